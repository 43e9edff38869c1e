//! Runtime-agnostic spawning and timer helpers
//!
//! The coordination client never picks an executor itself. Background work
//! (session drivers, keep-alive loops) is handed to a [`Spawner`], and all
//! waiting goes through `async-io` timers, which run on any executor.

use async_io::Timer;
use futures::future::{BoxFuture, Either};
use std::future::Future;
use std::time::Duration;

/// A spawner that can run futures in the background on some async runtime
pub trait Spawner: Send + Sync {
    /// Spawn a future; it runs to completion detached from the caller
    fn spawn(&self, future: BoxFuture<'static, ()>);
}

/// Sleep for the given duration
pub async fn sleep(duration: Duration) {
    Timer::after(duration).await;
}

/// Run `future` until it completes or `duration` elapses.
///
/// Returns `None` on timeout. The future is dropped at that point, so an
/// in-flight backend call is abandoned rather than awaited.
pub async fn timeout<F: Future>(duration: Duration, future: F) -> Option<F::Output> {
    let future = std::pin::pin!(future);
    match futures::future::select(future, Timer::after(duration)).await {
        Either::Left((output, _)) => Some(output),
        Either::Right(_) => None,
    }
}

/// Spawner for the smol runtime
#[cfg(feature = "smol")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SmolSpawner;

#[cfg(feature = "smol")]
impl Spawner for SmolSpawner {
    fn spawn(&self, future: BoxFuture<'static, ()>) {
        smol::spawn(future).detach();
    }
}

/// Spawner for the tokio runtime (must be called from within a runtime)
#[cfg(feature = "tokio")]
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

#[cfg(feature = "tokio")]
impl Spawner for TokioSpawner {
    fn spawn(&self, future: BoxFuture<'static, ()>) {
        tokio::spawn(future);
    }
}
