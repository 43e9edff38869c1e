//! Retry-until-connected execution

use crate::error::{Error, Result};
use crate::runtime;
use crate::session::{SessionState, SessionWatcher};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default pause between attempts after a transient failure
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Runs backend operations, riding out transient connection failures.
///
/// The executor only attempts an operation while the session is in the
/// target state. A transient failure makes it wait for that state again and
/// pause one retry interval before the next attempt. Time is accounted
/// across all attempts against one absolute deadline.
#[derive(Clone)]
pub struct RetryExecutor {
    watcher: Arc<SessionWatcher>,
    retry_interval: Duration,
}

impl RetryExecutor {
    /// Create an executor bound to a session watcher
    pub fn new(watcher: Arc<SessionWatcher>, retry_interval: Duration) -> Self {
        Self {
            watcher,
            retry_interval,
        }
    }

    /// Pause between attempts after a transient failure
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Execute `operation` until it succeeds, fails permanently or the
    /// `timeout` budget is spent.
    ///
    /// An attempt still running at the deadline is dropped and
    /// `OperationTimedOut` is returned. A session whose credentials were
    /// rejected fails the call with `AuthenticationFailed` instead of
    /// waiting out the budget.
    pub async fn execute<T, F, Fut>(
        &self,
        mut operation: F,
        target: SessionState,
        timeout: Duration,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            if self.watcher.is_closed() {
                return Err(Error::Closed);
            }
            self.check_credentials(target)?;

            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(Error::OperationTimedOut { timeout });
            }

            if self.watcher.state() != target {
                if !self.watcher.wait_for(target, remaining).await {
                    if self.watcher.is_closed() {
                        return Err(Error::Closed);
                    }
                    self.check_credentials(target)?;
                    return Err(Error::OperationTimedOut { timeout });
                }
                continue;
            }

            attempt += 1;
            match runtime::timeout(remaining, operation()).await {
                None => return Err(Error::OperationTimedOut { timeout }),
                Some(Ok(value)) => return Ok(value),
                Some(Err(e)) if e.is_transient() => {
                    debug!("Attempt {} failed transiently, retrying: {}", attempt, e);
                }
                Some(Err(e)) => return Err(e),
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(Error::OperationTimedOut { timeout });
            }
            runtime::sleep(self.retry_interval.min(remaining)).await;
        }
    }

    fn check_credentials(&self, target: SessionState) -> Result<()> {
        if target != SessionState::AuthFailed && self.watcher.state() == SessionState::AuthFailed {
            return Err(Error::AuthenticationFailed(
                "session credentials were rejected".to_string(),
            ));
        }
        Ok(())
    }
}
