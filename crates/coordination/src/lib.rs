//! Session-aware coordination client
//!
//! This crate keeps a set of registry entries mirrored into a coordination
//! store (a ZooKeeper-like tree or a leased key-value store) across
//! connection loss and session expiry.
//!
//! # Architecture
//!
//! - [`SessionWatcher`] tracks the session state machine and notifies
//!   listeners of every transition.
//! - [`RetryExecutor`] runs each operation once the session is connected,
//!   retrying transient failures within one absolute deadline.
//! - [`EphemeralNodeCache`] remembers ephemeral writes so they can be
//!   replayed on a replacement session.
//! - [`CoordinationClient`] joins the three over a backend [`Connection`].
//!
//! The crate is runtime-agnostic: timers come from `async-io` and
//! background work is handed to a [`Spawner`].
//!
//! # Example
//!
//! ```no_run
//! use coordination::{CanonicalKey, CoordinationClient, Durability, RegistryEndpoint};
//! use coordination::backend::memory::MemoryTree;
//! use std::sync::Arc;
//!
//! # async fn example() -> coordination::Result<()> {
//! let tree = MemoryTree::new();
//! let endpoint = RegistryEndpoint::new("memory://local")?;
//! let (client, driver) = CoordinationClient::connect(endpoint, Arc::new(tree.connector())).await?;
//! // The caller decides where the driver runs, e.g. smol::spawn or tokio::spawn
//! # drop(driver);
//!
//! let key = CanonicalKey::parse("/shenyu/register/uri/http/orders/10.0.0.1:8080");
//! client.upsert(&key, b"{}", Durability::Ephemeral).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod cache;
pub mod client;
pub mod error;
pub mod key;
pub mod retry;
pub mod runtime;
pub mod session;

pub use backend::{Connection, Connector, KeyLayout, RegistryEndpoint, WatchedEvent};
pub use cache::{EphemeralNodeCache, ReplayReport};
pub use client::{ChildWatch, CoordinationClient, SessionDriver};
pub use error::{Error, Result};
pub use key::{CanonicalKey, Durability};
pub use retry::RetryExecutor;
pub use runtime::Spawner;
pub use session::{ListenerId, SessionState, SessionTransition, SessionWatcher};

#[cfg(feature = "smol")]
pub use runtime::SmolSpawner;
#[cfg(feature = "tokio")]
pub use runtime::TokioSpawner;
