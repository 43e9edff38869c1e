//! Backend connection abstraction
//!
//! A [`Connector`] opens one session against a coordination store and
//! returns a [`Connection`]. Connections report session events (connect,
//! loss, expiry, watch triggers) through a [`SessionEventSender`] tagged
//! with the generation of the session that produced them, so the client can
//! ignore events from connections it already replaced.

pub mod lease;
pub mod memory;

use crate::error::{Error, Result};
use crate::key::{CanonicalKey, Durability};
use crate::retry::DEFAULT_RETRY_INTERVAL;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// How a backend addresses entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLayout {
    /// Entries need an existing parent chain (ZooKeeper-like trees)
    Hierarchical,
    /// Keys are opaque strings; no parent entries are written
    Flat,
}

/// Event reported by a backend session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchedEvent {
    /// The session is (again) usable
    SyncConnected,
    /// Transient connection loss; the session may still be alive
    Disconnected,
    /// The backend invalidated the session
    Expired,
    /// Credentials were rejected
    AuthFailed,
    /// The children of the given path changed; the watch is consumed
    NodeChildrenChanged(String),
}

/// A backend event tagged with the session generation that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    /// Generation of the connection that emitted the event
    pub generation: u64,
    /// The event itself
    pub event: WatchedEvent,
}

/// Handle a connection uses to report session events
#[derive(Debug, Clone)]
pub struct SessionEventSender {
    generation: u64,
    tx: async_channel::Sender<SessionEvent>,
}

impl SessionEventSender {
    /// Create a sender for one connection generation
    pub fn new(generation: u64, tx: async_channel::Sender<SessionEvent>) -> Self {
        Self { generation, tx }
    }

    /// Generation this sender is bound to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event; returns `false` once the client stopped listening
    pub fn notify(&self, event: WatchedEvent) -> bool {
        self.tx
            .try_send(SessionEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Where and how to reach a coordination store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEndpoint {
    /// Server addresses, in preference order
    pub servers: Vec<String>,
    /// Optional user name
    pub username: Option<String>,
    /// Optional password
    pub password: Option<String>,
    /// Budget for establishing a connection
    pub connection_timeout: Duration,
    /// Session timeout requested from the backend
    pub session_timeout: Duration,
    /// Budget for one client operation, across all retries
    pub operation_timeout: Duration,
    /// Pause between retries and reconnect attempts
    pub retry_interval: Duration,
}

impl RegistryEndpoint {
    /// Endpoint for a comma separated server list with default timeouts
    pub fn new(server_list: &str) -> Result<Self> {
        let servers: Vec<String> = server_list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if servers.is_empty() {
            return Err(Error::InvalidConfiguration(
                "server list is empty".to_string(),
            ));
        }

        Ok(Self {
            servers,
            username: None,
            password: None,
            connection_timeout: Duration::from_secs(3),
            session_timeout: Duration::from_secs(3),
            operation_timeout: Duration::from_secs(1),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        })
    }

    /// Attach credentials
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username.filter(|u| !u.is_empty());
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    /// Override the operation budget
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Override the connection budget
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Override the requested session timeout
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Override the retry interval
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

/// One live session against a coordination store.
///
/// Implementations map native failures onto the shared error taxonomy:
/// `ConnectionLoss` and `SessionExpired` for transient problems, the other
/// variants for permanent ones.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Key layout of the store
    fn layout(&self) -> KeyLayout;

    /// Whether an entry exists
    async fn exists(&self, key: &CanonicalKey) -> Result<bool>;

    /// Create an entry; fails with `AlreadyExists` or, for hierarchical
    /// stores with a missing parent, `NoNode`
    async fn create(&self, key: &CanonicalKey, data: &[u8], durability: Durability) -> Result<()>;

    /// Overwrite the payload of an existing entry; `NoNode` if missing
    async fn set_data(&self, key: &CanonicalKey, data: &[u8]) -> Result<()>;

    /// Read an entry's payload
    async fn get_data(&self, key: &CanonicalKey) -> Result<Option<Vec<u8>>>;

    /// Names of the direct children of an entry
    async fn children(&self, key: &CanonicalKey) -> Result<Vec<String>>;

    /// Read the children and arm a one-shot watch that reports
    /// [`WatchedEvent::NodeChildrenChanged`] on the next change
    async fn watch_children(&self, key: &CanonicalKey) -> Result<Vec<String>>;

    /// Delete an entry; `NoNode` if missing
    async fn delete(&self, key: &CanonicalKey) -> Result<()>;

    /// End the session and release its resources
    async fn close(&self) -> Result<()>;
}

/// Opens sessions against a coordination store
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new session. The connection must report
    /// [`WatchedEvent::SyncConnected`] once it is usable.
    async fn connect(
        &self,
        endpoint: &RegistryEndpoint,
        events: SessionEventSender,
    ) -> Result<Arc<dyn Connection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parses_server_list() {
        let endpoint = RegistryEndpoint::new(" zk1:2181, zk2:2181 ,,").unwrap();
        assert_eq!(endpoint.servers, vec!["zk1:2181", "zk2:2181"]);
        assert_eq!(endpoint.operation_timeout, Duration::from_secs(1));

        assert!(matches!(
            RegistryEndpoint::new(" , "),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_endpoint_drops_empty_credentials() {
        let endpoint = RegistryEndpoint::new("zk:2181")
            .unwrap()
            .with_credentials(Some("admin".to_string()), Some(String::new()));
        assert_eq!(endpoint.username.as_deref(), Some("admin"));
        assert_eq!(endpoint.password, None);
    }

    #[smol_potat::test]
    async fn test_event_sender_tags_generation() {
        let (tx, rx) = async_channel::unbounded();
        let sender = SessionEventSender::new(7, tx);
        assert!(sender.notify(WatchedEvent::SyncConnected));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.generation, 7);
        assert_eq!(event.event, WatchedEvent::SyncConnected);

        drop(rx);
        assert!(!sender.notify(WatchedEvent::Disconnected));
    }
}
