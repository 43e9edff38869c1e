//! In-process hierarchical store
//!
//! `MemoryTree` behaves like a small ZooKeeper ensemble: persistent and
//! ephemeral nodes, per-session ownership of ephemerals, one-shot child
//! watches and optional password authentication. Sessions can be suspended,
//! resumed and expired from the outside, which makes the store usable for
//! exercising session recovery.

use super::{Connection, Connector, KeyLayout, RegistryEndpoint, SessionEventSender, WatchedEvent};
use crate::error::{Error, Result};
use crate::key::{CanonicalKey, Durability};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Identifier of a session opened against a [`MemoryTree`]
pub type SessionId = u64;

/// Server-side status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Connected and serving requests
    Live,
    /// Connection lost; the session and its ephemerals are retained
    Suspended,
    /// Session invalidated; its ephemerals were removed
    Expired,
    /// Closed by the client
    Closed,
}

struct Node {
    data: Vec<u8>,
    owner: Option<SessionId>,
}

struct SessionEntry {
    status: SessionStatus,
    events: SessionEventSender,
    child_watches: HashSet<CanonicalKey>,
}

#[derive(Default)]
struct TreeState {
    nodes: BTreeMap<CanonicalKey, Node>,
    sessions: HashMap<SessionId, SessionEntry>,
    next_session: SessionId,
    password: Option<String>,
    injected_failures: u32,
}

impl TreeState {
    fn check_session(&mut self, session: SessionId) -> Result<()> {
        match self.sessions.get(&session).map(|s| s.status) {
            Some(SessionStatus::Live) => {}
            Some(SessionStatus::Suspended) => {
                return Err(Error::ConnectionLoss(format!("session {} suspended", session)));
            }
            Some(SessionStatus::Expired) => return Err(Error::SessionExpired),
            Some(SessionStatus::Closed) | None => return Err(Error::Closed),
        }
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(Error::ConnectionLoss("injected failure".to_string()));
        }
        Ok(())
    }

    fn children_of(&self, key: &CanonicalKey) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|k| k.parent().as_ref() == Some(key))
            .filter_map(|k| k.name().map(str::to_string))
            .collect()
    }

    fn fire_child_watches(&mut self, parent: &CanonicalKey) {
        for entry in self.sessions.values_mut() {
            if matches!(entry.status, SessionStatus::Live | SessionStatus::Suspended)
                && entry.child_watches.remove(parent)
            {
                entry
                    .events
                    .notify(WatchedEvent::NodeChildrenChanged(parent.to_string()));
            }
        }
    }

    fn remove_node(&mut self, key: &CanonicalKey) {
        if self.nodes.remove(key).is_some() {
            if let Some(parent) = key.parent() {
                self.fire_child_watches(&parent);
            }
        }
    }

    fn drop_ephemerals(&mut self, session: SessionId) {
        let owned: Vec<CanonicalKey> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(key, _)| key.clone())
            .collect();
        for key in owned {
            debug!("Removing ephemeral node {} of session {}", key, session);
            self.remove_node(&key);
        }
    }
}

/// Shared in-process store; clones refer to the same tree
#[derive(Clone, Default)]
pub struct MemoryTree {
    state: Arc<Mutex<TreeState>>,
}

impl MemoryTree {
    /// Create an empty tree containing only the root node
    pub fn new() -> Self {
        let tree = Self::default();
        tree.lock().nodes.insert(
            CanonicalKey::root(),
            Node {
                data: Vec::new(),
                owner: None,
            },
        );
        tree
    }

    /// Connector opening sessions against this tree
    pub fn connector(&self) -> MemoryTreeConnector {
        MemoryTreeConnector { tree: self.clone() }
    }

    /// Require a password from connecting clients
    pub fn set_password(&self, password: Option<String>) {
        self.lock().password = password;
    }

    /// Make the next `count` operations fail with `ConnectionLoss`
    pub fn inject_connection_loss(&self, count: u32) {
        self.lock().injected_failures = count;
    }

    /// Ids of sessions that have not expired or closed, oldest first
    pub fn sessions(&self) -> Vec<SessionId> {
        let state = self.lock();
        let mut ids: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, s)| matches!(s.status, SessionStatus::Live | SessionStatus::Suspended))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Status of a session
    pub fn session_status(&self, session: SessionId) -> Option<SessionStatus> {
        self.lock().sessions.get(&session).map(|s| s.status)
    }

    /// Simulate a transient connection loss
    pub fn disconnect(&self, session: SessionId) {
        self.set_status(session, SessionStatus::Suspended, WatchedEvent::Disconnected);
    }

    /// Heal a transient connection loss on the same session
    pub fn reconnect(&self, session: SessionId) {
        self.set_status(session, SessionStatus::Live, WatchedEvent::SyncConnected);
    }

    /// Invalidate a session, removing its ephemeral nodes
    pub fn expire(&self, session: SessionId) {
        let mut state = self.lock();
        let Some(entry) = state.sessions.get_mut(&session) else {
            return;
        };
        if matches!(entry.status, SessionStatus::Expired | SessionStatus::Closed) {
            return;
        }
        entry.status = SessionStatus::Expired;
        entry.child_watches.clear();
        entry.events.notify(WatchedEvent::Expired);
        info!("Session {} expired", session);
        state.drop_ephemerals(session);
    }

    /// Payload stored at `path`
    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .nodes
            .get(&CanonicalKey::parse(path))
            .map(|node| node.data.clone())
    }

    /// Names of the children of `path`
    pub fn children(&self, path: &str) -> Vec<String> {
        self.lock().children_of(&CanonicalKey::parse(path))
    }

    /// Whether the node at `path` is ephemeral
    pub fn is_ephemeral(&self, path: &str) -> bool {
        self.lock()
            .nodes
            .get(&CanonicalKey::parse(path))
            .is_some_and(|node| node.owner.is_some())
    }

    fn set_status(&self, session: SessionId, status: SessionStatus, event: WatchedEvent) {
        let mut state = self.lock();
        if let Some(entry) = state.sessions.get_mut(&session) {
            if matches!(entry.status, SessionStatus::Live | SessionStatus::Suspended) {
                entry.status = status;
                entry.events.notify(event);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Opens sessions against a [`MemoryTree`]
#[derive(Clone)]
pub struct MemoryTreeConnector {
    tree: MemoryTree,
}

#[async_trait]
impl Connector for MemoryTreeConnector {
    async fn connect(
        &self,
        endpoint: &RegistryEndpoint,
        events: SessionEventSender,
    ) -> Result<Arc<dyn Connection>> {
        let mut state = self.tree.lock();
        if let Some(expected) = &state.password {
            if endpoint.password.as_ref() != Some(expected) {
                events.notify(WatchedEvent::AuthFailed);
                return Err(Error::AuthenticationFailed(format!(
                    "credentials rejected for {:?}",
                    endpoint.username
                )));
            }
        }

        state.next_session += 1;
        let session = state.next_session;
        events.notify(WatchedEvent::SyncConnected);
        state.sessions.insert(
            session,
            SessionEntry {
                status: SessionStatus::Live,
                events,
                child_watches: HashSet::new(),
            },
        );
        debug!("Opened memory session {}", session);

        Ok(Arc::new(MemoryConnection {
            tree: self.tree.clone(),
            session,
        }))
    }
}

/// One session against a [`MemoryTree`]
pub struct MemoryConnection {
    tree: MemoryTree,
    session: SessionId,
}

impl MemoryConnection {
    /// Server-side id of this session
    pub fn session_id(&self) -> SessionId {
        self.session
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn layout(&self) -> KeyLayout {
        KeyLayout::Hierarchical
    }

    async fn exists(&self, key: &CanonicalKey) -> Result<bool> {
        let mut state = self.tree.lock();
        state.check_session(self.session)?;
        Ok(state.nodes.contains_key(key))
    }

    async fn create(&self, key: &CanonicalKey, data: &[u8], durability: Durability) -> Result<()> {
        let mut state = self.tree.lock();
        state.check_session(self.session)?;

        let Some(parent) = key.parent() else {
            return Err(Error::AlreadyExists(key.to_string()));
        };
        if state.nodes.contains_key(key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        if !state.nodes.contains_key(&parent) {
            return Err(Error::NoNode(parent.to_string()));
        }

        let owner = match durability {
            Durability::Persistent => None,
            Durability::Ephemeral => Some(self.session),
        };
        state.nodes.insert(
            key.clone(),
            Node {
                data: data.to_vec(),
                owner,
            },
        );
        state.fire_child_watches(&parent);
        Ok(())
    }

    async fn set_data(&self, key: &CanonicalKey, data: &[u8]) -> Result<()> {
        let mut state = self.tree.lock();
        state.check_session(self.session)?;
        match state.nodes.get_mut(key) {
            Some(node) => {
                node.data = data.to_vec();
                Ok(())
            }
            None => Err(Error::NoNode(key.to_string())),
        }
    }

    async fn get_data(&self, key: &CanonicalKey) -> Result<Option<Vec<u8>>> {
        let mut state = self.tree.lock();
        state.check_session(self.session)?;
        Ok(state.nodes.get(key).map(|node| node.data.clone()))
    }

    async fn children(&self, key: &CanonicalKey) -> Result<Vec<String>> {
        let mut state = self.tree.lock();
        state.check_session(self.session)?;
        if !state.nodes.contains_key(key) {
            return Err(Error::NoNode(key.to_string()));
        }
        Ok(state.children_of(key))
    }

    async fn watch_children(&self, key: &CanonicalKey) -> Result<Vec<String>> {
        let mut state = self.tree.lock();
        state.check_session(self.session)?;
        if !state.nodes.contains_key(key) {
            return Err(Error::NoNode(key.to_string()));
        }
        if let Some(entry) = state.sessions.get_mut(&self.session) {
            entry.child_watches.insert(key.clone());
        }
        Ok(state.children_of(key))
    }

    async fn delete(&self, key: &CanonicalKey) -> Result<()> {
        let mut state = self.tree.lock();
        state.check_session(self.session)?;
        if key.is_root() {
            return Err(Error::InvalidArgument("cannot delete the root node".to_string()));
        }
        if !state.nodes.contains_key(key) {
            return Err(Error::NoNode(key.to_string()));
        }
        if !state.children_of(key).is_empty() {
            return Err(Error::Backend(format!("node {} is not empty", key)));
        }
        state.remove_node(key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.tree.lock();
        let Some(entry) = state.sessions.get_mut(&self.session) else {
            return Ok(());
        };
        if entry.status == SessionStatus::Closed {
            return Ok(());
        }
        let was_expired = entry.status == SessionStatus::Expired;
        entry.status = SessionStatus::Closed;
        entry.child_watches.clear();
        if !was_expired {
            state.drop_ephemerals(self.session);
        }
        debug!("Closed memory session {}", self.session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SessionEvent;

    async fn open(tree: &MemoryTree) -> (Arc<dyn Connection>, async_channel::Receiver<SessionEvent>) {
        let (tx, rx) = async_channel::unbounded();
        let endpoint = RegistryEndpoint::new("memory://test").unwrap();
        let connection = tree
            .connector()
            .connect(&endpoint, SessionEventSender::new(1, tx))
            .await
            .unwrap();
        (connection, rx)
    }

    #[smol_potat::test]
    async fn test_create_requires_parent() {
        let tree = MemoryTree::new();
        let (conn, events) = open(&tree).await;
        assert_eq!(events.recv().await.unwrap().event, WatchedEvent::SyncConnected);

        let leaf = CanonicalKey::parse("/a/b");
        assert_eq!(
            conn.create(&leaf, b"x", Durability::Persistent).await,
            Err(Error::NoNode("/a".to_string()))
        );

        conn.create(&CanonicalKey::parse("/a"), b"", Durability::Persistent)
            .await
            .unwrap();
        conn.create(&leaf, b"x", Durability::Persistent).await.unwrap();
        assert_eq!(
            conn.create(&leaf, b"y", Durability::Persistent).await,
            Err(Error::AlreadyExists("/a/b".to_string()))
        );
        assert_eq!(tree.read("/a/b"), Some(b"x".to_vec()));
    }

    #[smol_potat::test]
    async fn test_expire_removes_only_owned_ephemerals() {
        let tree = MemoryTree::new();
        let (first, first_events) = open(&tree).await;
        let (second, _second_events) = open(&tree).await;

        first
            .create(&CanonicalKey::parse("/p"), b"", Durability::Persistent)
            .await
            .unwrap();
        first
            .create(&CanonicalKey::parse("/p/mine"), b"1", Durability::Ephemeral)
            .await
            .unwrap();
        second
            .create(&CanonicalKey::parse("/p/theirs"), b"2", Durability::Ephemeral)
            .await
            .unwrap();

        let sessions = tree.sessions();
        tree.expire(sessions[0]);

        assert_eq!(tree.children("/p"), vec!["theirs"]);
        assert_eq!(tree.read("/p"), Some(Vec::new()));
        assert_eq!(
            first.exists(&CanonicalKey::parse("/p")).await,
            Err(Error::SessionExpired)
        );

        let _ = first_events.recv().await.unwrap();
        assert_eq!(first_events.recv().await.unwrap().event, WatchedEvent::Expired);
    }

    #[smol_potat::test]
    async fn test_suspended_session_reports_connection_loss() {
        let tree = MemoryTree::new();
        let (conn, events) = open(&tree).await;
        let session = tree.sessions()[0];

        tree.disconnect(session);
        assert!(matches!(
            conn.exists(&CanonicalKey::root()).await,
            Err(Error::ConnectionLoss(_))
        ));
        tree.reconnect(session);
        assert_eq!(conn.exists(&CanonicalKey::root()).await, Ok(true));

        let seen: Vec<WatchedEvent> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.event)
            .collect();
        assert_eq!(
            seen,
            vec![
                WatchedEvent::SyncConnected,
                WatchedEvent::Disconnected,
                WatchedEvent::SyncConnected
            ]
        );
    }

    #[smol_potat::test]
    async fn test_child_watch_fires_once() {
        let tree = MemoryTree::new();
        let (conn, events) = open(&tree).await;
        let _ = events.recv().await.unwrap();

        let parent = CanonicalKey::parse("/w");
        conn.create(&parent, b"", Durability::Persistent).await.unwrap();
        assert!(conn.watch_children(&parent).await.unwrap().is_empty());

        conn.create(&parent.child("a").unwrap(), b"", Durability::Persistent)
            .await
            .unwrap();
        conn.create(&parent.child("b").unwrap(), b"", Durability::Persistent)
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap().event,
            WatchedEvent::NodeChildrenChanged("/w".to_string())
        );
        assert!(events.try_recv().is_err());
    }

    #[smol_potat::test]
    async fn test_wrong_password_is_rejected() {
        let tree = MemoryTree::new();
        tree.set_password(Some("secret".to_string()));

        let (tx, rx) = async_channel::unbounded();
        let endpoint = RegistryEndpoint::new("memory://test")
            .unwrap()
            .with_credentials(Some("admin".to_string()), Some("wrong".to_string()));
        let result = tree
            .connector()
            .connect(&endpoint, SessionEventSender::new(1, tx))
            .await;

        assert!(matches!(result, Err(Error::AuthenticationFailed(_))));
        assert_eq!(rx.recv().await.unwrap().event, WatchedEvent::AuthFailed);
        assert!(tree.sessions().is_empty());
    }

    #[smol_potat::test]
    async fn test_close_drops_ephemerals() {
        let tree = MemoryTree::new();
        let (conn, _events) = open(&tree).await;
        conn.create(&CanonicalKey::parse("/e"), b"1", Durability::Ephemeral)
            .await
            .unwrap();
        conn.create(&CanonicalKey::parse("/p"), b"2", Durability::Persistent)
            .await
            .unwrap();

        conn.close().await.unwrap();
        assert_eq!(tree.read("/e"), None);
        assert_eq!(tree.read("/p"), Some(b"2".to_vec()));
        assert_eq!(conn.exists(&CanonicalKey::root()).await, Err(Error::Closed));
    }
}
