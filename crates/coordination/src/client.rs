//! Connection-resilient coordination client

use crate::backend::{
    Connection, Connector, KeyLayout, RegistryEndpoint, SessionEvent, SessionEventSender,
    WatchedEvent,
};
use crate::cache::{EphemeralNodeCache, ReplayReport};
use crate::error::{Error, Result};
use crate::key::{CanonicalKey, Durability};
use crate::retry::RetryExecutor;
use crate::runtime::{self, Spawner};
use crate::session::{ListenerId, SessionState, SessionTransition, SessionWatcher};
use futures::StreamExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Background future processing session events for one client.
///
/// It must be polled for the client to make progress; it ends when the
/// client is closed.
pub type SessionDriver = BoxFuture<'static, ()>;

#[derive(Default)]
struct WatchEntry {
    subscribers: Vec<async_channel::Sender<Vec<String>>>,
    last: Option<Vec<String>>,
}

struct Shared {
    connection: Mutex<Option<Arc<dyn Connection>>>,
    generation: AtomicU64,
    closed: AtomicBool,
    events: async_channel::Sender<SessionEvent>,
    auth_retries: async_channel::Sender<()>,
    watches: Mutex<HashMap<CanonicalKey, WatchEntry>>,
}

impl Shared {
    fn connection(&self) -> Result<Arc<dyn Connection>> {
        self.lock_connection()
            .clone()
            .ok_or_else(|| Error::ConnectionLoss("no active connection".to_string()))
    }

    fn replace_connection(&self, connection: Option<Arc<dyn Connection>>) -> Option<Arc<dyn Connection>> {
        std::mem::replace(&mut *self.lock_connection(), connection)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<Arc<dyn Connection>>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_watches(&self) -> MutexGuard<'_, HashMap<CanonicalKey, WatchEntry>> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watched_keys(&self) -> Vec<CanonicalKey> {
        self.lock_watches().keys().cloned().collect()
    }

    /// Fan a child list out to every subscriber of `key`. With `only_changed`
    /// nothing is sent when the list equals the last delivered one.
    fn deliver(&self, key: &CanonicalKey, children: Vec<String>, only_changed: bool) {
        let mut watches = self.lock_watches();
        let Some(entry) = watches.get_mut(key) else {
            return;
        };
        if only_changed && entry.last.as_ref() == Some(&children) {
            return;
        }
        entry
            .subscribers
            .retain(|tx| tx.try_send(children.clone()).is_ok());
        entry.last = Some(children);
        if entry.subscribers.is_empty() {
            debug!("No subscribers left for child watch on {}", key);
            watches.remove(key);
        }
    }
}

/// Subscription to the child list of one key.
///
/// Any number of subscriptions on the same key share a single backend
/// watch. Every change delivers the full new child list.
pub struct ChildWatch {
    key: CanonicalKey,
    initial: Vec<String>,
    rx: async_channel::Receiver<Vec<String>>,
}

impl ChildWatch {
    /// Watched key
    pub fn key(&self) -> &CanonicalKey {
        &self.key
    }

    /// Children at the time the subscription was made
    pub fn initial(&self) -> &[String] {
        &self.initial
    }

    /// Next child list; `None` once the client is closed
    pub async fn next(&self) -> Option<Vec<String>> {
        self.rx.recv().await.ok()
    }

    /// Next child list if one is already queued
    pub fn try_next(&self) -> Option<Vec<String>> {
        self.rx.try_recv().ok()
    }
}

/// Facade over a backend session that survives connection loss and
/// session expiry.
///
/// Every operation runs through a [`RetryExecutor`] targeting
/// [`SessionState::Connected`] with the endpoint's operation timeout.
/// Ephemeral writes are remembered and replayed once a replacement session
/// is established after expiry.
pub struct CoordinationClient {
    endpoint: RegistryEndpoint,
    watcher: Arc<SessionWatcher>,
    cache: Arc<EphemeralNodeCache>,
    executor: RetryExecutor,
    shared: Arc<Shared>,
}

impl CoordinationClient {
    /// Open the first session and return the client with its driver.
    ///
    /// The driver future must be spawned (or otherwise polled) before any
    /// operation can complete.
    pub async fn connect(
        endpoint: RegistryEndpoint,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, SessionDriver)> {
        let watcher = Arc::new(SessionWatcher::new());
        let (tx, rx) = async_channel::unbounded();
        let (retry_tx, retry_rx) = async_channel::unbounded();
        let shared = Arc::new(Shared {
            connection: Mutex::new(None),
            generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            events: tx.clone(),
            auth_retries: retry_tx,
            watches: Mutex::new(HashMap::new()),
        });

        watcher.transition(SessionState::Connecting)?;
        info!("Connecting to {}", endpoint.servers.join(","));

        let sender = SessionEventSender::new(1, tx);
        let connection =
            match runtime::timeout(endpoint.connection_timeout, connector.connect(&endpoint, sender))
                .await
            {
                Some(Ok(connection)) => connection,
                Some(Err(Error::AuthenticationFailed(reason))) => {
                    let _ = watcher.transition(SessionState::AuthFailed);
                    return Err(Error::AuthenticationFailed(reason));
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(Error::ConnectionLoss(format!(
                        "no connection to {} within {} ms",
                        endpoint.servers.join(","),
                        endpoint.connection_timeout.as_millis()
                    )));
                }
            };
        shared.replace_connection(Some(connection));

        let cache = Arc::new(EphemeralNodeCache::new());
        let driver = Driver {
            shared: Arc::clone(&shared),
            watcher: Arc::clone(&watcher),
            cache: Arc::clone(&cache),
            connector,
            endpoint: endpoint.clone(),
            events: rx,
            auth_retries: retry_rx,
            fresh_session: AtomicBool::new(false),
        };

        let client = Self {
            executor: RetryExecutor::new(Arc::clone(&watcher), endpoint.retry_interval),
            endpoint,
            watcher,
            cache,
            shared,
        };
        Ok((client, Box::pin(driver.run())))
    }

    /// Connect and hand the session driver to `spawner`
    pub async fn start(
        endpoint: RegistryEndpoint,
        connector: Arc<dyn Connector>,
        spawner: &dyn Spawner,
    ) -> Result<Self> {
        let (client, driver) = Self::connect(endpoint, connector).await?;
        spawner.spawn(driver);
        Ok(client)
    }

    /// Endpoint this client was built for
    pub fn endpoint(&self) -> &RegistryEndpoint {
        &self.endpoint
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.watcher.state()
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Register a session transition listener
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionTransition) + Send + Sync + 'static,
    {
        self.watcher.subscribe(listener)
    }

    /// Remove a session transition listener
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.watcher.unsubscribe(id)
    }

    /// Ephemeral entries awaiting replay after expiry
    pub fn ephemeral_cache(&self) -> &EphemeralNodeCache {
        &self.cache
    }

    /// Wait until the session is connected
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<()> {
        if self.watcher.wait_for(SessionState::Connected, timeout).await {
            return Ok(());
        }
        if self.is_closed() {
            return Err(Error::Closed);
        }
        match self.watcher.state() {
            SessionState::AuthFailed => Err(Error::AuthenticationFailed(format!(
                "credentials rejected by {}",
                self.endpoint.servers.join(",")
            ))),
            _ => Err(Error::OperationTimedOut { timeout }),
        }
    }

    /// Ask the driver to open a new session after the backend rejected the
    /// credentials. The endpoint's credentials are reused; nothing happens
    /// unless the session is in [`SessionState::AuthFailed`].
    pub fn retry_authentication(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.shared
            .auth_retries
            .try_send(())
            .map_err(|_| Error::Closed)
    }

    /// Whether an entry exists
    pub async fn exists(&self, key: &CanonicalKey) -> Result<bool> {
        self.run(|conn| async move { conn.exists(key).await }).await
    }

    /// Read an entry's payload
    pub async fn get(&self, key: &CanonicalKey) -> Result<Option<Vec<u8>>> {
        self.run(|conn| async move { conn.get_data(key).await }).await
    }

    /// Names of the direct children of an entry
    pub async fn children(&self, key: &CanonicalKey) -> Result<Vec<String>> {
        self.run(|conn| async move { conn.children(key).await }).await
    }

    /// Create an entry; `AlreadyExists` if present, `NoNode` if the parent is
    /// missing on a hierarchical store
    pub async fn create(&self, key: &CanonicalKey, payload: &[u8], durability: Durability) -> Result<()> {
        self.run_write(key, payload, durability, |conn, rewrite| async move {
            if rewrite {
                write_entry(conn, key, payload, durability).await
            } else {
                conn.create(key, payload, durability).await
            }
        })
        .await
    }

    /// Create or overwrite an entry, materializing missing ancestors as
    /// persistent empty entries on hierarchical stores
    pub async fn upsert(&self, key: &CanonicalKey, payload: &[u8], durability: Durability) -> Result<()> {
        self.run_write(key, payload, durability, |conn, _| write_entry(conn, key, payload, durability))
            .await?;
        debug!("Upserted {} ({:?}, {} bytes)", key, durability, payload.len());
        Ok(())
    }

    /// Delete an entry; deleting a missing entry succeeds
    pub async fn delete(&self, key: &CanonicalKey) -> Result<()> {
        self.run(|conn| async move {
            match conn.delete(key).await {
                Ok(()) | Err(Error::NoNode(_)) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await?;
        self.cache.forget(key).await;
        Ok(())
    }

    /// Subscribe to the child list of `key`
    pub async fn watch_children(&self, key: &CanonicalKey) -> Result<ChildWatch> {
        let (tx, rx) = async_channel::unbounded();
        let first = {
            let mut watches = self.shared.lock_watches();
            let entry = watches.entry(key.clone()).or_default();
            let first = entry.subscribers.is_empty();
            entry.subscribers.push(tx.clone());
            first
        };

        let result = if first {
            self.run(|conn| async move { conn.watch_children(key).await })
                .await
        } else {
            self.children(key).await
        };

        match result {
            Ok(children) => {
                if first {
                    if let Some(entry) = self.shared.lock_watches().get_mut(key) {
                        entry.last = Some(children.clone());
                    }
                }
                Ok(ChildWatch {
                    key: key.clone(),
                    initial: children,
                    rx,
                })
            }
            Err(e) => {
                let mut watches = self.shared.lock_watches();
                if let Some(entry) = watches.get_mut(key) {
                    entry.subscribers.retain(|s| !s.same_channel(&tx));
                    if entry.subscribers.is_empty() {
                        watches.remove(key);
                    }
                }
                Err(e)
            }
        }
    }

    /// Close the client.
    ///
    /// In-flight and later operations fail with `Closed`. Persistent entries
    /// stay in the store; ephemeral ones end with the backend session.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.watcher.close();
        self.shared.events.close();
        self.shared.auth_retries.close();
        self.shared.lock_watches().clear();

        if let Some(connection) = self.shared.replace_connection(None) {
            connection.close().await?;
        }
        info!("Coordination client for {} closed", self.endpoint.servers.join(","));
        Ok(())
    }

    async fn run<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let operation = &operation;
        self.executor
            .execute(
                || {
                    let connection = self.shared.connection();
                    async move { operation(connection?).await }
                },
                SessionState::Connected,
                self.endpoint.operation_timeout,
            )
            .await
    }

    /// Run a write and record ephemeral payloads for replay.
    ///
    /// A replay that starts between the write and the record would miss the
    /// entry. Replays only follow a new session, so when the generation moved
    /// during the attempt the write is repeated on the current session.
    /// `write` receives `true` for such repeats.
    async fn run_write<F, Fut>(
        &self,
        key: &CanonicalKey,
        payload: &[u8],
        durability: Durability,
        write: F,
    ) -> Result<()>
    where
        F: Fn(Arc<dyn Connection>, bool) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let write = &write;
        let rewrite = &AtomicBool::new(false);
        self.executor
            .execute(
                || {
                    let generation = self.shared.generation.load(Ordering::SeqCst);
                    let connection = self.shared.connection();
                    async move {
                        write(connection?, rewrite.load(Ordering::SeqCst)).await?;
                        if durability == Durability::Ephemeral {
                            self.cache.remember(key.clone(), payload.to_vec()).await;
                            if self.shared.generation.load(Ordering::SeqCst) != generation {
                                debug!("Session replaced while writing {}, writing again", key);
                                rewrite.store(true, Ordering::SeqCst);
                                return Err(Error::SessionExpired);
                            }
                        }
                        Ok(())
                    }
                },
                SessionState::Connected,
                self.endpoint.operation_timeout,
            )
            .await
    }
}

/// Create-or-overwrite on a live connection, without retries
async fn write_entry(
    conn: Arc<dyn Connection>,
    key: &CanonicalKey,
    payload: &[u8],
    durability: Durability,
) -> Result<()> {
    if conn.layout() == KeyLayout::Hierarchical {
        for ancestor in key.ancestors() {
            match conn.create(&ancestor, &[], Durability::Persistent).await {
                Ok(()) | Err(Error::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }
    match conn.create(key, payload, durability).await {
        Err(Error::AlreadyExists(_)) => conn.set_data(key, payload).await,
        other => other,
    }
}

/// Processes session events one at a time
struct Driver {
    shared: Arc<Shared>,
    watcher: Arc<SessionWatcher>,
    cache: Arc<EphemeralNodeCache>,
    connector: Arc<dyn Connector>,
    endpoint: RegistryEndpoint,
    events: async_channel::Receiver<SessionEvent>,
    auth_retries: async_channel::Receiver<()>,
    // Set when a session is replaced for a reason other than expiry
    fresh_session: AtomicBool,
}

enum DriverInput {
    Event(SessionEvent),
    RetryAuthentication,
}

impl Driver {
    async fn run(self) {
        let mut inputs = std::pin::pin!(futures::stream::select(
            self.events.clone().map(DriverInput::Event),
            self.auth_retries.clone().map(|()| DriverInput::RetryAuthentication),
        ));
        while let Some(input) = inputs.next().await {
            if self.shared.is_closed() {
                break;
            }
            let SessionEvent { generation, event } = match input {
                DriverInput::Event(event) => event,
                DriverInput::RetryAuthentication => {
                    self.on_retry_authentication().await;
                    continue;
                }
            };
            let current = self.shared.generation.load(Ordering::SeqCst);
            if generation != current {
                debug!("Ignoring {:?} from superseded session {} (current {})", event, generation, current);
                continue;
            }

            match event {
                WatchedEvent::SyncConnected => self.on_connected().await,
                WatchedEvent::Disconnected => {
                    self.apply(SessionState::Disconnected);
                }
                WatchedEvent::Expired => self.on_expired().await,
                WatchedEvent::AuthFailed => {
                    self.apply(SessionState::AuthFailed);
                }
                WatchedEvent::NodeChildrenChanged(path) => {
                    self.on_children_changed(CanonicalKey::parse(&path)).await
                }
            }
        }
        debug!("Session driver stopped");
    }

    fn apply(&self, state: SessionState) -> Option<SessionTransition> {
        match self.watcher.transition(state) {
            Ok(transition) => Some(transition),
            Err(e) => {
                debug!("Ignoring session event: {}", e);
                None
            }
        }
    }

    async fn on_connected(&self) {
        // Entries are written back before waiting operations are released
        let fresh = self.fresh_session.swap(false, Ordering::SeqCst);
        if self.watcher.state() == SessionState::Connecting
            && (fresh || self.watcher.expired_since_connected())
        {
            let report = self.replay().await;
            info!(
                "Replayed {} ephemeral entries on the new session ({} failed)",
                report.replayed, report.failed
            );
        }

        if let Some(transition) = self.apply(SessionState::Connected) {
            info!("Session connected ({:?} -> Connected)", transition.from);
            self.rearm_watches().await;
        }
    }

    async fn replay(&self) -> ReplayReport {
        let connection = match self.shared.connection() {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Cannot replay ephemeral entries: {}", e);
                return ReplayReport::default();
            }
        };
        let budget = self.endpoint.operation_timeout;
        self.cache
            .replay_all(|key, payload| {
                let connection = Arc::clone(&connection);
                async move {
                    let write = write_entry(connection, &key, &payload, Durability::Ephemeral);
                    runtime::timeout(budget, write)
                        .await
                        .unwrap_or(Err(Error::OperationTimedOut { timeout: budget }))
                }
            })
            .await
    }

    async fn on_expired(&self) {
        if self.apply(SessionState::Expired).is_none() && self.watcher.state() != SessionState::Expired {
            return;
        }
        warn!("Session expired, opening a new session");

        if let Some(old) = self.shared.replace_connection(None) {
            if let Err(e) = old.close().await {
                debug!("Closing expired session failed: {}", e);
            }
        }
        self.reconnect().await;
    }

    async fn on_retry_authentication(&self) {
        let state = self.watcher.state();
        if state != SessionState::AuthFailed {
            debug!("Ignoring authentication retry in state {:?}", state);
            return;
        }
        info!("Retrying authentication against {}", self.endpoint.servers.join(","));

        if let Some(old) = self.shared.replace_connection(None) {
            if let Err(e) = old.close().await {
                debug!("Closing rejected session failed: {}", e);
            }
        }
        self.fresh_session.store(true, Ordering::SeqCst);
        self.reconnect().await;
    }

    async fn reconnect(&self) {
        if self.apply(SessionState::Connecting).is_none() {
            return;
        }

        let mut attempt = 0u32;
        loop {
            if self.shared.is_closed() {
                return;
            }
            attempt += 1;
            let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let sender = SessionEventSender::new(generation, self.shared.events.clone());

            let connect = self.connector.connect(&self.endpoint, sender);
            match runtime::timeout(self.endpoint.connection_timeout, connect).await {
                Some(Ok(connection)) => {
                    if self.shared.is_closed() {
                        let _ = connection.close().await;
                        return;
                    }
                    self.shared.replace_connection(Some(connection));
                    info!("Opened replacement session (generation {}, attempt {})", generation, attempt);
                    return;
                }
                Some(Err(Error::AuthenticationFailed(reason))) => {
                    error!("Reconnect rejected: {}", reason);
                    self.apply(SessionState::AuthFailed);
                    return;
                }
                Some(Err(e)) => warn!("Reconnect attempt {} failed: {}", attempt, e),
                None => warn!(
                    "Reconnect attempt {} timed out after {} ms",
                    attempt,
                    self.endpoint.connection_timeout.as_millis()
                ),
            }
            runtime::sleep(self.endpoint.retry_interval).await;
        }
    }

    async fn on_children_changed(&self, key: CanonicalKey) {
        if !self.shared.lock_watches().contains_key(&key) {
            return;
        }
        match self.arm(&key).await {
            Ok(children) => self.shared.deliver(&key, children, false),
            Err(e) => warn!("Failed to re-arm child watch on {}: {}", key, e),
        }
    }

    async fn rearm_watches(&self) {
        for key in self.shared.watched_keys() {
            match self.arm(&key).await {
                Ok(children) => self.shared.deliver(&key, children, true),
                Err(e) => warn!("Failed to re-arm child watch on {}: {}", key, e),
            }
        }
    }

    async fn arm(&self, key: &CanonicalKey) -> Result<Vec<String>> {
        let connection = self.shared.connection()?;
        let budget = self.endpoint.operation_timeout;
        runtime::timeout(budget, connection.watch_children(key))
            .await
            .unwrap_or(Err(Error::OperationTimedOut { timeout: budget }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryTree;
    use crate::runtime::SmolSpawner;

    async fn client_for(tree: &MemoryTree) -> CoordinationClient {
        let endpoint = RegistryEndpoint::new("memory://unit")
            .unwrap()
            .with_operation_timeout(Duration::from_millis(500))
            .with_retry_interval(Duration::from_millis(10));
        let client = CoordinationClient::start(endpoint, Arc::new(tree.connector()), &SmolSpawner)
            .await
            .unwrap();
        client.wait_until_connected(Duration::from_secs(1)).await.unwrap();
        client
    }

    #[smol_potat::test]
    async fn test_upsert_creates_ancestors_and_overwrites() {
        let tree = MemoryTree::new();
        let client = client_for(&tree).await;
        let key = CanonicalKey::parse("/shenyu/register/uri/http/orders/10.0.0.1:8080");

        client.upsert(&key, b"v1", Durability::Ephemeral).await.unwrap();
        assert_eq!(client.get(&key).await.unwrap(), Some(b"v1".to_vec()));
        assert!(!tree.is_ephemeral("/shenyu/register/uri/http/orders"));
        assert!(tree.is_ephemeral(&key.to_string()));

        client.upsert(&key, b"v2", Durability::Ephemeral).await.unwrap();
        assert_eq!(client.get(&key).await.unwrap(), Some(b"v2".to_vec()));
        assert_eq!(
            client.children(&key.parent().unwrap()).await.unwrap(),
            vec!["10.0.0.1:8080"]
        );
        assert_eq!(client.ephemeral_cache().len().await, 1);
    }

    #[smol_potat::test]
    async fn test_create_reports_conflicts() {
        let tree = MemoryTree::new();
        let client = client_for(&tree).await;

        assert_eq!(
            client
                .create(&CanonicalKey::parse("/missing/leaf"), b"", Durability::Persistent)
                .await,
            Err(Error::NoNode("/missing".to_string()))
        );
        client
            .create(&CanonicalKey::parse("/a"), b"1", Durability::Persistent)
            .await
            .unwrap();
        assert_eq!(
            client
                .create(&CanonicalKey::parse("/a"), b"2", Durability::Persistent)
                .await,
            Err(Error::AlreadyExists("/a".to_string()))
        );
    }

    #[smol_potat::test]
    async fn test_delete_is_idempotent_and_forgets() {
        let tree = MemoryTree::new();
        let client = client_for(&tree).await;
        let key = CanonicalKey::parse("/e");

        client.upsert(&key, b"1", Durability::Ephemeral).await.unwrap();
        client.delete(&key).await.unwrap();
        client.delete(&key).await.unwrap();
        assert!(!client.exists(&key).await.unwrap());
        assert!(client.ephemeral_cache().is_empty().await);
    }

    #[smol_potat::test]
    async fn test_injected_connection_loss_is_retried() {
        let tree = MemoryTree::new();
        let client = client_for(&tree).await;

        tree.inject_connection_loss(3);
        client
            .upsert(&CanonicalKey::parse("/retry/me"), b"x", Durability::Persistent)
            .await
            .unwrap();
        assert_eq!(tree.read("/retry/me"), Some(b"x".to_vec()));
    }

    #[smol_potat::test]
    async fn test_closed_client_fails_fast() {
        let tree = MemoryTree::new();
        let client = client_for(&tree).await;
        client.close().await.unwrap();
        client.close().await.unwrap();

        assert_eq!(client.exists(&CanonicalKey::root()).await, Err(Error::Closed));
        assert!(client.is_closed());
        assert!(tree.sessions().is_empty());
    }

    #[smol_potat::test]
    async fn test_auth_failure_surfaces_at_connect() {
        let tree = MemoryTree::new();
        tree.set_password(Some("secret".to_string()));
        let endpoint = RegistryEndpoint::new("memory://unit").unwrap();

        let result = CoordinationClient::connect(endpoint, Arc::new(tree.connector())).await;
        assert!(matches!(result, Err(Error::AuthenticationFailed(_))));
    }
}
