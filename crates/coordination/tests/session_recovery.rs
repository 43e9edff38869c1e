//! Session loss and recovery against the in-process backends

use async_trait::async_trait;
use coordination::backend::SessionEventSender;
use coordination::backend::lease::{LeaseKvConnector, MemoryKvStore};
use coordination::backend::memory::{MemoryTree, MemoryTreeConnector};
use coordination::{
    CanonicalKey, Connection, Connector, CoordinationClient, Durability, Error, KeyLayout,
    RegistryEndpoint, SessionState, SessionTransition, SmolSpawner,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

fn endpoint() -> RegistryEndpoint {
    RegistryEndpoint::new("memory://recovery")
        .expect("valid server list")
        .with_operation_timeout(Duration::from_secs(2))
        .with_retry_interval(Duration::from_millis(20))
}

async fn start_tree_client(tree: &MemoryTree) -> CoordinationClient {
    let client = CoordinationClient::start(endpoint(), Arc::new(tree.connector()), &SmolSpawner)
        .await
        .expect("Failed to connect");
    client
        .wait_until_connected(Duration::from_secs(1))
        .await
        .expect("Session never connected");
    client
}

fn transitions(client: &CoordinationClient) -> async_channel::Receiver<SessionTransition> {
    let (tx, rx) = async_channel::unbounded();
    client.subscribe(move |t| {
        let _ = tx.try_send(*t);
    });
    rx
}

async fn wait_for_transition<F>(rx: &async_channel::Receiver<SessionTransition>, matches: F) -> bool
where
    F: Fn(&SessionTransition) -> bool,
{
    let seen = async {
        while let Ok(t) = rx.recv().await {
            if matches(&t) {
                return true;
            }
        }
        false
    };
    smol::future::or(seen, async {
        smol::Timer::after(Duration::from_secs(5)).await;
        false
    })
    .await
}

async fn wait_for_recovery(rx: &async_channel::Receiver<SessionTransition>) {
    assert!(
        wait_for_transition(rx, SessionTransition::is_recovery_from_expiry).await,
        "client never recovered from session expiry"
    );
}

#[smol_potat::test]
async fn test_ephemeral_entries_replayed_after_expiry() {
    let tree = MemoryTree::new();
    let client = start_tree_client(&tree).await;
    let events = transitions(&client);

    let meta = CanonicalKey::parse("/shenyu/register/metadata/http/orders/orders-orders-list");
    let uri = CanonicalKey::parse("/shenyu/register/uri/http/orders/10.0.0.1:8080");
    client.upsert(&meta, b"m1", Durability::Ephemeral).await.expect("upsert meta");
    client.upsert(&uri, b"u1", Durability::Ephemeral).await.expect("upsert uri");
    client.upsert(&meta, b"m2", Durability::Ephemeral).await.expect("overwrite meta");

    // What the store holds at the moment the client sees the expiry
    let (seen_tx, seen_rx) = async_channel::unbounded();
    let observed = tree.clone();
    let (meta_path, uri_path) = (meta.to_string(), uri.to_string());
    client.subscribe(move |t| {
        if t.to == SessionState::Expired {
            let _ = seen_tx.try_send((observed.read(&meta_path), observed.read(&uri_path)));
        }
    });

    let session = tree.sessions()[0];
    tree.expire(session);

    wait_for_recovery(&events).await;
    assert_eq!(seen_rx.try_recv().expect("expiry observed"), (None, None));

    assert_eq!(tree.read(&meta.to_string()), Some(b"m2".to_vec()));
    assert_eq!(tree.read(&uri.to_string()), Some(b"u1".to_vec()));
    assert!(tree.is_ephemeral(&uri.to_string()));
    assert_eq!(tree.sessions().len(), 1);
    assert_ne!(tree.sessions()[0], session);
    assert_eq!(client.state(), SessionState::Connected);
}

#[smol_potat::test]
async fn test_plain_disconnect_does_not_replay() {
    let tree = MemoryTree::new();
    let client = start_tree_client(&tree).await;
    let other = start_tree_client(&tree).await;
    let events = transitions(&client);

    let key = CanonicalKey::parse("/shenyu/register/uri/http/orders/10.0.0.1:8080");
    client.upsert(&key, b"mine", Durability::Ephemeral).await.expect("upsert");
    // Another writer changes the entry behind the client's back
    other.upsert(&key, b"theirs", Durability::Ephemeral).await.expect("overwrite");

    let session = tree.sessions()[0];
    tree.disconnect(session);
    tree.reconnect(session);

    let first = events.recv().await.expect("transition");
    assert_eq!(first.to, SessionState::Disconnected);
    let second = events.recv().await.expect("transition");
    assert_eq!(second.to, SessionState::Connected);
    assert!(!second.is_recovery_from_expiry());

    assert_eq!(tree.read(&key.to_string()), Some(b"theirs".to_vec()));
}

#[smol_potat::test]
async fn test_operation_waits_out_disconnect() {
    let tree = MemoryTree::new();
    let client = Arc::new(start_tree_client(&tree).await);
    let events = transitions(&client);
    let session = tree.sessions()[0];

    tree.disconnect(session);
    assert_eq!(events.recv().await.expect("transition").to, SessionState::Disconnected);

    let writer = Arc::clone(&client);
    let write = smol::spawn(async move {
        writer
            .upsert(&CanonicalKey::parse("/late/entry"), b"x", Durability::Persistent)
            .await
    });

    smol::Timer::after(Duration::from_millis(100)).await;
    assert_eq!(tree.read("/late/entry"), None);

    tree.reconnect(session);
    write.await.expect("write after reconnect");
    assert_eq!(tree.read("/late/entry"), Some(b"x".to_vec()));
}

#[smol_potat::test]
async fn test_operation_times_out_while_disconnected() {
    let tree = MemoryTree::new();
    let endpoint = endpoint().with_operation_timeout(Duration::from_millis(150));
    let client = CoordinationClient::start(endpoint, Arc::new(tree.connector()), &SmolSpawner)
        .await
        .expect("Failed to connect");
    client
        .wait_until_connected(Duration::from_secs(1))
        .await
        .expect("Session never connected");

    let events = transitions(&client);
    tree.disconnect(tree.sessions()[0]);
    events.recv().await.expect("transition");

    let result = client.exists(&CanonicalKey::root()).await;
    assert_eq!(
        result,
        Err(Error::OperationTimedOut {
            timeout: Duration::from_millis(150)
        })
    );
}

#[smol_potat::test]
async fn test_lost_lease_regrants_and_replays() {
    let store = MemoryKvStore::new();
    let connector = LeaseKvConnector::new(
        Arc::new(store.clone()),
        Duration::from_millis(300),
        Arc::new(SmolSpawner),
    );
    let client = CoordinationClient::start(endpoint(), Arc::new(connector), &SmolSpawner)
        .await
        .expect("Failed to connect");
    client
        .wait_until_connected(Duration::from_secs(1))
        .await
        .expect("Session never connected");
    let events = transitions(&client);

    let key = CanonicalKey::parse("/shenyu/register/uri/http/orders/10.0.0.1:8080");
    client.upsert(&key, b"u1", Durability::Ephemeral).await.expect("upsert");
    let first_lease = store.lease_of(&key.to_string()).expect("lease attached");
    // Flat layout writes no parent keys
    assert_eq!(store.read("/shenyu/register/uri/http/orders"), None);

    store.expire_lease(first_lease);
    wait_for_recovery(&events).await;

    assert_eq!(store.read(&key.to_string()), Some(b"u1".to_vec()));
    let second_lease = store.lease_of(&key.to_string()).expect("lease attached");
    assert_ne!(first_lease, second_lease);

    client.close().await.expect("close");
    assert_eq!(store.read(&key.to_string()), None);
}

#[smol_potat::test]
async fn test_child_watch_is_shared_and_rearmed() {
    let tree = MemoryTree::new();
    let client = start_tree_client(&tree).await;
    let parent = CanonicalKey::parse("/shenyu/register/uri/http/orders");
    client.upsert(&parent, b"", Durability::Persistent).await.expect("parent");

    let first = client.watch_children(&parent).await.expect("watch");
    let second = client.watch_children(&parent).await.expect("watch");
    assert!(first.initial().is_empty());
    assert!(second.initial().is_empty());

    client
        .upsert(&parent.child("a:1").expect("segment"), b"", Durability::Ephemeral)
        .await
        .expect("child a");
    assert_eq!(first.next().await, Some(vec!["a:1".to_string()]));
    assert_eq!(second.next().await, Some(vec!["a:1".to_string()]));

    // The watch was re-armed after the first notification
    client
        .upsert(&parent.child("b:2").expect("segment"), b"", Durability::Ephemeral)
        .await
        .expect("child b");
    let expected = vec!["a:1".to_string(), "b:2".to_string()];
    assert_eq!(first.next().await, Some(expected.clone()));
    assert_eq!(second.next().await, Some(expected));

    client.close().await.expect("close");
    assert_eq!(first.next().await, None);
}

#[smol_potat::test]
async fn test_rejected_credentials_fail_fast_until_retried() {
    let tree = MemoryTree::new();
    tree.set_password(Some("secret".to_string()));
    let endpoint = endpoint().with_credentials(Some("admin".to_string()), Some("secret".to_string()));
    let client = CoordinationClient::start(endpoint, Arc::new(tree.connector()), &SmolSpawner)
        .await
        .expect("Failed to connect");
    client
        .wait_until_connected(Duration::from_secs(1))
        .await
        .expect("Session never connected");
    let events = transitions(&client);

    let key = CanonicalKey::parse("/shenyu/register/uri/http/orders/10.0.0.1:8080");
    client.upsert(&key, b"u1", Durability::Ephemeral).await.expect("upsert");

    // The replacement session is refused
    tree.set_password(Some("rotated".to_string()));
    tree.expire(tree.sessions()[0]);
    assert!(wait_for_transition(&events, |t| t.to == SessionState::AuthFailed).await);

    let started = Instant::now();
    let result = client
        .upsert(&CanonicalKey::parse("/late/entry"), b"x", Durability::Persistent)
        .await;
    assert!(matches!(result, Err(Error::AuthenticationFailed(_))), "{:?}", result);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(
        client.wait_until_connected(Duration::from_secs(5)).await,
        Err(Error::AuthenticationFailed(_))
    ));
    assert_eq!(client.state(), SessionState::AuthFailed);

    tree.set_password(Some("secret".to_string()));
    client.retry_authentication().expect("retry requested");
    assert!(wait_for_transition(&events, |t| t.to == SessionState::Connected).await);

    assert_eq!(tree.read(&key.to_string()), Some(b"u1".to_vec()));
    client
        .upsert(&CanonicalKey::parse("/late/entry"), b"x", Durability::Persistent)
        .await
        .expect("write after retry");
}

#[smol_potat::test]
async fn test_close_fails_waiting_operations() {
    let tree = MemoryTree::new();
    let endpoint = endpoint().with_operation_timeout(Duration::from_secs(30));
    let client = Arc::new(
        CoordinationClient::start(endpoint, Arc::new(tree.connector()), &SmolSpawner)
            .await
            .expect("Failed to connect"),
    );
    client
        .wait_until_connected(Duration::from_secs(1))
        .await
        .expect("Session never connected");
    let events = transitions(&client);

    tree.disconnect(tree.sessions()[0]);
    assert_eq!(events.recv().await.expect("transition").to, SessionState::Disconnected);

    let writer = Arc::clone(&client);
    let write = smol::spawn(async move {
        writer
            .upsert(&CanonicalKey::parse("/never/written"), b"x", Durability::Ephemeral)
            .await
    });
    smol::Timer::after(Duration::from_millis(50)).await;

    let started = Instant::now();
    client.close().await.expect("close");
    assert_eq!(write.await, Err(Error::Closed));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(tree.read("/never/written"), None);
}

/// Hands out tree sessions whose first write of one key expires the session
/// right after it succeeds and only returns once the client reconnected.
struct ExpireAfterWrite {
    tree: MemoryTree,
    inner: MemoryTreeConnector,
    target: CanonicalKey,
    armed: Arc<AtomicBool>,
    recovered: async_channel::Receiver<()>,
}

#[async_trait]
impl Connector for ExpireAfterWrite {
    async fn connect(
        &self,
        endpoint: &RegistryEndpoint,
        events: SessionEventSender,
    ) -> coordination::Result<Arc<dyn Connection>> {
        let inner = self.inner.connect(endpoint, events).await?;
        Ok(Arc::new(ExpiringConnection {
            tree: self.tree.clone(),
            inner,
            target: self.target.clone(),
            armed: Arc::clone(&self.armed),
            recovered: self.recovered.clone(),
        }))
    }
}

struct ExpiringConnection {
    tree: MemoryTree,
    inner: Arc<dyn Connection>,
    target: CanonicalKey,
    armed: Arc<AtomicBool>,
    recovered: async_channel::Receiver<()>,
}

#[async_trait]
impl Connection for ExpiringConnection {
    fn layout(&self) -> KeyLayout {
        self.inner.layout()
    }

    async fn exists(&self, key: &CanonicalKey) -> coordination::Result<bool> {
        self.inner.exists(key).await
    }

    async fn create(&self, key: &CanonicalKey, data: &[u8], durability: Durability) -> coordination::Result<()> {
        self.inner.create(key, data, durability).await?;
        if *key == self.target && self.armed.swap(false, Ordering::SeqCst) {
            if let Some(session) = self.tree.sessions().last().copied() {
                self.tree.expire(session);
            }
            smol::future::or(
                async {
                    let _ = self.recovered.recv().await;
                },
                async {
                    smol::Timer::after(Duration::from_secs(5)).await;
                },
            )
            .await;
        }
        Ok(())
    }

    async fn set_data(&self, key: &CanonicalKey, data: &[u8]) -> coordination::Result<()> {
        self.inner.set_data(key, data).await
    }

    async fn get_data(&self, key: &CanonicalKey) -> coordination::Result<Option<Vec<u8>>> {
        self.inner.get_data(key).await
    }

    async fn children(&self, key: &CanonicalKey) -> coordination::Result<Vec<String>> {
        self.inner.children(key).await
    }

    async fn watch_children(&self, key: &CanonicalKey) -> coordination::Result<Vec<String>> {
        self.inner.watch_children(key).await
    }

    async fn delete(&self, key: &CanonicalKey) -> coordination::Result<()> {
        self.inner.delete(key).await
    }

    async fn close(&self) -> coordination::Result<()> {
        self.inner.close().await
    }
}

#[smol_potat::test]
async fn test_write_racing_expiry_lands_on_new_session() {
    let tree = MemoryTree::new();
    let key = CanonicalKey::parse("/shenyu/register/uri/http/orders/10.0.0.1:8080");
    let (recovered_tx, recovered_rx) = async_channel::unbounded();
    let connector = ExpireAfterWrite {
        tree: tree.clone(),
        inner: tree.connector(),
        target: key.clone(),
        armed: Arc::new(AtomicBool::new(true)),
        recovered: recovered_rx,
    };
    let client = CoordinationClient::start(endpoint(), Arc::new(connector), &SmolSpawner)
        .await
        .expect("Failed to connect");
    client
        .wait_until_connected(Duration::from_secs(1))
        .await
        .expect("Session never connected");
    let first_session = tree.sessions()[0];
    client.subscribe(move |t| {
        if t.is_recovery_from_expiry() {
            let _ = recovered_tx.try_send(());
        }
    });

    // The replay ran before the write was recorded
    client.upsert(&key, b"u1", Durability::Ephemeral).await.expect("upsert");

    assert_ne!(tree.sessions()[0], first_session);
    assert_eq!(tree.read(&key.to_string()), Some(b"u1".to_vec()));
    assert!(tree.is_ephemeral(&key.to_string()));
    assert_eq!(client.ephemeral_cache().len().await, 1);
}
