//! Sessions over a leased key-value store
//!
//! A session is a lease: ephemeral entries are written with the lease
//! attached, a background loop keeps the lease alive, and losing the lease
//! is reported as session expiry. Keys are flat strings, so no parent
//! entries are written.

use super::{Connection, Connector, KeyLayout, RegistryEndpoint, SessionEventSender, WatchedEvent};
use crate::error::{Error, Result};
use crate::key::{CanonicalKey, Durability, SEPARATOR};
use crate::runtime::{self, Spawner};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lease identifier
pub type LeaseId = i64;

/// Minimal leased key-value API.
///
/// Transport failures must be reported as `ConnectionLoss`; writes against a
/// lease the store no longer knows as `SessionExpired`.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Grant a lease with the given time to live
    async fn grant(&self, ttl: Duration) -> Result<LeaseId>;

    /// Refresh a lease; `false` if the store no longer knows it
    async fn keep_alive(&self, lease: LeaseId) -> Result<bool>;

    /// Revoke a lease, deleting every key attached to it
    async fn revoke(&self, lease: LeaseId) -> Result<()>;

    /// Write a key, optionally attached to a lease
    async fn put(&self, key: &str, value: &[u8], lease: Option<LeaseId>) -> Result<()>;

    /// Overwrite the value of an existing key, keeping its lease; `false`
    /// if the key does not exist
    async fn update(&self, key: &str, value: &[u8]) -> Result<bool>;

    /// Read a key
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a key; `false` if it did not exist
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All keys starting with `prefix`
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Opens lease-backed sessions
pub struct LeaseKvConnector {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    spawner: Arc<dyn Spawner>,
}

impl LeaseKvConnector {
    /// Create a connector granting leases of `ttl`; keep-alive loops are
    /// handed to `spawner`
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration, spawner: Arc<dyn Spawner>) -> Self {
        Self {
            store,
            ttl,
            spawner,
        }
    }
}

#[async_trait]
impl Connector for LeaseKvConnector {
    async fn connect(
        &self,
        _endpoint: &RegistryEndpoint,
        events: SessionEventSender,
    ) -> Result<Arc<dyn Connection>> {
        if self.ttl.is_zero() {
            return Err(Error::InvalidConfiguration("lease ttl must be positive".to_string()));
        }
        let lease = self.store.grant(self.ttl).await?;
        info!("Granted lease {} (ttl {} s)", lease, self.ttl.as_secs_f32());

        let closed = Arc::new(AtomicBool::new(false));
        self.spawner.spawn(Box::pin(keep_alive_loop(
            Arc::clone(&self.store),
            lease,
            self.ttl / 3,
            Arc::clone(&closed),
            events.clone(),
        )));
        events.notify(WatchedEvent::SyncConnected);

        Ok(Arc::new(LeaseConnection {
            store: Arc::clone(&self.store),
            lease,
            closed,
        }))
    }
}

async fn keep_alive_loop(
    store: Arc<dyn KvStore>,
    lease: LeaseId,
    interval: Duration,
    closed: Arc<AtomicBool>,
    events: SessionEventSender,
) {
    let mut healthy = true;
    loop {
        runtime::sleep(interval).await;
        if closed.load(Ordering::SeqCst) {
            break;
        }

        let delivered = match store.keep_alive(lease).await {
            Ok(true) if healthy => true,
            Ok(true) => {
                info!("Lease {} keep-alive recovered", lease);
                healthy = true;
                events.notify(WatchedEvent::SyncConnected)
            }
            Ok(false) => {
                warn!("Lease {} is gone", lease);
                events.notify(WatchedEvent::Expired);
                break;
            }
            Err(e) if healthy => {
                warn!("Lease {} keep-alive failed: {}", lease, e);
                healthy = false;
                events.notify(WatchedEvent::Disconnected)
            }
            Err(e) => {
                debug!("Lease {} keep-alive still failing: {}", lease, e);
                true
            }
        };
        if !delivered {
            break;
        }
    }
    debug!("Keep-alive loop for lease {} stopped", lease);
}

/// One lease-backed session
pub struct LeaseConnection {
    store: Arc<dyn KvStore>,
    lease: LeaseId,
    closed: Arc<AtomicBool>,
}

impl LeaseConnection {
    /// Lease owning this session's ephemeral entries
    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

fn child_prefix(key: &CanonicalKey) -> String {
    if key.is_root() {
        SEPARATOR.to_string()
    } else {
        format!("{}{}", key, SEPARATOR)
    }
}

#[async_trait]
impl Connection for LeaseConnection {
    fn layout(&self) -> KeyLayout {
        KeyLayout::Flat
    }

    async fn exists(&self, key: &CanonicalKey) -> Result<bool> {
        self.check_open()?;
        Ok(self.store.get(&key.to_string()).await?.is_some())
    }

    async fn create(&self, key: &CanonicalKey, data: &[u8], durability: Durability) -> Result<()> {
        self.check_open()?;
        let path = key.to_string();
        if self.store.get(&path).await?.is_some() {
            return Err(Error::AlreadyExists(path));
        }
        let lease = match durability {
            Durability::Persistent => None,
            Durability::Ephemeral => Some(self.lease),
        };
        self.store.put(&path, data, lease).await
    }

    async fn set_data(&self, key: &CanonicalKey, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let path = key.to_string();
        if self.store.update(&path, data).await? {
            Ok(())
        } else {
            Err(Error::NoNode(path))
        }
    }

    async fn get_data(&self, key: &CanonicalKey) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        self.store.get(&key.to_string()).await
    }

    async fn children(&self, key: &CanonicalKey) -> Result<Vec<String>> {
        self.check_open()?;
        let prefix = child_prefix(key);
        let names: BTreeSet<String> = self
            .store
            .keys_with_prefix(&prefix)
            .await?
            .iter()
            .filter_map(|k| k[prefix.len()..].split(SEPARATOR).next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn watch_children(&self, key: &CanonicalKey) -> Result<Vec<String>> {
        Err(Error::Unsupported(format!(
            "child watches on leased store ({})",
            key
        )))
    }

    async fn delete(&self, key: &CanonicalKey) -> Result<()> {
        self.check_open()?;
        let path = key.to_string();
        if self.store.delete(&path).await? {
            Ok(())
        } else {
            Err(Error::NoNode(path))
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Revoking lease {}", self.lease);
        match self.store.revoke(self.lease).await {
            // An expired lease has nothing left to revoke
            Ok(()) | Err(Error::SessionExpired) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
}

#[derive(Default)]
struct KvState {
    entries: BTreeMap<String, (Vec<u8>, Option<LeaseId>)>,
    leases: HashMap<LeaseId, LeaseEntry>,
    next_lease: LeaseId,
    unreachable: bool,
}

impl KvState {
    fn check(&mut self) -> Result<()> {
        if self.unreachable {
            return Err(Error::ConnectionLoss("store unreachable".to_string()));
        }
        let now = Instant::now();
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            debug!("Lease {} ran out", id);
            self.drop_lease(id);
        }
        Ok(())
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let known = self.leases.remove(&id).is_some();
        self.entries.retain(|_, (_, lease)| *lease != Some(id));
        known
    }
}

/// In-process leased key-value store.
///
/// Leases run out when not refreshed within their time to live. The store
/// can be made unreachable to simulate transport failures.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    state: Arc<Mutex<KvState>>,
}

impl MemoryKvStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `ConnectionLoss` while `unreachable`
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Drop a lease and its keys, as if it ran out
    pub fn expire_lease(&self, lease: LeaseId) {
        self.lock().drop_lease(lease);
    }

    /// Currently known leases, lowest first
    pub fn leases(&self) -> Vec<LeaseId> {
        let mut state = self.lock();
        let _ = state.check();
        let mut ids: Vec<LeaseId> = state.leases.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Value stored under `key`
    pub fn read(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().entries.get(key).map(|(value, _)| value.clone())
    }

    /// Lease attached to `key`
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.lock().entries.get(key).and_then(|(_, lease)| *lease)
    }

    fn lock(&self) -> MutexGuard<'_, KvState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId> {
        let mut state = self.lock();
        state.check()?;
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<bool> {
        let mut state = self.lock();
        state.check()?;
        match state.leases.get_mut(&lease) {
            Some(entry) => {
                entry.deadline = Instant::now() + entry.ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.lock();
        state.check()?;
        if state.drop_lease(lease) {
            Ok(())
        } else {
            Err(Error::SessionExpired)
        }
    }

    async fn put(&self, key: &str, value: &[u8], lease: Option<LeaseId>) -> Result<()> {
        let mut state = self.lock();
        state.check()?;
        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(Error::SessionExpired);
            }
        }
        state.entries.insert(key.to_string(), (value.to_vec(), lease));
        Ok(())
    }

    async fn update(&self, key: &str, value: &[u8]) -> Result<bool> {
        let mut state = self.lock();
        state.check()?;
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.0 = value.to_vec();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut state = self.lock();
        state.check()?;
        Ok(state.entries.get(key).map(|(value, _)| value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.lock();
        state.check()?;
        Ok(state.entries.remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.check()?;
        Ok(state
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
