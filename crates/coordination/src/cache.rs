//! Bookkeeping of ephemeral writes for replay after session expiry

use crate::error::Result;
use crate::key::CanonicalKey;
use futures::lock::Mutex;
use indexmap::IndexMap;
use std::future::Future;
use tracing::{debug, warn};

/// Outcome of one replay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Entries written back successfully
    pub replayed: usize,
    /// Entries whose write failed
    pub failed: usize,
}

/// Last payload of every ephemeral entry this client wrote, in first-write
/// order. Overwrites keep the original position.
#[derive(Default)]
pub struct EphemeralNodeCache {
    entries: Mutex<IndexMap<CanonicalKey, Vec<u8>>>,
}

impl EphemeralNodeCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful ephemeral write
    pub async fn remember(&self, key: CanonicalKey, payload: Vec<u8>) {
        self.entries.lock().await.insert(key, payload);
    }

    /// Drop an entry after an explicit delete; returns whether it was cached
    pub async fn forget(&self, key: &CanonicalKey) -> bool {
        self.entries.lock().await.shift_remove(key).is_some()
    }

    /// Cached payload for `key`
    pub async fn get(&self, key: &CanonicalKey) -> Option<Vec<u8>> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Number of cached entries
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nothing is cached
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Copy of all entries in insertion order
    pub async fn snapshot(&self) -> Vec<(CanonicalKey, Vec<u8>)> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(key, payload)| (key.clone(), payload.clone()))
            .collect()
    }

    /// Re-issue every cached entry through `write`, in insertion order.
    ///
    /// A failed entry is logged and counted; the pass always visits every
    /// entry. The cache is not locked while writes run.
    pub async fn replay_all<F, Fut>(&self, mut write: F) -> ReplayReport
    where
        F: FnMut(CanonicalKey, Vec<u8>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut report = ReplayReport::default();
        for (key, payload) in self.snapshot().await {
            let path = key.to_string();
            match write(key, payload).await {
                Ok(()) => {
                    debug!("Replayed ephemeral entry {}", path);
                    report.replayed += 1;
                }
                Err(e) => {
                    warn!("Failed to replay ephemeral entry {}: {}", path, e);
                    report.failed += 1;
                }
            }
        }
        report
    }
}
