//! Short-lived read-through cache for coordinator reads.
//!
//! Entries expire after a fixed TTL. The coordinator invalidates keys it
//! writes itself; writes made elsewhere become visible once the entry ages
//! out. Every invalidation bumps an epoch, and a load that started before
//! the bump is not cached.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// TTL map guarded by a tokio `RwLock`.
pub struct ReadCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    ttl: Duration,
    /// Bumped under the write lock by `invalidate` and `clear`.
    epoch: AtomicU64,
}

impl<K, V> ReadCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            epoch: AtomicU64::new(0),
        }
    }

    /// Snapshot to take before reading the backing store.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Fresh value for `key`, if any.
    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .map(|e| e.value.clone())
    }

    /// Cache `value` unless an invalidation happened after `epoch` was
    /// taken. Returns whether the value was stored.
    pub async fn insert_since(&self, epoch: u64, key: K, value: V) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        let mut entries = self.entries.write().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        entries.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
        true
    }

    /// Drop `key`. Returns whether an entry was present.
    pub async fn invalidate(&self, key: &K) -> bool {
        let mut entries = self.entries.write().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        entries.remove(key).is_some()
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        entries.clear();
    }

    /// Return the cached value, or run `load` and cache what it returns.
    /// Errors are passed through and nothing is cached.
    pub async fn get_or_load<F, Fut, E>(&self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(&key).await {
            return Ok(hit);
        }
        let epoch = self.epoch();
        let value = load().await?;
        self.insert_since(epoch, key, value.clone()).await;
        Ok(value)
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.stored_at.elapsed() < self.ttl);
        before - entries.len()
    }

    /// Number of stored entries, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
