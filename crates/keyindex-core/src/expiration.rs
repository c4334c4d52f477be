//! Size-weighted LRU deciding which cached read results to drop.
//!
//! Owners report each use of a cached entry together with its weight. When
//! the total weight exceeds the budget, the least recently used entries are
//! evicted and their owners told to forget them.

use std::sync::{Arc, Mutex, Weak};

use lru::LruCache;
use tracing::debug;

use keyindex_storage::KeyValue;

use crate::config::IndexingConfig;

/// Something holding cached values that can be dropped on demand.
pub trait Expirable: Send + Sync {
    fn expire(&self, key: &KeyValue);
}

struct Tracked {
    weight: u64,
    owner: Weak<dyn Expirable>,
}

struct Inner {
    entries: LruCache<(String, KeyValue), Tracked>,
    used: u64,
}

/// Shared eviction policy across every index of a process.
pub struct ExpirationStrategy {
    capacity: u64,
    inner: Mutex<Inner>,
}

impl ExpirationStrategy {
    pub fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                used: 0,
            }),
        })
    }

    /// Strategy sized by `cache_capacity_bytes`.
    pub fn from_config(config: &IndexingConfig) -> Arc<Self> {
        Self::new(config.cache_capacity_bytes)
    }

    /// Record a use of `key` cached by `owner`, evicting as needed.
    pub fn use_entry(&self, owner: Weak<dyn Expirable>, owner_name: &str, key: &KeyValue, weight: u64) {
        let evicted = {
            let mut inner = self.inner.lock().expect("expiration mutex poisoned");
            let slot = (owner_name.to_string(), key.clone());
            if let Some(previous) = inner.entries.put(slot, Tracked { weight, owner }) {
                inner.used -= previous.weight;
            }
            inner.used += weight;

            let mut evicted = Vec::new();
            while inner.used > self.capacity {
                match inner.entries.pop_lru() {
                    Some(((_, key), tracked)) => {
                        inner.used -= tracked.weight;
                        evicted.push((key, tracked.owner));
                    }
                    None => break,
                }
            }
            evicted
        };

        for (key, owner) in evicted {
            if let Some(owner) = owner.upgrade() {
                debug!(key = %key, "Expiring cached index value");
                owner.expire(&key);
            }
        }
    }

    /// Stop tracking an entry the owner already dropped.
    pub fn forget(&self, owner_name: &str, key: &KeyValue) {
        let mut inner = self.inner.lock().expect("expiration mutex poisoned");
        if let Some(tracked) = inner.entries.pop(&(owner_name.to_string(), key.clone())) {
            inner.used -= tracked.weight;
        }
    }

    /// Total weight currently tracked
    pub fn used(&self) -> u64 {
        self.inner.lock().expect("expiration mutex poisoned").used
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("expiration mutex poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
