//! Bounded in-memory cache with per-entry expiry and LRU eviction
//!
//! Entries expire a fixed duration after insertion. Independently of expiry,
//! the cache holds at most `max_capacity` entries and evicts the least
//! recently used one when a new key would exceed that bound.
//!
//! Failed fetches are never written here: callers only `set` successful values.

use std::fmt::Display;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;

/// Trait for cache key types
pub trait CacheKey: Display + Hash + Eq + Clone + Send + Sync + 'static {}
impl<T> CacheKey for T where T: Display + Hash + Eq + Clone + Send + Sync + 'static {}

/// A stored value and its lifetime bounds.
#[derive(Debug)]
pub struct CacheEntry<V> {
    pub value: Arc<V>,
    pub inserted_at: Instant,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Capacity-bounded TTL cache.
pub struct TtlCache<K: CacheKey, V> {
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    ttl: Duration,
}

impl<K: CacheKey, V> TtlCache<K, V> {
    /// Create a cache holding at most `max_capacity` entries for `ttl` each.
    ///
    /// A capacity of zero is treated as one.
    pub fn new(max_capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_capacity, config.ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a live entry, marking it most recently used.
    ///
    /// An expired entry counts as a miss and is removed.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired = match entries.peek(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                debug!("Cache miss for key: {}", key);
                return None;
            }
        };

        if expired {
            entries.pop(key);
            debug!("Cache entry expired for key: {}", key);
            return None;
        }

        debug!("Cache hit for key: {}", key);
        entries.get(key).map(|entry| Arc::clone(&entry.value))
    }

    /// Insert `value`, replacing any previous entry for `key`.
    pub fn set(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        self.set_shared(key, Arc::clone(&value));
        value
    }

    /// Insert an already shared value.
    pub fn set_shared(&self, key: K, value: Arc<V>) {
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            inserted_at: now,
            expires_at: now + self.ttl,
        };

        let mut entries = self.entries.lock();
        if let Some((evicted, _)) = entries.push(key.clone(), entry)
            && evicted != key
        {
            debug!("Evicted least recently used key: {}", evicted);
        }
    }

    /// Remove `key`. Returns whether an entry was present.
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = self.entries.lock().pop(key).is_some();
        if removed {
            debug!("Invalidated cache key: {}", key);
        }
        removed
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
