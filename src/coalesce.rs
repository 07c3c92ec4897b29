//! Request coalescing for in-flight upstream fetches
//!
//! The first caller for a key becomes the owner: its producer runs as a tokio
//! task and every later caller for the same key attaches to that fetch instead
//! of starting another one. When the fetch settles the pending entry is removed
//! and all attached callers receive the same outcome. Nothing is remembered
//! afterwards, so a failure is retried by the next caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::ReadError;
use crate::ttl_cache::CacheKey;

/// Outcome shared with every caller attached to a fetch.
pub type Outcome<V> = Result<Arc<V>, ReadError>;

type OutcomeSender<V> = watch::Sender<Option<Outcome<V>>>;
type OutcomeReceiver<V> = watch::Receiver<Option<Outcome<V>>>;

/// A fetch that callers can attach to
struct PendingFetch<V> {
    rx: OutcomeReceiver<V>,
    waiters: usize,
}

type PendingMap<K, V> = Arc<Mutex<HashMap<K, PendingFetch<V>>>>;

/// Settles a pending fetch exactly once.
///
/// If dropped before `settle` (the producer panicked), waiters are released
/// with [`ReadError::FetchAborted`].
struct SettleGuard<K: CacheKey, V> {
    key: K,
    pending: PendingMap<K, V>,
    tx: Option<OutcomeSender<V>>,
}

impl<K: CacheKey, V> SettleGuard<K, V> {
    fn settle(mut self, outcome: Outcome<V>) {
        self.release(outcome);
    }

    fn release(&mut self, outcome: Outcome<V>) {
        if let Some(tx) = self.tx.take() {
            // Removal and broadcast happen under the same lock so no caller can
            // attach to a fetch that has already delivered its outcome.
            let mut pending = self.pending.lock();
            let waiters = pending.remove(&self.key).map_or(0, |p| p.waiters);
            debug!(
                "Settled in-flight fetch for key: {} ({} waiters, ok={})",
                self.key,
                waiters,
                outcome.is_ok()
            );
            let _ = tx.send(Some(outcome));
        }
    }
}

impl<K: CacheKey, V> Drop for SettleGuard<K, V> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!("In-flight fetch for key {} ended without an outcome", self.key);
            self.release(Err(ReadError::FetchAborted));
        }
    }
}

/// Tracks pending fetches and guarantees at most one producer per key.
pub struct Coalescer<K: CacheKey, V> {
    pending: PendingMap<K, V>,
}

impl<K: CacheKey, V> Clone for Coalescer<K, V> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<K: CacheKey, V> Default for Coalescer<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CacheKey, V> Coalescer<K, V> {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of callers that have attached to the pending fetch for `key`,
    /// if any. Callers that stopped waiting are still counted.
    pub fn waiters(&self, key: &K) -> Option<usize> {
        self.pending.lock().get(key).map(|p| p.waiters)
    }

    /// Number of keys with a fetch in flight.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: CacheKey, V: Send + Sync + 'static> Coalescer<K, V> {
    /// Run `producer` for `key` unless a fetch is already in flight, in which
    /// case wait for that fetch's outcome instead.
    ///
    /// The producer is spawned onto the runtime, so dropping the returned
    /// future does not cancel the fetch for other callers.
    pub async fn coalesce<F, Fut>(&self, key: K, producer: F) -> Outcome<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ReadError>> + Send + 'static,
    {
        let (mut rx, owner) = {
            let mut pending = self.pending.lock();
            if let Some(fetch) = pending.get_mut(&key) {
                fetch.waiters += 1;
                debug!(
                    "Attached to in-flight fetch for key: {} (waiters={})",
                    key, fetch.waiters
                );
                (fetch.rx.clone(), None)
            } else {
                let (tx, rx) = watch::channel(None);
                pending.insert(
                    key.clone(),
                    PendingFetch {
                        rx: rx.clone(),
                        waiters: 1,
                    },
                );
                let guard = SettleGuard {
                    key: key.clone(),
                    pending: Arc::clone(&self.pending),
                    tx: Some(tx),
                };
                (rx, Some(guard))
            }
        };

        if let Some(guard) = owner {
            debug!("Starting upstream fetch for key: {}", key);
            let fetch = producer();
            tokio::spawn(async move {
                let outcome = fetch.await.map(Arc::new);
                guard.settle(outcome);
            });
        }

        wait_for_outcome(&mut rx).await
    }
}

async fn wait_for_outcome<V>(rx: &mut OutcomeReceiver<V>) -> Outcome<V> {
    loop {
        if let Some(outcome) = rx.borrow_and_update().as_ref() {
            return outcome.clone();
        }
        if rx.changed().await.is_err() {
            // Sender gone: the outcome, if any, is still readable.
            return rx.borrow().clone().unwrap_or(Err(ReadError::FetchAborted));
        }
    }
}
