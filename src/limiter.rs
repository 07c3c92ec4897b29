//! Per-chain admission limiter
//!
//! Each chain has a counter that is incremented on every admitted call. The
//! counter's expiry is pushed out by the decay window on every admit, so it
//! only resets after a quiet period of at least one window with no admitted
//! traffic. Once the counter reaches capacity, calls are denied without
//! touching the counter.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::AdmissionConfig;
use crate::error::ReadError;
use crate::types::ChainId;

/// Admission state for one chain
#[derive(Debug, Clone)]
pub struct AdmissionCounter {
    pub chain_id: ChainId,
    pub count: u32,
    pub last_touched: Instant,
}

/// Snapshot reported with each admitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub limit: u32,
    pub remaining: u32,
    /// Wall-clock instant at which the counter resets if no further calls are admitted
    pub reset_at: DateTime<Utc>,
}

impl Admission {
    pub fn reset_at_ms(&self) -> i64 {
        self.reset_at.timestamp_millis()
    }
}

pub struct AdmissionLimiter {
    capacity: u32,
    window: Duration,
    counters: Mutex<HashMap<ChainId, AdmissionCounter>>,
}

impl AdmissionLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self::new(config.capacity, config.window)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Admit one call for `chain_id`, or fail with [`ReadError::RateLimited`].
    pub fn try_admit(&self, chain_id: ChainId) -> Result<Admission, ReadError> {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        let counter = counters.entry(chain_id).or_insert(AdmissionCounter {
            chain_id,
            count: 0,
            last_touched: now,
        });

        if self.is_decayed(counter, now) {
            counter.count = 0;
        }

        if counter.count >= self.capacity {
            let admission = self.snapshot(Some(&*counter), now);
            warn!(
                "Admission denied for chain {} ({} calls in window)",
                chain_id, counter.count
            );
            return Err(ReadError::RateLimited {
                chain_id,
                limit: self.capacity,
                reset_at_ms: admission.reset_at_ms(),
            });
        }

        counter.count += 1;
        counter.last_touched = now;
        debug!(
            "Admitted call for chain {} ({}/{})",
            chain_id, counter.count, self.capacity
        );
        Ok(self.snapshot(Some(&*counter), now))
    }

    /// Current admission state for `chain_id` without counting a call.
    pub fn status(&self, chain_id: ChainId) -> Admission {
        let now = Instant::now();
        let counters = self.counters.lock();
        let counter = counters
            .get(&chain_id)
            .filter(|counter| !self.is_decayed(counter, now));
        self.snapshot(counter, now)
    }

    fn is_decayed(&self, counter: &AdmissionCounter, now: Instant) -> bool {
        now.saturating_duration_since(counter.last_touched) >= self.window
    }

    fn snapshot(&self, counter: Option<&AdmissionCounter>, now: Instant) -> Admission {
        let (count, until_reset) = match counter {
            Some(counter) if counter.count > 0 => (
                counter.count,
                (counter.last_touched + self.window).saturating_duration_since(now),
            ),
            _ => (0, Duration::ZERO),
        };
        let until_reset =
            chrono::Duration::from_std(until_reset).unwrap_or(chrono::Duration::zero());
        Admission {
            limit: self.capacity,
            remaining: self.capacity.saturating_sub(count),
            reset_at: Utc::now() + until_reset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_denies_call_beyond_capacity() {
        let limiter = AdmissionLimiter::new(3, Duration::from_secs(60));
        for expected_remaining in [2, 1, 0] {
            let admission = limiter.try_admit(1).unwrap();
            assert_eq!(admission.remaining, expected_remaining);
            assert_eq!(admission.limit, 3);
        }

        let err = limiter.try_admit(1).unwrap_err();
        assert!(matches!(err, ReadError::RateLimited { chain_id: 1, limit: 3, .. }));
        // Denials do not count.
        assert_eq!(limiter.counters.lock()[&1].count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chains_are_isolated() {
        let limiter = AdmissionLimiter::new(1, Duration::from_secs(60));
        limiter.try_admit(1).unwrap();
        assert!(limiter.try_admit(1).is_err());
        assert!(limiter.try_admit(137).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resets_only_after_quiet_window() {
        let limiter = AdmissionLimiter::new(2, Duration::from_secs(60));
        limiter.try_admit(1).unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        // Admit renews the window from this call.
        limiter.try_admit(1).unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(limiter.try_admit(1).is_err());

        // 59s after the last admit: still denied.
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(limiter.try_admit(1).is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        let admission = limiter.try_admit(1).unwrap();
        assert_eq!(admission.remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_does_not_count() {
        let limiter = AdmissionLimiter::new(5, Duration::from_secs(60));
        assert_eq!(limiter.status(1).remaining, 5);
        limiter.try_admit(1).unwrap();
        assert_eq!(limiter.status(1).remaining, 4);
        assert_eq!(limiter.status(1).remaining, 4);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.status(1).remaining, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_is_one_window_after_last_admit() {
        let limiter = AdmissionLimiter::new(5, Duration::from_secs(60));
        let before = Utc::now();
        let admission = limiter.try_admit(1).unwrap();
        let delta = admission.reset_at - before;
        assert!(delta >= chrono::Duration::seconds(59));
        assert!(delta <= chrono::Duration::seconds(61));
    }
}
