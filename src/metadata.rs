//! Token metadata cache for the amount-formatting path
//!
//! Decimal precision is read synchronously: a cached record is returned as-is
//! (and refreshed in the background once it is past its fresh horizon), and a
//! missing record yields the default precision while a background fetch
//! populates the cache. A failed fetch caches nothing, so the next read
//! triggers another attempt. Formatting never waits on the upstream chain.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::client::ClientPool;
use crate::coalesce::Coalescer;
use crate::config::MetadataConfig;
use crate::error::ReadError;
use crate::key::Fingerprint;
use crate::limiter::AdmissionLimiter;
use crate::types::{Address, ChainId};

/// Descriptive data for one token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub chain_id: ChainId,
    pub token: Address,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: u8,
    pub fetched_at: Instant,
}

impl MetadataRecord {
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.fetched_at)
    }
}

struct MetadataCacheInner {
    records: Cache<Fingerprint, Arc<MetadataRecord>>,
    refreshes: Coalescer<Fingerprint, MetadataRecord>,
    pool: Arc<ClientPool>,
    limiter: Arc<AdmissionLimiter>,
    config: MetadataConfig,
}

/// Stale-tolerant token metadata cache
#[derive(Clone)]
pub struct MetadataCache {
    inner: Arc<MetadataCacheInner>,
}

impl MetadataCache {
    pub fn new(
        config: MetadataConfig,
        pool: Arc<ClientPool>,
        limiter: Arc<AdmissionLimiter>,
    ) -> Self {
        let records = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.stale_for)
            .build();

        Self {
            inner: Arc::new(MetadataCacheInner {
                records,
                refreshes: Coalescer::new(),
                pool,
                limiter,
                config,
            }),
        }
    }

    pub fn default_decimals(&self) -> u8 {
        self.inner.config.default_decimals
    }

    /// The cached record for `token`, fresh or stale.
    pub fn cached(&self, token: &Address, chain_id: ChainId) -> Option<Arc<MetadataRecord>> {
        self.live_record(&Fingerprint::token_metadata(chain_id, token))
    }

    /// A record younger than the stale horizon. Older records still held by
    /// the store count as missing.
    fn live_record(&self, key: &Fingerprint) -> Option<Arc<MetadataRecord>> {
        self.inner
            .records
            .get(key)
            .filter(|record| record.age() < self.inner.config.stale_for)
    }

    /// Decimal precision for `token`, without waiting on the chain.
    pub fn decimals_for(&self, token: &Address, chain_id: ChainId) -> u8 {
        let key = Fingerprint::token_metadata(chain_id, token);
        match self.live_record(&key) {
            Some(record) if record.age() < self.inner.config.fresh_for => record.decimals,
            Some(record) => {
                debug!("Serving stale metadata for key: {}", key);
                self.refresh_in_background(key, *token, chain_id);
                record.decimals
            }
            None => {
                self.refresh_in_background(key, *token, chain_id);
                self.inner.config.default_decimals
            }
        }
    }

    /// Render a base-unit `raw` amount of `token` as a decimal string.
    pub fn format_amount(&self, raw: u128, token: &Address, chain_id: ChainId) -> String {
        format_units(raw, self.decimals_for(token, chain_id))
    }

    /// The full record for `token`, fetching it if missing or stale.
    pub async fn metadata(
        &self,
        token: &Address,
        chain_id: ChainId,
    ) -> Result<Arc<MetadataRecord>, ReadError> {
        let key = Fingerprint::token_metadata(chain_id, token);
        if let Some(record) = self.live_record(&key)
            && record.age() < self.inner.config.fresh_for
        {
            return Ok(record);
        }
        self.fetch(key, *token, chain_id).await
    }

    /// Number of metadata fetches currently in flight.
    pub fn pending_refreshes(&self) -> usize {
        self.inner.refreshes.len()
    }

    fn refresh_in_background(&self, key: Fingerprint, token: Address, chain_id: ChainId) {
        if self.inner.refreshes.waiters(&key).is_some() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available to refresh metadata for key: {}", key);
            return;
        };

        let cache = self.clone();
        handle.spawn(async move {
            if let Err(e) = cache.fetch(key, token, chain_id).await {
                let err = ReadError::MetadataFetch {
                    chain_id,
                    token: token.to_string(),
                    message: e.to_string(),
                };
                warn!("{}; using default precision", err);
            }
        });
    }

    async fn fetch(
        &self,
        key: Fingerprint,
        token: Address,
        chain_id: ChainId,
    ) -> Result<Arc<MetadataRecord>, ReadError> {
        let inner = Arc::clone(&self.inner);
        let cache_key = key.clone();
        self.inner
            .refreshes
            .coalesce(key, move || async move {
                inner.pool.ensure_supported(chain_id)?;
                inner.limiter.try_admit(chain_id)?;
                let client = inner.pool.client_for(chain_id)?;

                let decimals = client.decimals(&token).await?;
                let symbol = client
                    .symbol(&token)
                    .await
                    .inspect_err(|e| debug!("symbol() unavailable for {}: {}", token, e))
                    .ok();
                let name = client
                    .name(&token)
                    .await
                    .inspect_err(|e| debug!("name() unavailable for {}: {}", token, e))
                    .ok();

                let record = MetadataRecord {
                    chain_id,
                    token,
                    name,
                    symbol,
                    decimals,
                    fetched_at: Instant::now(),
                };
                inner.records.insert(cache_key, Arc::new(record.clone()));
                debug!("Cached metadata for {} on chain {}", token, chain_id);
                Ok(record)
            })
            .await
    }
}

/// Render `raw` base units with `decimals` fractional digits, trimming
/// trailing zeros.
pub fn format_units(raw: u128, decimals: u8) -> String {
    let digits = raw.to_string();
    let decimals = usize::from(decimals);
    if decimals == 0 {
        return digits;
    }

    let padded = if digits.len() <= decimals {
        format!("{}{}", "0".repeat(decimals - digits.len() + 1), digits)
    } else {
        digits
    };
    let (whole, fraction) = padded.split_at(padded.len() - decimals);
    let fraction = fraction.trim_end_matches('0');
    if fraction.is_empty() {
        whole.to_owned()
    } else {
        format!("{}.{}", whole, fraction)
    }
}
