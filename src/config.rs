//! Service configuration

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ReadError;
use crate::types::{Address, ChainId};

/// Environment variable prefix for per-chain RPC URL overrides,
/// e.g. `CHAINCACHE_RPC_URL_137`.
pub const RPC_URL_ENV_PREFIX: &str = "CHAINCACHE_RPC_URL_";

/// Configuration for a bounded TTL cache
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries held at once
    pub max_capacity: usize,
    /// Time-to-live for each entry
    #[serde(rename = "ttl_secs", with = "duration_secs")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            ttl: Duration::from_secs(15),
        }
    }
}

/// Configuration for the token metadata cache
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub max_capacity: u64,
    /// Records younger than this are served without a refresh
    #[serde(rename = "fresh_secs", with = "duration_secs")]
    pub fresh_for: Duration,
    /// Records are kept (and served while refreshing) up to this age
    #[serde(rename = "stale_secs", with = "duration_secs")]
    pub stale_for: Duration,
    /// Precision reported while no record is available
    pub default_decimals: u8,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            fresh_for: Duration::from_secs(60 * 60),
            stale_for: Duration::from_secs(24 * 60 * 60),
            default_decimals: 18,
        }
    }
}

/// Configuration for the per-chain admission limiter
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Admits allowed before the counter decays
    pub capacity: u32,
    /// Quiet period after the last admit that resets the counter
    #[serde(rename = "window_secs", with = "duration_secs")]
    pub window: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Timeout and retry policy bound to each chain client at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportPolicy {
    #[serde(rename = "timeout_ms", with = "duration_millis")]
    pub timeout: Duration,
    /// Extra attempts after the first for idempotent reads
    pub retry_budget: u32,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry_budget: 2,
        }
    }
}

/// Endpoint configuration for one chain
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChainEndpoint {
    pub chain_id: ChainId,
    #[serde(default)]
    pub name: Option<String>,
    pub rpc_url: String,
    /// Position registry queried with `getPoolPositions`
    pub registry_address: Address,
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind: String,
    pub response_cache: CacheConfig,
    pub metadata: MetadataConfig,
    pub admission: AdmissionConfig,
    pub transport: TransportPolicy,
    pub chains: Vec<ChainEndpoint>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_owned(),
            response_cache: CacheConfig::default(),
            metadata: MetadataConfig::default(),
            admission: AdmissionConfig::default(),
            transport: TransportPolicy::default(),
            chains: Vec::new(),
        }
    }
}

impl ServiceConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ReadError> {
        let config: Self = toml::from_str(raw).map_err(|e| ReadError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ReadError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ReadError::Config(format!("reading {}: {}", path.display(), e)))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Replace RPC URLs from `CHAINCACHE_RPC_URL_<chainId>` lookups.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for chain in &mut self.chains {
            if let Some(url) = lookup(&format!("{}{}", RPC_URL_ENV_PREFIX, chain.chain_id))
                && !url.is_empty()
            {
                chain.rpc_url = url;
            }
        }
    }

    fn validate(&self) -> Result<(), ReadError> {
        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                return Err(ReadError::Config(format!(
                    "chain {} is configured more than once",
                    chain.chain_id
                )));
            }
            if chain.rpc_url.is_empty() {
                return Err(ReadError::Config(format!(
                    "chain {} has an empty rpc_url",
                    chain.chain_id
                )));
            }
        }
        if self.admission.capacity == 0 {
            return Err(ReadError::Config("admission.capacity must be positive".to_owned()));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
