//! chaincache - Read-path caching for EVM chain reads
//!
//! This library sits between request handlers and a slow, rate-limited chain
//! RPC endpoint:
//! - Response cache: bounded, TTL-expiring, least-recently-used eviction
//! - Request coalescing: at most one upstream fetch per key at any moment
//! - Admission limiter: per-chain call budget with a decaying window
//! - Client pool: one lazily built JSON-RPC client per chain
//! - Token metadata cache: non-blocking decimals with background refresh
//!
//! All state lives in an explicitly constructed [`PositionService`], which the
//! HTTP layer in [`http`] shares with its handlers.

pub mod abi;
pub mod client;
mod coalesce;
mod config;
mod error;
pub mod http;
pub mod key;
mod limiter;
pub mod metadata;
pub mod service;
#[cfg(test)]
mod testing;
mod ttl_cache;
mod types;

pub use client::{ChainReader, ClientFactory, ClientPool, RpcChainClient, RpcClientFactory};
pub use coalesce::{Coalescer, Outcome};
pub use config::{
    AdmissionConfig, CacheConfig, ChainEndpoint, MetadataConfig, ServiceConfig, TransportPolicy,
};
pub use error::ReadError;
pub use key::Fingerprint;
pub use limiter::{Admission, AdmissionCounter, AdmissionLimiter};
pub use metadata::{MetadataCache, MetadataRecord};
pub use service::{BalanceQuery, PositionQuery, PositionService, PositionsReply};
pub use ttl_cache::{CacheEntry, CacheKey, TtlCache};
pub use types::{Address, ChainId, Position};

// Re-export async_trait for implementors of ChainReader
pub use async_trait::async_trait;
