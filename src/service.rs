//! Read service
//!
//! [`PositionService`] owns every piece of shared read-path state: the
//! response cache, the in-flight maps, the admission limiter, the client pool
//! and the metadata cache. It is constructed once and handed to request
//! handlers; cloning it shares the same state.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::client::{ClientFactory, ClientPool, RpcClientFactory};
use crate::coalesce::{Coalescer, Outcome};
use crate::config::ServiceConfig;
use crate::error::ReadError;
use crate::key::Fingerprint;
use crate::limiter::{Admission, AdmissionLimiter};
use crate::metadata::{MetadataCache, format_units};
use crate::ttl_cache::TtlCache;
use crate::types::{Address, ChainId, Position};

const BALANCE_NAMESPACE: &str = "balance";

/// Validated input of a position listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionQuery {
    pub chain_id: ChainId,
    pub pool: Address,
    pub user: Address,
}

impl PositionQuery {
    /// Validate raw `chainId`, `poolAddress` and `userAddress` parameters.
    pub fn from_params(
        chain_id: Option<&str>,
        pool: Option<&str>,
        user: Option<&str>,
    ) -> Result<Self, ReadError> {
        let [chain_id, pool, user] = require([
            ("chainId", chain_id),
            ("poolAddress", pool),
            ("userAddress", user),
        ])?;
        Ok(Self {
            chain_id: parse_chain_id(chain_id)?,
            pool: Address::parse_param("poolAddress", pool)?,
            user: Address::parse_param("userAddress", user)?,
        })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::positions(self.chain_id, &self.pool, &self.user)
    }
}

/// Validated input of a token balance lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceQuery {
    pub chain_id: ChainId,
    pub token: Address,
    pub owner: Address,
}

impl BalanceQuery {
    pub fn from_params(
        chain_id: Option<&str>,
        token: Option<&str>,
        owner: Option<&str>,
    ) -> Result<Self, ReadError> {
        let [chain_id, token, owner] = require([
            ("chainId", chain_id),
            ("tokenAddress", token),
            ("ownerAddress", owner),
        ])?;
        Ok(Self {
            chain_id: parse_chain_id(chain_id)?,
            token: Address::parse_param("tokenAddress", token)?,
            owner: Address::parse_param("ownerAddress", owner)?,
        })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::builder(BALANCE_NAMESPACE, self.chain_id)
            .address("token", &self.token)
            .address("owner", &self.owner)
            .build()
    }
}

fn require<'a, const N: usize>(
    params: [(&'static str, Option<&'a str>); N],
) -> Result<[&'a str; N], ReadError> {
    let missing: Vec<&'static str> = params
        .iter()
        .filter(|(_, value)| value.is_none_or(|v| v.trim().is_empty()))
        .map(|(name, _)| *name)
        .collect();
    if !missing.is_empty() {
        return Err(ReadError::MissingParameters(missing));
    }
    Ok(params.map(|(_, value)| value.unwrap_or_default().trim()))
}

fn parse_chain_id(raw: &str) -> Result<ChainId, ReadError> {
    raw.parse().map_err(|_| ReadError::InvalidParameter {
        name: "chainId",
        reason: format!("'{}' is not a positive integer", raw),
    })
}

/// Positions plus the admission state reported to the caller
#[derive(Debug, Clone)]
pub struct PositionsReply {
    pub positions: Arc<Vec<Position>>,
    pub admission: Admission,
    pub cached: bool,
}

/// A token balance rendered for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceReply {
    pub token: Address,
    pub owner: Address,
    /// Base units, as a string so JSON consumers keep full precision
    #[serde(serialize_with = "serialize_u128")]
    pub raw: u128,
    pub formatted: String,
    pub decimals: u8,
    pub symbol: Option<String>,
    #[serde(skip)]
    pub admission: Option<Admission>,
}

fn serialize_u128<S: serde::Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

#[derive(Clone)]
pub struct PositionService {
    responses: Arc<TtlCache<Fingerprint, Vec<Position>>>,
    positions_in_flight: Coalescer<Fingerprint, Vec<Position>>,
    balances_in_flight: Coalescer<Fingerprint, u128>,
    limiter: Arc<AdmissionLimiter>,
    pool: Arc<ClientPool>,
    metadata: MetadataCache,
}

impl PositionService {
    /// Build a service that talks JSON-RPC to the configured chains.
    pub fn new(config: &ServiceConfig) -> Self {
        Self::with_factory(config, RpcClientFactory)
    }

    pub fn with_factory(config: &ServiceConfig, factory: impl ClientFactory + 'static) -> Self {
        let limiter = Arc::new(AdmissionLimiter::from_config(&config.admission));
        let pool = Arc::new(ClientPool::new(
            config.chains.iter().cloned(),
            config.transport,
            factory,
        ));
        let metadata =
            MetadataCache::new(config.metadata.clone(), Arc::clone(&pool), Arc::clone(&limiter));

        info!(
            "Read service ready for chains {:?} (response ttl={:?}, admission {}/{:?})",
            pool.chain_ids(),
            config.response_cache.ttl,
            config.admission.capacity,
            config.admission.window
        );

        Self {
            responses: Arc::new(TtlCache::from_config(&config.response_cache)),
            positions_in_flight: Coalescer::new(),
            balances_in_flight: Coalescer::new(),
            limiter,
            pool,
            metadata,
        }
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    pub fn limiter(&self) -> &AdmissionLimiter {
        &self.limiter
    }

    pub fn pool(&self) -> &ClientPool {
        &self.pool
    }

    /// Positions `query.user` holds in `query.pool`.
    ///
    /// Served from the response cache when possible; otherwise one upstream
    /// call is made per distinct query no matter how many callers ask at once.
    pub async fn positions(&self, query: PositionQuery) -> Result<PositionsReply, ReadError> {
        let chain_id = query.chain_id;
        self.pool.ensure_supported(chain_id)?;

        let key = query.fingerprint();
        if let Some(positions) = self.responses.get(&key) {
            return Ok(PositionsReply {
                positions,
                admission: self.limiter.status(chain_id),
                cached: true,
            });
        }

        let positions = self.fetch_positions(query, key).await?;
        Ok(PositionsReply {
            positions,
            admission: self.limiter.status(chain_id),
            cached: false,
        })
    }

    async fn fetch_positions(
        &self,
        query: PositionQuery,
        key: Fingerprint,
    ) -> Outcome<Vec<Position>> {
        let chain_id = query.chain_id;
        let responses = Arc::clone(&self.responses);
        let limiter = Arc::clone(&self.limiter);
        let pool = Arc::clone(&self.pool);
        let cache_key = key.clone();
        self.positions_in_flight
            .coalesce(key, move || async move {
                // A fetch for this key may have settled between the miss and now.
                if let Some(positions) = responses.get(&cache_key) {
                    debug!("Positions for key {} were cached by an earlier fetch", cache_key);
                    return Ok(Arc::unwrap_or_clone(positions));
                }

                limiter.try_admit(chain_id)?;
                let client = pool.client_for(chain_id)?;
                let addresses = client.pool_positions(&query.user, &query.pool).await?;

                let positions: Vec<Position> = addresses
                    .into_iter()
                    .map(|address| Position::new(chain_id, address, query.pool))
                    .collect();
                debug!("Fetched {} positions for key: {}", positions.len(), cache_key);
                responses.set(cache_key, positions.clone());
                Ok(positions)
            })
            .await
    }

    /// Balance of `query.owner` in `query.token`, formatted with the token's
    /// cached precision.
    pub async fn balance(&self, query: BalanceQuery) -> Result<BalanceReply, ReadError> {
        let chain_id = query.chain_id;
        self.pool.ensure_supported(chain_id)?;

        let limiter = Arc::clone(&self.limiter);
        let pool = Arc::clone(&self.pool);
        let raw = self
            .balances_in_flight
            .coalesce(query.fingerprint(), move || async move {
                limiter.try_admit(chain_id)?;
                let client = pool.client_for(chain_id)?;
                client.balance_of(&query.token, &query.owner).await
            })
            .await?;

        let decimals = self.metadata.decimals_for(&query.token, chain_id);
        let symbol = self
            .metadata
            .cached(&query.token, chain_id)
            .and_then(|record| record.symbol.clone());

        Ok(BalanceReply {
            token: query.token,
            owner: query.owner,
            raw: *raw,
            formatted: format_units(*raw, decimals),
            decimals,
            symbol,
            admission: Some(self.limiter.status(chain_id)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingFactory, MockChain, addr, endpoint, upstream_error, wait_until};
    use futures::future::join_all;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn config(capacity: u32) -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.chains = vec![endpoint(1), endpoint(137)];
        config.admission.capacity = capacity;
        config
    }

    fn service(capacity: u32) -> (PositionService, Arc<MockChain>) {
        let factory = CountingFactory::default();
        let chain = factory.chain();
        (PositionService::with_factory(&config(capacity), factory), chain)
    }

    fn query() -> PositionQuery {
        PositionQuery {
            chain_id: 1,
            pool: addr(0xbb),
            user: addr(0xcc),
        }
    }

    #[test]
    fn test_query_validation() {
        let err = PositionQuery::from_params(Some("1"), Some("0xbb"), None).unwrap_err();
        assert_eq!(err, ReadError::MissingParameters(vec!["userAddress"]));
        assert!(err.to_string().contains("Missing required parameters"));

        let err = PositionQuery::from_params(None, Some(""), None).unwrap_err();
        assert_eq!(
            err,
            ReadError::MissingParameters(vec!["chainId", "poolAddress", "userAddress"])
        );

        let err = PositionQuery::from_params(
            Some("one"),
            Some("0x00000000000000000000000000000000000000bb"),
            Some("0x00000000000000000000000000000000000000cc"),
        )
        .unwrap_err();
        assert!(matches!(err, ReadError::InvalidParameter { name: "chainId", .. }));

        let parsed = PositionQuery::from_params(
            Some("1"),
            Some("0x00000000000000000000000000000000000000BB"),
            Some("0x00000000000000000000000000000000000000cc"),
        )
        .unwrap();
        assert_eq!(parsed, query());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_request_is_served_from_cache() {
        let (service, chain) = service(100);

        let first = service.positions(query()).await.unwrap();
        let second = service.positions(query()).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.positions, second.positions);
        assert_eq!(first.positions.len(), 2);
        assert_eq!(first.positions[0].lending_pool_address, addr(0xbb));
        assert_eq!(chain.position_calls(), 1);
        // Cache hits do not spend admission.
        assert_eq!(second.admission.remaining, 99);
    }

    #[tokio::test]
    async fn test_fetch_rechecks_cache_before_going_upstream() {
        let (service, chain) = service(100);
        let key = query().fingerprint();
        let cached = vec![Position::new(1, addr(0xa9), addr(0xbb))];

        // Another owner settled after this caller missed the cache.
        service.responses.set(key.clone(), cached.clone());
        let positions = service.fetch_positions(query(), key).await.unwrap();

        assert_eq!(*positions, cached);
        assert_eq!(chain.position_calls(), 0);
        assert_eq!(service.limiter().status(1).remaining, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let (service, chain) = service(100);
        service.positions(query()).await.unwrap();

        tokio::time::advance(Duration::from_secs(15)).await;
        let reply = service.positions(query()).await.unwrap();
        assert!(!reply.cached);
        assert_eq!(chain.position_calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_upstream_call() {
        let (service, chain) = service(100);
        let gate = chain.gate_positions();

        let requests = join_all((0..5).map(|_| service.positions(query())));
        let release = async {
            wait_until(|| chain.position_calls() == 1).await;
            wait_until(|| service.positions_in_flight.waiters(&query().fingerprint()) == Some(5))
                .await;
            gate.notify_one();
        };
        let (replies, ()) = tokio::join!(requests, release);

        assert_eq!(chain.position_calls(), 1);
        let first = replies[0].as_ref().unwrap();
        for reply in &replies {
            assert!(Arc::ptr_eq(&first.positions, &reply.as_ref().unwrap().positions));
        }
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let (service, chain) = service(100);
        chain.fail_next_positions(upstream_error("getPoolPositions"));

        let err = service.positions(query()).await.unwrap_err();
        assert_eq!(err, upstream_error("getPoolPositions"));

        let reply = service.positions(query()).await.unwrap();
        assert!(!reply.cached);
        assert_eq!(chain.position_calls(), 2);
    }

    #[tokio::test]
    async fn test_unsupported_chain_rejected_before_any_work() {
        let factory = CountingFactory::default();
        let built = factory.built();
        let service = PositionService::with_factory(&config(100), factory);

        let err = service
            .positions(PositionQuery {
                chain_id: 999_999,
                ..query()
            })
            .await
            .unwrap_err();
        assert_eq!(err, ReadError::UnsupportedChain(999_999));
        assert_eq!(built.load(Ordering::SeqCst), 0);
        assert_eq!(service.limiter().status(999_999).remaining, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_denial_propagates() {
        let (service, chain) = service(1);
        service.positions(query()).await.unwrap();

        let other_user = PositionQuery {
            user: addr(0xdd),
            ..query()
        };
        let err = service.positions(other_user).await.unwrap_err();
        assert!(matches!(err, ReadError::RateLimited { chain_id: 1, .. }));
        assert_eq!(chain.position_calls(), 1);

        // Cached answers are still served while the chain is denied.
        assert!(service.positions(query()).await.unwrap().cached);

        // Other chains keep their own budget.
        let polygon = PositionQuery {
            chain_id: 137,
            ..query()
        };
        assert!(service.positions(polygon).await.is_ok());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(service.positions(other_user).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_balance_formats_with_cached_precision() {
        let (service, chain) = service(100);
        let query = BalanceQuery {
            chain_id: 1,
            token: addr(0x10),
            owner: addr(0x20),
        };

        let reply = service.balance(query).await.unwrap();
        assert_eq!(reply.raw, 1_500_000);
        assert_eq!(reply.decimals, 18);
        assert_eq!(reply.symbol, None);

        wait_until(|| chain.decimals_calls() == 1 && service.metadata().pending_refreshes() == 0)
            .await;
        let reply = service.balance(query).await.unwrap();
        assert_eq!(reply.decimals, 6);
        assert_eq!(reply.formatted, "1.5");
        assert_eq!(reply.symbol.as_deref(), Some("USDC"));

        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["raw"], "1500000");
        assert!(json.get("admission").is_none());
    }
}
