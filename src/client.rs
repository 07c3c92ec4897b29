//! Chain client pool
//!
//! One upstream client per chain, created on first use and reused for the
//! life of the process. Each client carries an immutable [`TransportPolicy`]
//! that bounds every call's duration and retry count.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::abi;
use crate::config::{ChainEndpoint, TransportPolicy};
use crate::error::ReadError;
use crate::types::{Address, ChainId};

/// Read-only calls the read path makes against a chain.
#[async_trait]
pub trait ChainReader: Send + Sync {
    fn chain_id(&self) -> ChainId;

    /// `getPoolPositions(user, pool)` on the chain's position registry.
    async fn pool_positions(
        &self,
        user: &Address,
        pool: &Address,
    ) -> Result<Vec<Address>, ReadError>;

    async fn decimals(&self, token: &Address) -> Result<u8, ReadError>;

    async fn symbol(&self, token: &Address) -> Result<String, ReadError>;

    async fn name(&self, token: &Address) -> Result<String, ReadError>;

    async fn balance_of(&self, token: &Address, owner: &Address) -> Result<u128, ReadError>;
}

/// Builds the client for a chain. Called at most once per chain by [`ClientPool`].
pub trait ClientFactory: Send + Sync {
    fn connect(
        &self,
        endpoint: &ChainEndpoint,
        policy: TransportPolicy,
    ) -> Result<Arc<dyn ChainReader>, ReadError>;
}

/// Factory for JSON-RPC clients over HTTP
#[derive(Debug, Default, Clone, Copy)]
pub struct RpcClientFactory;

impl ClientFactory for RpcClientFactory {
    fn connect(
        &self,
        endpoint: &ChainEndpoint,
        policy: TransportPolicy,
    ) -> Result<Arc<dyn ChainReader>, ReadError> {
        Ok(Arc::new(RpcChainClient::new(endpoint.clone(), policy)?))
    }
}

/// Memoizes one client per configured chain.
pub struct ClientPool {
    endpoints: HashMap<ChainId, ChainEndpoint>,
    policy: TransportPolicy,
    factory: Box<dyn ClientFactory>,
    clients: Mutex<HashMap<ChainId, Arc<dyn ChainReader>>>,
}

impl ClientPool {
    pub fn new(
        endpoints: impl IntoIterator<Item = ChainEndpoint>,
        policy: TransportPolicy,
        factory: impl ClientFactory + 'static,
    ) -> Self {
        Self {
            endpoints: endpoints
                .into_iter()
                .map(|endpoint| (endpoint.chain_id, endpoint))
                .collect(),
            policy,
            factory: Box::new(factory),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> TransportPolicy {
        self.policy
    }

    /// Fail fast for a chain with no endpoint configured.
    pub fn ensure_supported(&self, chain_id: ChainId) -> Result<&ChainEndpoint, ReadError> {
        self.endpoints
            .get(&chain_id)
            .ok_or(ReadError::UnsupportedChain(chain_id))
    }

    /// Configured chain ids in ascending order.
    pub fn chain_ids(&self) -> Vec<ChainId> {
        let mut ids: Vec<ChainId> = self.endpoints.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// The client for `chain_id`, constructing it on first use.
    pub fn client_for(&self, chain_id: ChainId) -> Result<Arc<dyn ChainReader>, ReadError> {
        let endpoint = self.ensure_supported(chain_id)?;

        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&chain_id) {
            return Ok(Arc::clone(client));
        }

        let client = self.factory.connect(endpoint, self.policy)?;
        info!(
            "Created chain client for chain {} (timeout={:?}, retry_budget={})",
            chain_id, self.policy.timeout, self.policy.retry_budget
        );
        clients.insert(chain_id, Arc::clone(&client));
        Ok(client)
    }

    /// Number of clients constructed so far.
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// One attempt's failure, and whether another attempt may help.
enum AttemptError {
    Retryable(ReadError),
    Fatal(ReadError),
}

/// JSON-RPC `eth_call` client for one chain
pub struct RpcChainClient {
    endpoint: ChainEndpoint,
    policy: TransportPolicy,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcChainClient {
    pub fn new(endpoint: ChainEndpoint, policy: TransportPolicy) -> Result<Self, ReadError> {
        let http = reqwest::Client::builder()
            .timeout(policy.timeout)
            .connect_timeout(policy.timeout)
            .build()
            .map_err(|e| ReadError::Config(format!("building HTTP client: {}", e)))?;

        Ok(Self {
            endpoint,
            policy,
            http,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &ChainEndpoint {
        &self.endpoint
    }

    /// `eth_call` at the latest block, retried within the policy's budget.
    async fn call(&self, method: &str, to: &Address, data: String) -> Result<Vec<u8>, ReadError> {
        let mut attempt = 0u32;
        loop {
            match self.call_once(method, to, &data).await {
                Ok(bytes) => return Ok(bytes),
                Err(AttemptError::Retryable(e)) if attempt < self.policy.retry_budget => {
                    attempt += 1;
                    warn!(
                        "Chain {} {} attempt {} failed ({}); retrying",
                        self.endpoint.chain_id, method, attempt, e
                    );
                    tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                }
                Err(AttemptError::Retryable(e)) | Err(AttemptError::Fatal(e)) => {
                    error!(
                        "Chain {} {} failed after {} attempts: {}",
                        self.endpoint.chain_id,
                        method,
                        attempt + 1,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn call_once(
        &self,
        method: &str,
        to: &Address,
        data: &str,
    ) -> Result<Vec<u8>, AttemptError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "eth_call",
            "params": [{ "to": to.to_string(), "data": data }, "latest"],
        });

        debug!("Chain {} eth_call {} -> {}", self.endpoint.chain_id, method, to);
        let response = self
            .http
            .post(&self.endpoint.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(method, e))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(AttemptError::Retryable(ReadError::UpstreamCall {
                method: method.to_owned(),
                message: format!("HTTP {}", status),
            }));
        }
        if !status.is_success() {
            return Err(AttemptError::Fatal(ReadError::UpstreamCall {
                method: method.to_owned(),
                message: format!("HTTP {}", status),
            }));
        }

        let payload: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error(method, e))?;

        if let Some(err) = payload.error {
            return Err(AttemptError::Fatal(ReadError::UpstreamCall {
                method: method.to_owned(),
                message: format!("JSON-RPC error {}: {}", err.code, err.message),
            }));
        }

        let result = payload.result.ok_or_else(|| {
            AttemptError::Fatal(ReadError::Decode(format!(
                "{} response has neither result nor error",
                method
            )))
        })?;
        abi::decode_hex(&result).map_err(AttemptError::Fatal)
    }

    fn transport_error(&self, method: &str, err: reqwest::Error) -> AttemptError {
        if err.is_timeout() {
            AttemptError::Retryable(ReadError::UpstreamTimeout {
                method: method.to_owned(),
                timeout_ms: u64::try_from(self.policy.timeout.as_millis()).unwrap_or(u64::MAX),
            })
        } else if err.is_decode() {
            AttemptError::Fatal(ReadError::Decode(format!("{}: {}", method, err)))
        } else {
            AttemptError::Retryable(ReadError::UpstreamCall {
                method: method.to_owned(),
                message: err.to_string(),
            })
        }
    }
}

#[async_trait]
impl ChainReader for RpcChainClient {
    fn chain_id(&self) -> ChainId {
        self.endpoint.chain_id
    }

    async fn pool_positions(
        &self,
        user: &Address,
        pool: &Address,
    ) -> Result<Vec<Address>, ReadError> {
        let data = abi::encode_call(abi::GET_POOL_POSITIONS, &[*user, *pool]);
        let bytes = self
            .call("getPoolPositions", &self.endpoint.registry_address, data)
            .await?;
        abi::decode_address_array(&bytes)
    }

    async fn decimals(&self, token: &Address) -> Result<u8, ReadError> {
        let bytes = self
            .call("decimals", token, abi::encode_call(abi::DECIMALS, &[]))
            .await?;
        abi::decode_u8(&bytes)
    }

    async fn symbol(&self, token: &Address) -> Result<String, ReadError> {
        let bytes = self
            .call("symbol", token, abi::encode_call(abi::SYMBOL, &[]))
            .await?;
        abi::decode_string(&bytes)
    }

    async fn name(&self, token: &Address) -> Result<String, ReadError> {
        let bytes = self
            .call("name", token, abi::encode_call(abi::NAME, &[]))
            .await?;
        abi::decode_string(&bytes)
    }

    async fn balance_of(&self, token: &Address, owner: &Address) -> Result<u128, ReadError> {
        let bytes = self
            .call("balanceOf", token, abi::encode_call(abi::BALANCE_OF, &[*owner]))
            .await?;
        abi::decode_u128(&bytes)
    }
}
