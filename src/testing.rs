//! Mock chain clients shared by unit tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::client::{ChainReader, ClientFactory};
use crate::config::{ChainEndpoint, TransportPolicy};
use crate::error::ReadError;
use crate::types::{Address, ChainId};

pub fn endpoint(chain_id: ChainId) -> ChainEndpoint {
    ChainEndpoint {
        chain_id,
        name: None,
        rpc_url: format!("http://127.0.0.1:1/rpc/{}", chain_id),
        registry_address: "0x00000000000000000000000000000000000000ee"
            .parse()
            .unwrap(),
    }
}

pub fn addr(tail: u8) -> Address {
    let mut bytes = [0u8; 20];
    bytes[19] = tail;
    Address::from_bytes(bytes)
}

pub fn upstream_error(method: &str) -> ReadError {
    ReadError::UpstreamCall {
        method: method.to_owned(),
        message: "connection reset".to_owned(),
    }
}

/// Scripted upstream state shared by every client a factory builds.
pub struct MockChain {
    pub positions: Mutex<Vec<Address>>,
    pub position_calls: AtomicUsize,
    pub position_failures: Mutex<VecDeque<ReadError>>,
    /// When set, `pool_positions` waits for a notification before answering.
    pub position_gate: Mutex<Option<Arc<Notify>>>,
    pub decimals: Mutex<VecDeque<Result<u8, ReadError>>>,
    pub decimals_calls: AtomicUsize,
    pub balance: Mutex<u128>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self {
            positions: Mutex::new(vec![addr(0xa1), addr(0xa2)]),
            position_calls: AtomicUsize::new(0),
            position_failures: Mutex::new(VecDeque::new()),
            position_gate: Mutex::new(None),
            decimals: Mutex::new(VecDeque::new()),
            decimals_calls: AtomicUsize::new(0),
            balance: Mutex::new(1_500_000),
        }
    }
}

impl MockChain {
    pub fn position_calls(&self) -> usize {
        self.position_calls.load(Ordering::SeqCst)
    }

    pub fn decimals_calls(&self) -> usize {
        self.decimals_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_positions(&self, err: ReadError) {
        self.position_failures.lock().push_back(err);
    }

    pub fn script_decimals(&self, results: impl IntoIterator<Item = Result<u8, ReadError>>) {
        self.decimals.lock().extend(results);
    }

    pub fn gate_positions(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.position_gate.lock() = Some(Arc::clone(&gate));
        gate
    }
}

pub struct MockReader {
    chain_id: ChainId,
    chain: Arc<MockChain>,
}

#[async_trait]
impl ChainReader for MockReader {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn pool_positions(
        &self,
        _user: &Address,
        _pool: &Address,
    ) -> Result<Vec<Address>, ReadError> {
        self.chain.position_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.chain.position_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(err) = self.chain.position_failures.lock().pop_front() {
            return Err(err);
        }
        Ok(self.chain.positions.lock().clone())
    }

    async fn decimals(&self, _token: &Address) -> Result<u8, ReadError> {
        self.chain.decimals_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.chain.decimals.lock().pop_front().unwrap_or(Ok(6))
    }

    async fn symbol(&self, _token: &Address) -> Result<String, ReadError> {
        Ok("USDC".to_owned())
    }

    async fn name(&self, _token: &Address) -> Result<String, ReadError> {
        Err(upstream_error("name"))
    }

    async fn balance_of(&self, _token: &Address, _owner: &Address) -> Result<u128, ReadError> {
        Ok(*self.chain.balance.lock())
    }
}

/// Factory that counts constructions and hands out [`MockReader`]s.
#[derive(Default)]
pub struct CountingFactory {
    built: Arc<AtomicUsize>,
    chain: Arc<MockChain>,
}

impl CountingFactory {
    pub fn built(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.built)
    }

    pub fn chain(&self) -> Arc<MockChain> {
        Arc::clone(&self.chain)
    }
}

impl ClientFactory for CountingFactory {
    fn connect(
        &self,
        endpoint: &ChainEndpoint,
        _policy: TransportPolicy,
    ) -> Result<Arc<dyn ChainReader>, ReadError> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockReader {
            chain_id: endpoint.chain_id,
            chain: Arc::clone(&self.chain),
        }))
    }
}

/// Poll `condition` until it holds, giving spawned tasks time to run.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}
