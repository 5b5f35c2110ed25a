//! In-process collaborators for development mode and tests: a simulated
//! base ledger with deterministic hashes and instant mining, plus
//! deterministic identity and key doubles. Production deployments replace
//! all of these with plugin-backed implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::errors::{EngineError, EngineResult};
use crate::ethclient::{EthClient, GasEstimateError, IndexedTransaction};
use crate::identity::{IdentityResolver, KeyManager, KeyMapping};
use crate::types::{Address, Bytes, EthTransaction, B256, U256};

/// Deterministic address for an identity string, shared by the dev
/// resolver and the dev key manager so both agree on verifiers.
pub fn derived_address(identity: &str) -> Address {
    let digest = alloy_primitives::keccak256(identity.as_bytes());
    Address::from_slice(&digest[12..])
}

pub struct DevIdentityResolver;

#[async_trait]
impl IdentityResolver for DevIdentityResolver {
    async fn resolve_verifier(
        &self,
        lookup: &str,
        _algorithm: &str,
        _verifier_type: &str,
    ) -> EngineResult<String> {
        Ok(derived_address(lookup).to_string())
    }
}

pub struct DevKeyManager;

#[async_trait]
impl KeyManager for DevKeyManager {
    async fn resolve_key(
        &self,
        identifier: &str,
        _algorithm: &str,
        _verifier_type: &str,
    ) -> EngineResult<KeyMapping> {
        Ok(KeyMapping {
            identifier: identifier.to_string(),
            key_handle: format!("kh:{identifier}"),
            verifier: derived_address(identifier).to_string(),
        })
    }

    async fn sign(
        &self,
        key: &KeyMapping,
        _payload_type: &str,
        payload: &[u8],
    ) -> EngineResult<Bytes> {
        let mut preimage = key.identifier.as_bytes().to_vec();
        preimage.extend_from_slice(payload);
        Ok(Bytes::copy_from_slice(
            alloy_primitives::keccak256(&preimage).as_slice(),
        ))
    }

    async fn resolve_eth_address(&self, identifier: &str) -> EngineResult<Address> {
        Ok(derived_address(identifier))
    }
}

struct MinedTx {
    from: Address,
    nonce: u64,
    hash: B256,
    revert: bool,
}

struct ChainState {
    confirmed_nonce: HashMap<Address, u64>,
    queued: HashMap<Address, HashMap<u64, B256>>,
    block_number: u64,
    subscribers: Vec<mpsc::UnboundedSender<Vec<IndexedTransaction>>>,
    /// Calldata prefix that makes gas estimation revert with this data.
    estimate_revert: Option<(Vec<u8>, Vec<u8>)>,
    /// Calldata prefix that makes execution revert on chain.
    execution_revert: Option<(Vec<u8>, Vec<u8>)>,
    revert_data_by_hash: HashMap<B256, Vec<u8>>,
    /// When false, submitted transactions queue until `mine()` is called.
    auto_mine: bool,
}

/// Simulated base ledger shared by every dev node in a process. Nonce
/// rules match the real thing: a transaction mines only when its nonce is
/// exactly the account's next, and queued gaps fill in order.
#[derive(Clone)]
pub struct DevChain {
    state: Arc<Mutex<ChainState>>,
}

impl Default for DevChain {
    fn default() -> Self {
        Self::new()
    }
}

impl DevChain {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ChainState {
                confirmed_nonce: HashMap::new(),
                queued: HashMap::new(),
                block_number: 0,
                subscribers: Vec::new(),
                estimate_revert: None,
                execution_revert: None,
                revert_data_by_hash: HashMap::new(),
                auto_mine: true,
            })),
        }
    }

    pub fn client(&self) -> Arc<dyn EthClient> {
        Arc::new(DevEthClient {
            chain: self.clone(),
        })
    }

    /// Registers a block-indexer feed; every mined batch is delivered to
    /// all subscribers.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<IndexedTransaction>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscribers.push(tx);
        rx
    }

    /// Makes gas estimation revert with `revert_data` for calldata
    /// starting with `prefix`.
    pub fn set_estimate_revert(&self, prefix: Vec<u8>, revert_data: Vec<u8>) {
        self.state.lock().estimate_revert = Some((prefix, revert_data));
    }

    /// Makes execution revert on chain for calldata starting with
    /// `prefix`.
    pub fn set_execution_revert(&self, prefix: Vec<u8>, revert_data: Vec<u8>) {
        self.state.lock().execution_revert = Some((prefix, revert_data));
    }

    pub fn set_auto_mine(&self, auto_mine: bool) {
        self.state.lock().auto_mine = auto_mine;
    }

    /// Mines everything minable and notifies subscribers.
    pub fn mine(&self) {
        let mut state = self.state.lock();
        Self::mine_locked(&mut state);
    }

    pub fn confirmed_nonce(&self, address: &Address) -> u64 {
        self.state
            .lock()
            .confirmed_nonce
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    fn mine_locked(state: &mut ChainState) {
        let mut mined: Vec<MinedTx> = Vec::new();
        loop {
            let mut progressed = false;
            for (from, queued) in state.queued.iter_mut() {
                let next = state.confirmed_nonce.get(from).copied().unwrap_or(0);
                if let Some(hash) = queued.remove(&next) {
                    state.confirmed_nonce.insert(*from, next + 1);
                    let revert = state.revert_data_by_hash.contains_key(&hash);
                    mined.push(MinedTx {
                        from: *from,
                        nonce: next,
                        hash,
                        revert,
                    });
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        if mined.is_empty() {
            return;
        }
        state.block_number += 1;
        let block_number = state.block_number;
        let batch: Vec<IndexedTransaction> = mined
            .into_iter()
            .map(|tx| IndexedTransaction {
                from: tx.from,
                nonce: tx.nonce,
                hash: tx.hash,
                block_number,
                success: !tx.revert,
                revert_data: state
                    .revert_data_by_hash
                    .get(&tx.hash)
                    .cloned()
                    .map(Bytes::from)
                    .unwrap_or_default(),
            })
            .collect();
        state.subscribers.retain(|sub| sub.send(batch.clone()).is_ok());
    }
}

struct DevEthClient {
    chain: DevChain,
}

#[async_trait]
impl EthClient for DevEthClient {
    async fn get_transaction_count(&self, address: &Address) -> EngineResult<u64> {
        Ok(self.chain.confirmed_nonce(address))
    }

    async fn estimate_gas(&self, tx: &EthTransaction) -> Result<u64, GasEstimateError> {
        let state = self.chain.state.lock();
        if let Some((prefix, revert_data)) = &state.estimate_revert {
            if tx.data.starts_with(prefix) {
                return Err(GasEstimateError::Reverted {
                    data: Bytes::from(revert_data.clone()),
                });
            }
        }
        Ok(100_000)
    }

    async fn gas_price(&self) -> EngineResult<U256> {
        Ok(U256::from(1_000_000_000u64))
    }

    async fn send_transaction(&self, _key_handle: &str, tx: &EthTransaction) -> EngineResult<B256> {
        let nonce = tx
            .nonce
            .ok_or_else(|| EngineError::InvalidInput("transaction without nonce".into()))?;
        let mut preimage = tx.from.as_slice().to_vec();
        preimage.extend_from_slice(&nonce.to_be_bytes());
        preimage.extend_from_slice(&tx.data);
        if let Some(price) = tx.gas_pricing.gas_price {
            preimage.extend_from_slice(&price.to_be_bytes::<32>());
        }
        let hash = B256::from(alloy_primitives::keccak256(&preimage));

        let mut state = self.chain.state.lock();
        if let Some((prefix, revert_data)) = state.execution_revert.clone() {
            if tx.data.starts_with(&prefix) {
                state.revert_data_by_hash.insert(hash, revert_data);
            }
        }
        state
            .queued
            .entry(tx.from)
            .or_default()
            .insert(nonce, hash);
        if state.auto_mine {
            DevChain::mine_locked(&mut state);
        }
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mines_in_nonce_order_and_fills_gaps() {
        let chain = DevChain::new();
        let client = chain.client();
        let mut confirmations = chain.subscribe();
        let from = derived_address("signer1");

        let tx = |nonce: u64| EthTransaction {
            from,
            nonce: Some(nonce),
            to: None,
            gas: Some(100_000),
            value: None,
            data: Bytes::from(vec![nonce as u8]),
            gas_pricing: Default::default(),
        };

        // nonce 1 queues until nonce 0 arrives
        client.send_transaction("kh", &tx(1)).await.unwrap();
        assert_eq!(chain.confirmed_nonce(&from), 0);
        client.send_transaction("kh", &tx(0)).await.unwrap();
        assert_eq!(chain.confirmed_nonce(&from), 2);

        let batch = confirmations.recv().await.unwrap();
        let nonces: Vec<u64> = batch.iter().map(|itx| itx.nonce).collect();
        assert_eq!(nonces, vec![0, 1]);
    }

    #[tokio::test]
    async fn estimate_revert_carries_data() {
        let chain = DevChain::new();
        chain.set_estimate_revert(vec![0xba, 0xd0], vec![0xde, 0xad]);
        let client = chain.client();
        let tx = EthTransaction {
            from: derived_address("signer2"),
            nonce: None,
            to: None,
            gas: None,
            value: None,
            data: Bytes::from(vec![0xba, 0xd0, 0x01]),
            gas_pricing: Default::default(),
        };
        match client.estimate_gas(&tx).await {
            Err(GasEstimateError::Reverted { data }) => {
                assert_eq!(data.as_ref(), &[0xde, 0xad]);
            }
            other => panic!("expected revert, got {other:?}"),
        }
    }
}
