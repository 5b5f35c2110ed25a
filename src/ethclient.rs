use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};
use crate::types::{Address, Bytes, EthTransaction, B256, U256};

/// Gas estimation distinguishes an execution revert (the transaction is
/// rejected before any nonce is allocated, revert data preserved for the
/// caller) from an infrastructure failure (retried like any other RPC
/// error).
#[derive(Debug)]
pub enum GasEstimateError {
    Reverted { data: Bytes },
    Failed(EngineError),
}

impl From<GasEstimateError> for EngineError {
    fn from(err: GasEstimateError) -> Self {
        match err {
            GasEstimateError::Reverted { data } => EngineError::RejectedPreChain {
                data: data.to_vec(),
            },
            GasEstimateError::Failed(inner) => inner,
        }
    }
}

/// The JSON-RPC surface of the base ledger the engine depends on. Signing
/// happens behind this seam: `send_transaction` takes the resolved key
/// handle and returns the submitted hash.
#[async_trait]
pub trait EthClient: Send + Sync {
    async fn get_transaction_count(&self, address: &Address) -> EngineResult<u64>;

    async fn estimate_gas(&self, tx: &EthTransaction) -> Result<u64, GasEstimateError>;

    async fn gas_price(&self) -> EngineResult<U256>;

    async fn send_transaction(&self, key_handle: &str, tx: &EthTransaction) -> EngineResult<B256>;
}

/// A transaction the block indexer observed as mined, delivered to the
/// public transaction manager for confirmation matching.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexedTransaction {
    pub from: Address,
    pub nonce: u64,
    pub hash: B256,
    pub block_number: u64,
    pub success: bool,
    #[serde(default)]
    pub revert_data: Bytes,
}
