use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Address, Bytes, FullState, B256};

/// Finalized outcome of a private or public transaction. Written exactly
/// once, when the transaction reaches a terminal state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub tx_hash: Option<B256>,
    #[serde(default)]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub failure_message: Option<String>,
    #[serde(default)]
    pub revert_data: Option<Bytes>,
    #[serde(default)]
    pub contract_address: Option<Address>,
    pub created_at: u64,
}

impl TransactionReceipt {
    pub fn success(id: Uuid, tx_hash: B256, block_number: u64) -> Self {
        Self {
            id,
            success: true,
            tx_hash: Some(tx_hash),
            block_number: Some(block_number),
            failure_message: None,
            revert_data: None,
            contract_address: None,
            created_at: super::private::unix_seconds(),
        }
    }

    pub fn reverted(id: Uuid, message: impl Into<String>, revert_data: Option<Bytes>) -> Self {
        Self {
            id,
            success: false,
            tx_hash: None,
            block_number: None,
            failure_message: Some(message.into()),
            revert_data,
            contract_address: None,
            created_at: super::private::unix_seconds(),
        }
    }
}

/// Domain-agnostic view of the states a confirmed transaction touched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateReceipt {
    pub confirmed: Vec<FullState>,
    pub spent: Vec<FullState>,
}
