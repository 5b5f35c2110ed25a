use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Address, Bytes, B256, U256};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Private,
    Public,
}

/// Reference binding a public transaction row back to the transaction that
/// produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxBinding {
    pub transaction: Uuid,
    pub tx_type: TransactionType,
}

/// Gas price options. Either legacy `gas_price` or the EIP-1559 pair.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasPricing {
    #[serde(default)]
    pub gas_price: Option<U256>,
    #[serde(default)]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub max_priority_fee_per_gas: Option<U256>,
}

impl GasPricing {
    pub fn fixed(gas_price: U256) -> Self {
        Self {
            gas_price: Some(gas_price),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.gas_price.is_none()
            && self.max_fee_per_gas.is_none()
            && self.max_priority_fee_per_gas.is_none()
    }
}

/// The request to create a public transaction. The `from` field is an
/// unresolved signer identifier; key resolution happens during prepare.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicTxInput {
    pub from: String,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub data: Bytes,
    #[serde(default)]
    pub gas: Option<u64>,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default)]
    pub gas_pricing: Option<GasPricing>,
}

/// One unit of work handed to the public transaction manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicTxSubmission {
    pub bindings: Vec<TxBinding>,
    pub input: PublicTxInput,
}

/// Row in the `public_txns` table, keyed by `(from, nonce)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedPubTx {
    pub from: Address,
    pub nonce: u64,
    pub key_handle: String,
    #[serde(default)]
    pub to: Option<Address>,
    pub data: Bytes,
    pub gas: u64,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default)]
    pub fixed_gas_pricing: Option<GasPricing>,
    pub bindings: Vec<TxBinding>,
    pub created_at: u64,
}

impl PersistedPubTx {
    /// `from:nonce` in the canonical form used for cross-table correlation.
    pub fn signer_nonce(&self) -> String {
        signer_nonce(&self.from, self.nonce)
    }
}

pub fn signer_nonce(from: &Address, nonce: u64) -> String {
    format!("{from}:{nonce}")
}

/// Row in the `public_submissions` table, one per send attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub tx_hash: B256,
    pub gas_pricing: GasPricing,
    pub created_at: u64,
}

/// Row in the `public_completions` table. Immutable once written.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicCompletion {
    pub tx_hash: B256,
    pub success: bool,
    pub revert_data: Bytes,
    pub block_number: u64,
    pub created_at: u64,
}

/// Read-model view of a public transaction with its submission history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicTx {
    #[serde(flatten)]
    pub tx: PersistedPubTx,
    pub submissions: Vec<SubmissionRecord>,
    #[serde(default)]
    pub completion: Option<PublicCompletion>,
}

/// A base-ledger transaction as handed to the Ethereum client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EthTransaction {
    pub from: Address,
    #[serde(default)]
    pub nonce: Option<u64>,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub gas: Option<u64>,
    #[serde(default)]
    pub value: Option<U256>,
    pub data: Bytes,
    #[serde(default)]
    pub gas_pricing: GasPricing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signer_nonce_is_checksummed_address_and_decimal_nonce() {
        let from = Address::repeat_byte(0x11);
        let key = signer_nonce(&from, 42);
        assert!(key.starts_with("0x"));
        assert!(key.ends_with(":42"));
    }

    #[test]
    fn gas_pricing_empty_detection() {
        assert!(GasPricing::default().is_empty());
        assert!(!GasPricing::fixed(U256::from(7)).is_empty());
    }
}
