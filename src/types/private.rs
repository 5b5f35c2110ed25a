use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Address, Bytes, B256};

/// Whether an attestation is produced by the local signing module or by an
/// endorsing party that may live on a remote node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttestationKind {
    Sign,
    Endorse,
}

/// One entry of the attestation plan returned by assembly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttestationRequest {
    pub name: String,
    pub kind: AttestationKind,
    pub algorithm: String,
    pub verifier_type: String,
    pub payload_type: String,
    #[serde(default)]
    pub payload: Option<Bytes>,
    pub parties: Vec<String>,
}

/// A verifier the domain requires to be resolved before assembly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierRequirement {
    pub lookup: String,
    pub algorithm: String,
    pub verifier_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedVerifier {
    pub lookup: String,
    pub algorithm: String,
    pub verifier_type: String,
    pub verifier: String,
}

/// A satisfied attestation request. Immutable once attached.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttestationResult {
    pub name: String,
    pub kind: AttestationKind,
    pub verifier: ResolvedVerifier,
    pub payload: Bytes,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PreAssembly {
    pub required_verifiers: Vec<VerifierRequirement>,
    #[serde(default)]
    pub verifiers: Vec<ResolvedVerifier>,
}

/// A state with its full off-chain data, as handled during assembly and
/// endorsement. Only the id ever reaches the base ledger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FullState {
    pub id: B256,
    pub schema: B256,
    pub data: serde_json::Value,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PostAssembly {
    pub input_states: Vec<FullState>,
    pub output_states: Vec<FullState>,
    pub attestation_plan: Vec<AttestationRequest>,
    #[serde(default)]
    pub signatures: Vec<AttestationResult>,
    #[serde(default)]
    pub endorsements: Vec<AttestationResult>,
}

impl PostAssembly {
    /// All collected attestation results, signatures first.
    pub fn attestations(&self) -> impl Iterator<Item = &AttestationResult> {
        self.signatures.iter().chain(self.endorsements.iter())
    }
}

/// What the caller wants back: a dispatched base-ledger transaction, or the
/// prepared artifact for external submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionIntent {
    SendTransaction,
    PrepareTransaction,
}

impl Default for TransactionIntent {
    fn default() -> Self {
        TransactionIntent::SendTransaction
    }
}

/// Base-ledger call produced by the domain's prepare step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreparedPublicTransaction {
    pub to: Address,
    pub function: String,
    pub params: serde_json::Value,
    pub data: Bytes,
    #[serde(default)]
    pub gas: Option<u64>,
}

/// Stage of a private transaction within its owning sequencer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    New,
    AwaitingVerifiers,
    Assembling,
    GatheringSignatures,
    GatheringEndorsements,
    Preparing,
    Dispatching,
    Dispatched,
    Delegating,
    Prepared,
    Parked,
    Reverted { reason: String },
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxStatus::Dispatched | TxStatus::Prepared | TxStatus::Reverted { .. }
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::New => "new",
            TxStatus::AwaitingVerifiers => "awaiting_verifiers",
            TxStatus::Assembling => "assembling",
            TxStatus::GatheringSignatures => "gathering_signatures",
            TxStatus::GatheringEndorsements => "gathering_endorsements",
            TxStatus::Preparing => "preparing",
            TxStatus::Dispatching => "dispatching",
            TxStatus::Dispatched => "dispatched",
            TxStatus::Delegating => "delegating",
            TxStatus::Prepared => "prepared",
            TxStatus::Parked => "parked",
            TxStatus::Reverted { .. } => "reverted",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A private transaction as owned by its sequencer and persisted for the
/// read model. Mutated through the lifecycle stages; terminal on
/// `Dispatched`, `Prepared`, or `Reverted`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrivateTransaction {
    pub id: Uuid,
    pub domain: String,
    pub to: Address,
    pub from: String,
    pub inputs: serde_json::Value,
    #[serde(default)]
    pub intent: TransactionIntent,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub pre_assembly: Option<PreAssembly>,
    #[serde(default)]
    pub post_assembly: Option<PostAssembly>,
    #[serde(default)]
    pub prepared: Option<PreparedPublicTransaction>,
    #[serde(default)]
    pub signer: Option<String>,
    pub status: TxStatus,
    pub created_at: u64,
}

impl PrivateTransaction {
    pub fn new(
        domain: impl Into<String>,
        to: Address,
        from: impl Into<String>,
        inputs: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain: domain.into(),
            to,
            from: from.into(),
            inputs,
            intent: TransactionIntent::SendTransaction,
            idempotency_key: None,
            pre_assembly: None,
            post_assembly: None,
            prepared: None,
            signer: None,
            status: TxStatus::New,
            created_at: unix_seconds(),
        }
    }

    /// Input state ids this transaction consumes. Empty before assembly.
    pub fn input_state_ids(&self) -> Vec<B256> {
        self.post_assembly
            .as_ref()
            .map(|pa| pa.input_states.iter().map(|s| s.id).collect())
            .unwrap_or_default()
    }

    /// Output state ids this transaction produces. Empty before assembly.
    pub fn output_state_ids(&self) -> Vec<B256> {
        self.post_assembly
            .as_ref()
            .map(|pa| pa.output_states.iter().map(|s| s.id).collect())
            .unwrap_or_default()
    }
}

/// Deployment of a new privately-coordinated contract. There is no contract
/// address yet, so these route through a per-domain deploy sequencer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrivateContractDeploy {
    pub id: Uuid,
    pub domain: String,
    pub from: String,
    pub inputs: serde_json::Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub created_at: u64,
}

impl PrivateContractDeploy {
    pub fn new(domain: impl Into<String>, from: impl Into<String>, inputs: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain: domain.into(),
            from: from.into(),
            inputs,
            idempotency_key: None,
            created_at: unix_seconds(),
        }
    }
}

pub(crate) fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_match_rpc_poll_values() {
        assert_eq!(TxStatus::Dispatched.as_str(), "dispatched");
        assert_eq!(TxStatus::Delegating.as_str(), "delegating");
        assert_eq!(
            TxStatus::Reverted {
                reason: "boom".into()
            }
            .as_str(),
            "reverted"
        );
    }

    #[test]
    fn terminal_states() {
        assert!(TxStatus::Dispatched.is_terminal());
        assert!(TxStatus::Prepared.is_terminal());
        assert!(!TxStatus::Assembling.is_terminal());
    }

    #[test]
    fn state_ids_empty_before_assembly() {
        let tx = PrivateTransaction::new(
            "tokens",
            Address::ZERO,
            "alice@node1",
            serde_json::json!({"amount": 1}),
        );
        assert!(tx.input_state_ids().is_empty());
        assert!(tx.output_state_ids().is_empty());
    }
}
