use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::DomainContext;
use crate::errors::{EngineError, EngineResult};
use crate::types::{
    Address, AttestationRequest, AttestationResult, Bytes, FullState, PostAssembly, PreAssembly,
    PreparedPublicTransaction, PrivateContractDeploy, PrivateTransaction, ResolvedVerifier,
    VerifierRequirement,
};

/// How the coordinator for a contract is chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorSelection {
    /// The submitting node coordinates.
    Submitter,
    /// The node hosting the (first) endorser coordinates; submissions from
    /// other nodes are delegated there.
    Endorser,
    /// A fixed node named in the contract config coordinates.
    Static,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContractConfig {
    pub coordinator_selection: CoordinatorSelection,
    #[serde(default)]
    pub static_coordinator: Option<String>,
}

impl Default for ContractConfig {
    fn default() -> Self {
        Self {
            coordinator_selection: CoordinatorSelection::Submitter,
            static_coordinator: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssembleResult {
    Ok,
    /// The assembly cannot proceed and the transaction must be finalized
    /// as reverted.
    Revert,
    /// Required states are transiently unavailable; retry later.
    Park,
}

#[derive(Clone, Debug)]
pub struct AssembleOutcome {
    pub result: AssembleResult,
    pub revert_reason: Option<String>,
    pub input_states: Vec<FullState>,
    pub output_states: Vec<FullState>,
    pub attestation_plan: Vec<AttestationRequest>,
}

impl AssembleOutcome {
    pub fn reverted(reason: impl Into<String>) -> Self {
        Self {
            result: AssembleResult::Revert,
            revert_reason: Some(reason.into()),
            input_states: Vec::new(),
            output_states: Vec::new(),
            attestation_plan: Vec::new(),
        }
    }

    pub fn parked() -> Self {
        Self {
            result: AssembleResult::Park,
            revert_reason: None,
            input_states: Vec::new(),
            output_states: Vec::new(),
            attestation_plan: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndorseResult {
    Sign,
    Endorse,
    Revert,
}

#[derive(Clone, Debug)]
pub struct EndorsementOutcome {
    pub result: EndorseResult,
    pub payload: Bytes,
    pub endorser: Option<ResolvedVerifier>,
    pub revert_reason: Option<String>,
}

/// Everything an endorser needs to evaluate a transaction. Built locally by
/// the coordinator or reconstructed from an `EndorsementRequest` frame.
#[derive(Clone, Debug)]
pub struct EndorsementInput {
    pub tx_id: Uuid,
    pub contract: Address,
    pub attestation: AttestationRequest,
    pub party: String,
    pub pre_assembly: PreAssembly,
    pub post_assembly: PostAssembly,
}

#[derive(Clone, Debug)]
pub struct PrepareOutcome {
    pub transaction: PreparedPublicTransaction,
    pub signer: String,
}

#[derive(Clone, Debug)]
pub struct DeployPrepared {
    pub transaction: PreparedPublicTransaction,
    pub signer: String,
    pub contract_address: Address,
}

/// The capability set every privacy pattern implements. Domain-specific
/// behavior lives entirely behind this seam; the engine drives the same
/// four-phase protocol for all of them.
#[async_trait]
pub trait Domain: Send + Sync {
    fn name(&self) -> &str;

    fn contract_config(&self, contract: &Address) -> ContractConfig;

    /// Declares the verifiers that must be resolved before assembly.
    /// Idempotent.
    async fn init_transaction(
        &self,
        tx: &PrivateTransaction,
    ) -> EngineResult<Vec<VerifierRequirement>>;

    /// Selects input states from the context's available set and produces
    /// outputs plus the attestation plan. Serialized per sequencer.
    async fn assemble_transaction(
        &self,
        context: &DomainContext,
        tx: &PrivateTransaction,
    ) -> EngineResult<AssembleOutcome>;

    async fn endorse_transaction(
        &self,
        input: &EndorsementInput,
    ) -> EngineResult<EndorsementOutcome>;

    /// Produces the base-ledger call once the attestation plan is
    /// satisfied.
    async fn prepare_transaction(&self, tx: &PrivateTransaction) -> EngineResult<PrepareOutcome>;

    async fn init_deploy(
        &self,
        deploy: &PrivateContractDeploy,
    ) -> EngineResult<Vec<VerifierRequirement>>;

    async fn prepare_deploy(
        &self,
        deploy: &PrivateContractDeploy,
        verifiers: &[ResolvedVerifier],
    ) -> EngineResult<DeployPrepared>;
}

/// Registered domains, keyed by name. Read-mostly after startup.
#[derive(Clone, Default)]
pub struct DomainRegistry {
    domains: HashMap<String, Arc<dyn Domain>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, domain: Arc<dyn Domain>) {
        self.domains.insert(domain.name().to_string(), domain);
    }

    pub fn get(&self, name: &str) -> EngineResult<Arc<dyn Domain>> {
        self.domains
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown domain {name}")))
    }
}

/// Checks a collected attestation result against the request it claims to
/// satisfy: the responding party must be in the request's party list and
/// the algorithm must match.
pub fn attestation_matches(
    request: &AttestationRequest,
    party: &str,
    result: &AttestationResult,
) -> bool {
    request.name == result.name
        && request.algorithm == result.verifier.algorithm
        && request.parties.iter().any(|p| p == party)
}
