//! Shared harness for the end-to-end tests: a notarized-token domain
//! double and a builder for in-process nodes wired over the loopback
//! transport against one shared simulated base ledger.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use ptx_node::config::NodeConfig;
use ptx_node::context::DomainContext;
use ptx_node::domain::{
    AssembleOutcome, AssembleResult, ContractConfig, CoordinatorSelection, Domain, DeployPrepared,
    DomainRegistry, EndorseResult, EndorsementInput, EndorsementOutcome, PrepareOutcome,
};
use ptx_node::errors::{EngineError, EngineResult};
use ptx_node::node::{Node, NodeDeps, NodeHandle};
use ptx_node::testbed::{derived_address, DevChain, DevIdentityResolver, DevKeyManager};
use ptx_node::transport::InProcessTransport;
use ptx_node::types::{
    Address, AttestationKind, AttestationRequest, Bytes, FullState, PreparedPublicTransaction,
    PrivateContractDeploy, PrivateTransaction, ResolvedVerifier, TxStatus, VerifierRequirement,
    B256,
};

pub const DOMAIN_NAME: &str = "tokens";
pub const ALGORITHM: &str = "ecdsa:secp256k1";
pub const VERIFIER_TYPE: &str = "eth_address";
pub const SUBMITTER: &str = "tokens.submitter";

/// Calldata prefix every prepared transaction starts with; tests key the
/// simulated chain's revert behavior off it.
pub const CALL_PREFIX: &[u8] = b"exec:";

/// A notarized-token domain double in the shape of a UTXO token with a
/// single notary: transfers consume owned states and produce recipient
/// plus change outputs, attested by a sender signature and a notary
/// endorsement.
pub struct TokenDomain {
    notary: String,
    selection: CoordinatorSelection,
    /// When set, endorsements block until `release_endorsement` is called
    /// for the transaction.
    gated: AtomicBool,
    released: Mutex<HashSet<Uuid>>,
    release_notify: Notify,
}

impl TokenDomain {
    pub fn new(notary: impl Into<String>, selection: CoordinatorSelection) -> Arc<Self> {
        Arc::new(Self {
            notary: notary.into(),
            selection,
            gated: AtomicBool::new(false),
            released: Mutex::new(HashSet::new()),
            release_notify: Notify::new(),
        })
    }

    pub fn gate_endorsements(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn release_endorsement(&self, tx_id: Uuid) {
        self.released.lock().insert(tx_id);
        self.release_notify.notify_waiters();
    }

    async fn wait_for_release(&self, tx_id: Uuid) {
        if !self.gated.load(Ordering::SeqCst) {
            return;
        }
        loop {
            let notified = self.release_notify.notified();
            if self.released.lock().contains(&tx_id) {
                return;
            }
            notified.await;
        }
    }

    fn state_id(tx_id: &Uuid, index: u8) -> B256 {
        let mut preimage = tx_id.as_bytes().to_vec();
        preimage.push(index);
        B256::from(alloy_primitives::keccak256(&preimage))
    }
}

#[async_trait]
impl Domain for TokenDomain {
    fn name(&self) -> &str {
        DOMAIN_NAME
    }

    fn contract_config(&self, _contract: &Address) -> ContractConfig {
        ContractConfig {
            coordinator_selection: self.selection,
            static_coordinator: None,
        }
    }

    async fn init_transaction(
        &self,
        tx: &PrivateTransaction,
    ) -> EngineResult<Vec<VerifierRequirement>> {
        Ok(vec![
            VerifierRequirement {
                lookup: tx.from.clone(),
                algorithm: ALGORITHM.into(),
                verifier_type: VERIFIER_TYPE.into(),
            },
            VerifierRequirement {
                lookup: self.notary.clone(),
                algorithm: ALGORITHM.into(),
                verifier_type: VERIFIER_TYPE.into(),
            },
        ])
    }

    async fn assemble_transaction(
        &self,
        context: &DomainContext,
        tx: &PrivateTransaction,
    ) -> EngineResult<AssembleOutcome> {
        let amount = tx.inputs["amount"].as_u64().unwrap_or(0);
        if amount == 0 {
            return Ok(AssembleOutcome::reverted("amount must be positive"));
        }
        let to = tx.inputs["to"].as_str().unwrap_or_default().to_string();
        let mint = tx.inputs["mint"].as_bool().unwrap_or(false);

        let mut input_states = Vec::new();
        let mut output_states = Vec::new();
        if mint {
            output_states.push(FullState {
                id: Self::state_id(&tx.id, 0),
                schema: B256::repeat_byte(0xcc),
                data: serde_json::json!({"owner": to, "amount": amount}),
            });
        } else {
            let mut total = 0u64;
            for state in context.available_states()? {
                if state.data["owner"].as_str() == Some(tx.from.as_str()) {
                    total += state.data["amount"].as_u64().unwrap_or(0);
                    input_states.push(state);
                    if total >= amount {
                        break;
                    }
                }
            }
            if total < amount {
                return Ok(AssembleOutcome::parked());
            }
            output_states.push(FullState {
                id: Self::state_id(&tx.id, 0),
                schema: B256::repeat_byte(0xcc),
                data: serde_json::json!({"owner": to, "amount": amount}),
            });
            if total > amount {
                output_states.push(FullState {
                    id: Self::state_id(&tx.id, 1),
                    schema: B256::repeat_byte(0xcc),
                    data: serde_json::json!({"owner": tx.from, "amount": total - amount}),
                });
            }
        }

        let attestation_plan = vec![
            AttestationRequest {
                name: "sender".into(),
                kind: AttestationKind::Sign,
                algorithm: ALGORITHM.into(),
                verifier_type: VERIFIER_TYPE.into(),
                payload_type: "opaque:rsv".into(),
                payload: Some(Bytes::copy_from_slice(tx.id.as_bytes())),
                parties: vec![tx.from.clone()],
            },
            AttestationRequest {
                name: "notary".into(),
                kind: AttestationKind::Endorse,
                algorithm: ALGORITHM.into(),
                verifier_type: VERIFIER_TYPE.into(),
                payload_type: "opaque:rsv".into(),
                payload: None,
                parties: vec![self.notary.clone()],
            },
        ];

        Ok(AssembleOutcome {
            result: AssembleResult::Ok,
            revert_reason: None,
            input_states,
            output_states,
            attestation_plan,
        })
    }

    async fn endorse_transaction(
        &self,
        input: &EndorsementInput,
    ) -> EngineResult<EndorsementOutcome> {
        self.wait_for_release(input.tx_id).await;
        let mut preimage = b"endorsed:".to_vec();
        preimage.extend_from_slice(input.tx_id.as_bytes());
        Ok(EndorsementOutcome {
            result: EndorseResult::Endorse,
            payload: Bytes::copy_from_slice(alloy_primitives::keccak256(&preimage).as_slice()),
            endorser: Some(ResolvedVerifier {
                lookup: input.party.clone(),
                algorithm: ALGORITHM.into(),
                verifier_type: VERIFIER_TYPE.into(),
                verifier: derived_address(&input.party).to_string(),
            }),
            revert_reason: None,
        })
    }

    async fn prepare_transaction(&self, tx: &PrivateTransaction) -> EngineResult<PrepareOutcome> {
        let post_assembly = tx
            .post_assembly
            .as_ref()
            .ok_or_else(|| EngineError::Fatal("prepare before assembly".into()))?;
        let mut data = CALL_PREFIX.to_vec();
        data.extend_from_slice(tx.id.as_bytes());
        Ok(PrepareOutcome {
            transaction: PreparedPublicTransaction {
                to: tx.to,
                function: "executeNotarized".into(),
                params: serde_json::json!({
                    "inputs": post_assembly.input_states.iter().map(|s| s.id).collect::<Vec<_>>(),
                    "outputs": post_assembly.output_states.iter().map(|s| s.id).collect::<Vec<_>>(),
                    "signature": post_assembly.signatures.first().map(|s| s.payload.clone()),
                }),
                data: Bytes::from(data),
                gas: None,
            },
            signer: SUBMITTER.into(),
        })
    }

    async fn init_deploy(
        &self,
        deploy: &PrivateContractDeploy,
    ) -> EngineResult<Vec<VerifierRequirement>> {
        Ok(vec![VerifierRequirement {
            lookup: deploy.from.clone(),
            algorithm: ALGORITHM.into(),
            verifier_type: VERIFIER_TYPE.into(),
        }])
    }

    async fn prepare_deploy(
        &self,
        deploy: &PrivateContractDeploy,
        _verifiers: &[ResolvedVerifier],
    ) -> EngineResult<DeployPrepared> {
        let mut data = b"deploy:".to_vec();
        data.extend_from_slice(deploy.id.as_bytes());
        Ok(DeployPrepared {
            transaction: PreparedPublicTransaction {
                to: derived_address("tokens.factory"),
                function: "deploy".into(),
                params: deploy.inputs.clone(),
                data: Bytes::from(data),
                gas: None,
            },
            signer: SUBMITTER.into(),
            contract_address: derived_address(&deploy.id.to_string()),
        })
    }
}

pub struct TestNode {
    pub name: String,
    pub handle: NodeHandle,
    pub domain: Arc<TokenDomain>,
    pub chain: DevChain,
    _dir: tempfile::TempDir,
}

fn test_config(name: &str, dir: &tempfile::TempDir) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node_name = name.to_string();
    config.data_dir = dir.path().to_path_buf();
    config.sequencer.endorsement_request_timeout_ms = 500;
    config.sequencer.endorsement_gather_timeout_ms = 20_000;
    config.orchestrator.interval_ms = 20;
    config.orchestrator.resubmit_interval_ms = 2_000;
    config.engine.interval_ms = 20;
    config.engine.max_idle_time_ms = 60_000;
    config.engine.retry.initial_delay_ms = 10;
    config.engine.retry.max_delay_ms = 50;
    config
}

async fn build_node(
    name: &str,
    domain: Arc<TokenDomain>,
    chain: &DevChain,
    transport: InProcessTransport,
    inbound: tokio::sync::mpsc::UnboundedReceiver<ptx_node::transport::Frame>,
) -> TestNode {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let config = test_config(name, &dir);
    let mut registry = DomainRegistry::new();
    registry.register(domain.clone());

    let deps = NodeDeps {
        registry,
        resolver: Arc::new(DevIdentityResolver),
        keymgr: Arc::new(DevKeyManager),
        eth: chain.client(),
        transport: Arc::new(transport),
        transport_inbound: inbound,
        indexer: chain.subscribe(),
    };
    let node = Node::new(config, deps).expect("node");
    let handle = node.handle();
    tokio::spawn(async move {
        let _ = node.start().await;
    });
    TestNode {
        name: name.to_string(),
        handle,
        domain,
        chain: chain.clone(),
        _dir: dir,
    }
}

/// One node, every party local.
pub async fn single_node(selection: CoordinatorSelection, notary: &str) -> TestNode {
    let chain = DevChain::new();
    let domain = TokenDomain::new(notary, selection);
    let (transport, inbound) = InProcessTransport::new("node1");
    build_node("node1", domain, &chain, transport, inbound).await
}

/// Two connected nodes sharing one simulated base ledger, each with its
/// own instance of the token domain.
pub async fn two_nodes(
    selection: CoordinatorSelection,
    notary: &str,
) -> (TestNode, TestNode) {
    let chain = DevChain::new();
    let (transport1, inbound1) = InProcessTransport::new("node1");
    let (transport2, inbound2) = InProcessTransport::new("node2");
    InProcessTransport::connect(&transport1, &transport2);

    let domain1 = TokenDomain::new(notary, selection);
    let domain2 = TokenDomain::new(notary, selection);
    let node1 = build_node("node1", domain1, &chain, transport1, inbound1).await;
    let node2 = build_node("node2", domain2, &chain, transport2, inbound2).await;
    (node1, node2)
}

/// Polls a transaction until it reaches the wanted status. Panics with
/// the last observed status on timeout.
pub async fn poll_for_status(
    node: &TestNode,
    id: Uuid,
    want: &str,
    deadline: Duration,
) -> TxStatus {
    let poll = async {
        loop {
            if let Ok(Some(status)) = node.handle.ptm.transaction_status(id).await {
                if status.as_str() == want {
                    return status;
                }
                if status.as_str() == "reverted" && want != "reverted" {
                    panic!("transaction {id} reverted while waiting for {want}: {status:?}");
                }
            }
            sleep(Duration::from_millis(20)).await;
        }
    };
    match timeout(deadline, poll).await {
        Ok(status) => status,
        Err(_) => {
            let last = node.handle.ptm.transaction_status(id).await;
            panic!("timed out waiting for {want} on {id}; last status {last:?}");
        }
    }
}

pub fn transfer_tx(contract: Address, from: &str, to: &str, amount: u64) -> PrivateTransaction {
    PrivateTransaction::new(
        DOMAIN_NAME,
        contract,
        from,
        serde_json::json!({"to": to, "amount": amount}),
    )
}

pub fn mint_tx(contract: Address, from: &str, to: &str, amount: u64) -> PrivateTransaction {
    PrivateTransaction::new(
        DOMAIN_NAME,
        contract,
        from,
        serde_json::json!({"mint": true, "to": to, "amount": amount}),
    )
}

pub fn submitter_address() -> Address {
    derived_address(SUBMITTER)
}
