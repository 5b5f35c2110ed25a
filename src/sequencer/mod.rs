pub mod delegation;
pub mod gather;
pub mod graph;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rocksdb::WriteBatch;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{RetryConfig, SequencerConfig, TransportConfig};
use crate::context::DomainContext;
use crate::domain::{
    AssembleResult, CoordinatorSelection, Domain, EndorseResult, EndorsementInput, PrepareOutcome,
};
use crate::errors::{EngineError, EngineResult};
use crate::identity::{CachingIdentityResolver, KeyManager};
use crate::metrics::{
    METRIC_ASSEMBLY_SECONDS, METRIC_ENDORSEMENT_REQUESTS, METRIC_ENDORSEMENT_TIMEOUTS,
    METRIC_PRIVATE_TX_DELEGATED, METRIC_PRIVATE_TX_DISPATCHED, METRIC_PRIVATE_TX_REVERTED,
};
use crate::pubtm::PublicTxManager;
use crate::storage::Storage;
use crate::transport::{DelegationOutcome, EndorsementReply, Transport, TransportMessage};
use crate::types::{
    Address, AttestationKind, AttestationRequest, AttestationResult, IdentityLocator,
    PostAssembly, PrivateTransaction, PublicTxInput, PublicTxSubmission, ResolvedVerifier,
    TransactionIntent, TransactionReceipt, TransactionType, TxBinding, TxStatus,
    VerifierRequirement, B256,
};

use delegation::DelegationTracker;
use gather::{attach_result, GatherState};
use graph::DepGraph;

/// How long a parked transaction waits before assembly is retried.
const PARK_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Commands accepted by a sequencer from the dispatcher.
pub enum SeqCommand {
    NewTransaction {
        tx: Box<PrivateTransaction>,
        ack: oneshot::Sender<EngineResult<()>>,
    },
    Inbound {
        from_node: String,
        message: TransportMessage,
    },
    /// A bound public transaction completed on chain.
    PublicTxCompleted {
        tx_id: Uuid,
        success: bool,
    },
    Status {
        id: Uuid,
        reply: oneshot::Sender<Option<TxStatus>>,
    },
}

enum Internal {
    InitDone {
        id: Uuid,
        result: EngineResult<Vec<VerifierRequirement>>,
    },
    VerifiersResolved {
        id: Uuid,
        result: EngineResult<Vec<ResolvedVerifier>>,
    },
    LocalAttestation {
        id: Uuid,
        party: String,
        result: EngineResult<AttestationResult>,
        revert_reason: Option<String>,
    },
    PrepareDone {
        id: Uuid,
        result: EngineResult<(PrepareOutcome, Address)>,
    },
    EndorserReply {
        to_node: String,
        tx_id: Uuid,
        contract: Address,
        attestation_name: String,
        party: String,
        reply: EndorsementReply,
    },
}

struct TxEntry {
    tx: PrivateTransaction,
    redrives: u32,
    /// Node that delegated this transaction to us, if any.
    delegated_from: Option<String>,
}

/// Handle used by the dispatcher and the node wiring to talk to a
/// sequencer task.
#[derive(Clone)]
pub struct SequencerHandle {
    commands: mpsc::Sender<SeqCommand>,
}

impl SequencerHandle {
    pub async fn submit(&self, tx: PrivateTransaction) -> EngineResult<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.commands
            .send(SeqCommand::NewTransaction {
                tx: Box::new(tx),
                ack,
            })
            .await
            .map_err(|_| EngineError::Routing("sequencer stopped".into()))?;
        ack_rx
            .await
            .map_err(|_| EngineError::Routing("sequencer dropped submission".into()))?
    }

    pub async fn inbound(&self, from_node: String, message: TransportMessage) -> EngineResult<()> {
        self.commands
            .send(SeqCommand::Inbound { from_node, message })
            .await
            .map_err(|_| EngineError::Routing("sequencer stopped".into()))
    }

    pub async fn public_tx_completed(&self, tx_id: Uuid, success: bool) -> EngineResult<()> {
        self.commands
            .send(SeqCommand::PublicTxCompleted { tx_id, success })
            .await
            .map_err(|_| EngineError::Routing("sequencer stopped".into()))
    }

    pub async fn status(&self, id: Uuid) -> EngineResult<Option<TxStatus>> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(SeqCommand::Status { id, reply })
            .await
            .map_err(|_| EngineError::Routing("sequencer stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::Routing("sequencer stopped".into()))
    }
}

/// Per-contract coordinator. One task owns every transaction for its
/// contract address: the stage machine, the serialized assembly slot, the
/// dependency graph, endorsement gathering, delegation, and dispatch.
pub struct Sequencer {
    node_name: String,
    contract: Address,
    domain: Arc<dyn Domain>,
    storage: Storage,
    context: DomainContext,
    resolver: Arc<CachingIdentityResolver>,
    keymgr: Arc<dyn KeyManager>,
    transport: Arc<dyn Transport>,
    pubtm: PublicTxManager,
    config: SequencerConfig,
    transport_config: TransportConfig,
    retry: RetryConfig,

    commands: mpsc::Receiver<SeqCommand>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,

    txs: HashMap<Uuid, TxEntry>,
    graph: DepGraph,
    assembly_queue: VecDeque<Uuid>,
    assembling: bool,
    parked: HashMap<Uuid, Instant>,
    gathers: HashMap<Uuid, GatherState>,
    delegations: DelegationTracker,
    /// Endorser-side reply cache so a re-sent request gets the same bytes.
    endorser_replies: HashMap<(Uuid, String, String), EndorsementReply>,
}

pub struct SequencerDeps {
    pub node_name: String,
    pub domain: Arc<dyn Domain>,
    pub storage: Storage,
    pub resolver: Arc<CachingIdentityResolver>,
    pub keymgr: Arc<dyn KeyManager>,
    pub transport: Arc<dyn Transport>,
    pub pubtm: PublicTxManager,
    pub config: SequencerConfig,
    pub transport_config: TransportConfig,
    pub retry: RetryConfig,
}

impl Sequencer {
    pub fn spawn(contract: Address, deps: SequencerDeps) -> SequencerHandle {
        let (command_tx, command_rx) = mpsc::channel(128);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let context = DomainContext::new(contract, deps.storage.clone());
        let sequencer = Sequencer {
            node_name: deps.node_name,
            contract,
            domain: deps.domain,
            storage: deps.storage,
            context,
            resolver: deps.resolver,
            keymgr: deps.keymgr,
            transport: deps.transport,
            pubtm: deps.pubtm,
            config: deps.config,
            transport_config: deps.transport_config,
            retry: deps.retry,
            commands: command_rx,
            internal_tx,
            internal_rx,
            txs: HashMap::new(),
            graph: DepGraph::new(),
            assembly_queue: VecDeque::new(),
            assembling: false,
            parked: HashMap::new(),
            gathers: HashMap::new(),
            delegations: DelegationTracker::new(),
            endorser_replies: HashMap::new(),
        };
        tokio::spawn(sequencer.run());
        SequencerHandle {
            commands: command_tx,
        }
    }

    async fn run(mut self) {
        info!(contract = %self.contract, "sequencer started");
        let mut ticker = time::interval(Duration::from_millis(50));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            if let Err(err) = self.handle_command(command).await {
                                warn!(contract = %self.contract, %err, "command handling failed");
                            }
                        }
                        None => break,
                    }
                }
                Some(event) = self.internal_rx.recv() => {
                    if let Err(err) = self.handle_internal(event).await {
                        warn!(contract = %self.contract, %err, "event handling failed");
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.handle_tick().await {
                        warn!(contract = %self.contract, %err, "tick handling failed");
                    }
                }
            }
            if let Err(err) = self.drive_assembly().await {
                warn!(contract = %self.contract, %err, "assembly drive failed");
            }
        }
        info!(contract = %self.contract, "sequencer stopped");
    }

    async fn handle_command(&mut self, command: SeqCommand) -> EngineResult<()> {
        match command {
            SeqCommand::NewTransaction { tx, ack } => {
                let result = self.accept_transaction(*tx, None);
                let _ = ack.send(result);
                Ok(())
            }
            SeqCommand::Inbound { from_node, message } => {
                self.handle_inbound(from_node, message).await
            }
            SeqCommand::PublicTxCompleted { tx_id, success } => {
                self.handle_public_completion(tx_id, success)
            }
            SeqCommand::Status { id, reply } => {
                let status = match self.txs.get(&id) {
                    Some(entry) => Some(entry.tx.status.clone()),
                    None => self.storage.read_private_tx(&id)?.map(|tx| tx.status),
                };
                let _ = reply.send(status);
                Ok(())
            }
        }
    }

    fn accept_transaction(
        &mut self,
        tx: PrivateTransaction,
        delegated_from: Option<String>,
    ) -> EngineResult<()> {
        if self.txs.contains_key(&tx.id) {
            // redelivered delegation or duplicate submit
            return Ok(());
        }
        if let Some(existing) = self.storage.read_private_tx(&tx.id)? {
            if existing.status.is_terminal() {
                return Ok(());
            }
        }
        let id = tx.id;
        let mut entry = TxEntry {
            tx,
            redrives: 0,
            delegated_from,
        };
        entry.tx.status = TxStatus::New;
        self.persist(&entry.tx)?;
        match &entry.delegated_from {
            Some(origin) => {
                self.record_activity(&id, format!("accepted by delegation from {origin}"))
            }
            None => self.record_activity(&id, "accepted for coordination"),
        }
        self.txs.insert(id, entry);
        self.start_init(id);
        Ok(())
    }

    fn start_init(&self, id: Uuid) {
        let Some(entry) = self.txs.get(&id) else {
            return;
        };
        let domain = self.domain.clone();
        let tx = entry.tx.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = domain.init_transaction(&tx).await;
            let _ = internal.send(Internal::InitDone { id, result });
        });
    }

    async fn handle_internal(&mut self, event: Internal) -> EngineResult<()> {
        match event {
            Internal::InitDone { id, result } => self.on_init_done(id, result),
            Internal::VerifiersResolved { id, result } => self.on_verifiers_resolved(id, result),
            Internal::LocalAttestation {
                id,
                party,
                result,
                revert_reason,
            } => self.on_attestation(id, party, result, revert_reason).await,
            Internal::PrepareDone { id, result } => self.on_prepare_done(id, result).await,
            Internal::EndorserReply {
                to_node,
                tx_id,
                contract,
                attestation_name,
                party,
                reply,
            } => {
                self.endorser_replies.insert(
                    (tx_id, attestation_name.clone(), party.clone()),
                    reply.clone(),
                );
                self.transport
                    .send(
                        &to_node,
                        TransportMessage::EndorsementResponse {
                            tx_id,
                            contract,
                            attestation_name,
                            party,
                            reply,
                        },
                    )
                    .await
            }
        }
    }

    fn on_init_done(
        &mut self,
        id: Uuid,
        result: EngineResult<Vec<VerifierRequirement>>,
    ) -> EngineResult<()> {
        let required = match result {
            Ok(required) => required,
            Err(err) => return self.finalize_revert(id, format!("init failed: {err}")),
        };
        let entry = match self.txs.get_mut(&id) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let pre_assembly = entry.tx.pre_assembly.get_or_insert_with(Default::default);
        pre_assembly.required_verifiers = required.clone();
        entry.tx.status = TxStatus::AwaitingVerifiers;
        let tx_snapshot = entry.tx.clone();
        self.persist(&tx_snapshot)?;
        self.record_activity(&id, format!("requires {} verifiers", required.len()));

        let resolver = self.resolver.clone();
        let retry = self.retry.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let mut resolved = Vec::with_capacity(required.len());
            let mut failure = None;
            for requirement in &required {
                match resolver.resolve_with_retry(requirement, &retry).await {
                    Ok(verifier) => resolved.push(verifier),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            let result = match failure {
                Some(err) => Err(err),
                None => Ok(resolved),
            };
            let _ = internal.send(Internal::VerifiersResolved { id, result });
        });
        Ok(())
    }

    fn on_verifiers_resolved(
        &mut self,
        id: Uuid,
        result: EngineResult<Vec<ResolvedVerifier>>,
    ) -> EngineResult<()> {
        let resolved = match result {
            Ok(resolved) => resolved,
            Err(err) => return self.finalize_revert(id, format!("verifier resolution: {err}")),
        };
        let entry = match self.txs.get_mut(&id) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        if let Some(pre_assembly) = entry.tx.pre_assembly.as_mut() {
            pre_assembly.verifiers = resolved;
        }

        // a static coordinator elsewhere takes over before assembly
        let config = self.domain.contract_config(&self.contract);
        if config.coordinator_selection == CoordinatorSelection::Static {
            if let Some(target) = config
                .static_coordinator
                .filter(|node| *node != self.node_name)
            {
                let tx_snapshot = entry.tx.clone();
                self.persist(&tx_snapshot)?;
                return self.delegate(id, target);
            }
        }

        entry.tx.status = TxStatus::Assembling;
        let tx_snapshot = entry.tx.clone();
        self.persist(&tx_snapshot)?;
        self.record_activity(&id, "verifiers resolved; queued for assembly");
        self.assembly_queue.push_back(id);
        Ok(())
    }

    /// Runs at most one assembly at a time. The call happens inline on the
    /// sequencer task, which is what serializes sibling assemblies against
    /// the shared domain context.
    async fn drive_assembly(&mut self) -> EngineResult<()> {
        if self.assembling {
            return Ok(());
        }
        let Some(id) = self.assembly_queue.pop_front() else {
            return Ok(());
        };
        let Some(entry) = self.txs.get(&id) else {
            return Ok(());
        };
        self.assembling = true;
        let started = Instant::now();
        let outcome = self
            .domain
            .assemble_transaction(&self.context, &entry.tx)
            .await;
        metrics::histogram!(METRIC_ASSEMBLY_SECONDS, started.elapsed().as_secs_f64());
        self.assembling = false;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => return self.finalize_revert(id, format!("assembly failed: {err}")),
        };
        match outcome.result {
            AssembleResult::Revert => {
                let reason = outcome
                    .revert_reason
                    .unwrap_or_else(|| "assembly reverted".into());
                self.finalize_revert(id, reason)
            }
            AssembleResult::Park => {
                let entry = self.txs.get_mut(&id).expect("entry checked above");
                entry.tx.status = TxStatus::Parked;
                let tx_snapshot = entry.tx.clone();
                self.persist(&tx_snapshot)?;
                self.record_activity(&id, "assembly parked; required states unavailable");
                self.parked.insert(id, Instant::now() + PARK_RETRY_DELAY);
                Ok(())
            }
            AssembleResult::Ok => {
                let entry = self.txs.get_mut(&id).expect("entry checked above");
                let post_assembly = PostAssembly {
                    input_states: outcome.input_states.clone(),
                    output_states: outcome.output_states.clone(),
                    attestation_plan: outcome.attestation_plan.clone(),
                    signatures: Vec::new(),
                    endorsements: Vec::new(),
                };
                entry.tx.post_assembly = Some(post_assembly);
                if let Err(err) =
                    self.context
                        .reserve(id, &outcome.input_states, &outcome.output_states)
                {
                    return self.finalize_revert(id, format!("state reservation: {err}"));
                }
                let inputs: Vec<B256> = outcome.input_states.iter().map(|s| s.id).collect();
                let outputs: Vec<B256> = outcome.output_states.iter().map(|s| s.id).collect();
                self.graph.record_assembly(id, &inputs, &outputs);
                self.record_activity(
                    &id,
                    format!(
                        "assembled with {} inputs and {} outputs",
                        inputs.len(),
                        outputs.len()
                    ),
                );

                // with endorser-based coordination, a fully remote endorser
                // set means the coordinator lives there
                let config = self.domain.contract_config(&self.contract);
                if config.coordinator_selection == CoordinatorSelection::Endorser {
                    if let Some(target) = self.remote_endorser_node(&id) {
                        // if that node is simultaneously delegating to us,
                        // both sides bid; the resolver picks one winner and
                        // the loser re-bases
                        let mutual_bid = self
                            .txs
                            .values()
                            .any(|e| e.delegated_from.as_deref() == Some(target.as_str()));
                        if mutual_bid {
                            let winner = crate::contention::resolve(
                                &self.contract.to_string(),
                                &self.node_name,
                                &target,
                            );
                            if winner == self.node_name {
                                info!(tx = %id, contract = %self.contract, loser = %target,
                                    "contention resolved locally; keeping coordination");
                                return self.start_gather(id).await;
                            }
                        }
                        self.context.release(&id);
                        self.graph.remove_with_dependents(&id);
                        let entry = self.txs.get_mut(&id).expect("entry checked above");
                        entry.tx.post_assembly = None;
                        let tx_snapshot = entry.tx.clone();
                        self.persist(&tx_snapshot)?;
                        return self.delegate(id, target);
                    }
                }

                self.start_gather(id).await
            }
        }
    }

    fn remote_endorser_node(&self, id: &Uuid) -> Option<String> {
        let entry = self.txs.get(id)?;
        if entry.delegated_from.is_some() {
            return None;
        }
        let plan = &entry.tx.post_assembly.as_ref()?.attestation_plan;
        let first_endorse = plan
            .iter()
            .find(|request| request.kind == AttestationKind::Endorse)?;
        let party = first_endorse.parties.first()?;
        let locator: IdentityLocator = party.parse().ok()?;
        let node = locator.node?;
        (node != self.node_name).then_some(node)
    }

    fn delegate(&mut self, id: Uuid, target: String) -> EngineResult<()> {
        let entry = match self.txs.get_mut(&id) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        entry.tx.status = TxStatus::Delegating;
        let tx = entry.tx.clone();
        self.persist(&tx)?;
        let delegation_id = self.delegations.track(id, target.clone());
        metrics::counter!(METRIC_PRIVATE_TX_DELEGATED, 1);
        info!(tx = %id, %target, "delegating coordination");
        self.record_activity(&id, format!("coordination delegated to {target}"));

        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(err) = transport
                .send(
                    &target,
                    TransportMessage::DelegationRequest {
                        delegation_id,
                        transaction: tx,
                    },
                )
                .await
            {
                warn!(tx = %id, %err, "delegation send failed; will re-send");
            }
        });
        Ok(())
    }

    async fn start_gather(&mut self, id: Uuid) -> EngineResult<()> {
        let entry = match self.txs.get_mut(&id) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let plan = entry
            .tx
            .post_assembly
            .as_ref()
            .map(|pa| pa.attestation_plan.clone())
            .unwrap_or_default();
        let has_signatures = plan
            .iter()
            .any(|request| request.kind == AttestationKind::Sign);
        entry.tx.status = if has_signatures {
            TxStatus::GatheringSignatures
        } else {
            TxStatus::GatheringEndorsements
        };
        let tx_snapshot = entry.tx.clone();
        self.persist(&tx_snapshot)?;

        let mut gather = GatherState::new(&plan, self.config.endorsement_gather_timeout());
        if gather.is_complete() {
            return self.start_prepare(id);
        }
        for (request, party) in gather.missing() {
            self.send_attestation_request(&tx_snapshot, &request, &party)
                .await?;
            gather.mark_sent(&request.name, &party);
        }
        self.gathers.insert(id, gather);
        Ok(())
    }

    /// Routes one attestation request: SIGN to the local signer, ENDORSE
    /// to the party's node (directly to the domain when the party is
    /// local).
    async fn send_attestation_request(
        &self,
        tx: &PrivateTransaction,
        request: &AttestationRequest,
        party: &str,
    ) -> EngineResult<()> {
        metrics::counter!(METRIC_ENDORSEMENT_REQUESTS, 1);
        let locator: IdentityLocator = party.parse()?;
        match request.kind {
            AttestationKind::Sign => {
                let keymgr = self.keymgr.clone();
                let internal = self.internal_tx.clone();
                let request = request.clone();
                let party = party.to_string();
                let identity = locator.identity.clone();
                let id = tx.id;
                tokio::spawn(async move {
                    let result = sign_attestation(keymgr, &identity, &request).await;
                    let _ = internal.send(Internal::LocalAttestation {
                        id,
                        party,
                        result,
                        revert_reason: None,
                    });
                });
                Ok(())
            }
            AttestationKind::Endorse if locator.is_local(&self.node_name) => {
                let domain = self.domain.clone();
                let internal = self.internal_tx.clone();
                let input = EndorsementInput {
                    tx_id: tx.id,
                    contract: self.contract,
                    attestation: request.clone(),
                    party: party.to_string(),
                    pre_assembly: tx.pre_assembly.clone().unwrap_or_default(),
                    post_assembly: tx.post_assembly.clone().unwrap_or_default(),
                };
                let party = party.to_string();
                let name = request.name.clone();
                let id = tx.id;
                tokio::spawn(async move {
                    let (result, revert_reason) =
                        endorse_locally(domain, &input, &name, &party).await;
                    let _ = internal.send(Internal::LocalAttestation {
                        id,
                        party,
                        result,
                        revert_reason,
                    });
                });
                Ok(())
            }
            AttestationKind::Endorse => {
                self.transport
                    .send(
                        locator.node_or(&self.node_name),
                        TransportMessage::EndorsementRequest {
                            tx_id: tx.id,
                            domain: tx.domain.clone(),
                            contract: self.contract,
                            attestation: request.clone(),
                            party: party.to_string(),
                            pre_assembly: tx.pre_assembly.clone().unwrap_or_default(),
                            post_assembly: tx.post_assembly.clone().unwrap_or_default(),
                        },
                    )
                    .await
            }
        }
    }

    async fn on_attestation(
        &mut self,
        id: Uuid,
        party: String,
        result: EngineResult<AttestationResult>,
        revert_reason: Option<String>,
    ) -> EngineResult<()> {
        if let Some(reason) = revert_reason {
            return self.finalize_revert(id, format!("endorsement reverted: {reason}"));
        }
        let result = match result {
            Ok(result) => result,
            Err(err) => {
                // transient attestation failures are retried by the gather
                // deadline machinery; a hard failure reverts
                if err.is_transient() {
                    warn!(tx = %id, %err, "attestation attempt failed; awaiting re-drive");
                    return Ok(());
                }
                return self.finalize_revert(id, format!("attestation failed: {err}"));
            }
        };
        let Some(gather) = self.gathers.get_mut(&id) else {
            return Ok(());
        };
        if !gather.record(&party, &result) {
            debug!(tx = %id, %party, "ignoring duplicate or unmatched attestation");
            return Ok(());
        }
        if let Some(entry) = self.txs.get_mut(&id) {
            if let Some(post_assembly) = entry.tx.post_assembly.as_mut() {
                attach_result(post_assembly, result);
            }
            let all_signed = entry
                .tx
                .post_assembly
                .as_ref()
                .map(|pa| {
                    pa.attestation_plan
                        .iter()
                        .filter(|r| r.kind == AttestationKind::Sign)
                        .all(|r| pa.signatures.iter().any(|s| s.name == r.name))
                })
                .unwrap_or(true);
            if all_signed && entry.tx.status == TxStatus::GatheringSignatures {
                entry.tx.status = TxStatus::GatheringEndorsements;
            }
            let tx_snapshot = entry.tx.clone();
            self.persist(&tx_snapshot)?;
        }
        if self
            .gathers
            .get(&id)
            .map(|g| g.is_complete())
            .unwrap_or(false)
        {
            self.gathers.remove(&id);
            self.start_prepare(id)?;
        }
        Ok(())
    }

    fn start_prepare(&mut self, id: Uuid) -> EngineResult<()> {
        let entry = match self.txs.get_mut(&id) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        entry.tx.status = TxStatus::Preparing;
        let tx = entry.tx.clone();
        self.persist(&tx)?;
        self.record_activity(&id, "attestation plan satisfied; preparing");

        let domain = self.domain.clone();
        let keymgr = self.keymgr.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let outcome = domain.prepare_transaction(&tx).await?;
                let signer_address = keymgr.resolve_eth_address(&outcome.signer).await?;
                Ok((outcome, signer_address))
            }
            .await;
            let _ = internal.send(Internal::PrepareDone { id, result });
        });
        Ok(())
    }

    async fn on_prepare_done(
        &mut self,
        id: Uuid,
        result: EngineResult<(PrepareOutcome, Address)>,
    ) -> EngineResult<()> {
        let (outcome, signer_address) = match result {
            Ok(done) => done,
            Err(err) => return self.finalize_revert(id, format!("prepare failed: {err}")),
        };
        let entry = match self.txs.get_mut(&id) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        entry.tx.prepared = Some(outcome.transaction);
        entry.tx.signer = Some(outcome.signer.clone());

        if entry.tx.intent == TransactionIntent::PrepareTransaction {
            entry.tx.status = TxStatus::Prepared;
            let record = crate::storage::PreparedTransactionRecord {
                id,
                transaction: entry.tx.prepared.clone().expect("just set"),
                signer: outcome.signer,
                created_at: crate::types::private::unix_seconds(),
            };
            let tx_snapshot = entry.tx.clone();
            self.persist(&tx_snapshot)?;
            self.storage.put_prepared(&record)?;
            self.complete_delegated(id, DelegationOutcome::Dispatched).await;
            return Ok(());
        }

        entry.tx.status = TxStatus::Dispatching;
        self.graph.set_signer(id, signer_address);
        let tx_snapshot = entry.tx.clone();
        self.persist(&tx_snapshot)?;
        self.try_dispatch().await
    }

    /// Dispatches every prepared transaction whose ancestors allow it,
    /// repeating until no further transaction becomes ready. Each pass is
    /// one atomic persistence transaction: public tx rows plus the state
    /// flush for every dispatched transaction.
    async fn try_dispatch(&mut self) -> EngineResult<()> {
        loop {
            let ready: Vec<Uuid> = self
                .graph
                .ready_transactions()
                .into_iter()
                .filter(|id| {
                    self.txs
                        .get(id)
                        .map(|entry| entry.tx.status == TxStatus::Dispatching)
                        .unwrap_or(false)
                })
                .collect();
            if ready.is_empty() {
                return Ok(());
            }

            let mut submissions = Vec::with_capacity(ready.len());
            for id in &ready {
                let entry = self.txs.get(id).expect("filtered above");
                let prepared = entry
                    .tx
                    .prepared
                    .as_ref()
                    .ok_or_else(|| EngineError::Fatal(format!("dispatching unprepared tx {id}")))?;
                submissions.push(PublicTxSubmission {
                    bindings: vec![TxBinding {
                        transaction: *id,
                        tx_type: TransactionType::Private,
                    }],
                    input: PublicTxInput {
                        from: entry
                            .tx
                            .signer
                            .clone()
                            .ok_or_else(|| EngineError::Fatal(format!("no signer for tx {id}")))?,
                        to: Some(prepared.to),
                        data: prepared.data.clone(),
                        gas: prepared.gas,
                        value: None,
                        gas_pricing: None,
                    },
                });
            }

            let mut batch = self.pubtm.prepare_submission_batch(submissions).await?;

            let rejected: Vec<(Uuid, Vec<u8>)> = batch
                .rejected()
                .iter()
                .map(|r| {
                    (
                        r.bindings.first().map(|b| b.transaction).unwrap_or_default(),
                        r.revert_data.to_vec(),
                    )
                })
                .collect();

            let accepted_ids: Vec<Uuid> = batch
                .accepted()
                .iter()
                .filter_map(|a| a.bindings.first().map(|b| b.transaction))
                .collect();

            let mut write_batch = WriteBatch::default();
            let submit_result = if accepted_ids.is_empty() {
                Ok(())
            } else {
                batch.submit(&mut write_batch)
            };
            match submit_result {
                Ok(()) => {}
                Err(err) => {
                    batch.completed(false);
                    return Err(err);
                }
            }
            for id in &accepted_ids {
                self.context
                    .flush_transaction(&mut write_batch, id, B256::ZERO)?;
            }
            if let Err(err) = self.storage.write(write_batch) {
                batch.completed(false);
                return Err(err);
            }
            batch.completed(true);

            for id in &accepted_ids {
                if let Some(entry) = self.txs.get_mut(id) {
                    entry.tx.status = TxStatus::Dispatched;
                    let tx_snapshot = entry.tx.clone();
                    self.persist(&tx_snapshot)?;
                }
                self.graph.mark_dispatched(id);
                metrics::counter!(METRIC_PRIVATE_TX_DISPATCHED, 1);
                info!(tx = %id, contract = %self.contract, "dispatched");
                self.record_activity(id, "dispatched to the base ledger");
                self.complete_delegated(*id, DelegationOutcome::Dispatched).await;
            }
            for (id, revert_data) in rejected {
                let reason = if revert_data.is_empty() {
                    "base ledger rejected during gas estimation".to_string()
                } else {
                    format!(
                        "base ledger rejected during gas estimation: 0x{}",
                        hex::encode(&revert_data)
                    )
                };
                self.finalize_revert(id, reason)?;
            }
        }
    }

    async fn handle_inbound(
        &mut self,
        from_node: String,
        message: TransportMessage,
    ) -> EngineResult<()> {
        match message {
            TransportMessage::EndorsementRequest {
                tx_id,
                domain: _,
                contract,
                attestation,
                party,
                pre_assembly,
                post_assembly,
            } => {
                let cache_key = (tx_id, attestation.name.clone(), party.clone());
                if let Some(reply) = self.endorser_replies.get(&cache_key) {
                    // same request, same bytes
                    return self
                        .transport
                        .send(
                            &from_node,
                            TransportMessage::EndorsementResponse {
                                tx_id,
                                contract,
                                attestation_name: attestation.name,
                                party,
                                reply: reply.clone(),
                            },
                        )
                        .await;
                }
                let domain = self.domain.clone();
                let internal = self.internal_tx.clone();
                let input = EndorsementInput {
                    tx_id,
                    contract,
                    attestation: attestation.clone(),
                    party: party.clone(),
                    pre_assembly,
                    post_assembly,
                };
                let name = attestation.name;
                tokio::spawn(async move {
                    let reply = match domain.endorse_transaction(&input).await {
                        Ok(outcome) => match outcome.result {
                            EndorseResult::Revert => EndorsementReply::Revert {
                                reason: outcome
                                    .revert_reason
                                    .unwrap_or_else(|| "endorsement refused".into()),
                            },
                            result => EndorsementReply::Attested {
                                kind: match result {
                                    EndorseResult::Sign => AttestationKind::Sign,
                                    _ => AttestationKind::Endorse,
                                },
                                payload: outcome.payload,
                                verifier: outcome.endorser.unwrap_or(ResolvedVerifier {
                                    lookup: input.party.clone(),
                                    algorithm: input.attestation.algorithm.clone(),
                                    verifier_type: input.attestation.verifier_type.clone(),
                                    verifier: String::new(),
                                }),
                            },
                        },
                        Err(err) => EndorsementReply::Revert {
                            reason: format!("endorsement error: {err}"),
                        },
                    };
                    let _ = internal.send(Internal::EndorserReply {
                        to_node: from_node,
                        tx_id,
                        contract,
                        attestation_name: name,
                        party: input.party.clone(),
                        reply,
                    });
                });
                Ok(())
            }
            TransportMessage::EndorsementResponse {
                tx_id,
                contract: _,
                attestation_name,
                party,
                reply,
            } => match reply {
                EndorsementReply::Attested {
                    kind,
                    payload,
                    verifier,
                } => {
                    let result = AttestationResult {
                        name: attestation_name,
                        kind: match kind {
                            // a SIGN reply still satisfies the ENDORSE slot
                            AttestationKind::Sign => AttestationKind::Endorse,
                            other => other,
                        },
                        verifier,
                        payload,
                    };
                    self.on_attestation(tx_id, party, Ok(result), None).await
                }
                EndorsementReply::Revert { reason } => {
                    self.on_attestation(
                        tx_id,
                        party,
                        Err(EngineError::EndorsementFailed(reason.clone())),
                        Some(reason),
                    )
                    .await
                }
            },
            TransportMessage::DelegationRequest {
                delegation_id,
                transaction,
            } => {
                let tx_id = transaction.id;
                self.accept_transaction(transaction, Some(from_node.clone()))?;
                self.transport
                    .send(
                        &from_node,
                        TransportMessage::DelegationAck {
                            delegation_id,
                            tx_id,
                            contract: self.contract,
                        },
                    )
                    .await?;
                // a redelivery after completion means the result was lost
                if let Some(stored) = self.storage.read_private_tx(&tx_id)? {
                    let outcome = match &stored.status {
                        TxStatus::Dispatched | TxStatus::Prepared => {
                            Some(DelegationOutcome::Dispatched)
                        }
                        TxStatus::Reverted { reason } => Some(DelegationOutcome::Reverted {
                            reason: reason.clone(),
                        }),
                        _ => None,
                    };
                    if let Some(outcome) = outcome {
                        self.transport
                            .send(
                                &from_node,
                                TransportMessage::DelegationResult {
                                    tx_id,
                                    contract: self.contract,
                                    outcome,
                                },
                            )
                            .await?;
                    }
                }
                Ok(())
            }
            TransportMessage::DelegationAck { delegation_id, .. } => {
                self.delegations.record_ack(&delegation_id);
                Ok(())
            }
            TransportMessage::DelegationResult {
                tx_id,
                contract: _,
                outcome,
            } => {
                if !self.delegations.is_delegated(&tx_id) {
                    return Ok(());
                }
                self.delegations.finish(&tx_id);
                match outcome {
                    DelegationOutcome::Dispatched => {
                        if let Some(entry) = self.txs.get_mut(&tx_id) {
                            entry.tx.status = TxStatus::Dispatched;
                            let tx_snapshot = entry.tx.clone();
                            self.persist(&tx_snapshot)?;
                        }
                        self.record_activity(&tx_id, "remote coordinator reported dispatched");
                        self.txs.remove(&tx_id);
                        Ok(())
                    }
                    DelegationOutcome::Reverted { reason } => {
                        self.finalize_revert(tx_id, format!("remote coordinator: {reason}"))
                    }
                }
            }
        }
    }

    fn handle_public_completion(&mut self, tx_id: Uuid, success: bool) -> EngineResult<()> {
        if success {
            self.graph.mark_confirmed(&tx_id);
            // the record is persisted; nothing further can happen here
            self.txs.remove(&tx_id);
            return Ok(());
        }
        // an on-chain revert invalidates undispatched dependents
        let doomed = self.graph.remove_with_dependents(&tx_id);
        for dependent in doomed {
            let pending = self
                .txs
                .get(&dependent)
                .map(|entry| !entry.tx.status.is_terminal())
                .unwrap_or(false);
            if pending {
                self.finalize_revert(dependent, format!("ancestor {tx_id} reverted on chain"))?;
            }
        }
        Ok(())
    }

    async fn handle_tick(&mut self) -> EngineResult<()> {
        // parked assemblies come back for another attempt
        let now = Instant::now();
        let due_parked: Vec<Uuid> = self
            .parked
            .iter()
            .filter(|(_, retry_at)| **retry_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due_parked {
            self.parked.remove(&id);
            if let Some(entry) = self.txs.get_mut(&id) {
                entry.tx.status = TxStatus::Assembling;
                let tx_snapshot = entry.tx.clone();
                self.persist(&tx_snapshot)?;
                self.assembly_queue.push_back(id);
            }
        }

        // endorsement re-sends and gather deadline breaches
        let request_timeout = self.config.endorsement_request_timeout();
        let gather_timeout = self.config.endorsement_gather_timeout();
        let max_redrives = self.config.max_redrives;
        let mut resends: Vec<(Uuid, AttestationRequest, String)> = Vec::new();
        let mut breached: Vec<Uuid> = Vec::new();
        for (id, gather) in self.gathers.iter() {
            if gather.deadline_breached() {
                breached.push(*id);
                continue;
            }
            for (request, party) in gather.due_resends(request_timeout) {
                resends.push((*id, request, party));
            }
        }
        for (id, request, party) in resends {
            let Some(entry) = self.txs.get(&id) else {
                continue;
            };
            let tx = entry.tx.clone();
            debug!(tx = %id, request = %request.name, %party, "re-sending attestation request");
            self.send_attestation_request(&tx, &request, &party).await?;
            if let Some(gather) = self.gathers.get_mut(&id) {
                gather.mark_sent(&request.name, &party);
            }
        }
        for id in breached {
            metrics::counter!(METRIC_ENDORSEMENT_TIMEOUTS, 1);
            let redrives = {
                let Some(entry) = self.txs.get_mut(&id) else {
                    continue;
                };
                entry.redrives += 1;
                entry.redrives
            };
            if redrives > max_redrives {
                self.gathers.remove(&id);
                self.finalize_revert(id, "endorsement gather timed out".to_string())?;
                continue;
            }
            warn!(tx = %id, redrives, "endorsement deadline breached; re-driving");
            self.record_activity(
                &id,
                format!("endorsement deadline breached; re-drive {redrives}"),
            );
            if let Some(gather) = self.gathers.get_mut(&id) {
                gather.reset_deadline(gather_timeout);
            }
            let (tx, missing) = {
                let entry = self.txs.get(&id).expect("checked above");
                let gather = self.gathers.get(&id).expect("checked above");
                (entry.tx.clone(), gather.missing())
            };
            for (request, party) in missing {
                self.send_attestation_request(&tx, &request, &party).await?;
                if let Some(gather) = self.gathers.get_mut(&id) {
                    gather.mark_sent(&request.name, &party);
                }
            }
        }

        // unacked delegations are re-sent
        let due = self
            .delegations
            .due_resends(self.transport_config.delegation_ack_timeout());
        for (tx_id, delegation_id, target) in due {
            let Some(entry) = self.txs.get(&tx_id) else {
                continue;
            };
            let message = TransportMessage::DelegationRequest {
                delegation_id,
                transaction: entry.tx.clone(),
            };
            if let Err(err) = self.transport.send(&target, message).await {
                warn!(tx = %tx_id, %target, %err, "delegation re-send failed");
            }
        }
        Ok(())
    }

    fn finalize_revert(&mut self, id: Uuid, reason: String) -> EngineResult<()> {
        let Some(entry) = self.txs.get_mut(&id) else {
            return Ok(());
        };
        if entry.tx.status.is_terminal() {
            return Ok(());
        }
        warn!(tx = %id, contract = %self.contract, %reason, "finalizing revert");
        entry.tx.status = TxStatus::Reverted {
            reason: reason.clone(),
        };
        let tx_snapshot = entry.tx.clone();
        let delegated_from = entry.delegated_from.clone();
        self.persist(&tx_snapshot)?;
        self.storage
            .put_receipt(&TransactionReceipt::reverted(id, reason.clone(), None))?;
        metrics::counter!(METRIC_PRIVATE_TX_REVERTED, 1);
        self.record_activity(&id, format!("reverted: {reason}"));

        self.gathers.remove(&id);
        self.parked.remove(&id);
        self.context.release(&id);

        // dependents assembled on top of this transaction are invalid
        let doomed = self.graph.remove_with_dependents(&id);
        for dependent in doomed {
            self.finalize_revert(dependent, format!("ancestor {id} reverted"))?;
        }

        if let Some(origin) = delegated_from {
            let transport = self.transport.clone();
            let contract = self.contract;
            tokio::spawn(async move {
                let _ = transport
                    .send(
                        &origin,
                        TransportMessage::DelegationResult {
                            tx_id: id,
                            contract,
                            outcome: DelegationOutcome::Reverted { reason },
                        },
                    )
                    .await;
            });
        }
        self.txs.remove(&id);
        Ok(())
    }

    /// Reports a terminal outcome back to the delegating node, if this
    /// transaction arrived by delegation.
    async fn complete_delegated(&mut self, id: Uuid, outcome: DelegationOutcome) {
        let origin = self
            .txs
            .get(&id)
            .and_then(|entry| entry.delegated_from.clone());
        if let Some(origin) = origin {
            let result = self
                .transport
                .send(
                    &origin,
                    TransportMessage::DelegationResult {
                        tx_id: id,
                        contract: self.contract,
                        outcome,
                    },
                )
                .await;
            if let Err(err) = result {
                warn!(tx = %id, %origin, %err, "delegation result send failed");
            }
        }
    }

    fn persist(&self, tx: &PrivateTransaction) -> EngineResult<()> {
        self.storage.upsert_private_tx(tx)
    }

    /// Appends to the transaction's activity ring. Advisory: a write
    /// failure is logged and never fails the flow.
    fn record_activity(&self, id: &Uuid, message: impl Into<String>) {
        if let Err(err) = self.storage.add_activity_record(id, message) {
            warn!(tx = %id, %err, "activity record write failed");
        }
    }
}

async fn sign_attestation(
    keymgr: Arc<dyn KeyManager>,
    identity: &str,
    request: &AttestationRequest,
) -> EngineResult<AttestationResult> {
    let key = keymgr
        .resolve_key(identity, &request.algorithm, &request.verifier_type)
        .await?;
    let payload = request.payload.clone().unwrap_or_default();
    let signature = keymgr.sign(&key, &request.payload_type, &payload).await?;
    Ok(AttestationResult {
        name: request.name.clone(),
        kind: AttestationKind::Sign,
        verifier: ResolvedVerifier {
            lookup: key.identifier,
            algorithm: request.algorithm.clone(),
            verifier_type: request.verifier_type.clone(),
            verifier: key.verifier,
        },
        payload: signature,
    })
}

async fn endorse_locally(
    domain: Arc<dyn Domain>,
    input: &EndorsementInput,
    name: &str,
    party: &str,
) -> (EngineResult<AttestationResult>, Option<String>) {
    match domain.endorse_transaction(input).await {
        Ok(outcome) => match outcome.result {
            EndorseResult::Revert => {
                let reason = outcome
                    .revert_reason
                    .unwrap_or_else(|| "endorsement refused".into());
                (
                    Err(EngineError::EndorsementFailed(reason.clone())),
                    Some(reason),
                )
            }
            _ => (
                Ok(AttestationResult {
                    name: name.to_string(),
                    kind: AttestationKind::Endorse,
                    verifier: outcome.endorser.unwrap_or(ResolvedVerifier {
                        lookup: party.to_string(),
                        algorithm: input.attestation.algorithm.clone(),
                        verifier_type: input.attestation.verifier_type.clone(),
                        verifier: String::new(),
                    }),
                    payload: outcome.payload,
                }),
                None,
            ),
        },
        Err(err) => (Err(err), None),
    }
}
