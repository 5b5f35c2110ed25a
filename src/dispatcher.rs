use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{RetryConfig, SequencerConfig, TransportConfig};
use crate::domain::DomainRegistry;
use crate::errors::{EngineError, EngineResult};
use crate::identity::{CachingIdentityResolver, KeyManager};
use crate::metrics::{METRIC_PRIVATE_TX_RECEIVED, METRIC_SEQUENCERS_ACTIVE};
use crate::pubtm::{PubTmEvent, PublicTxManager};
use crate::sequencer::{Sequencer, SequencerDeps, SequencerHandle};
use crate::storage::Storage;
use crate::transport::{Frame, Transport, TransportMessage};
use crate::types::{
    Address, IdentityLocator, PrivateContractDeploy, PrivateTransaction, PublicTxInput,
    PublicTxSubmission, TransactionReceipt, TransactionType, TxBinding, TxStatus,
};

/// Front door of the private transaction manager. Validates submissions,
/// binds idempotency keys, and routes work to the per-contract sequencer,
/// creating it lazily. Inbound transport frames and public-transaction
/// completions route through here as well.
#[derive(Clone)]
pub struct PrivateTxManager {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    node_name: String,
    registry: DomainRegistry,
    storage: Storage,
    resolver: Arc<CachingIdentityResolver>,
    keymgr: Arc<dyn KeyManager>,
    transport: Arc<dyn Transport>,
    pubtm: PublicTxManager,
    sequencer_config: SequencerConfig,
    transport_config: TransportConfig,
    retry: RetryConfig,
    sequencers: RwLock<HashMap<Address, SequencerHandle>>,
}

impl PrivateTxManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: String,
        registry: DomainRegistry,
        storage: Storage,
        resolver: Arc<CachingIdentityResolver>,
        keymgr: Arc<dyn KeyManager>,
        transport: Arc<dyn Transport>,
        pubtm: PublicTxManager,
        sequencer_config: SequencerConfig,
        transport_config: TransportConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                node_name,
                registry,
                storage,
                resolver,
                keymgr,
                transport,
                pubtm,
                sequencer_config,
                transport_config,
                retry,
                sequencers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Validates and routes a new private transaction. Idempotent under
    /// `idempotency_key`: a repeated key returns the originally assigned id
    /// without creating a duplicate.
    pub async fn handle_new_tx(&self, tx: PrivateTransaction) -> EngineResult<Uuid> {
        metrics::counter!(METRIC_PRIVATE_TX_RECEIVED, 1);
        if tx.domain.is_empty() {
            return Err(EngineError::InvalidInput("domain is required".into()));
        }
        self.inner.registry.get(&tx.domain)?;
        tx.from
            .parse::<IdentityLocator>()
            .map_err(|_| EngineError::InvalidInput(format!("unresolvable sender {}", tx.from)))?;
        if tx.inputs.is_null() {
            return Err(EngineError::InvalidInput("inputs are required".into()));
        }

        if let Some(key) = &tx.idempotency_key {
            if let Some(existing) = self.inner.storage.bind_idempotency_key(key, &tx.id)? {
                info!(key, id = %existing, "idempotency key already bound");
                return Ok(existing);
            }
        }

        let id = tx.id;
        let contract = tx.to;
        self.inner.storage.upsert_private_tx(&tx)?;
        let handle = self.sequencer_for(contract, &tx.domain)?;
        handle
            .submit(tx)
            .await
            .map_err(|err| EngineError::Routing(format!("sequencer rejected {id}: {err}")))?;
        Ok(id)
    }

    /// Deploys route through a per-domain flow with no contract address
    /// yet: init, verifier resolution, prepare, then a single public
    /// transaction against the domain's factory.
    pub async fn handle_deploy_tx(&self, deploy: PrivateContractDeploy) -> EngineResult<Uuid> {
        if deploy.domain.is_empty() {
            return Err(EngineError::InvalidInput("domain is required".into()));
        }
        let domain = self.inner.registry.get(&deploy.domain)?;
        deploy.from.parse::<IdentityLocator>().map_err(|_| {
            EngineError::InvalidInput(format!("unresolvable sender {}", deploy.from))
        })?;
        if let Some(key) = &deploy.idempotency_key {
            if let Some(existing) = self.inner.storage.bind_idempotency_key(key, &deploy.id)? {
                return Ok(existing);
            }
        }

        let id = deploy.id;
        let mut record = PrivateTransaction::new(
            deploy.domain.clone(),
            deploy_placeholder_address(&deploy.domain),
            deploy.from.clone(),
            deploy.inputs.clone(),
        );
        record.id = id;
        record.status = TxStatus::New;
        self.inner.storage.upsert_private_tx(&record)?;

        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(err) = run_deploy(inner.clone(), domain, deploy, record.clone()).await {
                warn!(deploy = %id, %err, "deploy failed");
                record.status = TxStatus::Reverted {
                    reason: err.to_string(),
                };
                let _ = inner.storage.upsert_private_tx(&record);
                let _ = inner
                    .storage
                    .put_receipt(&TransactionReceipt::reverted(id, err.to_string(), None));
            }
        });
        Ok(id)
    }

    fn sequencer_for(&self, contract: Address, domain_name: &str) -> EngineResult<SequencerHandle> {
        if let Some(handle) = self.inner.sequencers.read().get(&contract) {
            return Ok(handle.clone());
        }
        let domain = self.inner.registry.get(domain_name)?;
        let mut sequencers = self.inner.sequencers.write();
        if let Some(handle) = sequencers.get(&contract) {
            return Ok(handle.clone());
        }
        info!(%contract, domain = domain_name, "creating sequencer");
        let handle = Sequencer::spawn(
            contract,
            SequencerDeps {
                node_name: self.inner.node_name.clone(),
                domain,
                storage: self.inner.storage.clone(),
                resolver: self.inner.resolver.clone(),
                keymgr: self.inner.keymgr.clone(),
                transport: self.inner.transport.clone(),
                pubtm: self.inner.pubtm.clone(),
                config: self.inner.sequencer_config.clone(),
                transport_config: self.inner.transport_config.clone(),
                retry: self.inner.retry.clone(),
            },
        );
        sequencers.insert(contract, handle.clone());
        metrics::gauge!(METRIC_SEQUENCERS_ACTIVE, sequencers.len() as f64);
        Ok(handle)
    }

    /// Routes one inbound transport frame to the owning sequencer.
    /// Requests create the sequencer if needed; responses for unknown
    /// sequencers are dropped (the requester re-sends).
    pub async fn handle_inbound(&self, frame: Frame) -> EngineResult<()> {
        let from_node = frame.node.clone();
        let handle = match &frame.payload {
            TransportMessage::EndorsementRequest {
                domain, contract, ..
            } => Some(self.sequencer_for(*contract, domain)?),
            TransportMessage::DelegationRequest { transaction, .. } => {
                Some(self.sequencer_for(transaction.to, &transaction.domain)?)
            }
            TransportMessage::EndorsementResponse { contract, .. }
            | TransportMessage::DelegationAck { contract, .. }
            | TransportMessage::DelegationResult { contract, .. } => {
                let handle = self.inner.sequencers.read().get(contract).cloned();
                if handle.is_none() {
                    warn!(%contract, "dropping response for unknown sequencer");
                }
                handle
            }
        };
        match handle {
            Some(handle) => handle.inbound(from_node, frame.payload).await,
            None => Ok(()),
        }
    }

    /// Finalizes receipts for a completed public transaction and informs
    /// the sequencers that own the bound private transactions.
    pub async fn handle_pubtm_event(&self, event: PubTmEvent) -> EngineResult<()> {
        let PubTmEvent::Completed {
            bindings,
            completion,
            ..
        } = event
        else {
            return Ok(());
        };
        for binding in bindings {
            let id = binding.transaction;
            let receipt = if completion.success {
                TransactionReceipt::success(id, completion.tx_hash, completion.block_number)
            } else {
                TransactionReceipt::reverted(
                    id,
                    "transaction reverted on chain",
                    Some(completion.revert_data.clone()),
                )
            };
            self.inner.storage.put_receipt(&receipt)?;
            let note = if completion.success {
                format!(
                    "confirmed in block {} ({})",
                    completion.block_number, completion.tx_hash
                )
            } else {
                "reverted on chain".to_string()
            };
            if let Err(err) = self.inner.storage.add_activity_record(&id, note) {
                warn!(tx = %id, %err, "activity record write failed");
            }

            if binding.tx_type != TransactionType::Private {
                continue;
            }
            let Some(tx) = self.inner.storage.read_private_tx(&id)? else {
                continue;
            };
            let handle = self.inner.sequencers.read().get(&tx.to).cloned();
            if let Some(handle) = handle {
                handle.public_tx_completed(id, completion.success).await?;
            }
        }
        Ok(())
    }

    /// In-flight status as the owning sequencer sees it, falling back to
    /// the persisted record.
    pub async fn transaction_status(&self, id: Uuid) -> EngineResult<Option<TxStatus>> {
        let tx = self.inner.storage.read_private_tx(&id)?;
        let Some(tx) = tx else {
            return Ok(None);
        };
        let handle = self.inner.sequencers.read().get(&tx.to).cloned();
        match handle {
            Some(handle) => handle.status(id).await,
            None => Ok(Some(tx.status)),
        }
    }

    pub async fn resolve_verifier(
        &self,
        lookup: &str,
        algorithm: &str,
        verifier_type: &str,
    ) -> EngineResult<String> {
        self.inner
            .resolver
            .resolve(lookup, algorithm, verifier_type)
            .await
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    pub fn node_name(&self) -> &str {
        &self.inner.node_name
    }
}

/// Deterministic placeholder address for a deploy record before the real
/// contract address exists.
fn deploy_placeholder_address(domain: &str) -> Address {
    let digest = alloy_primitives::keccak256(domain.as_bytes());
    Address::from_slice(&digest[12..])
}

async fn run_deploy(
    inner: Arc<DispatcherInner>,
    domain: Arc<dyn crate::domain::Domain>,
    deploy: PrivateContractDeploy,
    mut record: PrivateTransaction,
) -> EngineResult<()> {
    let required = domain.init_deploy(&deploy).await?;
    record.status = TxStatus::AwaitingVerifiers;
    inner.storage.upsert_private_tx(&record)?;

    let mut verifiers = Vec::with_capacity(required.len());
    for requirement in &required {
        verifiers.push(
            inner
                .resolver
                .resolve_with_retry(requirement, &inner.retry)
                .await?,
        );
    }

    record.status = TxStatus::Preparing;
    inner.storage.upsert_private_tx(&record)?;
    let prepared = domain.prepare_deploy(&deploy, &verifiers).await?;

    record.status = TxStatus::Dispatching;
    record.prepared = Some(prepared.transaction.clone());
    record.signer = Some(prepared.signer.clone());
    inner.storage.upsert_private_tx(&record)?;

    inner
        .pubtm
        .single_transaction_submit(PublicTxSubmission {
            bindings: vec![TxBinding {
                transaction: deploy.id,
                tx_type: TransactionType::Private,
            }],
            input: PublicTxInput {
                from: prepared.signer,
                to: Some(prepared.transaction.to),
                data: prepared.transaction.data.clone(),
                gas: prepared.transaction.gas,
                value: None,
                gas_pricing: None,
            },
        })
        .await?;

    record.status = TxStatus::Dispatched;
    inner.storage.upsert_private_tx(&record)?;
    inner.storage.add_activity_record(
        &deploy.id,
        format!("deploy dispatched for {}", prepared.contract_address),
    )?;
    info!(deploy = %deploy.id, contract = %prepared.contract_address, "deploy dispatched");
    Ok(())
}
