pub mod gas;
pub mod nonce;
pub mod orchestrator;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rocksdb::WriteBatch;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{GasPriceConfig, OrchestratorConfig, TransactionEngineConfig};
use crate::errors::{EngineError, EngineResult};
use crate::ethclient::{EthClient, GasEstimateError, IndexedTransaction};
use crate::identity::KeyManager;
use crate::metrics::{METRIC_ORCHESTRATORS_ACTIVE, METRIC_PUBLIC_TX_CONFIRMED, METRIC_PUBLIC_TX_REJECTED};
use crate::storage::Storage;
use crate::types::private::unix_seconds;
use crate::types::{
    Address, Bytes, EthTransaction, PersistedPubTx, PublicCompletion, PublicTx,
    PublicTxSubmission, TxBinding, B256,
};

use gas::GasPriceClient;
use nonce::{AddressLease, NonceCache};
use orchestrator::{Orchestrator, OrchestratorAction, OrchestratorHandle};

/// Signing algorithm requested when resolving submission keys.
pub const ALGORITHM_ECDSA_SECP256K1: &str = "ecdsa:secp256k1";
pub const VERIFIER_ETH_ADDRESS: &str = "eth_address";

/// Events the manager surfaces to the private transaction layer.
#[derive(Clone, Debug)]
pub enum PubTmEvent {
    Completed {
        from: Address,
        nonce: u64,
        bindings: Vec<TxBinding>,
        completion: PublicCompletion,
    },
    OrchestratorRetired {
        from: Address,
    },
}

/// A transaction the batch accepted: key resolved, gas estimated, nonce
/// reserved. The nonce value is readable only after `submit` succeeds.
pub struct AcceptedTx {
    pub bindings: Vec<TxBinding>,
    pub from: Address,
    pub key_handle: String,
    pub to: Option<Address>,
    pub data: Bytes,
    pub gas: u64,
    pub value: Option<crate::types::U256>,
    pub nonce: Option<u64>,
}

/// A transaction rejected during prepare (gas estimation revert). No nonce
/// was allocated; the revert data is preserved for the caller.
pub struct RejectedTx {
    pub bindings: Vec<TxBinding>,
    pub from: String,
    pub reason: String,
    pub revert_data: Bytes,
}

/// Batch produced by [`PublicTxManager::prepare_submission_batch`].
///
/// The caller owns the database transaction: `submit` stages rows into the
/// caller's write batch, and `completed` must be called on every path with
/// whether that batch committed. Dropping the batch without calling
/// `completed` rolls the nonce leases back.
pub struct SubmissionBatch {
    manager: Arc<PubTmInner>,
    accepted: Vec<AcceptedTx>,
    rejected: Vec<RejectedTx>,
    leases: HashMap<Address, AddressLease>,
    submitted: bool,
}

impl SubmissionBatch {
    /// Finalizes nonces and stages one row per accepted transaction into
    /// the caller's batch. The single write path for public tx rows.
    pub fn submit(&mut self, batch: &mut WriteBatch) -> EngineResult<()> {
        if self.submitted {
            return Err(EngineError::Fatal("batch submitted twice".into()));
        }
        for accepted in self.accepted.iter_mut() {
            let lease = self
                .leases
                .get_mut(&accepted.from)
                .ok_or_else(|| EngineError::Fatal("missing nonce lease".into()))?;
            let nonce = lease.assign_next_nonce();
            accepted.nonce = Some(nonce);
            let row = PersistedPubTx {
                from: accepted.from,
                nonce,
                key_handle: accepted.key_handle.clone(),
                to: accepted.to,
                data: accepted.data.clone(),
                gas: accepted.gas,
                value: accepted.value,
                fixed_gas_pricing: None,
                bindings: accepted.bindings.clone(),
                created_at: unix_seconds(),
            };
            debug!(from = %row.from, nonce, "staged public transaction");
            self.manager.storage.stage_public_tx(batch, &row)?;
        }
        self.submitted = true;
        Ok(())
    }

    pub fn accepted(&self) -> &[AcceptedTx] {
        &self.accepted
    }

    pub fn rejected(&self) -> &[RejectedTx] {
        &self.rejected
    }

    /// Reports the commit outcome of the caller's database transaction.
    /// `true` makes the assigned nonces durable and wakes orchestrators;
    /// `false` rolls the leases back so the nonces are reused.
    pub fn completed(mut self, committed: bool) {
        let leases = std::mem::take(&mut self.leases);
        for (_, lease) in leases {
            if committed && self.submitted {
                lease.commit();
            } else {
                lease.rollback();
            }
        }
        if committed && self.submitted && !self.accepted.is_empty() {
            self.manager.mark_orchestrators_stale();
        }
    }
}

struct PubTmInner {
    storage: Storage,
    eth: Arc<dyn EthClient>,
    keymgr: Arc<dyn KeyManager>,
    nonce_cache: NonceCache,
    gas: Arc<GasPriceClient>,
    orchestrators: Mutex<HashMap<Address, OrchestratorHandle>>,
    stale: Notify,
    events: mpsc::UnboundedSender<PubTmEvent>,
    orchestrator_config: OrchestratorConfig,
    engine_config: TransactionEngineConfig,
}

impl PubTmInner {
    fn mark_orchestrators_stale(&self) {
        self.stale.notify_one();
        for handle in self.orchestrators.lock().values() {
            let _ = handle.actions.send(OrchestratorAction::Stale);
        }
    }
}

/// The public transaction manager: nonce allocation, per-signer
/// orchestrators, confirmation matching, and the read model over the
/// public tables.
#[derive(Clone)]
pub struct PublicTxManager {
    inner: Arc<PubTmInner>,
}

impl PublicTxManager {
    pub fn new(
        storage: Storage,
        eth: Arc<dyn EthClient>,
        keymgr: Arc<dyn KeyManager>,
        orchestrator_config: OrchestratorConfig,
        engine_config: TransactionEngineConfig,
        gas_config: GasPriceConfig,
        events: mpsc::UnboundedSender<PubTmEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(PubTmInner {
                storage,
                eth,
                keymgr,
                nonce_cache: NonceCache::new(),
                gas: Arc::new(GasPriceClient::new(gas_config)),
                orchestrators: Mutex::new(HashMap::new()),
                stale: Notify::new(),
                events,
                orchestrator_config,
                engine_config,
            }),
        }
    }

    /// Starts the engine loop that keeps orchestrators running for every
    /// signer with pending work.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.engine_loop().await })
    }

    async fn engine_loop(self) {
        let mut ticker = tokio::time::interval(self.inner.engine_config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.inner.stale.notified() => {}
            }
            if let Err(err) = self.ensure_orchestrators() {
                warn!(%err, "orchestrator sweep failed");
            }
        }
    }

    fn ensure_orchestrators(&self) -> EngineResult<()> {
        let signers = self.inner.storage.signers_with_pending()?;
        let mut orchestrators = self.inner.orchestrators.lock();
        orchestrators.retain(|from, handle| {
            if handle.task.is_finished() {
                info!(%from, "orchestrator retired");
                false
            } else {
                true
            }
        });
        for from in signers {
            if orchestrators.contains_key(&from) {
                continue;
            }
            if orchestrators.len() >= self.inner.orchestrator_config.max_in_flight_orchestrators {
                debug!(%from, "orchestrator pool full; signer queued");
                break;
            }
            info!(%from, "orchestrator created");
            let handle = Orchestrator::spawn(
                from,
                self.inner.storage.clone(),
                self.inner.eth.clone(),
                self.inner.gas.clone(),
                self.inner.orchestrator_config.clone(),
                self.inner.engine_config.clone(),
                self.inner.events.clone(),
            );
            orchestrators.insert(from, handle);
        }
        metrics::gauge!(METRIC_ORCHESTRATORS_ACTIVE, orchestrators.len() as f64);
        Ok(())
    }

    /// Resolves keys, estimates gas, and reserves nonce leases for a set of
    /// submissions. Gas-estimation reverts classify the transaction as
    /// rejected, not errored: no nonce is consumed and the revert data is
    /// surfaced through [`SubmissionBatch::rejected`].
    pub async fn prepare_submission_batch(
        &self,
        transactions: Vec<PublicTxSubmission>,
    ) -> EngineResult<SubmissionBatch> {
        let mut batch = SubmissionBatch {
            manager: self.inner.clone(),
            accepted: Vec::with_capacity(transactions.len()),
            rejected: Vec::new(),
            leases: HashMap::new(),
            submitted: false,
        };

        for submission in transactions {
            let key = self
                .inner
                .keymgr
                .resolve_key(
                    &submission.input.from,
                    ALGORITHM_ECDSA_SECP256K1,
                    VERIFIER_ETH_ADDRESS,
                )
                .await?;
            let from: Address = key.verifier.parse().map_err(|_| {
                EngineError::Fatal(format!(
                    "key manager returned non-address verifier {}",
                    key.verifier
                ))
            })?;

            let gas = match submission.input.gas {
                Some(gas) if gas > 0 => gas,
                _ => {
                    let estimate_tx = EthTransaction {
                        from,
                        nonce: None,
                        to: submission.input.to,
                        gas: None,
                        value: submission.input.value,
                        data: submission.input.data.clone(),
                        gas_pricing: submission.input.gas_pricing.clone().unwrap_or_default(),
                    };
                    match self.inner.eth.estimate_gas(&estimate_tx).await {
                        Ok(gas) => gas,
                        Err(GasEstimateError::Reverted { data }) => {
                            metrics::counter!(METRIC_PUBLIC_TX_REJECTED, 1);
                            batch.rejected.push(RejectedTx {
                                bindings: submission.bindings,
                                from: submission.input.from,
                                reason: "gas estimation reverted".into(),
                                revert_data: data,
                            });
                            continue;
                        }
                        Err(GasEstimateError::Failed(err)) => return Err(err),
                    }
                }
            };

            batch.accepted.push(AcceptedTx {
                bindings: submission.bindings,
                from,
                key_handle: key.key_handle,
                to: submission.input.to,
                data: submission.input.data,
                gas,
                value: submission.input.value,
                nonce: None,
            });
        }

        // leases are taken in address order so two batches touching the
        // same signers cannot deadlock on each other
        let mut signers: Vec<Address> = batch.accepted.iter().map(|tx| tx.from).collect();
        signers.sort_unstable();
        signers.dedup();
        for from in signers {
            let lease = self
                .inner
                .nonce_cache
                .lease(from, self.inner.eth.as_ref())
                .await?;
            batch.leases.insert(from, lease);
        }
        Ok(batch)
    }

    /// One-and-done submission of a single transaction, wrapping the batch
    /// contract. A rejection surfaces as `RejectedPreChain`.
    pub async fn single_transaction_submit(
        &self,
        submission: PublicTxSubmission,
    ) -> EngineResult<(Address, u64)> {
        let mut batch = self.prepare_submission_batch(vec![submission]).await?;
        if let Some(rejected) = batch.rejected().first() {
            let data = rejected.revert_data.to_vec();
            batch.completed(false);
            return Err(EngineError::RejectedPreChain { data });
        }
        let mut write_batch = WriteBatch::default();
        if let Err(err) = batch.submit(&mut write_batch) {
            batch.completed(false);
            return Err(err);
        }
        if let Err(err) = self.inner.storage.write(write_batch) {
            batch.completed(false);
            return Err(err);
        }
        let result = batch
            .accepted()
            .first()
            .and_then(|tx| tx.nonce.map(|nonce| (tx.from, nonce)))
            .ok_or_else(|| EngineError::Fatal("accepted tx without nonce".into()));
        batch.completed(true);
        result
    }

    /// Joins block-indexer records against our submissions and writes
    /// completion rows. Only transactions this node submitted match; the
    /// rest of the chain's traffic is ignored. Redelivery is a no-op.
    pub fn match_confirmed_transactions(
        &self,
        indexed: &[IndexedTransaction],
    ) -> EngineResult<Vec<(PersistedPubTx, PublicCompletion)>> {
        let mut matches = Vec::new();
        for itx in indexed {
            let Some(row) = self.inner.storage.public_tx_row(&itx.from, itx.nonce)? else {
                continue;
            };
            let known_hash = self
                .inner
                .storage
                .submissions(&itx.from, itx.nonce)?
                .iter()
                .any(|sub| sub.tx_hash == itx.hash);
            if !known_hash {
                // a transaction for our signer and nonce that we did not
                // submit means the signer is in use elsewhere; complete the
                // row anyway, flagged by the foreign hash
                warn!(from = %itx.from, nonce = itx.nonce, hash = %itx.hash, "confirmed with unknown hash");
            }
            let completion = PublicCompletion {
                tx_hash: itx.hash,
                success: itx.success,
                revert_data: itx.revert_data.clone(),
                block_number: itx.block_number,
                created_at: unix_seconds(),
            };
            if self
                .inner
                .storage
                .insert_completion_if_absent(&itx.from, itx.nonce, &completion)?
            {
                metrics::counter!(METRIC_PUBLIC_TX_CONFIRMED, 1);
                matches.push((row, completion));
            }
        }
        Ok(matches)
    }

    /// Full confirmation path: match, emit completion events for receipt
    /// finalization, and nudge the owning orchestrators. Never blocks the
    /// indexer's delivery path.
    pub fn handle_confirmed_transactions(
        &self,
        indexed: Vec<IndexedTransaction>,
    ) -> EngineResult<()> {
        let matches = self.match_confirmed_transactions(&indexed)?;
        for (row, completion) in matches {
            let _ = self.inner.events.send(PubTmEvent::Completed {
                from: row.from,
                nonce: row.nonce,
                bindings: row.bindings.clone(),
                completion,
            });
        }
        let orchestrators = self.inner.orchestrators.lock();
        for itx in indexed {
            if let Some(handle) = orchestrators.get(&itx.from) {
                let _ = handle.confirmations.send(itx);
            }
        }
        Ok(())
    }

    /// Passes a suspend/resume control message to the signer's
    /// orchestrator. With no live orchestrator there is nothing in flight
    /// to gate, so the action is a no-op.
    pub fn dispatch_action(
        &self,
        from: Address,
        nonce: u64,
        suspend: bool,
    ) -> EngineResult<()> {
        if self.inner.storage.public_tx_row(&from, nonce)?.is_none() {
            return Err(EngineError::NotFound(format!(
                "public transaction {from}:{nonce}"
            )));
        }
        let orchestrators = self.inner.orchestrators.lock();
        if let Some(handle) = orchestrators.get(&from) {
            let action = if suspend {
                OrchestratorAction::Suspend(nonce)
            } else {
                OrchestratorAction::Resume(nonce)
            };
            let _ = handle.actions.send(action);
        }
        Ok(())
    }

    // ---- read model ----

    pub fn query_public_txs(&self, limit: usize, pending_only: bool) -> EngineResult<Vec<PublicTx>> {
        self.inner.storage.query_public_txs(limit, pending_only)
    }

    pub fn get_by_nonce(&self, from: &Address, nonce: u64) -> EngineResult<Option<PublicTx>> {
        self.inner.storage.read_public_tx(from, nonce)
    }

    pub fn get_by_hash(&self, hash: &B256) -> EngineResult<Option<PublicTx>> {
        self.inner.storage.public_tx_by_hash(hash)
    }

    /// Public transactions bound to the given parent transactions.
    pub fn query_for_transactions(
        &self,
        bound: &[Uuid],
    ) -> EngineResult<HashMap<Uuid, Vec<PublicTx>>> {
        let all = self.inner.storage.query_public_txs(usize::MAX, false)?;
        let mut out: HashMap<Uuid, Vec<PublicTx>> = HashMap::new();
        for tx in all {
            for binding in &tx.tx.bindings {
                if bound.contains(&binding.transaction) {
                    out.entry(binding.transaction).or_default().push(tx.clone());
                }
            }
        }
        Ok(out)
    }
}
