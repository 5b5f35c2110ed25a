use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::{OrchestratorConfig, TransactionEngineConfig};
use crate::errors::EngineResult;
use crate::ethclient::{EthClient, IndexedTransaction};
use crate::metrics::{METRIC_PUBLIC_TX_RESUBMITTED, METRIC_PUBLIC_TX_SUBMITTED};
use crate::pubtm::gas::GasPriceClient;
use crate::pubtm::PubTmEvent;
use crate::storage::Storage;
use crate::types::private::unix_seconds;
use crate::types::{
    Address, Bytes, EthTransaction, GasPricing, PersistedPubTx, PublicCompletion,
    SubmissionRecord, B256,
};

#[derive(Debug)]
pub enum OrchestratorAction {
    Suspend(u64),
    Resume(u64),
    /// New rows were committed for this signer; reload from storage.
    Stale,
}

pub(crate) struct OrchestratorHandle {
    pub actions: mpsc::UnboundedSender<OrchestratorAction>,
    pub confirmations: mpsc::UnboundedSender<IndexedTransaction>,
    pub task: tokio::task::JoinHandle<()>,
}

struct InFlight {
    row: PersistedPubTx,
    pricing: GasPricing,
    first_attempt: Instant,
    last_submit: Option<Instant>,
    submitted_hash: Option<B256>,
}

/// Per-signer submission loop. Strictly nonce-ordered: the sweep stops at
/// the first transaction that cannot be sent (suspended or erroring), so a
/// later nonce never reaches the chain before an earlier one.
pub(crate) struct Orchestrator {
    from: Address,
    storage: Storage,
    eth: Arc<dyn EthClient>,
    gas: Arc<GasPriceClient>,
    config: OrchestratorConfig,
    engine: TransactionEngineConfig,
    actions: mpsc::UnboundedReceiver<OrchestratorAction>,
    confirmations: mpsc::UnboundedReceiver<IndexedTransaction>,
    events: mpsc::UnboundedSender<PubTmEvent>,
    suspended: HashSet<u64>,
    inflight: Vec<InFlight>,
    stale: bool,
    idle_since: Option<Instant>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        from: Address,
        storage: Storage,
        eth: Arc<dyn EthClient>,
        gas: Arc<GasPriceClient>,
        config: OrchestratorConfig,
        engine: TransactionEngineConfig,
        events: mpsc::UnboundedSender<PubTmEvent>,
    ) -> OrchestratorHandle {
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator {
            from,
            storage,
            eth,
            gas,
            config,
            engine,
            actions: action_rx,
            confirmations: confirm_rx,
            events,
            suspended: HashSet::new(),
            inflight: Vec::new(),
            stale: true,
            idle_since: None,
        };
        let task = tokio::spawn(orchestrator.run());
        OrchestratorHandle {
            actions: action_tx,
            confirmations: confirm_tx,
            task,
        }
    }

    async fn run(mut self) {
        info!(from = %self.from, "orchestrator started");
        let mut ticker = time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                action = self.actions.recv() => {
                    match action {
                        Some(action) => self.handle_action(action),
                        None => break,
                    }
                }
                confirmation = self.confirmations.recv() => {
                    match confirmation {
                        Some(itx) => self.handle_confirmation(itx),
                        None => break,
                    }
                }
            }

            if self.stale {
                if let Err(err) = self.reload() {
                    warn!(from = %self.from, %err, "orchestrator reload failed");
                }
            }
            if let Err(err) = self.sweep().await {
                warn!(from = %self.from, %err, "submission sweep failed");
            }

            if self.inflight.is_empty() {
                let idle_since = *self.idle_since.get_or_insert_with(Instant::now);
                if idle_since.elapsed() >= self.engine.max_idle_time() {
                    break;
                }
            } else {
                self.idle_since = None;
            }
        }
        info!(from = %self.from, "orchestrator retired");
        let _ = self.events.send(PubTmEvent::OrchestratorRetired { from: self.from });
    }

    fn handle_action(&mut self, action: OrchestratorAction) {
        match action {
            OrchestratorAction::Suspend(nonce) => {
                debug!(from = %self.from, nonce, "suspending public transaction");
                self.suspended.insert(nonce);
            }
            OrchestratorAction::Resume(nonce) => {
                debug!(from = %self.from, nonce, "resuming public transaction");
                self.suspended.remove(&nonce);
            }
            OrchestratorAction::Stale => self.stale = true,
        }
    }

    fn handle_confirmation(&mut self, itx: IndexedTransaction) {
        self.inflight.retain(|entry| entry.row.nonce > itx.nonce);
        self.suspended.retain(|nonce| *nonce > itx.nonce);
    }

    fn reload(&mut self) -> EngineResult<()> {
        self.stale = false;
        let pending = self.storage.pending_public_txs_for(&self.from)?;
        for row in pending {
            if self.inflight.len() >= self.config.max_in_flight_per_signer {
                // remaining rows are picked up as the window drains; we
                // stay stale so the next pass reloads
                self.stale = true;
                break;
            }
            if self.inflight.iter().any(|e| e.row.nonce == row.nonce) {
                continue;
            }
            let pricing = row.fixed_gas_pricing.clone().unwrap_or_default();
            self.inflight.push(InFlight {
                row,
                pricing,
                first_attempt: Instant::now(),
                last_submit: None,
                submitted_hash: None,
            });
        }
        self.inflight.sort_by_key(|e| e.row.nonce);
        Ok(())
    }

    async fn sweep(&mut self) -> EngineResult<()> {
        let resubmit_after = self.config.resubmit_interval();
        let overload_budget = self.engine.max_overload_process_time();
        let mut failed: Vec<u64> = Vec::new();

        for entry in self.inflight.iter_mut() {
            if self.suspended.contains(&entry.row.nonce) {
                // a suspended nonce gates everything behind it
                break;
            }

            let due = match entry.last_submit {
                None => true,
                Some(at) => at.elapsed() >= resubmit_after,
            };
            if !due {
                continue;
            }

            if entry.pricing.is_empty() {
                entry.pricing = self.gas.current_pricing(self.eth.as_ref()).await?;
            } else if entry.submitted_hash.is_some() {
                if let Some(bumped) = self.gas.bump(&entry.pricing) {
                    entry.pricing = bumped;
                }
            }

            let tx = EthTransaction {
                from: entry.row.from,
                nonce: Some(entry.row.nonce),
                to: entry.row.to,
                gas: Some(entry.row.gas),
                value: entry.row.value,
                data: entry.row.data.clone(),
                gas_pricing: entry.pricing.clone(),
            };
            match self.eth.send_transaction(&entry.row.key_handle, &tx).await {
                Ok(hash) => {
                    let resubmission = entry.submitted_hash.is_some();
                    entry.submitted_hash = Some(hash);
                    entry.last_submit = Some(Instant::now());
                    self.storage.add_submission(
                        &self.from,
                        entry.row.nonce,
                        &SubmissionRecord {
                            tx_hash: hash,
                            gas_pricing: entry.pricing.clone(),
                            created_at: unix_seconds(),
                        },
                    )?;
                    if resubmission {
                        metrics::counter!(METRIC_PUBLIC_TX_RESUBMITTED, 1);
                    } else {
                        metrics::counter!(METRIC_PUBLIC_TX_SUBMITTED, 1);
                    }
                    debug!(from = %self.from, nonce = entry.row.nonce, %hash, "submitted");
                }
                Err(err) if err.is_transient() => {
                    warn!(from = %self.from, nonce = entry.row.nonce, %err, "submission failed; will retry");
                    if entry.first_attempt.elapsed() >= overload_budget {
                        failed.push(entry.row.nonce);
                    }
                    // an unsubmitted nonce gates everything behind it
                    if entry.submitted_hash.is_none() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(from = %self.from, nonce = entry.row.nonce, %err, "submission failed permanently");
                    failed.push(entry.row.nonce);
                    if entry.submitted_hash.is_none() {
                        break;
                    }
                }
            }
        }

        for nonce in failed {
            self.fail_transaction(nonce)?;
        }
        Ok(())
    }

    /// Writes a failure completion so the row stops being pending, and
    /// surfaces the outcome so bound transactions get a revert receipt.
    fn fail_transaction(&mut self, nonce: u64) -> EngineResult<()> {
        let Some(position) = self.inflight.iter().position(|e| e.row.nonce == nonce) else {
            return Ok(());
        };
        let entry = self.inflight.remove(position);
        let completion = PublicCompletion {
            tx_hash: entry.submitted_hash.unwrap_or(B256::ZERO),
            success: false,
            revert_data: Bytes::new(),
            block_number: 0,
            created_at: unix_seconds(),
        };
        if self
            .storage
            .insert_completion_if_absent(&self.from, nonce, &completion)?
        {
            let _ = self.events.send(PubTmEvent::Completed {
                from: self.from,
                nonce,
                bindings: entry.row.bindings.clone(),
                completion,
            });
        }
        Ok(())
    }
}
