use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace};

use crate::ethclient::EthClient;
use crate::errors::EngineResult;
use crate::metrics::METRIC_NONCE_ROLLBACKS;
use crate::types::Address;

#[derive(Debug)]
pub struct NonceState {
    /// Next nonce as durably committed. `None` until lazily initialized
    /// from the chain.
    next: Option<u64>,
}

/// Per-signer nonce allocator implementing the two-phase
/// intent → assign → commit|rollback contract.
///
/// A lease holds the address's FIFO-fair async lock from first assignment
/// until the owning batch reports its commit outcome, so concurrent batches
/// for one signer serialize in request order and a rollback can never open
/// a gap: the speculative counter is simply discarded and the next batch
/// re-reads the committed value.
#[derive(Clone, Default)]
pub struct NonceCache {
    entries: Arc<Mutex<HashMap<Address, Arc<AsyncMutex<NonceState>>>>>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the assignment lease for `from`, initializing the cache
    /// from `eth_getTransactionCount` on first use.
    pub async fn lease(&self, from: Address, eth: &dyn EthClient) -> EngineResult<AddressLease> {
        let entry = {
            let mut entries = self.entries.lock();
            entries
                .entry(from)
                .or_insert_with(|| Arc::new(AsyncMutex::new(NonceState { next: None })))
                .clone()
        };
        let mut guard = entry.lock_owned().await;
        if guard.next.is_none() {
            let chain_next = eth.get_transaction_count(&from).await?;
            trace!(%from, chain_next, "initialized nonce cache from chain");
            guard.next = Some(chain_next);
        }
        let speculative = guard.next.unwrap_or_default();
        Ok(AddressLease {
            from,
            guard,
            speculative,
        })
    }

    /// Committed next nonce, if the cache has been initialized. Test and
    /// introspection hook; assignment always goes through a lease.
    pub fn peek_next(&self, from: &Address) -> Option<u64> {
        let entries = self.entries.lock();
        let entry = entries.get(from)?;
        entry.try_lock().ok().and_then(|state| state.next)
    }
}

/// Exclusive assignment window for one signing address.
pub struct AddressLease {
    from: Address,
    guard: OwnedMutexGuard<NonceState>,
    speculative: u64,
}

impl AddressLease {
    /// Advances the speculative counter and returns the assigned nonce.
    pub fn assign_next_nonce(&mut self) -> u64 {
        let nonce = self.speculative;
        self.speculative += 1;
        nonce
    }

    /// Makes the speculative assignments durable. Called only after the
    /// database transaction carrying the rows has committed.
    pub fn commit(mut self) {
        debug!(from = %self.from, next = self.speculative, "nonce lease committed");
        self.guard.next = Some(self.speculative);
    }

    /// Discards the speculative assignments; the same nonces will be
    /// handed to the next batch.
    pub fn rollback(self) {
        metrics::counter!(METRIC_NONCE_ROLLBACKS, 1);
        debug!(
            from = %self.from,
            next = self.guard.next.unwrap_or_default(),
            "nonce lease rolled back"
        );
    }
}
