use std::collections::{HashMap, HashSet};

use rocksdb::WriteBatch;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::storage::{new_state, Storage, StoredState};
use crate::types::{Address, FullState, B256};

/// Scoped view over the state store for one contract. Assembly reserves
/// input states and stages outputs here; nothing touches the store until
/// the owning sequencer flushes a dispatched transaction. Staged outputs
/// are visible to later assemblies so dependent transactions can chain
/// before their ancestor confirms.
pub struct DomainContext {
    contract: Address,
    storage: Storage,
    reserved: HashMap<B256, Uuid>,
    staged_outputs: HashMap<Uuid, Vec<FullState>>,
    staged_spends: HashMap<Uuid, Vec<B256>>,
}

impl DomainContext {
    pub fn new(contract: Address, storage: Storage) -> Self {
        Self {
            contract,
            storage,
            reserved: HashMap::new(),
            staged_outputs: HashMap::new(),
            staged_spends: HashMap::new(),
        }
    }

    pub fn contract(&self) -> &Address {
        &self.contract
    }

    /// The unspent set as assembly must see it: confirmed states minus
    /// sibling reservations, plus staged outputs of siblings already past
    /// assembly.
    pub fn available_states(&self) -> EngineResult<Vec<FullState>> {
        let mut out: Vec<FullState> = Vec::new();
        let mut seen: HashSet<B256> = HashSet::new();
        for state in self.storage.unspent_states(&self.contract)? {
            if self.reserved.contains_key(&state.id) {
                continue;
            }
            seen.insert(state.id);
            out.push(FullState {
                id: state.id,
                schema: state.schema,
                data: state.data,
            });
        }
        for staged in self.staged_outputs.values() {
            for state in staged {
                if self.reserved.contains_key(&state.id) || !seen.insert(state.id) {
                    continue;
                }
                out.push(state.clone());
            }
        }
        Ok(out)
    }

    /// Records the outcome of one assembly: inputs become reserved, outputs
    /// become visible to later assemblies.
    pub fn reserve(
        &mut self,
        tx_id: Uuid,
        inputs: &[FullState],
        outputs: &[FullState],
    ) -> EngineResult<()> {
        for input in inputs {
            if let Some(holder) = self.reserved.get(&input.id) {
                if *holder != tx_id {
                    return Err(EngineError::Fatal(format!(
                        "state {} already reserved by {holder}",
                        input.id
                    )));
                }
            }
        }
        for input in inputs {
            self.reserved.insert(input.id, tx_id);
        }
        self.staged_spends
            .insert(tx_id, inputs.iter().map(|s| s.id).collect());
        self.staged_outputs.insert(tx_id, outputs.to_vec());
        Ok(())
    }

    /// Drops a transaction's reservations, e.g. on revert or park. Its
    /// inputs become available to the next assembly.
    pub fn release(&mut self, tx_id: &Uuid) {
        self.reserved.retain(|_, holder| holder != tx_id);
        self.staged_outputs.remove(tx_id);
        self.staged_spends.remove(tx_id);
    }

    /// Stages the dispatched transaction's state writes into the caller's
    /// batch: outputs inserted, inputs marked spent. The reservation is
    /// consumed; only the sequencer that produced the assembly calls this.
    pub fn flush_transaction(
        &mut self,
        batch: &mut WriteBatch,
        tx_id: &Uuid,
        schema_default: B256,
    ) -> EngineResult<()> {
        let outputs = self.staged_outputs.remove(tx_id).unwrap_or_default();
        let spends = self.staged_spends.remove(tx_id).unwrap_or_default();

        for output in &outputs {
            let schema = if output.schema == B256::ZERO {
                schema_default
            } else {
                output.schema
            };
            let row = new_state(self.contract, output.id, schema, output.data.clone(), *tx_id);
            self.storage.stage_state_insert(batch, &row)?;
        }
        for id in &spends {
            // inputs produced by an undispatched sibling would not be in the
            // store yet; the reservation map guarantees they are flushed
            // first because dispatch follows the dependency order
            if self.storage.read_state(&self.contract, id)?.is_none() {
                let staged = StoredState {
                    id: *id,
                    schema: schema_default,
                    contract: self.contract,
                    data: serde_json::Value::Null,
                    created_by: *tx_id,
                    spent_by: Some(*tx_id),
                    created_at: 0,
                };
                self.storage.stage_state_insert(batch, &staged)?;
                continue;
            }
            self.storage
                .stage_state_spend(batch, &self.contract, id, tx_id)?;
        }
        self.reserved.retain(|_, holder| holder != tx_id);
        Ok(())
    }

    /// Whether the given state id was produced by a transaction that has
    /// not flushed yet.
    pub fn producer_of(&self, state_id: &B256) -> Option<Uuid> {
        for (tx_id, outputs) in &self.staged_outputs {
            if outputs.iter().any(|s| s.id == *state_id) {
                return Some(*tx_id);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, DomainContext) {
        let dir = TempDir::new().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let contract = Address::repeat_byte(0x77);
        (dir, DomainContext::new(contract, storage))
    }

    fn state(id: u8) -> FullState {
        FullState {
            id: B256::repeat_byte(id),
            schema: B256::repeat_byte(0xee),
            data: serde_json::json!({"amount": id}),
        }
    }

    #[test]
    fn reservations_hide_states_from_siblings() {
        let (_dir, mut ctx) = setup();
        let minter = Uuid::new_v4();
        ctx.reserve(minter, &[], &[state(1), state(2)]).unwrap();
        assert_eq!(ctx.available_states().unwrap().len(), 2);

        let spender = Uuid::new_v4();
        ctx.reserve(spender, &[state(1)], &[state(3)]).unwrap();
        let available: Vec<B256> = ctx
            .available_states()
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        assert!(!available.contains(&B256::repeat_byte(1)));
        assert!(available.contains(&B256::repeat_byte(2)));
        assert!(available.contains(&B256::repeat_byte(3)));
    }

    #[test]
    fn double_reservation_is_fatal() {
        let (_dir, mut ctx) = setup();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        ctx.reserve(a, &[], &[state(1)]).unwrap();
        ctx.reserve(a, &[state(1)], &[]).unwrap();
        let err = ctx.reserve(b, &[state(1)], &[]).unwrap_err();
        assert!(matches!(err, EngineError::Fatal(_)));
    }

    #[test]
    fn release_returns_states_to_pool() {
        let (_dir, mut ctx) = setup();
        let minter = Uuid::new_v4();
        ctx.reserve(minter, &[], &[state(1)]).unwrap();
        let spender = Uuid::new_v4();
        ctx.reserve(spender, &[state(1)], &[]).unwrap();
        assert!(ctx.available_states().unwrap().is_empty());
        ctx.release(&spender);
        assert_eq!(ctx.available_states().unwrap().len(), 1);
    }

    #[test]
    fn flush_persists_outputs_and_spends() {
        let (_dir, mut ctx) = setup();
        let storage = ctx.storage.clone();
        let contract = *ctx.contract();

        let minter = Uuid::new_v4();
        ctx.reserve(minter, &[], &[state(1)]).unwrap();
        let mut batch = WriteBatch::default();
        ctx.flush_transaction(&mut batch, &minter, B256::ZERO)
            .unwrap();
        storage.write(batch).unwrap();
        assert_eq!(storage.unspent_states(&contract).unwrap().len(), 1);

        let spender = Uuid::new_v4();
        ctx.reserve(spender, &[state(1)], &[state(2)]).unwrap();
        let mut batch = WriteBatch::default();
        ctx.flush_transaction(&mut batch, &spender, B256::ZERO)
            .unwrap();
        storage.write(batch).unwrap();

        let unspent = storage.unspent_states(&contract).unwrap();
        assert_eq!(unspent.len(), 1);
        assert_eq!(unspent[0].id, B256::repeat_byte(2));
    }
}
