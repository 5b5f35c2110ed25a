use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options,
};
pub use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::types::private::unix_seconds;
use crate::types::{
    Address, PersistedPubTx, PreparedPublicTransaction, PrivateTransaction, PublicCompletion,
    PublicTx, SubmissionRecord, TransactionReceipt, B256,
};

pub const STORAGE_SCHEMA_VERSION: u32 = 1;

const CF_PUBLIC_TXNS: &str = "public_txns";
const CF_PUBLIC_SUBMISSIONS: &str = "public_submissions";
const CF_PUBLIC_COMPLETIONS: &str = "public_completions";
const CF_PUBLIC_TX_HASHES: &str = "public_tx_hashes";
const CF_PRIVATE_TXNS: &str = "private_txns";
const CF_ACTIVITY_RECORDS: &str = "activity_records";
const CF_RECEIPTS: &str = "receipts";
const CF_STATES: &str = "states";
const CF_STORED_ABIS: &str = "stored_abis";
const CF_PREPARED_TXNS: &str = "prepared_txns";
const CF_IDEMPOTENCY_KEYS: &str = "idempotency_keys";
const CF_METADATA: &str = "metadata";

const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

/// Activity entries kept per transaction; older entries roll off.
const ACTIVITY_RING_CAP: usize = 20;

const ALL_CFS: &[&str] = &[
    CF_PUBLIC_TXNS,
    CF_PUBLIC_SUBMISSIONS,
    CF_PUBLIC_COMPLETIONS,
    CF_PUBLIC_TX_HASHES,
    CF_PRIVATE_TXNS,
    CF_ACTIVITY_RECORDS,
    CF_RECEIPTS,
    CF_STATES,
    CF_STORED_ABIS,
    CF_PREPARED_TXNS,
    CF_IDEMPOTENCY_KEYS,
    CF_METADATA,
];

/// A state row. `contract + id` keys the row so the unspent scan for one
/// contract is a prefix iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredState {
    pub id: B256,
    pub schema: B256,
    pub contract: Address,
    pub data: serde_json::Value,
    pub created_by: Uuid,
    #[serde(default)]
    pub spent_by: Option<Uuid>,
    pub created_at: u64,
}

/// One entry of a transaction's activity ring: a human-readable note of
/// something that happened to it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub message: String,
    pub occurred_at: u64,
}

/// Row for a transaction prepared in external-submit mode.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreparedTransactionRecord {
    pub id: Uuid,
    pub transaction: PreparedPublicTransaction,
    pub signer: String,
    pub created_at: u64,
}

/// Persistence for the engine. One column family per logical table; rows
/// carrying arbitrary JSON are stored as JSON, fixed-layout index entries
/// as bincode. Composite keys are big-endian so `(from, nonce)` and
/// `(txn, resubmit_idx)` order lexicographically.
pub struct Storage {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

fn pub_tx_key(from: &Address, nonce: u64) -> [u8; 28] {
    let mut key = [0u8; 28];
    key[..20].copy_from_slice(from.as_slice());
    key[20..].copy_from_slice(&nonce.to_be_bytes());
    key
}

fn submission_key(from: &Address, nonce: u64, idx: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..28].copy_from_slice(&pub_tx_key(from, nonce));
    key[28..].copy_from_slice(&idx.to_be_bytes());
    key
}

fn state_key(contract: &Address, id: &B256) -> [u8; 52] {
    let mut key = [0u8; 52];
    key[..20].copy_from_slice(contract.as_slice());
    key[20..].copy_from_slice(id.as_slice());
    key
}

impl Storage {
    pub fn open(path: &Path) -> EngineResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        let storage = Self { db: Arc::new(db) };
        storage.ensure_schema_supported()?;
        Ok(storage)
    }

    fn cf(&self, name: &str) -> EngineResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| EngineError::Config(format!("missing column family {name}")))
    }

    fn ensure_schema_supported(&self) -> EngineResult<()> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, SCHEMA_VERSION_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| EngineError::Config("invalid schema version encoding".into()))?;
                let version = u32::from_be_bytes(bytes);
                if version != STORAGE_SCHEMA_VERSION {
                    return Err(EngineError::Config(format!(
                        "database schema version {version} is not supported (requires {STORAGE_SCHEMA_VERSION})"
                    )));
                }
                Ok(())
            }
            None => {
                self.db.put_cf(
                    &cf,
                    SCHEMA_VERSION_KEY,
                    STORAGE_SCHEMA_VERSION.to_be_bytes(),
                )?;
                Ok(())
            }
        }
    }

    /// Commits a staged batch. All cross-table writes that must land
    /// together go through one of these.
    pub fn write(&self, batch: WriteBatch) -> EngineResult<()> {
        self.db.write(batch)?;
        Ok(())
    }

    // ---- private transactions ----

    pub fn upsert_private_tx(&self, tx: &PrivateTransaction) -> EngineResult<()> {
        let cf = self.cf(CF_PRIVATE_TXNS)?;
        self.db
            .put_cf(&cf, tx.id.as_bytes(), serde_json::to_vec(tx)?)?;
        Ok(())
    }

    pub fn read_private_tx(&self, id: &Uuid) -> EngineResult<Option<PrivateTransaction>> {
        let cf = self.cf(CF_PRIVATE_TXNS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn query_private_txs(
        &self,
        limit: usize,
        pending_only: bool,
    ) -> EngineResult<Vec<PrivateTransaction>> {
        let cf = self.cf(CF_PRIVATE_TXNS)?;
        let mut txs: Vec<PrivateTransaction> = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_key, value) = entry?;
            let tx: PrivateTransaction = serde_json::from_slice(&value)?;
            if pending_only && tx.status.is_terminal() {
                continue;
            }
            txs.push(tx);
        }
        txs.sort_by_key(|tx| (tx.created_at, tx.id));
        txs.truncate(limit);
        Ok(txs)
    }

    /// Binds an idempotency key to a transaction id, returning the id of an
    /// existing binding instead when the key has been seen before.
    pub fn bind_idempotency_key(&self, key: &str, id: &Uuid) -> EngineResult<Option<Uuid>> {
        let cf = self.cf(CF_IDEMPOTENCY_KEYS)?;
        if let Some(existing) = self.db.get_cf(&cf, key.as_bytes())? {
            let bound = Uuid::from_slice(&existing)
                .map_err(|err| EngineError::Config(format!("corrupt idempotency row: {err}")))?;
            return Ok(Some(bound));
        }
        self.db.put_cf(&cf, key.as_bytes(), id.as_bytes())?;
        Ok(None)
    }

    pub fn idempotency_key_lookup(&self, key: &str) -> EngineResult<Option<Uuid>> {
        let cf = self.cf(CF_IDEMPOTENCY_KEYS)?;
        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(existing) => Ok(Some(Uuid::from_slice(&existing).map_err(|err| {
                EngineError::Config(format!("corrupt idempotency row: {err}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Appends to a transaction's activity ring, dropping the oldest
    /// entries beyond the cap. Advisory data: single-writer per
    /// transaction (the owning sequencer or completion handler).
    pub fn add_activity_record(&self, id: &Uuid, message: impl Into<String>) -> EngineResult<()> {
        let cf = self.cf(CF_ACTIVITY_RECORDS)?;
        let mut ring: Vec<ActivityRecord> = match self.db.get_cf(&cf, id.as_bytes())? {
            Some(value) => serde_json::from_slice(&value)?,
            None => Vec::new(),
        };
        ring.push(ActivityRecord {
            message: message.into(),
            occurred_at: unix_seconds(),
        });
        if ring.len() > ACTIVITY_RING_CAP {
            let excess = ring.len() - ACTIVITY_RING_CAP;
            ring.drain(..excess);
        }
        self.db
            .put_cf(&cf, id.as_bytes(), serde_json::to_vec(&ring)?)?;
        Ok(())
    }

    pub fn activity_records(&self, id: &Uuid) -> EngineResult<Vec<ActivityRecord>> {
        let cf = self.cf(CF_ACTIVITY_RECORDS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(value) => Ok(serde_json::from_slice(&value)?),
            None => Ok(Vec::new()),
        }
    }

    // ---- receipts ----

    pub fn put_receipt(&self, receipt: &TransactionReceipt) -> EngineResult<()> {
        let cf = self.cf(CF_RECEIPTS)?;
        self.db
            .put_cf(&cf, receipt.id.as_bytes(), serde_json::to_vec(receipt)?)?;
        Ok(())
    }

    pub fn read_receipt(&self, id: &Uuid) -> EngineResult<Option<TransactionReceipt>> {
        let cf = self.cf(CF_RECEIPTS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn query_receipts(
        &self,
        limit: usize,
        success: Option<bool>,
    ) -> EngineResult<Vec<TransactionReceipt>> {
        let cf = self.cf(CF_RECEIPTS)?;
        let mut receipts: Vec<TransactionReceipt> = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_key, value) = entry?;
            let receipt: TransactionReceipt = serde_json::from_slice(&value)?;
            if let Some(wanted) = success {
                if receipt.success != wanted {
                    continue;
                }
            }
            receipts.push(receipt);
        }
        receipts.sort_by_key(|r| (r.created_at, r.id));
        receipts.truncate(limit);
        Ok(receipts)
    }

    // ---- public transactions ----

    /// Stages a new public transaction row into the caller's batch. The
    /// nonce must already be finalized by the allocator.
    pub fn stage_public_tx(
        &self,
        batch: &mut WriteBatch,
        tx: &PersistedPubTx,
    ) -> EngineResult<()> {
        let cf = self.cf(CF_PUBLIC_TXNS)?;
        batch.put_cf(&cf, pub_tx_key(&tx.from, tx.nonce), serde_json::to_vec(tx)?);
        Ok(())
    }

    pub fn public_tx_row(
        &self,
        from: &Address,
        nonce: u64,
    ) -> EngineResult<Option<PersistedPubTx>> {
        let cf = self.cf(CF_PUBLIC_TXNS)?;
        match self.db.get_cf(&cf, pub_tx_key(from, nonce))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Appends a submission attempt, assigning the next resubmit index, and
    /// indexes the hash for reverse lookup.
    pub fn add_submission(
        &self,
        from: &Address,
        nonce: u64,
        record: &SubmissionRecord,
    ) -> EngineResult<u32> {
        let idx = self.submissions(from, nonce)?.len() as u32;
        let mut batch = WriteBatch::default();
        let cf = self.cf(CF_PUBLIC_SUBMISSIONS)?;
        batch.put_cf(
            &cf,
            submission_key(from, nonce, idx),
            serde_json::to_vec(record)?,
        );
        let hashes = self.cf(CF_PUBLIC_TX_HASHES)?;
        batch.put_cf(
            &hashes,
            record.tx_hash.as_slice(),
            bincode::serialize(&(*from, nonce))?,
        );
        self.write(batch)?;
        Ok(idx)
    }

    pub fn submissions(&self, from: &Address, nonce: u64) -> EngineResult<Vec<SubmissionRecord>> {
        let cf = self.cf(CF_PUBLIC_SUBMISSIONS)?;
        let prefix = pub_tx_key(from, nonce);
        let mut records = Vec::new();
        for entry in self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        ) {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }

    /// Writes a completion row unless one exists. Completions are immutable;
    /// redelivered confirmations are no-ops.
    pub fn insert_completion_if_absent(
        &self,
        from: &Address,
        nonce: u64,
        completion: &PublicCompletion,
    ) -> EngineResult<bool> {
        let cf = self.cf(CF_PUBLIC_COMPLETIONS)?;
        let key = pub_tx_key(from, nonce);
        if self.db.get_cf(&cf, key)?.is_some() {
            return Ok(false);
        }
        self.db.put_cf(&cf, key, serde_json::to_vec(completion)?)?;
        Ok(true)
    }

    pub fn completion(&self, from: &Address, nonce: u64) -> EngineResult<Option<PublicCompletion>> {
        let cf = self.cf(CF_PUBLIC_COMPLETIONS)?;
        match self.db.get_cf(&cf, pub_tx_key(from, nonce))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn read_public_tx(&self, from: &Address, nonce: u64) -> EngineResult<Option<PublicTx>> {
        let Some(tx) = self.public_tx_row(from, nonce)? else {
            return Ok(None);
        };
        Ok(Some(PublicTx {
            submissions: self.submissions(from, nonce)?,
            completion: self.completion(from, nonce)?,
            tx,
        }))
    }

    pub fn public_tx_by_hash(&self, hash: &B256) -> EngineResult<Option<PublicTx>> {
        let cf = self.cf(CF_PUBLIC_TX_HASHES)?;
        match self.db.get_cf(&cf, hash.as_slice())? {
            Some(value) => {
                let (from, nonce): (Address, u64) = bincode::deserialize(&value)?;
                self.read_public_tx(&from, nonce)
            }
            None => Ok(None),
        }
    }

    pub fn query_public_txs(
        &self,
        limit: usize,
        pending_only: bool,
    ) -> EngineResult<Vec<PublicTx>> {
        let cf = self.cf(CF_PUBLIC_TXNS)?;
        let mut txs = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            if txs.len() >= limit {
                break;
            }
            let (_key, value) = entry?;
            let row: PersistedPubTx = serde_json::from_slice(&value)?;
            let completion = self.completion(&row.from, row.nonce)?;
            if pending_only && completion.is_some() {
                continue;
            }
            txs.push(PublicTx {
                submissions: self.submissions(&row.from, row.nonce)?,
                completion,
                tx: row,
            });
        }
        Ok(txs)
    }

    /// Rows for one signer with no completion yet, in nonce order.
    pub fn pending_public_txs_for(&self, from: &Address) -> EngineResult<Vec<PersistedPubTx>> {
        let cf = self.cf(CF_PUBLIC_TXNS)?;
        let prefix: [u8; 20] = (*from).into();
        let mut rows = Vec::new();
        for entry in self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        ) {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            let row: PersistedPubTx = serde_json::from_slice(&value)?;
            if self.completion(&row.from, row.nonce)?.is_none() {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Distinct signing addresses that still have pending rows.
    pub fn signers_with_pending(&self) -> EngineResult<Vec<Address>> {
        let cf = self.cf(CF_PUBLIC_TXNS)?;
        let mut signers: Vec<Address> = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_key, value) = entry?;
            let row: PersistedPubTx = serde_json::from_slice(&value)?;
            if signers.last() == Some(&row.from) {
                continue;
            }
            if self.completion(&row.from, row.nonce)?.is_none() && !signers.contains(&row.from) {
                signers.push(row.from);
            }
        }
        Ok(signers)
    }

    // ---- states ----

    pub fn stage_state_insert(
        &self,
        batch: &mut WriteBatch,
        state: &StoredState,
    ) -> EngineResult<()> {
        let cf = self.cf(CF_STATES)?;
        batch.put_cf(
            &cf,
            state_key(&state.contract, &state.id),
            serde_json::to_vec(state)?,
        );
        Ok(())
    }

    /// Marks a state spent. The row must exist; spending an unknown state
    /// is an invariant violation surfaced as fatal.
    pub fn stage_state_spend(
        &self,
        batch: &mut WriteBatch,
        contract: &Address,
        id: &B256,
        spending_tx: &Uuid,
    ) -> EngineResult<()> {
        let mut state = self
            .read_state(contract, id)?
            .ok_or_else(|| EngineError::Fatal(format!("spend of unknown state {id}")))?;
        if let Some(existing) = state.spent_by {
            if existing != *spending_tx {
                return Err(EngineError::Fatal(format!(
                    "state {id} already spent by {existing}"
                )));
            }
        }
        state.spent_by = Some(*spending_tx);
        self.stage_state_insert(batch, &state)
    }

    pub fn read_state(&self, contract: &Address, id: &B256) -> EngineResult<Option<StoredState>> {
        let cf = self.cf(CF_STATES)?;
        match self.db.get_cf(&cf, state_key(contract, id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn unspent_states(&self, contract: &Address) -> EngineResult<Vec<StoredState>> {
        let cf = self.cf(CF_STATES)?;
        let prefix: [u8; 20] = (*contract).into();
        let mut states = Vec::new();
        for entry in self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        ) {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            let state: StoredState = serde_json::from_slice(&value)?;
            if state.spent_by.is_none() {
                states.push(state);
            }
        }
        Ok(states)
    }

    /// States a transaction created or spent, for the state receipt view.
    pub fn states_touched_by(
        &self,
        contract: &Address,
        tx_id: &Uuid,
    ) -> EngineResult<(Vec<StoredState>, Vec<StoredState>)> {
        let cf = self.cf(CF_STATES)?;
        let prefix: [u8; 20] = (*contract).into();
        let mut created = Vec::new();
        let mut spent = Vec::new();
        for entry in self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        ) {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            let state: StoredState = serde_json::from_slice(&value)?;
            if state.created_by == *tx_id {
                created.push(state.clone());
            }
            if state.spent_by == Some(*tx_id) {
                spent.push(state);
            }
        }
        Ok((created, spent))
    }

    // ---- stored ABIs ----

    /// Stores an ABI document keyed by the keccak of its canonical JSON.
    /// Idempotent: storing the same document returns the same hash.
    pub fn store_abi(&self, abi: &serde_json::Value) -> EngineResult<B256> {
        let canonical = serde_json::to_vec(abi)?;
        let hash = B256::from(alloy_primitives::keccak256(&canonical));
        let cf = self.cf(CF_STORED_ABIS)?;
        self.db.put_cf(&cf, hash.as_slice(), canonical)?;
        Ok(hash)
    }

    pub fn read_abi(&self, hash: &B256) -> EngineResult<Option<serde_json::Value>> {
        let cf = self.cf(CF_STORED_ABIS)?;
        match self.db.get_cf(&cf, hash.as_slice())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn query_abis(&self, limit: usize) -> EngineResult<Vec<(B256, serde_json::Value)>> {
        let cf = self.cf(CF_STORED_ABIS)?;
        let mut abis = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            if abis.len() >= limit {
                break;
            }
            let (key, value) = entry?;
            let hash = B256::from_slice(&key);
            abis.push((hash, serde_json::from_slice(&value)?));
        }
        Ok(abis)
    }

    // ---- prepared transactions ----

    pub fn put_prepared(&self, record: &PreparedTransactionRecord) -> EngineResult<()> {
        let cf = self.cf(CF_PREPARED_TXNS)?;
        self.db
            .put_cf(&cf, record.id.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    pub fn read_prepared(&self, id: &Uuid) -> EngineResult<Option<PreparedTransactionRecord>> {
        let cf = self.cf(CF_PREPARED_TXNS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn query_prepared(&self, limit: usize) -> EngineResult<Vec<PreparedTransactionRecord>> {
        let cf = self.cf(CF_PREPARED_TXNS)?;
        let mut records: Vec<PreparedTransactionRecord> = Vec::new();
        for entry in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_key, value) = entry?;
            records.push(serde_json::from_slice(&value)?);
        }
        records.sort_by_key(|r| (r.created_at, r.id));
        records.truncate(limit);
        Ok(records)
    }
}

/// Helper for building a state row from assembly output.
pub fn new_state(
    contract: Address,
    id: B256,
    schema: B256,
    data: serde_json::Value,
    created_by: Uuid,
) -> StoredState {
    StoredState {
        id,
        schema,
        contract,
        data,
        created_by,
        spent_by: None,
        created_at: unix_seconds(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bytes, GasPricing, TransactionType, TxBinding};
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, Storage) {
        let dir = TempDir::new().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        (dir, storage)
    }

    fn sample_pub_tx(from: Address, nonce: u64) -> PersistedPubTx {
        PersistedPubTx {
            from,
            nonce,
            key_handle: "kh1".into(),
            to: Some(Address::repeat_byte(0x22)),
            data: Bytes::from(vec![1, 2, 3]),
            gas: 21_000,
            value: None,
            fixed_gas_pricing: None,
            bindings: vec![TxBinding {
                transaction: Uuid::new_v4(),
                tx_type: TransactionType::Private,
            }],
            created_at: 1,
        }
    }

    #[test]
    fn public_tx_round_trip_with_submissions() {
        let (_dir, storage) = open_temp();
        let from = Address::repeat_byte(0x11);
        let tx = sample_pub_tx(from, 5);

        let mut batch = WriteBatch::default();
        storage.stage_public_tx(&mut batch, &tx).unwrap();
        storage.write(batch).unwrap();

        let record = SubmissionRecord {
            tx_hash: B256::repeat_byte(0xaa),
            gas_pricing: GasPricing::default(),
            created_at: 2,
        };
        let idx = storage.add_submission(&from, 5, &record).unwrap();
        assert_eq!(idx, 0);
        let idx = storage.add_submission(&from, 5, &record).unwrap();
        assert_eq!(idx, 1);

        let loaded = storage.read_public_tx(&from, 5).unwrap().expect("present");
        assert_eq!(loaded.submissions.len(), 2);
        assert!(loaded.completion.is_none());

        let by_hash = storage
            .public_tx_by_hash(&B256::repeat_byte(0xaa))
            .unwrap()
            .expect("indexed");
        assert_eq!(by_hash.tx.nonce, 5);
    }

    #[test]
    fn completions_are_immutable() {
        let (_dir, storage) = open_temp();
        let from = Address::repeat_byte(0x33);
        let completion = PublicCompletion {
            tx_hash: B256::repeat_byte(0xbb),
            success: true,
            revert_data: Bytes::new(),
            block_number: 7,
            created_at: 3,
        };
        assert!(storage
            .insert_completion_if_absent(&from, 1, &completion)
            .unwrap());
        assert!(!storage
            .insert_completion_if_absent(&from, 1, &completion)
            .unwrap());
    }

    #[test]
    fn pending_rows_exclude_completed_and_keep_nonce_order() {
        let (_dir, storage) = open_temp();
        let from = Address::repeat_byte(0x44);
        let mut batch = WriteBatch::default();
        for nonce in [2u64, 0, 1] {
            storage
                .stage_public_tx(&mut batch, &sample_pub_tx(from, nonce))
                .unwrap();
        }
        storage.write(batch).unwrap();

        let completion = PublicCompletion {
            tx_hash: B256::repeat_byte(0xcc),
            success: true,
            revert_data: Bytes::new(),
            block_number: 1,
            created_at: 1,
        };
        storage
            .insert_completion_if_absent(&from, 0, &completion)
            .unwrap();

        let pending = storage.pending_public_txs_for(&from).unwrap();
        let nonces: Vec<u64> = pending.iter().map(|tx| tx.nonce).collect();
        assert_eq!(nonces, vec![1, 2]);

        assert_eq!(storage.signers_with_pending().unwrap(), vec![from]);
    }

    #[test]
    fn state_spend_is_single_use() {
        let (_dir, storage) = open_temp();
        let contract = Address::repeat_byte(0x55);
        let minter = Uuid::new_v4();
        let state = new_state(
            contract,
            B256::repeat_byte(0x01),
            B256::repeat_byte(0x02),
            serde_json::json!({"amount": 100}),
            minter,
        );
        let mut batch = WriteBatch::default();
        storage.stage_state_insert(&mut batch, &state).unwrap();
        storage.write(batch).unwrap();

        assert_eq!(storage.unspent_states(&contract).unwrap().len(), 1);

        let spender = Uuid::new_v4();
        let mut batch = WriteBatch::default();
        storage
            .stage_state_spend(&mut batch, &contract, &state.id, &spender)
            .unwrap();
        storage.write(batch).unwrap();

        assert!(storage.unspent_states(&contract).unwrap().is_empty());

        let other = Uuid::new_v4();
        let mut batch = WriteBatch::default();
        let err = storage
            .stage_state_spend(&mut batch, &contract, &state.id, &other)
            .unwrap_err();
        assert!(matches!(err, EngineError::Fatal(_)));
    }

    #[test]
    fn idempotency_key_binds_once() {
        let (_dir, storage) = open_temp();
        let id = Uuid::new_v4();
        assert!(storage.bind_idempotency_key("tx1", &id).unwrap().is_none());
        let other = Uuid::new_v4();
        assert_eq!(
            storage.bind_idempotency_key("tx1", &other).unwrap(),
            Some(id)
        );
        assert_eq!(storage.idempotency_key_lookup("tx1").unwrap(), Some(id));
    }

    #[test]
    fn activity_ring_is_bounded_and_ordered() {
        let (_dir, storage) = open_temp();
        let id = Uuid::new_v4();
        assert!(storage.activity_records(&id).unwrap().is_empty());

        for i in 0..30 {
            storage
                .add_activity_record(&id, format!("step {i}"))
                .unwrap();
        }
        let ring = storage.activity_records(&id).unwrap();
        assert_eq!(ring.len(), ACTIVITY_RING_CAP);
        // oldest entries rolled off; the most recent survives at the tail
        assert_eq!(ring.first().unwrap().message, "step 10");
        assert_eq!(ring.last().unwrap().message, "step 29");
    }

    #[test]
    fn abi_store_is_idempotent() {
        let (_dir, storage) = open_temp();
        let abi = serde_json::json!([{"type": "function", "name": "transfer"}]);
        let first = storage.store_abi(&abi).unwrap();
        let second = storage.store_abi(&abi).unwrap();
        assert_eq!(first, second);
        assert!(storage.read_abi(&first).unwrap().is_some());
        assert_eq!(storage.query_abis(10).unwrap().len(), 1);
    }
}
