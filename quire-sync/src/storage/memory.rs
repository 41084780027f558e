use quire_core::DocumentId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use super::record::{decode_entry, decode_snapshot, encode_entry, encode_snapshot};
use super::{Snapshot, SnapshotStore, StoreError, StoreResult, UpdateLogEntry, UpdateLogStore};

/// In-memory storage backend.
///
/// Records are kept in `BTreeMap`s in the same encoded form the RocksDB
/// backend writes, so corruption and checksum handling behave identically.
/// Individual operations can be made to fail for testing failure paths.
#[derive(Default)]
pub struct MemoryStore {
    snapshots: RwLock<BTreeMap<DocumentId, Vec<u8>>>,
    updates: RwLock<BTreeMap<(DocumentId, u64), Vec<u8>>>,
    fail_snapshot_writes: AtomicBool,
    fail_appends: AtomicBool,
    fail_truncates: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_snapshot_writes(&self, fail: bool) {
        self.fail_snapshot_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_truncates(&self, fail: bool) {
        self.fail_truncates.store(fail, Ordering::SeqCst);
    }

    /// Overwrite the stored bytes of one log entry.
    pub fn overwrite_entry(&self, document_id: &DocumentId, seq: u64, bytes: Vec<u8>) {
        if let Ok(mut updates) = self.updates.write() {
            updates.insert((document_id.clone(), seq), bytes);
        }
    }

    /// Number of log entries held for a document.
    pub fn entry_count(&self, document_id: &DocumentId) -> usize {
        self.updates
            .read()
            .map(|updates| updates.keys().filter(|(id, _)| id == document_id).count())
            .unwrap_or(0)
    }

    fn injected(flag: &AtomicBool, operation: &str) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("injected {operation} failure")));
        }
        Ok(())
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Database("memory store lock poisoned".to_string())
}

impl SnapshotStore for MemoryStore {
    fn load_snapshot(&self, document_id: &DocumentId) -> StoreResult<Option<Snapshot>> {
        let snapshots = self.snapshots.read().map_err(poisoned)?;
        snapshots
            .get(document_id)
            .map(|bytes| decode_snapshot(document_id, bytes))
            .transpose()
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()> {
        Self::injected(&self.fail_snapshot_writes, "snapshot write")?;
        let bytes = encode_snapshot(snapshot)?;
        self.snapshots
            .write()
            .map_err(poisoned)?
            .insert(snapshot.document_id.clone(), bytes);
        Ok(())
    }
}

impl UpdateLogStore for MemoryStore {
    fn append(&self, entry: &UpdateLogEntry) -> StoreResult<()> {
        Self::injected(&self.fail_appends, "append")?;
        let bytes = encode_entry(entry)?;
        self.updates
            .write()
            .map_err(poisoned)?
            .insert((entry.document_id.clone(), entry.seq), bytes);
        Ok(())
    }

    fn entries_after(&self, document_id: &DocumentId, after: u64) -> StoreResult<Vec<UpdateLogEntry>> {
        let updates = self.updates.read().map_err(poisoned)?;
        let start = (document_id.clone(), after.saturating_add(1));
        let end = (document_id.clone(), u64::MAX);
        if after == u64::MAX {
            return Ok(Vec::new());
        }
        updates
            .range(start..=end)
            .map(|((_, seq), bytes)| decode_entry(document_id, *seq, bytes))
            .collect()
    }

    fn remove_entry(&self, document_id: &DocumentId, seq: u64) -> StoreResult<()> {
        self.updates
            .write()
            .map_err(poisoned)?
            .remove(&(document_id.clone(), seq));
        Ok(())
    }

    fn truncate_through(&self, document_id: &DocumentId, through: u64) -> StoreResult<u64> {
        Self::injected(&self.fail_truncates, "truncate")?;
        let mut updates = self.updates.write().map_err(poisoned)?;
        let doomed: Vec<_> = updates
            .range((document_id.clone(), 0)..=(document_id.clone(), through))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            updates.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    fn documents(&self) -> StoreResult<Vec<DocumentId>> {
        let updates = self.updates.read().map_err(poisoned)?;
        let ids: BTreeSet<_> = updates.keys().map(|(id, _)| id.clone()).collect();
        Ok(ids.into_iter().collect())
    }
}
