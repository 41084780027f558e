//! Cache of live documents.
//!
//! Each document gets one slot guarded by a tokio mutex. The slot mutex is
//! the per-document critical section: loading, applying and compacting all
//! happen while it is held, so sequence assignment and merge never race.
//! The outer map lock is only held long enough to find or insert a slot.

use log::{debug, info};
use quire_core::{Document, DocumentId};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard, RwLock};
use tokio::time::Instant;

use crate::collaborators::InitialContentSource;
use crate::error::{SyncError, SyncResult};
use crate::storage::{now_millis, DocumentStore, Snapshot, StoreError};

/// Live state of one loaded document.
pub struct Slot {
    pub document: Document,
    /// Highest sequence number assigned to this document.
    pub last_seq: u64,
    /// Highest sequence folded into the persisted snapshot.
    pub covered_seq: u64,
    /// Log entries written since the snapshot.
    pub pending_entries: u64,
    pub last_access: Instant,
}

/// Exclusive access to a loaded slot.
pub type SlotGuard = OwnedMappedMutexGuard<Option<Slot>, Slot>;

type SlotCell = Arc<Mutex<Option<Slot>>>;

pub struct DocumentRegistry {
    slots: RwLock<HashMap<DocumentId, SlotCell>>,
    store: Arc<dyn DocumentStore>,
    initial_content: Arc<dyn InitialContentSource>,
}

impl DocumentRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, initial_content: Arc<dyn InitialContentSource>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            store,
            initial_content,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Lock a document, loading it on first access.
    pub async fn lock(&self, document_id: &DocumentId) -> SyncResult<SlotGuard> {
        if !document_id.is_valid() {
            return Err(SyncError::InvalidDocumentId(format!(
                "length must be 1 to {} bytes, got {}",
                DocumentId::MAX_LEN,
                document_id.as_str().len()
            )));
        }
        let cell = self.cell(document_id).await;
        let mut guard = cell.lock_owned().await;
        if guard.is_none() {
            *guard = Some(self.load(document_id).await?);
        }
        match OwnedMutexGuard::try_map(guard, |slot| slot.as_mut()) {
            Ok(mut slot) => {
                slot.last_access = Instant::now();
                Ok(slot)
            }
            Err(_) => Err(SyncError::Unrecoverable {
                document_id: document_id.clone(),
                seq: None,
                reason: "slot vanished while locked".to_string(),
            }),
        }
    }

    async fn cell(&self, document_id: &DocumentId) -> SlotCell {
        {
            let slots = self.slots.read().await;
            if let Some(cell) = slots.get(document_id) {
                return Arc::clone(cell);
            }
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(document_id.clone()).or_default())
    }

    /// Snapshot, then every log entry after it, in ascending order.
    async fn load(&self, document_id: &DocumentId) -> SyncResult<Slot> {
        let snapshot = self
            .store
            .load_snapshot(document_id)
            .map_err(|e| escalate(document_id, e))?;
        let covered_seq = snapshot.as_ref().map_or(0, |s| s.covered_seq);
        let entries = self
            .store
            .entries_after(document_id, covered_seq)
            .map_err(|e| escalate(document_id, e))?;

        let Some(snapshot) = snapshot else {
            if entries.is_empty() {
                return self.seed(document_id).await;
            }
            return self.replay(document_id, Document::new(), 0, entries);
        };

        let document = Document::from_state(&snapshot.data).map_err(|e| SyncError::Unrecoverable {
            document_id: document_id.clone(),
            seq: None,
            reason: format!("snapshot does not decode: {e}"),
        })?;
        self.replay(document_id, document, covered_seq, entries)
    }

    fn replay(
        &self,
        document_id: &DocumentId,
        document: Document,
        covered_seq: u64,
        entries: Vec<crate::storage::UpdateLogEntry>,
    ) -> SyncResult<Slot> {
        let mut last_seq = covered_seq;
        for entry in &entries {
            document
                .apply_update(&entry.data)
                .map_err(|e| SyncError::Unrecoverable {
                    document_id: document_id.clone(),
                    seq: Some(entry.seq),
                    reason: e.to_string(),
                })?;
            last_seq = last_seq.max(entry.seq);
        }
        info!(
            "Loaded document {} (snapshot through seq {}, {} log entries replayed)",
            document_id,
            covered_seq,
            entries.len()
        );
        Ok(Slot {
            document,
            last_seq,
            covered_seq,
            pending_entries: entries.len() as u64,
            last_access: Instant::now(),
        })
    }

    /// First-time document: build from the collaborator's blocks and persist
    /// that state as the first snapshot before anyone sees it.
    async fn seed(&self, document_id: &DocumentId) -> SyncResult<Slot> {
        let blocks = self.initial_content.initial_blocks(document_id).await?;
        let document = Document::from_blocks(&blocks);
        self.store.save_snapshot(&Snapshot {
            document_id: document_id.clone(),
            data: document.encode_state(),
            covered_seq: 0,
            created_at: now_millis(),
        })?;
        info!("Seeded document {} from {} blocks", document_id, blocks.len());
        Ok(Slot {
            document,
            last_seq: 0,
            covered_seq: 0,
            pending_entries: 0,
            last_access: Instant::now(),
        })
    }

    /// Drop documents untouched for `max_idle`. Slots in use are kept.
    ///
    /// Every applied delta reaches the update log before its merge is
    /// visible, so a loaded slot never holds unflushed state.
    /// Drop documents idle for at least `max_idle`. Returns the evicted ids.
    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<DocumentId> {
        let mut slots = self.slots.write().await;
        let mut evicted = Vec::new();
        slots.retain(|document_id, cell| {
            if Arc::strong_count(cell) > 1 {
                return true;
            }
            let Ok(slot) = cell.try_lock() else {
                return true;
            };
            let keep = slot
                .as_ref()
                .is_some_and(|slot| slot.last_access.elapsed() < max_idle);
            if !keep {
                debug!("Evicting idle document {}", document_id);
                evicted.push(document_id.clone());
            }
            keep
        });
        evicted
    }

    pub async fn is_loaded(&self, document_id: &DocumentId) -> bool {
        self.slots.read().await.contains_key(document_id)
    }

    /// Loaded documents plus every document with log entries in the store.
    pub async fn known_documents(&self) -> SyncResult<Vec<DocumentId>> {
        let mut ids: BTreeSet<DocumentId> = self.slots.read().await.keys().cloned().collect();
        ids.extend(self.store.documents()?);
        Ok(ids.into_iter().collect())
    }
}

/// Corrupt persisted state becomes an unrecoverable document; anything else
/// is an ordinary store failure the caller may retry.
fn escalate(document_id: &DocumentId, error: StoreError) -> SyncError {
    match error {
        StoreError::Corrupt { seq, reason } => SyncError::Unrecoverable {
            document_id: document_id.clone(),
            seq: Some(seq),
            reason,
        },
        StoreError::CorruptSnapshot(reason) => SyncError::Unrecoverable {
            document_id: document_id.clone(),
            seq: None,
            reason,
        },
        other => SyncError::Store(other),
    }
}
