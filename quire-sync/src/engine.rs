//! The sync engine: diff, apply and compact for every document.
//!
//! Ordering inside the per-document critical section:
//!
//! ```text
//! apply:   validate ─► seq = last + 1 ─► log.append ─► merge ─► last = seq
//!                                           │ fail        │ fail
//!                                           ▼             ▼
//!                                        propagate    remove entry, propagate
//!
//! compact: encode ─► snapshot.save(covered = last) ─► log.truncate(≤ covered)
//!                         │ fail                          │ fail
//!                         ▼                               ▼
//!                  log untouched, propagate        replay skips ≤ covered
//! ```

use log::{debug, info, warn};
use quire_core::{Document, DocumentId, UserId};
use std::sync::Arc;
use std::time::Duration;

use crate::collaborators::{Access, BlockDiff, Collaborators, PermissionChecker};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::materializer::BlockMaterializer;
use crate::registry::DocumentRegistry;
use crate::storage::{now_millis, DocumentStore, Snapshot, UpdateLogEntry};

/// Result of a successful [`SyncEngine::apply_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedUpdate {
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionOutcome {
    Compacted { covered_seq: u64, truncated: u64 },
    /// Nothing logged since the last snapshot.
    Skipped,
}

pub struct SyncEngine {
    registry: Arc<DocumentRegistry>,
    materializer: Arc<BlockMaterializer>,
    permissions: Arc<dyn PermissionChecker>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collaborators: Collaborators,
        config: SyncConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(DocumentRegistry::new(store, collaborators.initial_content));
        let materializer = Arc::new(BlockMaterializer::new(
            Arc::clone(&registry),
            collaborators.block_store,
            collaborators.search_index,
            config.debounce,
        ));
        Arc::new(Self {
            registry,
            materializer,
            permissions: collaborators.permissions,
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn materializer(&self) -> &Arc<BlockMaterializer> {
        &self.materializer
    }

    /// Delta that brings a peer at `state_vector` to the current state.
    /// Without a state vector the full state is returned.
    pub async fn diff(
        &self,
        document_id: &DocumentId,
        state_vector: Option<&[u8]>,
    ) -> SyncResult<Vec<u8>> {
        let slot = self.registry.lock(document_id).await?;
        match state_vector {
            Some(sv) => Ok(slot.document.encode_diff(sv)?),
            None => Ok(slot.document.encode_state()),
        }
    }

    /// Merge a delta, record it in the update log and schedule materialization.
    pub async fn apply_update(&self, document_id: &DocumentId, delta: &[u8]) -> SyncResult<AppliedUpdate> {
        Document::validate_update(delta)?;

        let mut slot = self.registry.lock(document_id).await?;
        let seq = slot.last_seq + 1;
        let store = self.registry.store();
        store.append(&UpdateLogEntry {
            document_id: document_id.clone(),
            seq,
            data: delta.to_vec(),
            recorded_at: now_millis(),
        })?;

        if let Err(e) = slot.document.apply_update(delta) {
            if let Err(cleanup) = store.remove_entry(document_id, seq) {
                warn!(
                    "Could not remove unmerged entry {} of {}: {}",
                    seq, document_id, cleanup
                );
            }
            return Err(e.into());
        }
        slot.last_seq = seq;
        slot.pending_entries += 1;
        drop(slot);

        debug!("Applied update {} to {} ({} bytes)", seq, document_id, delta.len());
        self.materializer.schedule(document_id);
        Ok(AppliedUpdate { seq })
    }

    /// Fold the update log into a fresh snapshot and truncate it.
    pub async fn compact(&self, document_id: &DocumentId) -> SyncResult<CompactionOutcome> {
        let mut slot = self.registry.lock(document_id).await?;
        if slot.pending_entries == 0 {
            return Ok(CompactionOutcome::Skipped);
        }

        let covered_seq = slot.last_seq;
        let store = self.registry.store();
        store.save_snapshot(&Snapshot {
            document_id: document_id.clone(),
            data: slot.document.encode_state(),
            covered_seq,
            created_at: now_millis(),
        })?;
        slot.covered_seq = covered_seq;

        let truncated = store.truncate_through(document_id, covered_seq)?;
        slot.pending_entries = 0;
        info!(
            "Compacted {} through seq {} ({} log entries truncated)",
            document_id, covered_seq, truncated
        );
        Ok(CompactionOutcome::Compacted { covered_seq, truncated })
    }

    /// Materialize immediately, bypassing the debounce timer.
    pub async fn materialize_now(
        &self,
        document_id: &DocumentId,
    ) -> SyncResult<Option<BlockDiff>> {
        self.materializer.materialize(document_id).await
    }

    /// Materialize everything still waiting on a debounce timer.
    ///
    /// Call before dropping the engine when the store must be reopened in
    /// the same process; timer tasks otherwise keep it alive.
    pub async fn shutdown(&self) -> usize {
        self.materializer.flush().await
    }

    pub async fn known_documents(&self) -> SyncResult<Vec<DocumentId>> {
        self.registry.known_documents().await
    }

    /// Unload idle documents along with their materialization baselines.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let evicted = self.registry.evict_idle(max_idle).await;
        self.materializer.forget(&evicted);
        evicted.len()
    }

    async fn authorize(&self, user: &UserId, document_id: &DocumentId, access: Access) -> SyncResult<()> {
        if self.permissions.check(document_id, user, access).await? {
            return Ok(());
        }
        warn!("Denied {} access to {} for {}", access, document_id, user);
        Err(SyncError::PermissionDenied {
            document_id: document_id.clone(),
            access,
        })
    }

    /// [`diff`](Self::diff) after checking read permission.
    pub async fn authorized_diff(
        &self,
        user: &UserId,
        document_id: &DocumentId,
        state_vector: Option<&[u8]>,
    ) -> SyncResult<Vec<u8>> {
        self.authorize(user, document_id, Access::Read).await?;
        self.diff(document_id, state_vector).await
    }

    /// [`apply_update`](Self::apply_update) after checking edit permission.
    pub async fn authorized_apply(
        &self,
        user: &UserId,
        document_id: &DocumentId,
        delta: &[u8],
    ) -> SyncResult<AppliedUpdate> {
        self.authorize(user, document_id, Access::Edit).await?;
        self.apply_update(document_id, delta).await
    }

    /// Read permission check alone, for joins that subscribe before diffing.
    pub async fn authorize_read(&self, user: &UserId, document_id: &DocumentId) -> SyncResult<()> {
        self.authorize(user, document_id, Access::Read).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        MemoryBlockStore, MemorySearchIndex, NoInitialContent, StaticPermissions,
    };
    use crate::storage::{MemoryStore, SnapshotStore, UpdateLogStore};
    use quire_core::Block;

    fn engine_with(store: Arc<MemoryStore>) -> Arc<SyncEngine> {
        SyncEngine::new(store, Collaborators::in_memory(), SyncConfig::for_testing())
    }

    fn paragraph_delta(id: &str, text: &str) -> Vec<u8> {
        Document::new().insert_block(0, &Block::paragraph(id, text, 0))
    }

    #[tokio::test]
    async fn test_apply_assigns_increasing_seq() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone());
        let doc = DocumentId::new("ep-1");

        let first = engine.apply_update(&doc, &paragraph_delta("a", "one")).await.unwrap();
        let second = engine.apply_update(&doc, &paragraph_delta("b", "two")).await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(store.entry_count(&doc), 2);
    }

    #[tokio::test]
    async fn test_diff_without_state_vector_is_full_state() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        let doc = DocumentId::new("ep-1");
        engine.apply_update(&doc, &paragraph_delta("a", "Hello")).await.unwrap();

        let full = engine.diff(&doc, None).await.unwrap();
        let peer = Document::from_state(&full).unwrap();
        assert_eq!(peer.to_blocks(&doc)[0].text, "Hello");

        let sv = peer.state_vector();
        let nothing_new = engine.diff(&doc, Some(&sv)).await.unwrap();
        peer.apply_update(&nothing_new).unwrap();
        assert_eq!(peer.block_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_delta_rejected_before_logging() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone());
        let doc = DocumentId::new("ep-1");

        let result = engine.apply_update(&doc, &[0x05]).await;
        assert!(matches!(result, Err(SyncError::Document(_))));
        assert_eq!(store.entry_count(&doc), 0);
    }

    #[tokio::test]
    async fn test_oversized_document_id_rejected_before_logging() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone());
        let doc = DocumentId::new("x".repeat(DocumentId::MAX_LEN + 1));

        let err = engine
            .apply_update(&doc, &paragraph_delta("a", "one"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidDocumentId(_)));
        assert_eq!(err.code(), 400);
        assert_eq!(store.entry_count(&doc), 0);
        assert!(engine.diff(&doc, None).await.is_err());

        let longest = DocumentId::new("x".repeat(DocumentId::MAX_LEN));
        assert!(engine.apply_update(&longest, &paragraph_delta("a", "one")).await.is_ok());
    }

    #[tokio::test]
    async fn test_evicted_documents_release_baselines() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        for name in ["ep-1", "ep-2", "ep-3"] {
            let doc = DocumentId::new(name);
            engine.apply_update(&doc, &paragraph_delta("a", name)).await.unwrap();
        }
        assert_eq!(engine.shutdown().await, 3);
        assert_eq!(engine.materializer().baseline_count(), 3);

        assert_eq!(engine.evict_idle(Duration::ZERO).await, 3);
        assert_eq!(engine.materializer().baseline_count(), 0);
        assert!(!engine.registry().is_loaded(&DocumentId::new("ep-1")).await);
    }

    #[tokio::test]
    async fn test_failed_append_leaves_document_untouched() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone());
        let doc = DocumentId::new("ep-1");
        engine.diff(&doc, None).await.unwrap();

        store.fail_appends(true);
        let result = engine.apply_update(&doc, &paragraph_delta("a", "lost?")).await;
        assert!(matches!(result, Err(SyncError::Store(_))));

        store.fail_appends(false);
        let state = engine.diff(&doc, None).await.unwrap();
        assert_eq!(Document::from_state(&state).unwrap().block_count(), 0);

        // The client retries and gets the next seq.
        let retried = engine.apply_update(&doc, &paragraph_delta("a", "kept")).await.unwrap();
        assert_eq!(retried.seq, 1);
    }

    #[tokio::test]
    async fn test_compact_then_replay_is_equivalent() {
        let store = Arc::new(MemoryStore::new());
        let doc = DocumentId::new("ep-1");
        let before = {
            let engine = engine_with(store.clone());
            for i in 0..5 {
                engine
                    .apply_update(&doc, &paragraph_delta(&format!("b{i}"), "text"))
                    .await
                    .unwrap();
            }
            let outcome = engine.compact(&doc).await.unwrap();
            assert_eq!(outcome, CompactionOutcome::Compacted { covered_seq: 5, truncated: 5 });
            assert_eq!(store.entry_count(&doc), 0);
            engine.diff(&doc, None).await.unwrap()
        };

        let engine = engine_with(store.clone());
        let after = engine.diff(&doc, None).await.unwrap();
        let before = Document::from_state(&before).unwrap();
        let after = Document::from_state(&after).unwrap();
        assert!(before.content_eq(&after));
        assert_eq!(after.block_count(), 5);

        // Sequence numbers continue past the snapshot.
        let next = engine.apply_update(&doc, &paragraph_delta("z", "next")).await.unwrap();
        assert_eq!(next.seq, 6);
    }

    #[tokio::test]
    async fn test_compact_skips_when_nothing_logged() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        let doc = DocumentId::new("ep-1");
        assert_eq!(engine.compact(&doc).await.unwrap(), CompactionOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_failed_snapshot_keeps_log() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone());
        let doc = DocumentId::new("ep-1");
        engine.apply_update(&doc, &paragraph_delta("a", "safe")).await.unwrap();

        store.fail_snapshot_writes(true);
        assert!(engine.compact(&doc).await.is_err());
        assert_eq!(store.entry_count(&doc), 1);
        assert_eq!(store.load_snapshot(&doc).unwrap().unwrap().covered_seq, 0);

        store.fail_snapshot_writes(false);
        assert!(matches!(
            engine.compact(&doc).await.unwrap(),
            CompactionOutcome::Compacted { covered_seq: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_truncate_is_retried_and_replay_stays_exact() {
        let store = Arc::new(MemoryStore::new());
        let doc = DocumentId::new("ep-1");
        {
            let engine = engine_with(store.clone());
            engine.apply_update(&doc, &paragraph_delta("a", "one")).await.unwrap();
            store.fail_truncates(true);
            assert!(engine.compact(&doc).await.is_err());
            assert_eq!(store.entry_count(&doc), 1);
        }
        store.fail_truncates(false);

        // The snapshot covers seq 1; replay must not double count it.
        let engine = engine_with(store.clone());
        let slot = engine.registry().lock(&doc).await.unwrap();
        assert_eq!(slot.covered_seq, 1);
        assert_eq!(slot.last_seq, 1);
        assert_eq!(slot.pending_entries, 0);
        assert_eq!(slot.document.block_count(), 1);
        drop(slot);
        assert_eq!(store.entries_after(&doc, 1).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_compact_and_apply_never_lose_delta() {
        let store = Arc::new(MemoryStore::new());
        let doc = DocumentId::new("ep-1");
        let engine = engine_with(store.clone());
        for i in 0..10 {
            engine
                .apply_update(&doc, &paragraph_delta(&format!("seed{i}"), "x"))
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for i in 0..20 {
            let engine = Arc::clone(&engine);
            let doc = doc.clone();
            tasks.push(tokio::spawn(async move {
                if i % 4 == 0 {
                    engine.compact(&doc).await.map(|_| ())
                } else {
                    engine
                        .apply_update(&doc, &paragraph_delta(&format!("late{i}"), "y"))
                        .await
                        .map(|_| ())
                }
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let replayed = engine_with(store.clone());
        let state = replayed.diff(&doc, None).await.unwrap();
        let document = Document::from_state(&state).unwrap();
        let ids: Vec<String> = document.to_blocks(&doc).into_iter().map(|b| b.id).collect();
        for i in (0..20).filter(|i| i % 4 != 0) {
            assert!(ids.contains(&format!("late{i}")), "late{i} lost after compaction");
        }
        assert_eq!(ids.len(), 25);
    }

    #[tokio::test]
    async fn test_permission_denied_before_mutation() {
        let store = Arc::new(MemoryStore::new());
        let permissions = Arc::new(StaticPermissions::new());
        let doc = DocumentId::new("ep-1");
        let reader = UserId::new("reader");
        permissions.grant(&doc, &reader, Access::Read);

        let collaborators = Collaborators {
            permissions,
            initial_content: Arc::new(NoInitialContent),
            block_store: Arc::new(MemoryBlockStore::new()),
            search_index: Arc::new(MemorySearchIndex::new()),
        };
        let engine = SyncEngine::new(store.clone(), collaborators, SyncConfig::for_testing());

        assert!(engine.authorized_diff(&reader, &doc, None).await.is_ok());
        let denied = engine
            .authorized_apply(&reader, &doc, &paragraph_delta("a", "nope"))
            .await;
        assert!(matches!(
            denied,
            Err(SyncError::PermissionDenied { access: Access::Edit, .. })
        ));
        assert_eq!(store.entry_count(&doc), 0);

        let stranger = UserId::new("stranger");
        assert!(engine.authorized_diff(&stranger, &DocumentId::new("ep-1"), None).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_updates_materializes_once() {
        let store = Arc::new(MemoryStore::new());
        let blocks = Arc::new(MemoryBlockStore::new());
        let collaborators = Collaborators {
            block_store: blocks.clone(),
            ..Collaborators::in_memory()
        };
        let mut config = SyncConfig::for_testing();
        config.debounce = Duration::from_secs(1);
        let engine = SyncEngine::new(store, collaborators, config);
        let doc = DocumentId::new("ep-1");

        // 50 updates spread over 200ms.
        let replica = Document::new();
        for i in 0..50u32 {
            let delta = replica.insert_block(i, &Block::paragraph(format!("b{i}"), format!("{i}"), i));
            engine.apply_update(&doc, &delta).await.unwrap();
            tokio::time::sleep(Duration::from_millis(4)).await;
        }
        assert_eq!(engine.materializer().completed_runs(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(engine.materializer().completed_runs(), 1);
        assert_eq!(blocks.write_count(), 1);
        let stored = blocks.blocks(&doc);
        assert_eq!(stored.len(), 50);
        assert_eq!(stored[49].text, "49");
    }
}
