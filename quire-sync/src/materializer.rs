//! Debounced derivation of block rows from live documents.
//!
//! ```text
//! apply_update ──► schedule(doc) ──► [abort previous timer] ──► sleep(debounce)
//!                                                                   │
//!                       BlockStore ◄── diff vs baseline ◄── to_blocks()
//!                       SearchIndex ◄──┘
//! ```
//!
//! Each new update for a document cancels its pending timer and starts a
//! fresh one, so a burst of edits produces one run after the burst ends.
//! Runs diff against the last set that was written successfully, so a failed
//! run is repaired by the next one.

use log::{debug, info, warn};
use quire_core::{Block, DocumentId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::collaborators::{BlockDiff, BlockStore, SearchIndex};
use crate::error::SyncResult;
use crate::registry::DocumentRegistry;

struct PendingRun {
    generation: u64,
    handle: JoinHandle<()>,
}

type Baseline = Arc<Mutex<Option<HashMap<String, Block>>>>;

pub struct BlockMaterializer {
    registry: Arc<DocumentRegistry>,
    block_store: Arc<dyn BlockStore>,
    search_index: Arc<dyn SearchIndex>,
    debounce: Duration,
    pending: StdMutex<HashMap<DocumentId, PendingRun>>,
    /// Runs past their timer, still writing.
    running: StdMutex<HashMap<DocumentId, PendingRun>>,
    baselines: StdMutex<HashMap<DocumentId, Baseline>>,
    generation: AtomicU64,
    completed_runs: AtomicU64,
}

impl BlockMaterializer {
    pub fn new(
        registry: Arc<DocumentRegistry>,
        block_store: Arc<dyn BlockStore>,
        search_index: Arc<dyn SearchIndex>,
        debounce: Duration,
    ) -> Self {
        Self {
            registry,
            block_store,
            search_index,
            debounce,
            pending: StdMutex::new(HashMap::new()),
            running: StdMutex::new(HashMap::new()),
            baselines: StdMutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            completed_runs: AtomicU64::new(0),
        }
    }

    /// (Re)start the debounce timer for a document. Never blocks.
    pub fn schedule(self: &Arc<Self>, document_id: &DocumentId) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let Ok(mut pending) = self.pending.lock() else {
            warn!("Materializer pending table poisoned; skipping {}", document_id);
            return;
        };
        if let Some(previous) = pending.remove(document_id) {
            previous.handle.abort();
        }

        let this = Arc::clone(self);
        let id = document_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(this.debounce).await;
            if !this.claim(&id, generation) {
                return;
            }
            if let Err(e) = this.materialize(&id).await {
                warn!("Materialization of {} failed: {}", id, e);
            }
            this.finish(&id, generation);
        });
        pending.insert(document_id.clone(), PendingRun { generation, handle: task });
    }

    /// Take ownership of the pending run if it is still the latest one.
    fn claim(&self, document_id: &DocumentId, generation: u64) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        match pending.get(document_id) {
            Some(run) if run.generation == generation => {
                if let (Some(run), Ok(mut running)) = (pending.remove(document_id), self.running.lock()) {
                    running.insert(document_id.clone(), run);
                }
                true
            }
            _ => false,
        }
    }

    fn finish(&self, document_id: &DocumentId, generation: u64) {
        if let Ok(mut running) = self.running.lock() {
            if running.get(document_id).is_some_and(|run| run.generation == generation) {
                running.remove(document_id);
            }
        }
    }

    /// Cancel every pending timer and materialize those documents now,
    /// after waiting for runs already in flight. Returns how many documents
    /// were flushed.
    ///
    /// Once this returns no timer task holds a reference to the materializer.
    pub async fn flush(&self) -> usize {
        let (pending, running) = {
            let (Ok(mut pending), Ok(mut running)) = (self.pending.lock(), self.running.lock()) else {
                warn!("Materializer tables poisoned; nothing flushed");
                return 0;
            };
            let pending: Vec<(DocumentId, PendingRun)> = pending.drain().collect();
            let running: Vec<PendingRun> = running.drain().map(|(_, run)| run).collect();
            (pending, running)
        };

        for run in running {
            let _ = run.handle.await;
        }
        let flushed = pending.len();
        for (document_id, run) in pending {
            run.handle.abort();
            let _ = run.handle.await;
            if let Err(e) = self.materialize(&document_id).await {
                warn!("Materialization of {} failed during flush: {}", document_id, e);
            }
        }
        if flushed > 0 {
            debug!("Flushed {} pending materializations", flushed);
        }
        flushed
    }

    fn baseline(&self, document_id: &DocumentId) -> Baseline {
        match self.baselines.lock() {
            Ok(mut baselines) => Arc::clone(baselines.entry(document_id.clone()).or_default()),
            Err(_) => Arc::new(Mutex::new(None)),
        }
    }

    /// Drop the baselines of unloaded documents. Documents with a timer
    /// pending or a run in flight keep theirs; the next run of a dropped
    /// document reseeds from the block store.
    pub fn forget(&self, document_ids: &[DocumentId]) -> usize {
        let (Ok(pending), Ok(running), Ok(mut baselines)) =
            (self.pending.lock(), self.running.lock(), self.baselines.lock())
        else {
            return 0;
        };
        let mut forgotten = 0;
        for document_id in document_ids {
            if pending.contains_key(document_id) || running.contains_key(document_id) {
                continue;
            }
            let idle = baselines
                .get(document_id)
                .is_some_and(|cell| Arc::strong_count(cell) == 1);
            if idle {
                baselines.remove(document_id);
                forgotten += 1;
            }
        }
        forgotten
    }

    /// Derive blocks from the current document and write the changes.
    ///
    /// Returns the diff that was written, or `None` when nothing changed.
    pub async fn materialize(&self, document_id: &DocumentId) -> SyncResult<Option<BlockDiff>> {
        let cell = self.baseline(document_id);
        let mut baseline = cell.lock().await;

        let blocks = {
            let slot = self.registry.lock(document_id).await?;
            slot.document.to_blocks(document_id)
        };
        self.completed_runs.fetch_add(1, Ordering::SeqCst);

        let previous = match baseline.take() {
            Some(previous) => previous,
            None => self
                .block_store
                .load_blocks(document_id)
                .await?
                .into_iter()
                .map(|b| (b.id.clone(), b))
                .collect(),
        };

        let diff = BlockDiff::between(&previous, &blocks);
        if diff.is_empty() {
            debug!("Blocks of {} unchanged", document_id);
            *baseline = Some(previous);
            return Ok(None);
        }

        let written = async {
            self.block_store.apply(document_id, &diff).await?;
            self.search_index.apply(document_id, &diff).await
        }
        .await;
        if let Err(e) = written {
            *baseline = Some(previous);
            return Err(e.into());
        }

        info!(
            "Materialized {}: {} blocks upserted, {} deleted",
            document_id,
            diff.upserts.len(),
            diff.deleted.len()
        );
        *baseline = Some(blocks.into_iter().map(|b| (b.id.clone(), b)).collect());
        Ok(Some(diff))
    }

    /// Number of materialization runs that reached the document.
    pub fn completed_runs(&self) -> u64 {
        self.completed_runs.load(Ordering::SeqCst)
    }

    /// Documents with a timer still pending.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Documents with a cached baseline.
    pub fn baseline_count(&self) -> usize {
        self.baselines.lock().map(|b| b.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MemoryBlockStore, MemorySearchIndex, NoInitialContent};
    use crate::storage::MemoryStore;

    struct Fixture {
        registry: Arc<DocumentRegistry>,
        blocks: Arc<MemoryBlockStore>,
        search: Arc<MemorySearchIndex>,
        materializer: Arc<BlockMaterializer>,
    }

    fn fixture(debounce: Duration) -> Fixture {
        let registry = Arc::new(DocumentRegistry::new(
            Arc::new(MemoryStore::new()),
            Arc::new(NoInitialContent),
        ));
        let blocks = Arc::new(MemoryBlockStore::new());
        let search = Arc::new(MemorySearchIndex::new());
        let materializer = Arc::new(BlockMaterializer::new(
            registry.clone(),
            blocks.clone(),
            search.clone(),
            debounce,
        ));
        Fixture { registry, blocks, search, materializer }
    }

    async fn insert(registry: &DocumentRegistry, doc: &DocumentId, block: Block) {
        let slot = registry.lock(doc).await.unwrap();
        slot.document.insert_block(u32::MAX, &block);
    }

    #[tokio::test]
    async fn test_materialize_writes_store_and_index() {
        let f = fixture(Duration::from_secs(1));
        let doc = DocumentId::new("ep-1");
        insert(&f.registry, &doc, Block::paragraph("a", "Hello", 0)).await;

        let diff = f.materializer.materialize(&doc).await.unwrap().unwrap();
        assert_eq!(diff.upserts.len(), 1);
        assert_eq!(f.blocks.blocks(&doc)[0].text, "Hello");
        assert_eq!(f.search.records(&doc)[0].block_id, "a");

        // Nothing changed since: no writes.
        assert!(f.materializer.materialize(&doc).await.unwrap().is_none());
        assert_eq!(f.blocks.write_count(), 1);
    }

    #[tokio::test]
    async fn test_removed_blocks_are_deleted() {
        let f = fixture(Duration::from_secs(1));
        let doc = DocumentId::new("ep-1");
        insert(&f.registry, &doc, Block::paragraph("a", "one", 0)).await;
        insert(&f.registry, &doc, Block::paragraph("b", "two", 1)).await;
        f.materializer.materialize(&doc).await.unwrap();

        {
            let slot = f.registry.lock(&doc).await.unwrap();
            slot.document.remove_block(0);
        }
        let diff = f.materializer.materialize(&doc).await.unwrap().unwrap();
        assert_eq!(diff.deleted, vec!["a".to_string()]);
        assert_eq!(f.search.records(&doc).len(), 1);
        assert_eq!(f.blocks.blocks(&doc)[0].order, 0);
    }

    #[tokio::test]
    async fn test_duplicate_block_ids_settle_after_one_run() {
        let f = fixture(Duration::from_secs(1));
        let doc = DocumentId::new("ep-1");
        insert(&f.registry, &doc, Block::paragraph("same", "local", 0)).await;
        let remote = quire_core::Document::new().insert_block(0, &Block::paragraph("same", "remote", 0));
        {
            let slot = f.registry.lock(&doc).await.unwrap();
            slot.document.apply_update(&remote).unwrap();
        }

        let diff = f.materializer.materialize(&doc).await.unwrap().unwrap();
        assert_eq!(diff.upserts.len(), 2);
        assert_eq!(f.blocks.blocks(&doc).len(), 2);
        assert!(f.materializer.materialize(&doc).await.unwrap().is_none());
        assert_eq!(f.blocks.write_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_next_run() {
        let f = fixture(Duration::from_secs(1));
        let doc = DocumentId::new("ep-1");
        insert(&f.registry, &doc, Block::paragraph("a", "Hello", 0)).await;

        f.search.set_failing(true);
        assert!(f.materializer.materialize(&doc).await.is_err());
        assert!(f.search.records(&doc).is_empty());

        f.search.set_failing(false);
        let diff = f.materializer.materialize(&doc).await.unwrap().unwrap();
        assert_eq!(diff.upserts.len(), 1);
        assert_eq!(f.search.records(&doc).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_run() {
        let f = fixture(Duration::from_secs(1));
        let doc = DocumentId::new("ep-1");

        for i in 0..20u32 {
            insert(&f.registry, &doc, Block::paragraph(format!("b{i}"), "x", i)).await;
            f.materializer.schedule(&doc);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.materializer.completed_runs(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.materializer.completed_runs(), 1);
        assert_eq!(f.blocks.blocks(&doc).len(), 20);
        assert_eq!(f.materializer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_runs_pending_documents_immediately() {
        let f = fixture(Duration::from_secs(3600));
        let doc = DocumentId::new("ep-1");
        insert(&f.registry, &doc, Block::paragraph("a", "Hello", 0)).await;
        f.materializer.schedule(&doc);
        assert_eq!(f.materializer.pending_count(), 1);

        assert_eq!(f.materializer.flush().await, 1);
        assert_eq!(f.materializer.pending_count(), 0);
        assert_eq!(f.materializer.completed_runs(), 1);
        assert_eq!(f.blocks.blocks(&doc)[0].text, "Hello");
        // The only remaining reference is the fixture's.
        assert_eq!(Arc::strong_count(&f.materializer), 1);
        assert_eq!(f.materializer.flush().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_drops_idle_baselines_only() {
        let f = fixture(Duration::from_secs(3600));
        let idle = DocumentId::new("idle");
        let waiting = DocumentId::new("waiting");
        insert(&f.registry, &idle, Block::paragraph("a", "one", 0)).await;
        insert(&f.registry, &waiting, Block::paragraph("b", "two", 0)).await;
        f.materializer.materialize(&idle).await.unwrap();
        f.materializer.materialize(&waiting).await.unwrap();
        f.materializer.schedule(&waiting);
        assert_eq!(f.materializer.baseline_count(), 2);

        let forgotten = f.materializer.forget(&[idle.clone(), waiting.clone()]);
        assert_eq!(forgotten, 1);
        assert_eq!(f.materializer.baseline_count(), 1);

        // Reseeded from the block store, so an unchanged document writes nothing.
        assert!(f.materializer.materialize(&idle).await.unwrap().is_none());
        assert_eq!(f.blocks.write_count(), 2);
        f.materializer.flush().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_documents_fire_independently() {
        let f = fixture(Duration::from_millis(500));
        let a = DocumentId::new("a");
        let b = DocumentId::new("b");
        insert(&f.registry, &a, Block::paragraph("x", "1", 0)).await;
        insert(&f.registry, &b, Block::paragraph("y", "2", 0)).await;

        f.materializer.schedule(&a);
        f.materializer.schedule(&b);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(f.materializer.completed_runs(), 2);
        assert_eq!(f.blocks.blocks(&a).len(), 1);
        assert_eq!(f.blocks.blocks(&b).len(), 1);
    }
}
