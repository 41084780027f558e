//! Narrow interfaces to the services around the sync core.
//!
//! Permissions, initial content, block persistence and search indexing are
//! owned by the host application. The engine only talks to these traits;
//! in-memory implementations back the default server and the tests.

use async_trait::async_trait;
use quire_core::{Block, DocumentId, UserId};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::storage::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Edit,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => f.write_str("read"),
            Access::Edit => f.write_str("edit"),
        }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

impl From<StoreError> for CollaboratorError {
    fn from(e: StoreError) -> Self {
        CollaboratorError(e.to_string())
    }
}

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Changes between two materialized block sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockDiff {
    /// Created or changed blocks, in document order.
    pub upserts: Vec<Block>,
    /// Ids of blocks no longer present.
    pub deleted: Vec<String>,
}

impl BlockDiff {
    pub fn between(previous: &HashMap<String, Block>, current: &[Block]) -> Self {
        let upserts = current
            .iter()
            .filter(|block| previous.get(&block.id) != Some(*block))
            .cloned()
            .collect();

        let live: HashSet<&str> = current.iter().map(|b| b.id.as_str()).collect();
        let mut deleted: Vec<String> = previous
            .keys()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();
        deleted.sort();

        Self { upserts, deleted }
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deleted.is_empty()
    }
}

/// A block as handed to the search index.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRecord {
    pub document_id: DocumentId,
    pub block_id: String,
    pub content: String,
    pub block_type: String,
    pub order: u32,
}

impl SearchRecord {
    pub fn from_block(document_id: &DocumentId, block: &Block) -> Self {
        Self {
            document_id: document_id.clone(),
            block_id: block.id.clone(),
            content: block.text.clone(),
            block_type: block.block_type.clone(),
            order: block.order,
        }
    }
}

#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn check(
        &self,
        document_id: &DocumentId,
        user: &UserId,
        access: Access,
    ) -> CollaboratorResult<bool>;
}

/// Grants everything. Authentication happens in front of the server.
pub struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn check(&self, _: &DocumentId, _: &UserId, _: Access) -> CollaboratorResult<bool> {
        Ok(true)
    }
}

/// Explicit grant table. Edit implies read.
#[derive(Default)]
pub struct StaticPermissions {
    grants: RwLock<HashMap<(DocumentId, UserId), Access>>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, document_id: &DocumentId, user: &UserId, access: Access) {
        if let Ok(mut grants) = self.grants.write() {
            grants.insert((document_id.clone(), user.clone()), access);
        }
    }
}

#[async_trait]
impl PermissionChecker for StaticPermissions {
    async fn check(
        &self,
        document_id: &DocumentId,
        user: &UserId,
        access: Access,
    ) -> CollaboratorResult<bool> {
        let grants = self
            .grants
            .read()
            .map_err(|_| CollaboratorError("permission table poisoned".to_string()))?;
        let granted = grants.get(&(document_id.clone(), user.clone()));
        Ok(match (granted, access) {
            (Some(Access::Edit), _) => true,
            (Some(Access::Read), Access::Read) => true,
            _ => false,
        })
    }
}

/// Source of the structured content used to seed a first-time document.
#[async_trait]
pub trait InitialContentSource: Send + Sync {
    async fn initial_blocks(&self, document_id: &DocumentId) -> CollaboratorResult<Vec<Block>>;
}

/// Every document starts empty.
pub struct NoInitialContent;

#[async_trait]
impl InitialContentSource for NoInitialContent {
    async fn initial_blocks(&self, _: &DocumentId) -> CollaboratorResult<Vec<Block>> {
        Ok(Vec::new())
    }
}

/// Durable home of materialized blocks.
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn load_blocks(&self, document_id: &DocumentId) -> CollaboratorResult<Vec<Block>>;
    async fn apply(&self, document_id: &DocumentId, diff: &BlockDiff) -> CollaboratorResult<()>;
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn apply(&self, document_id: &DocumentId, diff: &BlockDiff) -> CollaboratorResult<()>;
}

/// The full set of collaborators an engine is built with.
#[derive(Clone)]
pub struct Collaborators {
    pub permissions: Arc<dyn PermissionChecker>,
    pub initial_content: Arc<dyn InitialContentSource>,
    pub block_store: Arc<dyn BlockStore>,
    pub search_index: Arc<dyn SearchIndex>,
}

impl Collaborators {
    /// Open permissions, in-memory block store (also the seed source) and
    /// in-memory search index.
    pub fn in_memory() -> Self {
        let blocks = Arc::new(MemoryBlockStore::new());
        Self {
            permissions: Arc::new(AllowAll),
            initial_content: blocks.clone(),
            block_store: blocks,
            search_index: Arc::new(MemorySearchIndex::new()),
        }
    }
}

#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<DocumentId, BTreeMap<String, Block>>>,
    writes: AtomicUsize,
    fail: AtomicBool,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store blocks directly, as the host application would before a
    /// document is first opened for live editing.
    pub fn insert_blocks(&self, document_id: &DocumentId, blocks: Vec<Block>) {
        if let Ok(mut all) = self.blocks.write() {
            let rows = all.entry(document_id.clone()).or_default();
            for block in blocks {
                rows.insert(block.id.clone(), block);
            }
        }
    }

    /// Blocks of a document ordered by `order`.
    pub fn blocks(&self, document_id: &DocumentId) -> Vec<Block> {
        let mut blocks: Vec<Block> = self
            .blocks
            .read()
            .ok()
            .and_then(|all| all.get(document_id).map(|rows| rows.values().cloned().collect()))
            .unwrap_or_default();
        blocks.sort_by_key(|b| b.order);
        blocks
    }

    /// Number of successful `apply` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn load_blocks(&self, document_id: &DocumentId) -> CollaboratorResult<Vec<Block>> {
        Ok(self.blocks(document_id))
    }

    async fn apply(&self, document_id: &DocumentId, diff: &BlockDiff) -> CollaboratorResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError("block store unavailable".to_string()));
        }
        let mut all = self
            .blocks
            .write()
            .map_err(|_| CollaboratorError("block store poisoned".to_string()))?;
        let rows = all.entry(document_id.clone()).or_default();
        for id in &diff.deleted {
            rows.remove(id);
        }
        for block in &diff.upserts {
            rows.insert(block.id.clone(), block.clone());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl InitialContentSource for MemoryBlockStore {
    async fn initial_blocks(&self, document_id: &DocumentId) -> CollaboratorResult<Vec<Block>> {
        Ok(self.blocks(document_id))
    }
}

#[derive(Default)]
pub struct MemorySearchIndex {
    records: RwLock<BTreeMap<(DocumentId, String), SearchRecord>>,
    fail: AtomicBool,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexed records of a document ordered by `order`.
    pub fn records(&self, document_id: &DocumentId) -> Vec<SearchRecord> {
        let mut records: Vec<SearchRecord> = self
            .records
            .read()
            .map(|all| {
                all.iter()
                    .filter(|((id, _), _)| id == document_id)
                    .map(|(_, record)| record.clone())
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by_key(|r| r.order);
        records
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn apply(&self, document_id: &DocumentId, diff: &BlockDiff) -> CollaboratorResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError("search index unavailable".to_string()));
        }
        let mut records = self
            .records
            .write()
            .map_err(|_| CollaboratorError("search index poisoned".to_string()))?;
        for id in &diff.deleted {
            records.remove(&(document_id.clone(), id.clone()));
        }
        for block in &diff.upserts {
            records.insert(
                (document_id.clone(), block.id.clone()),
                SearchRecord::from_block(document_id, block),
            );
        }
        Ok(())
    }
}
