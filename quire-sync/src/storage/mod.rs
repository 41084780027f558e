//! Durable state for synchronized documents.
//!
//! ```text
//! ┌──────────────┐  append / entries_after   ┌────────────────┐
//! │ SyncEngine   │ ────────────────────────► │ UpdateLogStore │  (doc, seq) → delta
//! │ (registry)   │                           └────────────────┘
//! │              │  save / load snapshot     ┌────────────────┐
//! │              │ ────────────────────────► │ SnapshotStore  │  doc → full state
//! └──────────────┘                           └────────────────┘
//! ```
//!
//! Replaying the snapshot followed by every log entry with a greater
//! sequence number reconstructs the live document. Both stores are
//! synchronous; backends are [`RocksStore`] and [`MemoryStore`].

use quire_core::DocumentId;
use std::time::SystemTime;
use thiserror::Error;

pub mod memory;
pub mod record;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A log entry could not be decoded or failed its checksum.
    #[error("corrupt update log entry at seq {seq}: {reason}")]
    Corrupt { seq: u64, reason: String },
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Latest full-state encoding of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub document_id: DocumentId,
    pub data: Vec<u8>,
    /// Highest update log sequence folded into `data`.
    pub covered_seq: u64,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// One delta applied to a document since its last snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateLogEntry {
    pub document_id: DocumentId,
    pub seq: u64,
    pub data: Vec<u8>,
    /// Milliseconds since the Unix epoch.
    pub recorded_at: u64,
}

/// At most one snapshot per document; saving replaces the previous one.
pub trait SnapshotStore: Send + Sync {
    fn load_snapshot(&self, document_id: &DocumentId) -> StoreResult<Option<Snapshot>>;
    fn save_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()>;
}

/// Append-only per-document delta log keyed by `(document, seq)`.
pub trait UpdateLogStore: Send + Sync {
    fn append(&self, entry: &UpdateLogEntry) -> StoreResult<()>;

    /// Entries with `seq > after`, ascending. A corrupt entry fails the
    /// whole read with [`StoreError::Corrupt`].
    fn entries_after(&self, document_id: &DocumentId, after: u64)
        -> StoreResult<Vec<UpdateLogEntry>>;

    fn remove_entry(&self, document_id: &DocumentId, seq: u64) -> StoreResult<()>;

    /// Delete entries with `seq <= through`. Returns how many were removed.
    fn truncate_through(&self, document_id: &DocumentId, through: u64) -> StoreResult<u64>;

    /// Documents that currently have at least one log entry.
    fn documents(&self) -> StoreResult<Vec<DocumentId>>;
}

/// Both halves of the persistence layer behind one handle.
pub trait DocumentStore: SnapshotStore + UpdateLogStore {}

impl<T: SnapshotStore + UpdateLogStore> DocumentStore for T {}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
