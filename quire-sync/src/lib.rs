//! # quire-sync: document synchronization engine
//!
//! Keeps one replicated document per writable unit consistent across
//! concurrently editing clients, persists it durably and derives queryable
//! blocks from it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket / HTTP   ┌────────────────┐
//! │ SyncClient  │ ◄──────────────────► │ RealtimeServer │──► RoomManager (fan-out)
//! │ (replicas)  │    bincode frames    │ http::router   │
//! └─────────────┘                      └───────┬────────┘
//!                                              ▼
//!                                       ┌─────────────┐      ┌───────────────────┐
//!                                       │ SyncEngine  │ ───► │ BlockMaterializer │──► BlockStore
//!                                       └──────┬──────┘      │ (debounced)       │──► SearchIndex
//!                                              ▼             └───────────────────┘
//!                                     ┌──────────────────┐
//!                                     │ DocumentRegistry │ ◄── CompactionScheduler
//!                                     └────────┬─────────┘
//!                                              ▼
//!                              SnapshotStore + UpdateLogStore (RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`storage`]: snapshot and update log stores (RocksDB, in-memory)
//! - [`registry`]: live document cache and per-document critical section
//! - [`engine`]: diff / apply / compact
//! - [`materializer`]: debounced `Document -> Block[]` with diffing upserts
//! - [`scheduler`]: periodic compaction sweep
//! - [`protocol`], [`broadcast`], [`server`], [`http`]: realtime port
//! - [`client`]: WebSocket client with local replicas

pub mod broadcast;
pub mod client;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod materializer;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod storage;

pub use broadcast::{BroadcastGroup, PeerInfo, RoomEvent, RoomManager};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use collaborators::{
    Access, AllowAll, BlockDiff, BlockStore, CollaboratorError, Collaborators,
    InitialContentSource, MemoryBlockStore, MemorySearchIndex, NoInitialContent,
    PermissionChecker, SearchIndex, SearchRecord, StaticPermissions,
};
pub use config::SyncConfig;
pub use engine::{AppliedUpdate, CompactionOutcome, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use http::{router, HttpState};
pub use materializer::BlockMaterializer;
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use registry::DocumentRegistry;
pub use scheduler::{CompactionScheduler, SchedulerHandle, SweepReport};
pub use server::{RealtimeServer, USER_HEADER};
pub use storage::{
    DocumentStore, MemoryStore, RocksStore, Snapshot, SnapshotStore, StoreConfig, StoreError,
    UpdateLogEntry, UpdateLogStore,
};
