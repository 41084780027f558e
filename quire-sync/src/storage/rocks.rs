//! RocksDB-backed persistent store.
//!
//! Column families:
//! - `snapshots`: latest full state per document, keyed by document id
//! - `updates`: update log, keyed by `<u16 id len><id><u64 BE seq>`
//! - `blocks`: materialized blocks (JSON), keyed by `<u16 id len><id><block id>`
//!
//! Values in `snapshots` and `updates` use the checksummed record format
//! from [`super::record`]. The length prefix keeps one document's keys from
//! interleaving with another's whose id shares a prefix.

use async_trait::async_trait;
use quire_core::{Block, DocumentId};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::record::{decode_entry, decode_snapshot, encode_entry, encode_snapshot};
use super::{Snapshot, SnapshotStore, StoreError, StoreResult, UpdateLogEntry, UpdateLogStore};
use crate::collaborators::{
    BlockDiff, BlockStore, CollaboratorError, CollaboratorResult, InitialContentSource,
};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";
const CF_BLOCKS: &str = "blocks";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_UPDATES, CF_BLOCKS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true, the log is the durability boundary)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches and no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// RocksDB-backed snapshot store, update log and block store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Payloads are already LZ4-compressed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_BLOCKS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> StoreResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// `<u16 BE len><id bytes>`
    fn document_prefix(document_id: &DocumentId) -> StoreResult<Vec<u8>> {
        let id = document_id.as_str().as_bytes();
        let len = u16::try_from(id.len()).map_err(|_| {
            StoreError::InvalidKey(format!("document id is {} bytes long", id.len()))
        })?;
        let mut key = Vec::with_capacity(2 + id.len() + 8);
        key.extend_from_slice(&len.to_be_bytes());
        key.extend_from_slice(id);
        Ok(key)
    }

    fn update_key(document_id: &DocumentId, seq: u64) -> StoreResult<Vec<u8>> {
        let mut key = Self::document_prefix(document_id)?;
        key.extend_from_slice(&seq.to_be_bytes());
        Ok(key)
    }

    /// Split an update key into document id and seq.
    fn parse_update_key(key: &[u8]) -> Option<(DocumentId, u64)> {
        if key.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([key[0], key[1]]) as usize;
        if key.len() != 2 + len + 8 {
            return None;
        }
        let id = std::str::from_utf8(&key[2..2 + len]).ok()?;
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&key[2 + len..]);
        Some((DocumentId::new(id), u64::from_be_bytes(seq)))
    }

    fn block_key(document_id: &DocumentId, block_id: &str) -> StoreResult<Vec<u8>> {
        let mut key = Self::document_prefix(document_id)?;
        key.extend_from_slice(block_id.as_bytes());
        Ok(key)
    }

    /// Materialized blocks of a document ordered by `order`.
    pub fn load_block_rows(&self, document_id: &DocumentId) -> StoreResult<Vec<Block>> {
        let cf = self.cf(CF_BLOCKS)?;
        let prefix = Self::document_prefix(document_id)?;

        let mut blocks = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let block: Block = serde_json::from_slice(&value)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            blocks.push(block);
        }
        blocks.sort_by_key(|b| b.order);
        Ok(blocks)
    }

    /// Upsert and delete block rows in one batch.
    pub fn write_block_rows(&self, document_id: &DocumentId, diff: &BlockDiff) -> StoreResult<()> {
        let cf = self.cf(CF_BLOCKS)?;
        let mut batch = WriteBatch::default();
        for id in &diff.deleted {
            batch.delete_cf(cf, Self::block_key(document_id, id)?);
        }
        for block in &diff.upserts {
            let value = serde_json::to_vec(block)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            batch.put_cf(cf, Self::block_key(document_id, &block.id)?, value);
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }
}

impl SnapshotStore for RocksStore {
    fn load_snapshot(&self, document_id: &DocumentId) -> StoreResult<Option<Snapshot>> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, document_id.as_str().as_bytes())? {
            Some(bytes) => decode_snapshot(document_id, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let bytes = encode_snapshot(snapshot)?;
        self.db.put_cf_opt(
            cf,
            snapshot.document_id.as_str().as_bytes(),
            bytes,
            &self.write_options(),
        )?;
        Ok(())
    }
}

impl UpdateLogStore for RocksStore {
    fn append(&self, entry: &UpdateLogEntry) -> StoreResult<()> {
        let cf = self.cf(CF_UPDATES)?;
        let bytes = encode_entry(entry)?;
        self.db.put_cf_opt(
            cf,
            Self::update_key(&entry.document_id, entry.seq)?,
            bytes,
            &self.write_options(),
        )?;
        Ok(())
    }

    fn entries_after(&self, document_id: &DocumentId, after: u64) -> StoreResult<Vec<UpdateLogEntry>> {
        if after == u64::MAX {
            return Ok(Vec::new());
        }
        let cf = self.cf(CF_UPDATES)?;
        let prefix = Self::document_prefix(document_id)?;
        let start = Self::update_key(document_id, after + 1)?;

        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let Some((_, seq)) = Self::parse_update_key(&key) else {
                break;
            };
            entries.push(decode_entry(document_id, seq, &value)?);
        }
        Ok(entries)
    }

    fn remove_entry(&self, document_id: &DocumentId, seq: u64) -> StoreResult<()> {
        let cf = self.cf(CF_UPDATES)?;
        self.db
            .delete_cf_opt(cf, Self::update_key(document_id, seq)?, &self.write_options())?;
        Ok(())
    }

    fn truncate_through(&self, document_id: &DocumentId, through: u64) -> StoreResult<u64> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = Self::document_prefix(document_id)?;
        let start = Self::update_key(document_id, 0)?;

        let mut count = 0u64;
        let mut batch = WriteBatch::default();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            match Self::parse_update_key(&key) {
                Some((_, seq)) if seq <= through => {
                    batch.delete_cf(cf, &key);
                    count += 1;
                }
                _ => break,
            }
        }

        if count > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(count)
    }

    fn documents(&self) -> StoreResult<Vec<DocumentId>> {
        let cf = self.cf(CF_UPDATES)?;
        let mut ids = BTreeSet::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some((id, _)) = Self::parse_update_key(&key) {
                ids.insert(id);
            }
        }
        Ok(ids.into_iter().collect())
    }
}

#[async_trait]
impl BlockStore for RocksStore {
    async fn load_blocks(&self, document_id: &DocumentId) -> CollaboratorResult<Vec<Block>> {
        self.load_block_rows(document_id).map_err(CollaboratorError::from)
    }

    async fn apply(&self, document_id: &DocumentId, diff: &BlockDiff) -> CollaboratorResult<()> {
        self.write_block_rows(document_id, diff)
            .map_err(CollaboratorError::from)
    }
}

#[async_trait]
impl InitialContentSource for RocksStore {
    async fn initial_blocks(&self, document_id: &DocumentId) -> CollaboratorResult<Vec<Block>> {
        self.load_block_rows(document_id).map_err(CollaboratorError::from)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
