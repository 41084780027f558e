//! Server configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) is valid:
//!
//! ```toml
//! ws_bind = "0.0.0.0:9000"
//! http_bind = "0.0.0.0:9001"
//! data_path = "quire_data"
//!
//! [sync]
//! debounce_ms = 1000
//! compaction_interval_secs = 60
//! idle_eviction_secs = 600
//! broadcast_capacity = 256
//!
//! [store]
//! sync_writes = true
//! ```

use anyhow::{Context, Result};
use quire_sync::{StoreConfig, SyncConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub ws_bind: String,
    pub http_bind: String,
    pub data_path: PathBuf,
    pub sync: SyncSection,
    pub store: StoreSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_bind: "0.0.0.0:9000".to_string(),
            http_bind: "0.0.0.0:9001".to_string(),
            data_path: PathBuf::from("quire_data"),
            sync: SyncSection::default(),
            store: StoreSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSection {
    pub debounce_ms: u64,
    pub compaction_interval_secs: u64,
    pub idle_eviction_secs: u64,
    pub broadcast_capacity: usize,
}

impl Default for SyncSection {
    fn default() -> Self {
        let defaults = SyncConfig::default();
        Self {
            debounce_ms: defaults.debounce.as_millis() as u64,
            compaction_interval_secs: defaults.compaction_interval.as_secs(),
            idle_eviction_secs: defaults.idle_eviction.as_secs(),
            broadcast_capacity: defaults.broadcast_capacity,
        }
    }
}

/// RocksDB tuning; sizes in bytes.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    pub sync_writes: bool,
    pub max_open_files: i32,
    pub write_buffer_size: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        let defaults = StoreConfig::default();
        Self {
            block_cache_size: defaults.block_cache_size,
            bloom_filter_bits: defaults.bloom_filter_bits,
            sync_writes: defaults.sync_writes,
            max_open_files: defaults.max_open_files,
            write_buffer_size: defaults.write_buffer_size,
        }
    }
}

impl ServerConfig {
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("invalid server configuration")
    }

    /// Load from `path`, or defaults when no path was given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("in {}", path.display()))
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            debounce: Duration::from_millis(self.sync.debounce_ms),
            compaction_interval: Duration::from_secs(self.sync.compaction_interval_secs.max(1)),
            idle_eviction: Duration::from_secs(self.sync.idle_eviction_secs),
            broadcast_capacity: self.sync.broadcast_capacity.max(1),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.data_path.clone(),
            block_cache_size: self.store.block_cache_size,
            bloom_filter_bits: self.store.bloom_filter_bits,
            sync_writes: self.store.sync_writes,
            max_open_files: self.store.max_open_files,
            write_buffer_size: self.store.write_buffer_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config = ServerConfig::from_toml("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.sync_config().debounce, Duration::from_secs(1));
        assert_eq!(config.sync_config().compaction_interval, Duration::from_secs(60));
        assert!(config.store_config().sync_writes);
    }

    #[test]
    fn test_partial_sections_override_defaults() {
        let config = ServerConfig::from_toml(
            r#"
            ws_bind = "127.0.0.1:7000"
            data_path = "/var/lib/quire"

            [sync]
            debounce_ms = 250

            [store]
            sync_writes = false
            "#,
        )
        .unwrap();

        assert_eq!(config.ws_bind, "127.0.0.1:7000");
        assert_eq!(config.http_bind, "0.0.0.0:9001");
        let sync = config.sync_config();
        assert_eq!(sync.debounce, Duration::from_millis(250));
        assert_eq!(sync.idle_eviction, Duration::from_secs(600));
        let store = config.store_config();
        assert_eq!(store.path, PathBuf::from("/var/lib/quire"));
        assert!(!store.sync_writes);
        assert_eq!(store.max_open_files, 512);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(ServerConfig::from_toml("debounce = 5").is_err());
        assert!(ServerConfig::from_toml("[sync]\ndebounce_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "http_bind = \"127.0.0.1:8081\"").unwrap();
        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.http_bind, "127.0.0.1:8081");

        assert_eq!(ServerConfig::load(None).unwrap(), ServerConfig::default());
        assert!(ServerConfig::load(Some(Path::new("/nonexistent/quire.toml"))).is_err());
    }
}
