//! Configuration for the indexer

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Indexer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Network addressing and native token
    pub network: NetworkConfig,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Batching configuration
    pub batching: BatchingConfig,

    /// Substate configuration
    pub substates: SubstatesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/indexer"),
            service_name: "ledger-indexer".to_string(),
            network: NetworkConfig::default(),
            rocksdb: RocksDBConfig::default(),
            batching: BatchingConfig::default(),
            substates: SubstatesConfig::default(),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Resource identifier of the native token
    pub native_token_rri: String,

    /// Human readable part of account addresses
    pub account_hrp: String,

    /// Human readable part of validator addresses
    pub validator_hrp: String,

    /// Suffix of the human readable part of resource addresses
    pub resource_hrp_suffix: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            native_token_rri: "xrd_rr1qy5wfsfh".to_string(),
            account_hrp: "rdx".to_string(),
            validator_hrp: "rv".to_string(),
            resource_hrp_suffix: "_rr".to_string(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Level 0 file num compaction trigger
    pub level0_file_num_compaction_trigger: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 128,
            max_write_buffer_number: 4,
            target_file_size_mb: 128,
            max_background_jobs: 4,
            level0_file_num_compaction_trigger: 4,
            enable_statistics: false,
        }
    }
}

/// Batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Maximum transactions committed in one batch
    pub max_batch_size: usize,

    /// Capacity of the extender actor's mailbox
    pub channel_capacity: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            channel_capacity: 16,
        }
    }
}

/// Substate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubstatesConfig {
    /// Hex prefixes of identifiers which may be downed without a prior up
    pub virtual_identifier_prefixes: Vec<String>,
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("INDEXER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(rri) = std::env::var("INDEXER_NATIVE_TOKEN") {
            config.network.native_token_rri = rri;
        }

        if let Ok(size) = std::env::var("INDEXER_MAX_BATCH_SIZE") {
            config.batching.max_batch_size = size
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid INDEXER_MAX_BATCH_SIZE {}: {}", size, e)))?;
        }

        Ok(config)
    }
}
