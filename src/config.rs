use std::path::PathBuf;

use crate::error::Result;
use crate::errconfig;

/// Default number of index buckets when `hash_table_size` is unset.
pub const DEFAULT_HASH_TABLE_SIZE: usize = 64 * 1024;

/// Configuration for a blob backend instance.
///
/// `data` and `history` are mandatory; everything else has a working
/// default. The same options are reachable through [`BlobConfig::apply`],
/// the `{key, value}` surface the node's config-file loader drives.
#[derive(Debug, Clone)]
pub struct BlobConfig {
    /// Path of the data stream file (created if absent).
    pub data: PathBuf,

    /// Path of the history stream file (created if absent).
    pub history: PathBuf,

    /// Block alignment for data records, in bytes. Zero disables padding.
    pub data_block_size: u64,

    /// Block alignment for history records, in bytes. Zero disables padding.
    pub history_block_size: u64,

    /// Number of index buckets. Zero selects the default.
    pub hash_table_size: usize,

    /// Opaque index behavior flags. Reserved.
    pub hash_table_flags: u64,

    /// Sync frequency. Parsed and stored but not applied yet.
    pub sync: u32,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            data: PathBuf::new(),
            history: PathBuf::new(),
            data_block_size: 0,
            history_block_size: 0,
            hash_table_size: DEFAULT_HASH_TABLE_SIZE,
            hash_table_flags: 0,
            sync: 0,
        }
    }
}

impl BlobConfig {
    /// Create a new config with the given stream file paths.
    pub fn new(data: impl Into<PathBuf>, history: impl Into<PathBuf>) -> Self {
        Self {
            data: data.into(),
            history: history.into(),
            ..Default::default()
        }
    }

    /// Set the data stream block size.
    pub fn data_block_size(mut self, size: u64) -> Self {
        self.data_block_size = size;
        self
    }

    /// Set the history stream block size.
    pub fn history_block_size(mut self, size: u64) -> Self {
        self.history_block_size = size;
        self
    }

    /// Set the index bucket count.
    pub fn hash_table_size(mut self, size: usize) -> Self {
        self.hash_table_size = size;
        self
    }

    /// Set the opaque index flags.
    pub fn hash_table_flags(mut self, flags: u64) -> Self {
        self.hash_table_flags = flags;
        self
    }

    /// Applies one `key = value` pair from the node's config loader.
    /// Unknown keys and unparsable values are configuration errors.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "data" => self.data = PathBuf::from(value),
            "history" => self.history = PathBuf::from(value),
            "data_block_size" => self.data_block_size = parse_num(key, value)?,
            "history_block_size" => self.history_block_size = parse_num(key, value)?,
            "hash_table_size" => self.hash_table_size = parse_num(key, value)? as usize,
            "hash_table_flags" => self.hash_table_flags = parse_num(key, value)?,
            "sync" => self.sync = parse_num(key, value)? as u32,
            _ => return errconfig!("unknown option '{}'", key),
        }
        Ok(())
    }

    /// Effective bucket count for the index.
    pub fn buckets(&self) -> usize {
        if self.hash_table_size == 0 {
            DEFAULT_HASH_TABLE_SIZE
        } else {
            self.hash_table_size
        }
    }
}

fn parse_num(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|e| crate::Error::Config(format!("option '{}': {}", key, e)))
}
