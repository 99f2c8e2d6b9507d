//! Engine configuration.
//!
//! All tunables are explicit struct fields passed to constructors — there
//! is no global state. [`Config::new`] supplies the defaults; callers
//! override fields before handing the config to
//! [`Engine::open`](crate::engine::Engine::open), which validates it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Size in bytes of the SSTable footer (four zero-padded varints).
pub const SST_FOOTER_SIZE: usize = 40;

/// Size in bytes of the CRC trailer after each compressed block.
pub const SST_BLOCK_TRAILER_SIZE: usize = 4;

/// Default interval between prefix-compression restart points.
pub const SST_RESTART_INTERVAL: usize = 16;

/// Errors raised by [`Config::validate`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `max_level` must be at least 1.
    #[error("max_level must be >= 1, got {0}")]
    InvalidMaxLevel(usize),

    /// `sst_size` must be positive.
    #[error("sst_size must be > 0")]
    InvalidSstSize,

    /// `sst_data_block_size` must be positive.
    #[error("sst_data_block_size must be > 0")]
    InvalidDataBlockSize,

    /// `memtable_size` must be positive.
    #[error("memtable_size must be > 0")]
    InvalidMemtableSize,
}

/// Configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for SSTables; WAL segments live under `dir/log/`.
    pub dir: PathBuf,

    /// Number of levels in the LSM tree.
    pub max_level: usize,

    /// Base SSTable size; level `L` holds up to `sst_size · 10^(L+1)` bytes.
    pub sst_size: usize,

    /// Target plaintext size of one data block.
    pub sst_data_block_size: usize,

    /// Records between prefix-compression restart points.
    pub sst_restart_interval: usize,

    /// Bloom filter budget in bits per key.
    pub bloom_bits_per_key: usize,

    /// Memtable byte budget before a freeze is forced.
    pub memtable_size: usize,

    /// Interval of the timer that freezes a still-writable memtable.
    pub flush_period: Duration,

    /// Number of level-0 SSTables that triggers a level-0 compaction.
    pub level0_compact_threshold: usize,

    /// Make WAL replay corruption fatal instead of reported-and-skipped.
    pub wal_strict: bool,

    /// Verify WAL chunk checksums during replay.
    pub wal_checksum: bool,
}

impl Config {
    /// Creates a configuration with default tunables rooted at `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            max_level: 7,
            sst_size: 4096 * 1024,
            sst_data_block_size: 16 * 1024,
            sst_restart_interval: SST_RESTART_INTERVAL,
            bloom_bits_per_key: 10,
            memtable_size: 4 * 1024 * 1024,
            flush_period: Duration::from_secs(30),
            level0_compact_threshold: 4,
            wal_strict: false,
            wal_checksum: true,
        }
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_level < 1 {
            return Err(ConfigError::InvalidMaxLevel(self.max_level));
        }
        if self.sst_size == 0 {
            return Err(ConfigError::InvalidSstSize);
        }
        if self.sst_data_block_size == 0 {
            return Err(ConfigError::InvalidDataBlockSize);
        }
        if self.memtable_size == 0 {
            return Err(ConfigError::InvalidMemtableSize);
        }
        Ok(())
    }

    /// Directory holding WAL segments.
    pub fn log_dir(&self) -> PathBuf {
        self.dir.join("log")
    }

    /// Byte budget of level `level`: `sst_size · 10^(level+1)`.
    pub fn level_size_limit(&self, level: usize) -> u64 {
        let exp = (level + 1).min(18) as u32;
        self.sst_size as u64 * 10u64.pow(exp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::new("/tmp/db").validate().is_ok());
    }

    #[test]
    fn invalid_fields_rejected() {
        let mut c = Config::new("/tmp/db");
        c.max_level = 0;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::InvalidMaxLevel(0))
        ));

        let mut c = Config::new("/tmp/db");
        c.sst_size = 0;
        assert!(matches!(c.validate(), Err(ConfigError::InvalidSstSize)));
    }

    #[test]
    fn level_budgets_grow_by_decade() {
        let c = Config::new("/tmp/db");
        assert_eq!(c.level_size_limit(0), c.sst_size as u64 * 10);
        assert_eq!(c.level_size_limit(1), c.sst_size as u64 * 100);
    }
}
