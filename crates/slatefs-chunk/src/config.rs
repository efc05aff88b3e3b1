//! Chunk store configuration

use crate::compress::Compression;
use crate::error::{ChunkError, ChunkResult};
use crate::slice::Precedence;
use serde::{Deserialize, Serialize};
use slatefs_common::{CHUNK_SIZE, DEFAULT_BLOCK_SIZE};
use std::path::PathBuf;
use std::time::Duration;

/// Where cached blocks live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheDir {
    /// In-process memory pool
    Memory,
    /// One independent capacity pool per directory
    Disk(Vec<PathBuf>),
}

impl CacheDir {
    /// Parse a `:`-separated directory list, or `memory`
    #[must_use]
    pub fn from_path_list(list: &str) -> Self {
        if list == "memory" {
            return Self::Memory;
        }
        let dirs = list
            .split(':')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(PathBuf::from)
            .collect();
        Self::Disk(dirs)
    }

    /// Number of capacity pools
    #[must_use]
    pub fn pools(&self) -> usize {
        match self {
            Self::Memory => 1,
            Self::Disk(dirs) => dirs.len(),
        }
    }
}

impl Default for CacheDir {
    fn default() -> Self {
        Self::Disk(vec![PathBuf::from("/var/slatefsCache")])
    }
}

/// Chunk store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Size of one remote block in bytes
    pub block_size: u32,
    /// Block compression
    pub compress: Compression,

    /// Timeout of one download attempt
    pub get_timeout_secs: u64,
    /// Timeout of one upload attempt
    pub put_timeout_secs: u64,
    /// Attempts per remote call before giving up
    pub io_retries: u32,
    /// First backoff delay between attempts
    pub retry_delay_ms: u64,
    /// Backoff cap
    pub retry_max_delay_ms: u64,

    /// Concurrent uploads
    pub max_upload: usize,
    /// Concurrent downloads, direct reads and prefetch combined
    pub max_download: usize,
    /// Concurrent remote deletions
    pub max_deletes: usize,

    /// Acknowledge flushes before blocks are durable
    pub writeback: bool,
    /// Delay before a write-back block is uploaded
    pub upload_delay_ms: u64,
    /// Blocks to prefetch after a read
    pub prefetch: usize,
    /// Bytes of unflushed write data held in memory
    pub buffer_size: u64,
    /// Upload bandwidth in bytes per second (0 = unlimited)
    pub upload_limit: u64,
    /// Download bandwidth in bytes per second (0 = unlimited)
    pub download_limit: u64,

    /// Cache location
    pub cache_dir: CacheDir,
    /// Cache capacity in bytes, split evenly across pools
    pub cache_size: u64,
    /// Minimum free ratio kept on each cache disk
    pub free_space: f32,
    /// Mode bits of cached block files
    pub cache_mode: u32,
    /// Admit blocks read in full (otherwise only partial reads are cached)
    pub cache_full_block: bool,
    /// Create missing cache directories
    pub auto_create: bool,
    /// Interval of the background free-space check
    pub cache_check_interval_ms: u64,

    /// Overlap resolution between slices of a chunk
    pub precedence: Precedence,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            compress: Compression::None,
            get_timeout_secs: 60,
            put_timeout_secs: 60,
            io_retries: 30,
            retry_delay_ms: 100,
            retry_max_delay_ms: 10_000,
            max_upload: 20,
            max_download: 20,
            max_deletes: 2,
            writeback: false,
            upload_delay_ms: 0,
            prefetch: 1,
            buffer_size: 300 << 20,
            upload_limit: 0,
            download_limit: 0,
            cache_dir: CacheDir::default(),
            cache_size: 100 << 30,
            free_space: 0.1,
            cache_mode: 0o600,
            cache_full_block: true,
            auto_create: true,
            cache_check_interval_ms: 1_000,
            precedence: Precedence::CommitOrder,
        }
    }
}

impl ChunkConfig {
    /// Check the configuration for values the store cannot run with
    pub fn validate(&self) -> ChunkResult<()> {
        if self.block_size < 4096 || u64::from(self.block_size) > CHUNK_SIZE {
            return Err(ChunkError::Config(format!(
                "block_size must be between 4 KiB and {CHUNK_SIZE} bytes, got {}",
                self.block_size
            )));
        }
        if self.max_upload == 0 || self.max_download == 0 || self.max_deletes == 0 {
            return Err(ChunkError::Config(
                "max_upload, max_download and max_deletes must be positive".into(),
            ));
        }
        if self.buffer_size < u64::from(self.block_size) {
            return Err(ChunkError::Config(format!(
                "buffer_size {} is smaller than block_size {}",
                self.buffer_size, self.block_size
            )));
        }
        if u32::try_from(self.buffer_size).is_err() {
            return Err(ChunkError::Config(format!(
                "buffer_size {} is too large",
                self.buffer_size
            )));
        }
        if !(0.0..1.0).contains(&self.free_space) {
            return Err(ChunkError::Config(format!(
                "free_space must be in [0, 1), got {}",
                self.free_space
            )));
        }
        if matches!(&self.cache_dir, CacheDir::Disk(dirs) if dirs.is_empty()) {
            return Err(ChunkError::Config("no cache directory configured".into()));
        }
        Ok(())
    }

    /// Timeout of one download attempt
    #[must_use]
    pub const fn get_timeout(&self) -> Duration {
        Duration::from_secs(self.get_timeout_secs)
    }

    /// Timeout of one upload attempt
    #[must_use]
    pub const fn put_timeout(&self) -> Duration {
        Duration::from_secs(self.put_timeout_secs)
    }

    /// Write-back upload delay (zero outside write-back mode)
    #[must_use]
    pub const fn upload_delay(&self) -> Duration {
        if self.writeback {
            Duration::from_millis(self.upload_delay_ms)
        } else {
            Duration::ZERO
        }
    }

    /// Interval of the background free-space check
    #[must_use]
    pub const fn cache_check_interval(&self) -> Duration {
        Duration::from_millis(self.cache_check_interval_ms)
    }

    /// Capacity of a single cache pool
    #[must_use]
    pub fn pool_budget(&self) -> u64 {
        self.cache_size / self.cache_dir.pools().max(1) as u64
    }
}
