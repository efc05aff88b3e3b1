//! Chunk store error types

use slatefs_common::BlockId;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Chunk store error
#[derive(Error, Debug)]
pub enum ChunkError {
    /// Invalid caller input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Write or read past the end of a chunk
    #[error("Offset {offset} + length {length} exceeds chunk size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    /// Rejected configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Object storage reported a non-retryable failure
    #[error("Storage error: {0}")]
    Storage(#[from] slatefs_common::Error),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A remote call did not finish in time
    #[error("{op} of block {block} timed out after {timeout:?}")]
    Timeout {
        op: &'static str,
        block: BlockId,
        timeout: Duration,
    },

    /// Transient failures exhausted the retry budget
    #[error("{op} of block {block} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        op: &'static str,
        block: BlockId,
        attempts: u32,
        #[source]
        source: slatefs_common::Error,
    },

    /// Stored bytes failed checksum or size verification
    #[error("Block {block} corrupted: {reason}")]
    Corrupted { block: BlockId, reason: String },

    /// Cache directory cannot take more data
    #[error("Cache full: {0}")]
    CacheFull(String),

    /// Compression or decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Slice id allocation or metadata command failure
    #[error("Metadata error: {0}")]
    Meta(String),

    /// Write-back uploads that failed definitively
    #[error("{failed} block uploads failed")]
    UploadFailed { failed: usize },

    /// The store has been closed
    #[error("Chunk store is closed")]
    Closed,

    /// Error shared between all waiters of a deduplicated task
    #[error(transparent)]
    Shared(Arc<ChunkError>),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChunkError {
    /// Check whether the underlying failure is a missing object
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Storage(e) | Self::RetriesExhausted { source: e, .. } => e.is_not_found(),
            Self::Shared(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Check whether the failure is a checksum or size mismatch
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Corrupted { .. } => true,
            Self::Storage(e) => e.is_corruption(),
            Self::Shared(e) => e.is_corruption(),
            _ => false,
        }
    }
}

impl From<Arc<Self>> for ChunkError {
    fn from(err: Arc<Self>) -> Self {
        match Arc::try_unwrap(err) {
            Ok(err) => err,
            Err(shared) => Self::Shared(shared),
        }
    }
}

/// Result type for chunk store operations
pub type ChunkResult<T> = Result<T, ChunkError>;
