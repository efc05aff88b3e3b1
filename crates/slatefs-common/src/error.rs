//! Error types for SlateFS
//!
//! This module defines the error type object storage adapters report to the
//! chunk store. The classification helpers decide what the upload and
//! download pipelines retry.

use thiserror::Error;

/// Common result type for SlateFS storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for SlateFS
#[derive(Debug, Error)]
pub enum Error {
    // Local errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("insufficient disk space: required {required} bytes, available {available} bytes")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    // Object storage errors
    #[error("object not found: {key}")]
    ObjectNotFound { key: String },

    #[error("invalid range {offset}+{length} for object {key} of {size} bytes")]
    InvalidRange {
        key: String,
        offset: u64,
        length: u64,
        size: u64,
    },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Network errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an object-not-found error
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::ObjectNotFound { key: key.into() }
    }

    /// Check if this is a transient error worth retrying
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::ServiceUnavailable(_) | Self::ConnectionFailed(_) => true,
            Self::DiskIo(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ObjectNotFound { .. } => true,
            Self::DiskIo(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if this error means the stored bytes cannot be trusted
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. } | Self::DataCorruption(_))
    }
}
