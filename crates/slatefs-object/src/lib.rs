//! SlateFS Object - Object storage adapters
//!
//! The chunk store only ever talks to remote storage through the
//! [`ObjectStorage`] capability. Backends are expected to have variable
//! latency and occasional transient failures; they report those through
//! [`slatefs_common::Error`] so callers can classify them with
//! `is_retryable()` / `is_not_found()`.
//!
//! Backends in this crate:
//! - [`MemStorage`]: in-process map, used by tests and benchmarks
//! - [`LocalStorage`]: one file per key under a root directory
//! - [`FlakyStorage`]: wraps another backend and injects faults and latency

pub mod flaky;
pub mod local;
pub mod mem;

pub use flaky::{FaultKind, FlakyStorage};
pub use local::LocalStorage;
pub use mem::MemStorage;

use async_trait::async_trait;
use bytes::Bytes;
use slatefs_common::Result;

/// Remote object storage capability consumed by the chunk store
///
/// There are no transactional guarantees across keys.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Store `data` under `key`, replacing any previous object
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Read `length` bytes starting at `offset`, or to the end of the object
    /// when `length` is `None`
    async fn get(&self, key: &str, offset: u64, length: Option<u64>) -> Result<Bytes>;

    /// Remove the object; a missing key reports `ObjectNotFound`
    async fn delete(&self, key: &str) -> Result<()>;

    /// List keys starting with `prefix`, in lexical order
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Size of the object in bytes
    async fn head(&self, key: &str) -> Result<u64>;
}

/// Resolve a requested range against an object of `size` bytes
pub(crate) fn resolve_range(
    key: &str,
    size: u64,
    offset: u64,
    length: Option<u64>,
) -> Result<std::ops::Range<usize>> {
    let end = match length {
        Some(len) => offset.checked_add(len),
        None => Some(size),
    };
    match end {
        Some(end) if offset <= end && end <= size => {
            let start = usize::try_from(offset).map_err(|_| overflow(key))?;
            let end = usize::try_from(end).map_err(|_| overflow(key))?;
            Ok(start..end)
        }
        _ => Err(slatefs_common::Error::InvalidRange {
            key: key.to_string(),
            offset,
            length: length.unwrap_or(0),
            size,
        }),
    }
}

fn overflow(key: &str) -> slatefs_common::Error {
    slatefs_common::Error::invalid_argument(format!("range of {key} does not fit in memory"))
}
