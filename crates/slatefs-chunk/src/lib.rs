#![allow(clippy::result_large_err)]
//! SlateFS Chunk Store
//!
//! The data path of SlateFS. File writes land in per-chunk buffers, are
//! sealed into immutable slices and cut into fixed-size blocks stored as
//! objects in remote storage. A local cache keeps recently used blocks and
//! every block not yet durable remotely.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐      ┌─────────────────────┐
//! │     POSIX layer      │      │  Metadata engine    │
//! │ write / read / flush │      │ DeleteChunk/Compact │
//! └──────────┬───────────┘      └──────────┬──────────┘
//!            │                             │ MetaCommand
//! ┌──────────▼─────────────────────────────▼──────────┐
//! │                  CachedStore                      │
//! │  WriteBuffer · SliceTable · Compactor             │
//! └─────┬──────────────────┬──────────────────┬───────┘
//!       │                  │                  │
//! ┌─────▼──────┐   ┌───────▼───────┐   ┌──────▼───────┐
//! │  Uploader  │   │ CacheManager  │   │  Downloader  │
//! │ (retry,    │──►│ staging/clean │◄──│ (priority,   │
//! │  delay)    │   │ LRU, pools    │   │  prefetch)   │
//! └─────┬──────┘   └───────────────┘   └──────┬───────┘
//!       │                                      │
//! ┌─────▼──────────────────────────────────────▼──────┐
//! │            ObjectStorage (remote)                 │
//! └───────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod compact;
pub mod compress;
pub mod config;
pub mod download;
pub mod error;
pub mod limiter;
pub mod meta;
pub mod metrics;
pub mod retry;
pub mod slice;
pub mod store;
pub mod upload;

pub use cache::{Admission, BlockState, CacheManager, CacheStats};
pub use compact::{CompactionState, Compactor};
pub use compress::Compression;
pub use config::{CacheDir, ChunkConfig};
pub use download::{Downloader, Priority, PriorityPool};
pub use error::{ChunkError, ChunkResult};
pub use limiter::TokenBucket;
pub use meta::{
    LocalIdAllocator, MetaClient, MetaCommand, MetaCommandHandler, MetaReply, SliceIdAllocator,
    serve_commands,
};
pub use metrics::{LatencyHistogram, PrometheusExporter, StoreGauges, StoreMetrics};
pub use retry::RetryPolicy;
pub use slice::{Precedence, SliceTable, WriteBuffer};
pub use store::CachedStore;
pub use upload::Uploader;
