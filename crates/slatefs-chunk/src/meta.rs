//! Metadata engine interface
//!
//! The metadata engine owns slice identity and liveness. The chunk store
//! consumes slice ids through [`SliceIdAllocator`] and receives deletion
//! and compaction requests as typed [`MetaCommand`]s through
//! [`MetaCommandHandler`]. Failures travel back to the sender, which
//! retries on its own schedule.

use crate::error::{ChunkError, ChunkResult};
use async_trait::async_trait;
use slatefs_common::{ChunkId, Slice, SliceId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Source of slice ids
#[async_trait]
pub trait SliceIdAllocator: Send + Sync {
    /// A slice id never handed out before
    async fn next_slice_id(&self) -> ChunkResult<SliceId>;
}

/// Process-local allocator counting up from a starting id
#[derive(Debug)]
pub struct LocalIdAllocator {
    next: AtomicU64,
}

impl LocalIdAllocator {
    #[must_use]
    pub const fn new(first: SliceId) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for LocalIdAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl SliceIdAllocator for LocalIdAllocator {
    async fn next_slice_id(&self) -> ChunkResult<SliceId> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        if id == SliceId::MAX {
            return Err(ChunkError::Meta("slice id space exhausted".into()));
        }
        Ok(id)
    }
}

/// Commands the metadata engine sends to the chunk store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaCommand {
    /// Delete every block of a slice's object series
    DeleteChunk { slice_id: SliceId, size: u32 },
    /// Merge slices of one chunk into a single new slice
    CompactChunk { slices: Vec<Slice>, chunk_id: ChunkId },
}

impl MetaCommand {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::DeleteChunk { .. } => "delete_chunk",
            Self::CompactChunk { .. } => "compact_chunk",
        }
    }
}

/// Successful outcome of a [`MetaCommand`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaReply {
    Deleted,
    /// The compacted slice, or `None` when every input was already retired
    Compacted(Option<Slice>),
}

/// Receiver side of metadata commands
#[async_trait]
pub trait MetaCommandHandler: Send + Sync {
    async fn handle(&self, command: MetaCommand) -> ChunkResult<MetaReply>;
}

type Request = (MetaCommand, oneshot::Sender<ChunkResult<MetaReply>>);

/// Sending half of a metadata command channel
#[derive(Debug, Clone)]
pub struct MetaClient {
    tx: mpsc::Sender<Request>,
}

impl MetaClient {
    /// Send a command and wait for its outcome
    pub async fn send(&self, command: MetaCommand) -> ChunkResult<MetaReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((command, reply_tx))
            .await
            .map_err(|_| ChunkError::Closed)?;
        reply_rx.await.map_err(|_| ChunkError::Closed)?
    }
}

/// Serve commands from a channel of `capacity` until every client is gone
///
/// Each command runs on its own task, so a slow compaction does not hold
/// up deletions.
pub fn serve_commands(
    handler: Arc<dyn MetaCommandHandler>,
    capacity: usize,
) -> (MetaClient, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Request>(capacity.max(1));
    let handle = tokio::spawn(async move {
        while let Some((command, reply)) = rx.recv().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let name = command.name();
                let result = handler.handle(command).await;
                if let Err(e) = &result {
                    warn!(command = name, "metadata command failed: {e}");
                }
                if reply.send(result).is_err() {
                    debug!(command = name, "metadata command sender went away");
                }
            });
        }
        debug!("metadata command channel closed");
    });
    (MetaClient { tx }, handle)
}
