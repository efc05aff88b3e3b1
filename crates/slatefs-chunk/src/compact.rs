//! Compaction of fragmented chunks
//!
//! A compaction walks `Collecting → Merging → Uploading → Retiring → Done`.
//! Any failure before `Retiring` aborts with the inputs untouched, so the
//! old slices stay readable until a merged slice is durable and installed.
//! Compactions of the same chunk run one at a time; a second request waits
//! for the first.

use crate::error::{ChunkError, ChunkResult};
use crate::store::CachedStore;
use bytes::Bytes;
use dashmap::DashMap;
use slatefs_common::{ChunkId, Slice, SliceId};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Steps of one compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionState {
    /// Reading the bytes of the input slices
    Collecting,
    /// Building the merged slice
    Merging,
    /// Making the merged slice durable
    Uploading,
    /// Deleting the superseded slices
    Retiring,
    Done,
}

impl fmt::Display for CompactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Collecting => "collecting",
            Self::Merging => "merging",
            Self::Uploading => "uploading",
            Self::Retiring => "retiring",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

struct Compaction {
    chunk_id: ChunkId,
    state: CompactionState,
}

impl Compaction {
    const fn new(chunk_id: ChunkId) -> Self {
        Self {
            chunk_id,
            state: CompactionState::Collecting,
        }
    }

    fn advance(&mut self, next: CompactionState) {
        debug!(chunk_id = self.chunk_id, from = %self.state, to = %next, "compaction step");
        self.state = next;
    }
}

/// Runs compactions, serialised per chunk
#[derive(Default)]
pub struct Compactor {
    locks: DashMap<ChunkId, Arc<Mutex<()>>>,
}

impl Compactor {
    /// Merge `inputs` of `chunk_id` into one new slice
    ///
    /// Returns `None` without touching any object when none of the inputs is
    /// live, as when a command is retried after it already succeeded. Inputs
    /// unknown to a tracked chunk are left alone.
    pub async fn compact(
        &self,
        store: &CachedStore,
        chunk_id: ChunkId,
        inputs: &[Slice],
    ) -> ChunkResult<Option<Slice>> {
        if inputs.is_empty() {
            return Err(ChunkError::InvalidArgument("nothing to compact".into()));
        }
        if let Some(stray) = inputs.iter().find(|s| s.chunk_id != chunk_id) {
            return Err(ChunkError::InvalidArgument(format!(
                "{stray} does not belong to chunk {chunk_id}"
            )));
        }

        let lock = Arc::clone(self.locks.entry(chunk_id).or_default().value());
        let guard = lock.lock().await;
        let result = self.run(store, chunk_id, inputs).await;
        drop(guard);
        self.locks
            .remove_if(&chunk_id, |_, l| Arc::strong_count(l) == 2);

        if let Err(e) = &result {
            store
                .metrics
                .compaction_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(chunk_id, inputs = inputs.len(), "compaction aborted: {e}");
        }
        result
    }

    async fn run(
        &self,
        store: &CachedStore,
        chunk_id: ChunkId,
        inputs: &[Slice],
    ) -> ChunkResult<Option<Slice>> {
        let mut job = Compaction::new(chunk_id);
        if !store.is_tracked(chunk_id) {
            store.attach(chunk_id, inputs.to_vec())?;
        }
        let ids: Vec<SliceId> = inputs.iter().map(|s| s.id).collect();
        let live = store.live_slices(chunk_id, &ids);
        if live.is_empty() {
            // Either retired by an earlier run or never seen here; only the
            // metadata engine may decide they are garbage
            debug!(chunk_id, "no compaction input is live, nothing to do");
            return Ok(None);
        }
        let live_ids: Vec<SliceId> = live.iter().map(|s| s.id).collect();

        let start = live.iter().map(|s| u64::from(s.pos)).min().unwrap_or(0);
        let end = live.iter().map(Slice::end).max().unwrap_or(start);
        let new_id = store.allocator.next_slice_id().await?;
        let layers = store.compaction_layers(chunk_id, &live_ids, new_id);
        let data = store
            .downloader
            .read_view(&layers, start, end - start, false)
            .await?;

        job.advance(CompactionState::Merging);
        let size = u32::try_from(data.len())
            .map_err(|_| ChunkError::Internal(format!("compacted slice of {} bytes", data.len())))?;
        let pos = u32::try_from(start)
            .map_err(|_| ChunkError::Internal(format!("compacted slice at {start}")))?;
        let merged = Slice::new(new_id, chunk_id, pos, size);
        let data = Bytes::from(data);

        job.advance(CompactionState::Uploading);
        let block_size = store.config.block_size;
        let mut blocks = Vec::new();
        for block in merged.blocks(block_size) {
            let from = block.object_offset(block_size) as usize;
            let bytes = data.slice(from..from + block.size as usize);
            if let Err(e) = store.cache.stage(&block, &bytes).await {
                store.metrics.stage_failures.fetch_add(1, Ordering::Relaxed);
                debug!(%block, "compacted block not staged: {e}");
            }
            blocks.push((block, Some(bytes)));
        }
        let block_ids = blocks.iter().map(|(block, _)| *block).collect::<Vec<_>>();
        if let Err(e) = store.uploader.upload(blocks).await {
            store.discard_blocks(block_ids).await;
            return Err(e);
        }
        if !store.install_compacted(chunk_id, &live_ids, merged) {
            // Every input was removed while we were merging
            store.discard_blocks(block_ids).await;
            return Ok(None);
        }

        job.advance(CompactionState::Retiring);
        retire(store, &live).await;
        job.advance(CompactionState::Done);
        store.metrics.compactions.fetch_add(1, Ordering::Relaxed);
        info!(
            chunk_id,
            merged = merged.id,
            inputs = live.len(),
            bytes = size,
            "compacted chunk"
        );
        Ok(Some(merged))
    }
}

/// Delete superseded slices; failures leave garbage for a later delete
async fn retire(store: &CachedStore, slices: &[Slice]) {
    for slice in slices {
        if let Err(e) = store.remove(slice.id, slice.size).await {
            warn!(slice_id = slice.id, "failed to retire compacted slice: {e}");
        }
    }
}
