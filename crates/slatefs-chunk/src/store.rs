//! Cached chunk store
//!
//! The façade the POSIX layer calls. Each open chunk has a write buffer of
//! unsealed slices and a table of sealed ones:
//!
//! ```text
//! write ──► WriteBuffer ──flush──► blocks ──stage──► cache (staging)
//!                                     │
//!                                     └──► Uploader ──► object storage
//!                                                   └─► cache (clean)
//! read  ◄── WriteBuffer overlay ◄── SliceTable view ◄── cache / Downloader
//! ```
//!
//! Buffered bytes count against a `buffer_size` budget. A write that finds
//! the budget exhausted seals its own chunk first, then the largest other
//! buffers, and waits only for seals already under way.

use crate::cache::{Admission, CacheManager, CacheStats};
use crate::compact::Compactor;
use crate::config::ChunkConfig;
use crate::download::{Downloader, Priority};
use crate::error::{ChunkError, ChunkResult};
use crate::meta::{MetaCommand, MetaCommandHandler, MetaReply, SliceIdAllocator};
use crate::metrics::{PrometheusExporter, StoreGauges, StoreMetrics};
use crate::retry::RetryPolicy;
use crate::slice::{PendingSlice, SliceTable, WriteBuffer};
use crate::upload::Uploader;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use slatefs_common::{BlockId, CHUNK_SIZE, ChunkId, Slice, SliceId};
use slatefs_object::ObjectStorage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, Semaphore, TryAcquireError, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct ChunkBuffer {
    buffer: WriteBuffer,
    /// Budget bytes held by `buffer`
    reserved: u64,
    /// Slices sealed outside `flush`, reported by the next `flush`
    sealed: Vec<Slice>,
}

/// Cached chunk store
pub struct CachedStore {
    pub(crate) config: ChunkConfig,
    storage: Arc<dyn ObjectStorage>,
    pub(crate) allocator: Arc<dyn SliceIdAllocator>,
    pub(crate) metrics: Arc<StoreMetrics>,
    pub(crate) cache: Arc<CacheManager>,
    pub(crate) uploader: Arc<Uploader>,
    pub(crate) downloader: Arc<Downloader>,
    compactor: Compactor,
    retry: RetryPolicy,
    buffers: DashMap<ChunkId, Arc<Mutex<ChunkBuffer>>>,
    tables: DashMap<ChunkId, SliceTable>,
    /// Chunk each tracked slice belongs to
    owners: DashMap<SliceId, ChunkId>,
    budget: Semaphore,
    buffered: AtomicU64,
    deletes: Semaphore,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl CachedStore {
    /// Open a store: validate the configuration, open the cache, resubmit
    /// blocks left in staging and start the background tasks
    pub async fn open(
        config: ChunkConfig,
        storage: Arc<dyn ObjectStorage>,
        allocator: Arc<dyn SliceIdAllocator>,
        metrics: Arc<StoreMetrics>,
    ) -> ChunkResult<Self> {
        config.validate()?;
        let (cache, staged) = CacheManager::open(&config, Arc::clone(&metrics)).await?;
        let uploader = Uploader::new(
            &config,
            Arc::clone(&storage),
            Arc::clone(&cache),
            Arc::clone(&metrics),
        );
        let downloader = Downloader::new(
            &config,
            Arc::clone(&storage),
            Arc::clone(&cache),
            Arc::clone(&uploader),
            Arc::clone(&metrics),
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            uploader.spawn_scheduler(shutdown_rx.clone()),
            cache.spawn_maintenance(config.cache_check_interval(), shutdown_rx),
        ];

        if !staged.is_empty() {
            info!(blocks = staged.len(), "re-uploading blocks left in staging");
            metrics
                .recovered_blocks
                .fetch_add(staged.len() as u64, Ordering::Relaxed);
            for block in staged {
                uploader.schedule(block, None);
            }
        }

        info!(
            storage = storage.name(),
            block_size = config.block_size,
            compress = ?config.compress,
            writeback = config.writeback,
            buffer_size = config.buffer_size,
            "chunk store opened"
        );

        Ok(Self {
            retry: RetryPolicy::from_config(&config),
            budget: Semaphore::new(config.buffer_size as usize),
            deletes: Semaphore::new(config.max_deletes),
            config,
            storage,
            allocator,
            metrics,
            cache,
            uploader,
            downloader,
            compactor: Compactor::default(),
            buffers: DashMap::new(),
            tables: DashMap::new(),
            owners: DashMap::new(),
            buffered: AtomicU64::new(0),
            shutdown,
            tasks: parking_lot::Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> ChunkResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChunkError::Closed);
        }
        Ok(())
    }

    fn check_range(offset: u64, len: u64) -> ChunkResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= CHUNK_SIZE => Ok(()),
            _ => Err(ChunkError::OutOfBounds {
                offset,
                length: len,
                size: CHUNK_SIZE,
            }),
        }
    }

    fn chunk_buffer(&self, chunk_id: ChunkId) -> Arc<Mutex<ChunkBuffer>> {
        Arc::clone(self.buffers.entry(chunk_id).or_default().value())
    }

    fn release_budget(&self, bytes: u64) {
        if bytes > 0 {
            self.budget.add_permits(bytes as usize);
        }
    }

    /// Buffer `data` at `offset` of a chunk
    ///
    /// Once a chunk buffers a full block its buffer is sealed; in
    /// synchronous mode that waits for the upload.
    pub async fn write(&self, chunk_id: ChunkId, offset: u64, data: &[u8]) -> ChunkResult<()> {
        self.check_open()?;
        if data.is_empty() {
            return Err(ChunkError::InvalidArgument("empty write".into()));
        }
        let len = data.len() as u64;
        Self::check_range(offset, len)?;
        if len > self.config.buffer_size {
            return Err(ChunkError::InvalidArgument(format!(
                "write of {len} bytes exceeds the buffer budget of {}",
                self.config.buffer_size
            )));
        }
        let permits = u32::try_from(len)
            .map_err(|_| ChunkError::InvalidArgument(format!("write of {len} bytes")))?;
        self.reserve(chunk_id, permits).await?;

        let chunk = self.chunk_buffer(chunk_id);
        let mut state = chunk.lock().await;
        // `check_range` bounds the offset by the chunk size
        let growth = state.buffer.write(offset as u32, data);
        state.reserved += growth;
        self.release_budget(len - growth);
        self.buffered.fetch_add(growth, Ordering::Relaxed);
        self.metrics.writes.fetch_add(1, Ordering::Relaxed);
        self.metrics.write_bytes.fetch_add(len, Ordering::Relaxed);

        if state.buffer.bytes() >= u64::from(self.config.block_size) {
            let sealed = self.seal(chunk_id, &mut state).await?;
            state.sealed.extend(sealed);
        }
        Ok(())
    }

    fn try_reserve(&self, bytes: u32) -> ChunkResult<bool> {
        match self.budget.try_acquire_many(bytes) {
            Ok(permit) => {
                permit.forget();
                Ok(true)
            }
            Err(TryAcquireError::Closed) => Err(ChunkError::Closed),
            Err(TryAcquireError::NoPermits) => Ok(false),
        }
    }

    /// Take `bytes` of buffer budget
    ///
    /// When the budget is exhausted this chunk's buffer is sealed first,
    /// then other chunks' buffers, largest first, until enough is free.
    async fn reserve(&self, chunk_id: ChunkId, bytes: u32) -> ChunkResult<()> {
        if self.try_reserve(bytes)? {
            return Ok(());
        }
        self.metrics.backpressure.fetch_add(1, Ordering::Relaxed);
        debug!(chunk_id, bytes, "write buffer budget exhausted");

        if let Some(chunk) = self.buffers.get(&chunk_id).map(|e| Arc::clone(e.value())) {
            let mut state = chunk.lock().await;
            let sealed = self.seal(chunk_id, &mut state).await?;
            state.sealed.extend(sealed);
        }
        if self.try_reserve(bytes)? {
            return Ok(());
        }

        let mut others: Vec<(ChunkId, u64, Arc<Mutex<ChunkBuffer>>)> = self
            .buffers
            .iter()
            .filter(|e| *e.key() != chunk_id)
            .map(|e| {
                // A locked buffer is being sealed or written; rank it last
                let held = e.value().try_lock().map_or(0, |s| s.reserved);
                (*e.key(), held, Arc::clone(e.value()))
            })
            .collect();
        others.sort_by(|a, b| b.1.cmp(&a.1));
        for (other, _, chunk) in others {
            let mut state = chunk.lock().await;
            match self.seal(other, &mut state).await {
                Ok(sealed) => state.sealed.extend(sealed),
                Err(e) => warn!(chunk_id = other, "failed to seal buffer under pressure: {e}"),
            }
            drop(state);
            if self.try_reserve(bytes)? {
                return Ok(());
            }
        }

        self.budget
            .acquire_many(bytes)
            .await
            .map_err(|_| ChunkError::Closed)?
            .forget();
        Ok(())
    }

    /// Seal every buffered write of a chunk into slices and hand their
    /// blocks to the upload pipeline
    ///
    /// Returns the slices sealed since the previous flush. In synchronous
    /// mode this waits until they are durable.
    pub async fn flush(&self, chunk_id: ChunkId) -> ChunkResult<Vec<Slice>> {
        self.check_open()?;
        self.flush_chunk(chunk_id).await
    }

    async fn flush_chunk(&self, chunk_id: ChunkId) -> ChunkResult<Vec<Slice>> {
        let Some(chunk) = self.buffers.get(&chunk_id).map(|e| Arc::clone(e.value())) else {
            return Ok(Vec::new());
        };
        let mut state = chunk.lock().await;
        let sealed = self.seal(chunk_id, &mut state).await?;
        let mut slices = std::mem::take(&mut state.sealed);
        slices.extend(sealed);
        drop(state);

        self.buffers.remove_if(&chunk_id, |_, buffer| {
            Arc::strong_count(buffer) == 2
                && buffer
                    .try_lock()
                    .is_ok_and(|s| s.buffer.is_empty() && s.sealed.is_empty())
        });
        Ok(slices)
    }

    /// Seal the pending writes of a locked chunk buffer
    ///
    /// The buffer stays locked until the new slices are in the chunk table,
    /// so a reader always finds the bytes in one place or the other. On
    /// failure the pending writes are put back.
    async fn seal(&self, chunk_id: ChunkId, state: &mut ChunkBuffer) -> ChunkResult<Vec<Slice>> {
        let pending = state.buffer.take();
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let reserved = std::mem::take(&mut state.reserved);

        let mut ids = Vec::with_capacity(pending.len());
        for _ in 0..pending.len() {
            match self.allocator.next_slice_id().await {
                Ok(id) => ids.push(id),
                Err(e) => {
                    state.buffer.restore(pending);
                    state.reserved = reserved;
                    return Err(e);
                }
            }
        }

        let slices: Vec<Slice> = ids
            .iter()
            .zip(&pending)
            .map(|(&id, p)| Slice::new(id, chunk_id, p.pos, p.data.len() as u32))
            .collect();
        let objects: Vec<Bytes> = pending.into_iter().map(|p| Bytes::from(p.data)).collect();

        let block_size = self.config.block_size;
        let mut blocks = Vec::new();
        for (slice, object) in slices.iter().zip(&objects) {
            for block in slice.blocks(block_size) {
                let start = block.object_offset(block_size) as usize;
                let data = object.slice(start..start + block.size as usize);
                let staged = match self.cache.stage(&block, &data).await {
                    Ok(()) => true,
                    Err(e) => {
                        self.metrics.stage_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(%block, "staging failed, uploading from memory: {e}");
                        false
                    }
                };
                blocks.push((block, data, staged));
            }
        }
        self.install(chunk_id, &slices);
        self.metrics.flushes.fetch_add(1, Ordering::Relaxed);

        // Write-back only waits for blocks that have no local copy
        let direct: Vec<(BlockId, Option<Bytes>)> = blocks
            .iter()
            .filter(|(_, _, staged)| !self.config.writeback || !staged)
            .map(|(block, data, _)| (*block, Some(data.clone())))
            .collect();
        if !direct.is_empty() {
            if let Err(e) = self.uploader.upload(direct).await {
                error!(chunk_id, slices = slices.len(), "flush failed: {e}");
                self.uninstall(chunk_id, &slices);
                self.discard_blocks(blocks.iter().map(|(block, _, _)| *block).collect())
                    .await;
                let restored = slices
                    .iter()
                    .zip(objects)
                    .map(|(slice, object)| PendingSlice {
                        pos: slice.pos,
                        data: object.to_vec(),
                    })
                    .collect();
                state.buffer.restore(restored);
                state.reserved = reserved;
                return Err(e);
            }
        }
        if self.config.writeback {
            for (block, _, staged) in &blocks {
                if *staged {
                    self.uploader.schedule(*block, None);
                }
            }
        }

        self.release_budget(reserved);
        self.buffered.fetch_sub(reserved, Ordering::Relaxed);
        debug!(chunk_id, slices = slices.len(), blocks = blocks.len(), "sealed chunk buffer");
        Ok(slices)
    }

    fn install(&self, chunk_id: ChunkId, slices: &[Slice]) {
        let mut table = self.tables.entry(chunk_id).or_default();
        for slice in slices {
            table.push(*slice, self.config.precedence);
            self.owners.insert(slice.id, chunk_id);
        }
    }

    fn uninstall(&self, chunk_id: ChunkId, slices: &[Slice]) {
        if let Some(mut table) = self.tables.get_mut(&chunk_id) {
            for slice in slices {
                table.remove(slice.id);
            }
        }
        for slice in slices {
            self.owners.remove(&slice.id);
        }
    }

    /// Drop blocks that never became part of a committed slice
    pub(crate) async fn discard_blocks(&self, blocks: Vec<BlockId>) {
        if let Err(e) = self.delete_blocks(&blocks).await {
            warn!(blocks = blocks.len(), "failed to discard uploaded blocks: {e}");
        }
    }

    /// Delete blocks locally and remotely, bounded by `max_deletes`
    ///
    /// A delayed upload is cancelled and a running one is waited for, so a
    /// late put cannot bring a block back. Missing objects are not an error.
    async fn delete_blocks(&self, blocks: &[BlockId]) -> ChunkResult<()> {
        for block in blocks {
            self.uploader.cancel(block);
            self.uploader.wait_inflight(block).await;
            self.cache.invalidate(block).await;
        }

        let _permit = self.deletes.acquire().await.map_err(|_| ChunkError::Closed)?;
        let timeout = self.config.put_timeout();
        for &block in blocks {
            let key = block.key();
            // Deletes share the upload retry counter
            let result = self
                .retry
                .run("delete", block, timeout, &self.metrics.put.retries, || {
                    self.storage.delete(&key)
                })
                .await;
            match result {
                Ok(()) => {
                    self.metrics.deletions.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(%block, "delete failed: {e}");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Read `len` bytes at `offset` of a chunk
    ///
    /// Unsealed writes shadow sealed slices; bytes no slice covers read as
    /// zeros.
    pub async fn read(&self, chunk_id: ChunkId, offset: u64, len: u64) -> ChunkResult<Bytes> {
        self.check_open()?;
        if len == 0 {
            return Ok(Bytes::new());
        }
        Self::check_range(offset, len)?;
        let start = std::time::Instant::now();

        let mut retried = false;
        let (mut out, pending) = loop {
            let (pending, layers, generation) = self.snapshot(chunk_id, offset, len).await;
            match self.downloader.read_view(&layers, offset, len, true).await {
                Ok(out) => break (out, pending),
                // A slice may have been compacted away under us
                Err(e) if e.is_not_found() && !retried && self.generation(chunk_id) != generation => {
                    debug!(chunk_id, offset, len, "slice table changed during read, retrying");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        };
        for (pos, bytes) in pending {
            let at = (pos - offset) as usize;
            out[at..at + bytes.len()].copy_from_slice(&bytes);
        }

        self.metrics.reads.fetch_add(1, Ordering::Relaxed);
        self.metrics.read_bytes.fetch_add(len, Ordering::Relaxed);
        self.metrics.read_latency.record_since(start);
        Ok(Bytes::from(out))
    }

    /// Unsealed writes and sealed slices of a chunk as of one instant
    ///
    /// Sealing holds the buffer lock until its slices are installed, so
    /// both halves are taken under that lock.
    async fn snapshot(
        &self,
        chunk_id: ChunkId,
        offset: u64,
        len: u64,
    ) -> (Vec<(u64, Vec<u8>)>, Vec<Slice>, Option<u64>) {
        let buffer = self.buffers.get(&chunk_id).map(|e| Arc::clone(e.value()));
        match buffer {
            Some(chunk) => {
                let state = chunk.lock().await;
                let pending = state.buffer.overlapping(offset, len);
                let (layers, generation) = self.table_view(chunk_id);
                (pending, layers, generation)
            }
            None => {
                let (layers, generation) = self.table_view(chunk_id);
                (Vec::new(), layers, generation)
            }
        }
    }

    fn table_view(&self, chunk_id: ChunkId) -> (Vec<Slice>, Option<u64>) {
        self.tables
            .get(&chunk_id)
            .map_or_else(|| (Vec::new(), None), |t| (t.slices().to_vec(), Some(t.generation())))
    }

    fn generation(&self, chunk_id: ChunkId) -> Option<u64> {
        self.tables.get(&chunk_id).map(|t| t.generation())
    }

    /// Install the slice list the metadata engine holds for a chunk
    pub fn attach(&self, chunk_id: ChunkId, slices: Vec<Slice>) -> ChunkResult<()> {
        for slice in &slices {
            if slice.chunk_id != chunk_id {
                return Err(ChunkError::InvalidArgument(format!(
                    "{slice} does not belong to chunk {chunk_id}"
                )));
            }
            if slice.len == 0
                || u64::from(slice.off) + u64::from(slice.len) > u64::from(slice.size)
                || slice.end() > CHUNK_SIZE
            {
                return Err(ChunkError::InvalidArgument(format!("malformed {slice}")));
            }
        }

        let previous: Vec<SliceId> = match self.tables.entry(chunk_id) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let old = entry.get().slices().iter().map(|s| s.id).collect();
                entry.get_mut().reset(slices.clone(), self.config.precedence);
                old
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(SliceTable::from_slices(slices.clone(), self.config.precedence));
                Vec::new()
            }
        };
        for id in previous {
            self.owners.remove_if(&id, |_, owner| *owner == chunk_id);
        }
        for slice in &slices {
            self.owners.insert(slice.id, chunk_id);
        }
        debug!(chunk_id, slices = slices.len(), "attached chunk");
        Ok(())
    }

    /// Sealed slices of a chunk in precedence order
    pub fn slices(&self, chunk_id: ChunkId) -> Vec<Slice> {
        self.table_view(chunk_id).0
    }

    pub(crate) fn is_tracked(&self, chunk_id: ChunkId) -> bool {
        self.tables.contains_key(&chunk_id)
    }

    pub(crate) fn live_slices(&self, chunk_id: ChunkId, inputs: &[SliceId]) -> Vec<Slice> {
        self.tables
            .get(&chunk_id)
            .map(|t| t.live(inputs))
            .unwrap_or_default()
    }

    pub(crate) fn compaction_layers(
        &self,
        chunk_id: ChunkId,
        live: &[SliceId],
        new_id: SliceId,
    ) -> Vec<Slice> {
        self.tables
            .get(&chunk_id)
            .map(|t| t.compaction_layers(live, new_id, self.config.precedence))
            .unwrap_or_default()
    }

    /// Swap compaction inputs for the compacted slice; false when the
    /// inputs are gone
    pub(crate) fn install_compacted(&self, chunk_id: ChunkId, inputs: &[SliceId], merged: Slice) -> bool {
        let Some(mut table) = self.tables.get_mut(&chunk_id) else {
            return false;
        };
        if !table.replace(inputs, merged, self.config.precedence) {
            return false;
        }
        drop(table);
        for id in inputs {
            self.owners.remove(id);
        }
        self.owners.insert(merged.id, chunk_id);
        true
    }

    /// Delete every block of a slice's object series, locally and remotely
    ///
    /// Deleting blocks that are already gone is not an error. A delayed
    /// upload of the slice is cancelled and a running one is waited for.
    pub async fn remove(&self, slice_id: SliceId, size: u32) -> ChunkResult<()> {
        self.check_open()?;
        if let Some((_, chunk_id)) = self.owners.remove(&slice_id) {
            if let Some(mut table) = self.tables.get_mut(&chunk_id) {
                table.remove(slice_id);
            }
        }

        let blocks = BlockId::for_object(slice_id, size, self.config.block_size);
        self.delete_blocks(&blocks).await?;
        debug!(slice_id, size, "removed slice");
        Ok(())
    }

    /// Merge slices of a chunk into one new slice and retire the inputs
    ///
    /// Returns `None` when every input was already retired.
    pub async fn compact(&self, slices: Vec<Slice>, chunk_id: ChunkId) -> ChunkResult<Option<Slice>> {
        self.check_open()?;
        self.compactor.compact(self, chunk_id, &slices).await
    }

    /// Load every block of a slice into the cache
    pub async fn fill_cache(&self, slice: &Slice) -> ChunkResult<()> {
        self.check_open()?;
        let loads = slice
            .blocks(self.config.block_size)
            .into_iter()
            .filter(|block| !self.cache.contains(block))
            .map(|block| self.downloader.load(block, Priority::Low, Admission::Prefetch));
        futures::future::try_join_all(loads).await?;
        Ok(())
    }

    /// Bytes held by write buffers
    pub fn used_memory(&self) -> u64 {
        self.buffered.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Evict every clean cached block; returns how many were evicted
    pub async fn purge_cache(&self) -> usize {
        self.cache.purge_clean().await
    }

    /// Metrics in Prometheus text format
    pub fn render_metrics(&self) -> String {
        let stats = self.cache.stats();
        let gauges = StoreGauges {
            buffer_bytes: self.used_memory(),
            cache_bytes: stats.used_bytes,
            cache_capacity: stats.capacity,
            cache_blocks: stats.blocks,
            staging_blocks: stats.staging,
        };
        PrometheusExporter::new("slatefs").export(&self.metrics, &gauges)
    }

    /// Seal every buffer and wait for all uploads, delayed ones included
    ///
    /// Returns how many chunk buffers failed to seal.
    pub async fn drain(&self) -> usize {
        let chunks: Vec<ChunkId> = self.buffers.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for chunk_id in chunks {
            if let Err(e) = self.flush_chunk(chunk_id).await {
                error!(chunk_id, "failed to flush chunk: {e}");
                failed += 1;
            }
        }
        self.uploader.drain().await;
        failed
    }

    /// Drain and stop the store
    ///
    /// Fails with [`ChunkError::UploadFailed`] when any buffered or
    /// write-back data could not be made durable.
    pub async fn close(&self) -> ChunkResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let flush_failures = self.drain().await;

        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("background task ended abnormally: {e}");
            }
        }
        self.budget.close();

        let failed = self.uploader.take_failed().len() + flush_failures;
        if failed > 0 {
            error!(failed, "chunk store closed with undurable data");
            return Err(ChunkError::UploadFailed { failed });
        }
        info!("chunk store closed");
        Ok(())
    }
}

impl Drop for CachedStore {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[async_trait]
impl MetaCommandHandler for CachedStore {
    async fn handle(&self, command: MetaCommand) -> ChunkResult<MetaReply> {
        match command {
            MetaCommand::DeleteChunk { slice_id, size } => {
                self.remove(slice_id, size).await?;
                Ok(MetaReply::Deleted)
            }
            MetaCommand::CompactChunk { slices, chunk_id } => {
                Ok(MetaReply::Compacted(self.compact(slices, chunk_id).await?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockState;
    use crate::config::CacheDir;
    use crate::meta::{LocalIdAllocator, serve_commands};
    use crate::slice::Precedence;
    use slatefs_object::{FaultKind, FlakyStorage, MemStorage};
    use std::time::Duration;
    use tempfile::TempDir;

    const BLOCK: u32 = 4096;

    fn test_config() -> ChunkConfig {
        ChunkConfig {
            block_size: BLOCK,
            buffer_size: 1 << 20,
            cache_dir: CacheDir::Memory,
            free_space: 0.0,
            io_retries: 3,
            retry_delay_ms: 1,
            retry_max_delay_ms: 2,
            cache_check_interval_ms: 50,
            ..ChunkConfig::default()
        }
    }

    async fn open_store(config: ChunkConfig, storage: Arc<dyn ObjectStorage>) -> CachedStore {
        CachedStore::open(
            config,
            storage,
            Arc::new(LocalIdAllocator::default()),
            StoreMetrics::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_read_after_write_survives_cache_clear() {
        let mem = Arc::new(MemStorage::new());
        let store = open_store(test_config(), mem.clone()).await;

        store.write(1, 0, b"0123456789").await.unwrap();
        let slices = store.flush(1).await.unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len, 10);
        assert_eq!(mem.len(), 1);

        assert_eq!(&store.read(1, 0, 10).await.unwrap()[..], b"0123456789");
        assert_eq!(mem.gets(), 0);

        assert_eq!(store.purge_cache().await, 1);
        assert_eq!(&store.read(1, 0, 10).await.unwrap()[..], b"0123456789");
        assert_eq!(mem.gets(), 1);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_later_write_wins_on_overlap() {
        let mem = Arc::new(MemStorage::new());
        let store = open_store(test_config(), mem.clone()).await;

        store.write(2, 0, b"AAAA").await.unwrap();
        store.flush(2).await.unwrap();
        store.write(2, 1, b"BB").await.unwrap();
        store.flush(2).await.unwrap();
        assert_eq!(&store.read(2, 0, 4).await.unwrap()[..], b"ABBA");

        // Same bytes without an intermediate flush
        store.write(20, 0, b"AAAA").await.unwrap();
        store.write(20, 1, b"BB").await.unwrap();
        assert_eq!(&store.read(20, 0, 4).await.unwrap()[..], b"ABBA");
        store.flush(20).await.unwrap();
        assert_eq!(&store.read(20, 0, 4).await.unwrap()[..], b"ABBA");
    }

    #[tokio::test]
    async fn test_slice_id_precedence() {
        let mem = Arc::new(MemStorage::new());
        let config = ChunkConfig {
            precedence: Precedence::SliceId,
            ..test_config()
        };
        let store = open_store(config, mem.clone()).await;
        store.write(2, 0, b"AAAA").await.unwrap();
        let a = store.flush(2).await.unwrap()[0];
        store.write(2, 1, b"BB").await.unwrap();
        let b = store.flush(2).await.unwrap()[0];
        assert_eq!(&store.read(2, 0, 4).await.unwrap()[..], b"ABBA");

        // Listing order does not matter, ids do
        store.attach(2, vec![b, a]).unwrap();
        assert_eq!(&store.read(2, 0, 4).await.unwrap()[..], b"ABBA");
    }

    #[tokio::test]
    async fn test_compaction_then_delete() {
        let mem = Arc::new(MemStorage::new());
        let store = open_store(test_config(), mem.clone()).await;

        store.write(3, 0, b"AAAA").await.unwrap();
        let a = store.flush(3).await.unwrap()[0];
        store.write(3, 1, b"BB").await.unwrap();
        let b = store.flush(3).await.unwrap()[0];

        let merged = store.compact(vec![a, b], 3).await.unwrap().unwrap();
        assert_eq!((merged.pos, merged.len), (0, 4));
        assert_eq!(store.slices(3), vec![merged]);

        for slice in [a, b] {
            store
                .handle(MetaCommand::DeleteChunk {
                    slice_id: slice.id,
                    size: slice.size,
                })
                .await
                .unwrap();
        }
        assert_eq!(mem.len(), 1);
        for slice in [a, b] {
            assert!(!mem.contains(&slice.blocks(BLOCK)[0].key()));
        }

        store.purge_cache().await;
        assert_eq!(&store.read(3, 0, 4).await.unwrap()[..], b"ABBA");
        assert_eq!(store.metrics().compactions.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_repeated_compaction_is_harmless() {
        let mem = Arc::new(MemStorage::new());
        let store = open_store(test_config(), mem.clone()).await;

        store.write(3, 0, b"AAAA").await.unwrap();
        let a = store.flush(3).await.unwrap()[0];
        store.write(3, 1, b"BB").await.unwrap();
        let b = store.flush(3).await.unwrap()[0];

        let merged = store.compact(vec![a, b], 3).await.unwrap().unwrap();
        assert_eq!(store.compact(vec![a, b], 3).await.unwrap(), None);
        assert_eq!(store.slices(3), vec![merged]);
        assert_eq!(&store.read(3, 0, 4).await.unwrap()[..], b"ABBA");
    }

    #[tokio::test]
    async fn test_compaction_of_unattached_chunk() {
        let mem = Arc::new(MemStorage::new());
        let writer = open_store(test_config(), mem.clone()).await;
        writer.write(4, 0, b"xxxxxxxx").await.unwrap();
        let a = writer.flush(4).await.unwrap()[0];
        writer.write(4, 2, b"yy").await.unwrap();
        let b = writer.flush(4).await.unwrap()[0];
        writer.close().await.unwrap();

        // A fresh process that only knows the slice list from metadata
        let store = CachedStore::open(
            test_config(),
            mem.clone(),
            Arc::new(LocalIdAllocator::new(1_000)),
            StoreMetrics::new(),
        )
        .await
        .unwrap();
        let merged = store.compact(vec![a, b], 4).await.unwrap().unwrap();
        assert_eq!(merged.id, 1_000);
        assert_eq!(&store.read(4, 0, 8).await.unwrap()[..], b"xxyyxxxx");
    }

    #[tokio::test]
    async fn test_compaction_leaves_unknown_inputs_alone() {
        let mem = Arc::new(MemStorage::new());
        let writer = open_store(test_config(), mem.clone()).await;
        writer.write(4, 0, b"AAAA").await.unwrap();
        let a = writer.flush(4).await.unwrap()[0];
        writer.write(4, 1, b"BB").await.unwrap();
        let b = writer.flush(4).await.unwrap()[0];
        writer.close().await.unwrap();

        // The chunk is tracked here through a newer slice only
        let store = CachedStore::open(
            test_config(),
            mem.clone(),
            Arc::new(LocalIdAllocator::new(1_000)),
            StoreMetrics::new(),
        )
        .await
        .unwrap();
        store.write(4, 6, b"cc").await.unwrap();
        let c = store.flush(4).await.unwrap()[0];

        assert_eq!(store.compact(vec![a, b], 4).await.unwrap(), None);
        for slice in [a, b] {
            assert!(mem.contains(&slice.blocks(BLOCK)[0].key()));
        }
        assert_eq!(store.metrics().deletions.load(Ordering::Relaxed), 0);

        store.attach(4, vec![a, b, c]).unwrap();
        assert_eq!(&store.read(4, 0, 8).await.unwrap()[..], b"ABBA\0\0cc");
    }

    #[tokio::test]
    async fn test_lru_block_evicted_staging_survives() {
        let mem = Arc::new(MemStorage::new());
        let flaky = Arc::new(FlakyStorage::new(mem.clone()));
        let config = ChunkConfig {
            writeback: true,
            cache_size: 3 * u64::from(BLOCK),
            ..test_config()
        };
        let store = open_store(config, flaky.clone()).await;

        let block = vec![7u8; BLOCK as usize];
        for chunk_id in 1..=3 {
            store.write(chunk_id, 0, &block).await.unwrap();
        }
        store.drain().await;
        assert_eq!(mem.len(), 3);
        let cached: Vec<BlockId> = (1..=3)
            .map(|chunk_id| store.slices(chunk_id)[0].blocks(BLOCK)[0])
            .collect();
        for block in &cached {
            assert_eq!(store.cache.state(block), Some(BlockState::Clean));
        }

        // The fourth block cannot be uploaded yet and stays staging
        flaky.fail_puts(1, FaultKind::Hang);
        store.write(4, 0, &block).await.unwrap();
        let staging = store.slices(4)[0].blocks(BLOCK)[0];
        assert_eq!(store.cache.state(&staging), Some(BlockState::Staging));

        assert!(!store.cache.contains(&cached[0]));
        assert!(store.cache.contains(&cached[1]));
        assert!(store.cache.contains(&cached[2]));

        let gets = mem.gets();
        assert_eq!(&store.read(1, 0, 16).await.unwrap()[..], &block[..16]);
        assert_eq!(mem.gets(), gets + 1);
        assert_eq!(&store.read(4, 0, 16).await.unwrap()[..], &block[..16]);
        assert_eq!(mem.gets(), gets + 1);
        assert_eq!(store.cache.state(&staging), Some(BlockState::Staging));
    }

    #[tokio::test]
    async fn test_writeback_drains_on_close() {
        let mem = Arc::new(MemStorage::new());
        let config = ChunkConfig {
            writeback: true,
            upload_delay_ms: 60_000,
            ..test_config()
        };
        let store = open_store(config, mem.clone()).await;

        store.write(1, 0, b"later").await.unwrap();
        store.write(2, 0, b"unflushed").await.unwrap();
        store.flush(1).await.unwrap();
        assert!(mem.is_empty());
        assert_eq!(&store.read(1, 0, 5).await.unwrap()[..], b"later");

        store.close().await.unwrap();
        assert_eq!(mem.len(), 2);
        assert!(matches!(store.write(1, 0, b"x").await, Err(ChunkError::Closed)));
    }

    #[tokio::test]
    async fn test_flush_retries_transient_failures() {
        let mem = Arc::new(MemStorage::new());
        let flaky = Arc::new(FlakyStorage::new(mem.clone()));
        flaky.fail_puts(2, FaultKind::Transient);
        let store = open_store(test_config(), flaky.clone()).await;

        store.write(1, 0, b"payload").await.unwrap();
        store.flush(1).await.unwrap();
        assert_eq!(flaky.put_attempts(), 3);
        assert_eq!(mem.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_data() {
        let mem = Arc::new(MemStorage::new());
        let flaky = Arc::new(FlakyStorage::new(mem.clone()));
        flaky.fail_puts(1, FaultKind::Permanent);
        let store = open_store(test_config(), flaky.clone()).await;

        store.write(1, 0, b"payload").await.unwrap();
        assert!(store.flush(1).await.is_err());
        assert!(store.slices(1).is_empty());
        assert_eq!(store.used_memory(), 7);
        assert_eq!(&store.read(1, 0, 7).await.unwrap()[..], b"payload");

        let slices = store.flush(1).await.unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(store.used_memory(), 0);
        store.purge_cache().await;
        assert_eq!(&store.read(1, 0, 7).await.unwrap()[..], b"payload");
    }

    #[tokio::test]
    async fn test_backpressure_seals_own_chunk() {
        let mem = Arc::new(MemStorage::new());
        let config = ChunkConfig {
            buffer_size: 2 * u64::from(BLOCK),
            ..test_config()
        };
        let store = open_store(config, mem.clone()).await;

        store.write(1, 0, &[1u8; 4000]).await.unwrap();
        store.write(2, 0, &[2u8; 4000]).await.unwrap();
        assert_eq!(store.used_memory(), 8000);

        store.write(1, 4000, &[3u8; 1000]).await.unwrap();
        assert_eq!(store.metrics().backpressure.load(Ordering::Relaxed), 1);
        assert_eq!(store.used_memory(), 5000);

        // The slice sealed under pressure is reported by the next flush
        let slices = store.flush(1).await.unwrap();
        assert_eq!(slices.len(), 2);
        let out = store.read(1, 3998, 4).await.unwrap();
        assert_eq!(&out[..], &[1, 1, 3, 3]);

        let err = store.write(3, 0, &vec![0u8; 3 * BLOCK as usize]).await.unwrap_err();
        assert!(matches!(err, ChunkError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_backpressure_seals_other_chunks() {
        let mem = Arc::new(MemStorage::new());
        let config = ChunkConfig {
            buffer_size: 2 * u64::from(BLOCK),
            ..test_config()
        };
        let store = open_store(config, mem.clone()).await;

        store.write(1, 0, &[1u8; 4000]).await.unwrap();
        store.write(2, 0, &[2u8; 4000]).await.unwrap();

        // Chunk 3 has nothing buffered to seal
        tokio::time::timeout(Duration::from_secs(3), store.write(3, 0, &[3u8; 1000]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.metrics().backpressure.load(Ordering::Relaxed), 1);
        assert_eq!(store.used_memory(), 5000);
        assert_eq!(mem.len(), 1);

        let sealed = store.flush(1).await.unwrap().len() + store.flush(2).await.unwrap().len();
        assert_eq!(sealed, 2);
        assert_eq!(store.flush(3).await.unwrap().len(), 1);
        assert_eq!(&store.read(1, 3998, 2).await.unwrap()[..], &[1, 1]);
        assert_eq!(&store.read(2, 0, 2).await.unwrap()[..], &[2, 2]);
        assert_eq!(&store.read(3, 998, 2).await.unwrap()[..], &[3, 3]);
    }

    #[tokio::test]
    async fn test_failed_seal_deletes_uploaded_blocks() {
        let mem = Arc::new(MemStorage::new());
        let flaky = Arc::new(FlakyStorage::new(mem.clone()));
        let store = open_store(test_config(), flaky.clone()).await;

        // One of the two blocks is rejected, the other lands remotely
        flaky.fail_puts(1, FaultKind::Permanent);
        assert!(store.write(1, 0, &[5u8; 6000]).await.is_err());
        assert_eq!(flaky.put_attempts(), 2);
        assert!(mem.is_empty());
        assert_eq!(store.metrics().deletions.load(Ordering::Relaxed), 1);
        assert_eq!(store.used_memory(), 6000);

        assert_eq!(store.flush(1).await.unwrap().len(), 1);
        assert_eq!(mem.len(), 2);
        assert_eq!(&store.read(1, 5998, 2).await.unwrap()[..], &[5, 5]);
    }

    #[tokio::test]
    async fn test_transient_get_failures_are_retried() {
        let mem = Arc::new(MemStorage::new());
        let flaky = Arc::new(FlakyStorage::new(mem.clone()));
        let store = open_store(test_config(), flaky.clone()).await;
        store.write(1, 0, b"payload").await.unwrap();
        store.flush(1).await.unwrap();
        store.purge_cache().await;

        flaky.fail_gets(2, FaultKind::Transient);
        assert_eq!(&store.read(1, 0, 7).await.unwrap()[..], b"payload");
        assert_eq!(flaky.get_attempts(), 3);
        assert_eq!(store.metrics().get.retries.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_exhausted_get_retries_fail_the_read() {
        let mem = Arc::new(MemStorage::new());
        let flaky = Arc::new(FlakyStorage::new(mem.clone()));
        let store = open_store(test_config(), flaky.clone()).await;
        store.write(1, 0, b"payload").await.unwrap();
        store.flush(1).await.unwrap();
        store.purge_cache().await;

        flaky.fail_gets(3, FaultKind::Transient);
        let err = store.read(1, 0, 7).await.unwrap_err();
        let ChunkError::Shared(inner) = &err else {
            panic!("unexpected error {err:?}");
        };
        assert!(matches!(
            **inner,
            ChunkError::RetriesExhausted { attempts: 3, .. }
        ));
        assert!(!err.is_not_found());

        // Nothing sticks once the store recovers
        assert_eq!(&store.read(1, 0, 7).await.unwrap()[..], b"payload");
    }

    #[tokio::test]
    async fn test_failed_prefetch_is_swallowed() {
        let mem = Arc::new(MemStorage::new());
        let flaky = Arc::new(FlakyStorage::new(mem.clone()));
        let store = open_store(test_config(), flaky.clone()).await;
        let data: Vec<u8> = (0..3 * BLOCK).map(|i| (i % 251) as u8).collect();
        store.write(1, 0, &data).await.unwrap();
        let slice = store.flush(1).await.unwrap()[0];
        store.purge_cache().await;

        assert_eq!(&store.read(1, 0, 16).await.unwrap()[..], &data[..16]);
        // The prefetch of the next block has been spawned but not started
        flaky.fail_gets(3, FaultKind::Transient);
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.metrics().prefetch_failures.load(Ordering::Relaxed) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!store.cache.contains(&slice.blocks(BLOCK)[1]));

        let at = u64::from(BLOCK);
        let out = store.read(1, at, 16).await.unwrap();
        assert_eq!(&out[..], &data[BLOCK as usize..BLOCK as usize + 16]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_read_sees_one_version_during_flushes() {
        let mem = Arc::new(MemStorage::new());
        let store = Arc::new(open_store(test_config(), mem.clone()).await);
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                // Every state has the first half at least as new as the second
                for v in 0..100u8 {
                    store.write(1, 0, &[2 * v; 64]).await.unwrap();
                    store.flush(1).await.unwrap();
                    store.write(1, 0, &[2 * v + 1; 32]).await.unwrap();
                }
                done.store(true, Ordering::Release);
            })
        };

        while !done.load(Ordering::Acquire) {
            let out = store.read(1, 0, 64).await.unwrap();
            let (first, second) = out.split_at(32);
            assert!(first.iter().all(|&b| b == first[0]));
            assert!(second.iter().all(|&b| b == second[0]));
            assert!(first[0] >= second[0], "read {} over {}", first[0], second[0]);
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_block_is_sealed_by_write() {
        let mem = Arc::new(MemStorage::new());
        let store = open_store(test_config(), mem.clone()).await;

        store.write(1, 0, &vec![9u8; BLOCK as usize]).await.unwrap();
        assert_eq!(mem.len(), 1);
        assert_eq!(store.used_memory(), 0);
        assert_eq!(store.flush(1).await.unwrap().len(), 1);
        assert!(store.flush(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_holes_and_bounds() {
        let mem = Arc::new(MemStorage::new());
        let store = open_store(test_config(), mem.clone()).await;

        store.write(1, 5, b"xyz").await.unwrap();
        assert_eq!(&store.read(1, 0, 10).await.unwrap()[..], b"\0\0\0\0\0xyz\0\0");
        assert_eq!(&store.read(99, 0, 3).await.unwrap()[..], b"\0\0\0");

        assert!(matches!(
            store.write(1, CHUNK_SIZE - 1, b"ab").await,
            Err(ChunkError::OutOfBounds { .. })
        ));
        assert!(matches!(
            store.write(1, 0, b"").await,
            Err(ChunkError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.read(1, CHUNK_SIZE, 1).await,
            Err(ChunkError::OutOfBounds { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let mem = Arc::new(MemStorage::new());
        let store = open_store(test_config(), mem.clone()).await;

        store.write(1, 0, &vec![5u8; 6000]).await.unwrap();
        let slice = store.flush(1).await.unwrap()[0];
        assert_eq!(mem.len(), 2);

        store.remove(slice.id, slice.size).await.unwrap();
        store.remove(slice.id, slice.size).await.unwrap();
        assert!(mem.is_empty());
        assert!(store.slices(1).is_empty());
        assert_eq!(store.cache_stats().blocks, 0);
        assert_eq!(store.metrics().deletions.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_remove_cancels_delayed_upload() {
        let mem = Arc::new(MemStorage::new());
        let config = ChunkConfig {
            writeback: true,
            upload_delay_ms: 60_000,
            ..test_config()
        };
        let store = open_store(config, mem.clone()).await;

        store.write(1, 0, b"short-lived").await.unwrap();
        let slice = store.flush(1).await.unwrap()[0];
        store.remove(slice.id, slice.size).await.unwrap();
        store.close().await.unwrap();
        assert!(mem.is_empty());
    }

    #[tokio::test]
    async fn test_staged_blocks_recovered_after_restart() {
        let tmp = TempDir::new().unwrap();
        let mem = Arc::new(MemStorage::new());
        let config = ChunkConfig {
            cache_dir: CacheDir::Disk(vec![tmp.path().to_path_buf()]),
            writeback: true,
            upload_delay_ms: 60_000,
            ..test_config()
        };

        let slice = {
            let store = open_store(config.clone(), mem.clone()).await;
            store.write(6, 0, b"crash-safe").await.unwrap();
            store.flush(6).await.unwrap()[0]
            // Dropped without close: the delayed upload never ran
        };
        assert!(mem.is_empty());

        let config = ChunkConfig {
            writeback: false,
            ..config
        };
        let store = open_store(config, mem.clone()).await;
        store.drain().await;
        assert_eq!(mem.len(), 1);
        assert_eq!(store.metrics().recovered_blocks.load(Ordering::Relaxed), 1);

        store.attach(6, vec![slice]).unwrap();
        assert_eq!(&store.read(6, 0, 10).await.unwrap()[..], b"crash-safe");
    }

    #[tokio::test]
    async fn test_corrupt_cache_falls_back_to_remote() {
        let tmp = TempDir::new().unwrap();
        let mem = Arc::new(MemStorage::new());
        let config = ChunkConfig {
            cache_dir: CacheDir::Disk(vec![tmp.path().to_path_buf()]),
            ..test_config()
        };
        let store = open_store(config, mem.clone()).await;

        store.write(1, 0, b"checksummed").await.unwrap();
        let slice = store.flush(1).await.unwrap()[0];
        let path = tmp.path().join("raw").join(slice.blocks(BLOCK)[0].key());
        let mut raw = std::fs::read(&path).unwrap();
        raw[0] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        assert_eq!(&store.read(1, 0, 11).await.unwrap()[..], b"checksummed");
        assert_eq!(store.metrics().cache_corruptions.load(Ordering::Relaxed), 1);
        assert_eq!(mem.gets(), 1);
    }

    #[tokio::test]
    async fn test_fill_cache() {
        let mem = Arc::new(MemStorage::new());
        let store = open_store(test_config(), mem.clone()).await;
        store.write(1, 0, &vec![1u8; 10_000]).await.unwrap();
        let slice = store.flush(1).await.unwrap()[0];

        store.purge_cache().await;
        assert_eq!(store.cache_stats().blocks, 0);
        store.fill_cache(&slice).await.unwrap();
        assert_eq!(store.cache_stats().blocks, 3);
    }

    #[tokio::test]
    async fn test_commands_through_channel() {
        let mem = Arc::new(MemStorage::new());
        let store = Arc::new(open_store(test_config(), mem.clone()).await);
        let (client, _server) = serve_commands(store.clone(), 8);

        store.write(5, 0, b"AAAA").await.unwrap();
        let a = store.flush(5).await.unwrap()[0];
        store.write(5, 2, b"CC").await.unwrap();
        let b = store.flush(5).await.unwrap()[0];

        let reply = client
            .send(MetaCommand::CompactChunk {
                slices: vec![a, b],
                chunk_id: 5,
            })
            .await
            .unwrap();
        let MetaReply::Compacted(Some(merged)) = reply else {
            panic!("unexpected reply {reply:?}");
        };
        assert_eq!(merged.len, 4);
        assert_eq!(&store.read(5, 0, 4).await.unwrap()[..], b"AACC");

        let err = client
            .send(MetaCommand::CompactChunk {
                slices: vec![a],
                chunk_id: 6,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_concurrent_chunks() {
        let mem = Arc::new(MemStorage::new());
        let config = ChunkConfig {
            compress: crate::compress::Compression::Lz4,
            ..test_config()
        };
        let store = Arc::new(open_store(config, mem.clone()).await);

        let tasks: Vec<_> = (0..8u64)
            .map(|chunk_id| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let data = vec![chunk_id as u8; 9_000];
                    store.write(chunk_id, 100, &data).await.unwrap();
                    store.flush(chunk_id).await.unwrap();
                    let out = store.read(chunk_id, 100, 9_000).await.unwrap();
                    assert_eq!(&out[..], &data[..]);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert!(store.render_metrics().contains("slatefs_writes_total 8"));
        tokio::time::timeout(Duration::from_secs(5), store.close())
            .await
            .unwrap()
            .unwrap();
    }
}
