//! Download and prefetch pipeline
//!
//! Cache misses are fetched on a worker pool bounded by `max_download`.
//! Slots go to direct reads first: a speculative prefetch only gets a slot
//! when no direct read is waiting. Fetched blocks are verified, offered to
//! the cache, and returned; concurrent fetches of the same block share one
//! request.

use crate::cache::{Admission, CacheManager};
use crate::compress::decompress;
use crate::config::ChunkConfig;
use crate::error::{ChunkError, ChunkResult};
use crate::limiter::TokenBucket;
use crate::metrics::StoreMetrics;
use crate::retry::RetryPolicy;
use crate::slice::{Source, resolve};
use crate::upload::Uploader;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use slatefs_common::{BlockId, Slice};
use slatefs_object::ObjectStorage;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// Scheduling class of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Speculative prefetch
    Low,
    /// A reader is waiting on it
    High,
}

#[derive(Debug)]
struct PoolState {
    available: usize,
    high: VecDeque<oneshot::Sender<PoolPermit>>,
    low: VecDeque<oneshot::Sender<PoolPermit>>,
}

/// Worker slots handed out by priority, first come first served within a
/// class
#[derive(Debug)]
pub struct PriorityPool {
    state: Mutex<PoolState>,
}

/// A held worker slot; returned to the pool on drop
#[derive(Debug)]
pub struct PoolPermit {
    pool: Option<Arc<PriorityPool>>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release();
        }
    }
}

impl PriorityPool {
    pub fn new(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                available: slots,
                high: VecDeque::new(),
                low: VecDeque::new(),
            }),
        })
    }

    pub async fn acquire(self: &Arc<Self>, priority: Priority) -> ChunkResult<PoolPermit> {
        let rx = {
            let mut state = self.state.lock();
            if state.available > 0 {
                state.available -= 1;
                return Ok(PoolPermit {
                    pool: Some(Arc::clone(self)),
                });
            }
            let (tx, rx) = oneshot::channel();
            match priority {
                Priority::High => state.high.push_back(tx),
                Priority::Low => state.low.push_back(tx),
            }
            rx
        };
        rx.await.map_err(|_| ChunkError::Closed)
    }

    /// Hand a freed slot to the next waiter, high priority first
    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        loop {
            let next = match state.high.pop_front() {
                Some(tx) => Some(tx),
                None => state.low.pop_front(),
            };
            let Some(tx) = next else {
                state.available += 1;
                return;
            };
            let permit = PoolPermit {
                pool: Some(Arc::clone(self)),
            };
            match tx.send(permit) {
                Ok(()) => return,
                // Waiter gave up; the slot goes to the next one
                Err(mut permit) => permit.pool = None,
            }
        }
    }

    /// Free slots
    pub fn available(&self) -> usize {
        self.state.lock().available
    }
}

type DownloadOutcome = Option<Result<Bytes, Arc<ChunkError>>>;

/// Part of a resolved range served by one block
struct Piece {
    block: BlockId,
    /// Offset within the block
    within: usize,
    len: usize,
    /// Offset within the output buffer
    dst: usize,
}

/// Download pipeline
pub struct Downloader {
    storage: Arc<dyn ObjectStorage>,
    cache: Arc<CacheManager>,
    uploader: Arc<Uploader>,
    metrics: Arc<StoreMetrics>,
    retry: RetryPolicy,
    get_timeout: Duration,
    block_size: u32,
    prefetch: usize,
    pool: Arc<PriorityPool>,
    limiter: Option<TokenBucket>,
    inflight: DashMap<BlockId, watch::Receiver<DownloadOutcome>>,
    max_prefetching: usize,
    prefetching: AtomicUsize,
}

impl Downloader {
    pub fn new(
        config: &ChunkConfig,
        storage: Arc<dyn ObjectStorage>,
        cache: Arc<CacheManager>,
        uploader: Arc<Uploader>,
        metrics: Arc<StoreMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            cache,
            uploader,
            metrics,
            retry: RetryPolicy::from_config(config),
            get_timeout: config.get_timeout(),
            block_size: config.block_size,
            prefetch: config.prefetch,
            pool: PriorityPool::new(config.max_download),
            limiter: TokenBucket::for_limit(config.download_limit, config.block_size),
            inflight: DashMap::new(),
            max_prefetching: config.max_download,
            prefetching: AtomicUsize::new(0),
        })
    }

    /// Bytes of one block: cache first, then a pending upload's payload,
    /// then remote storage
    ///
    /// A cached copy that fails verification is dropped and the block is
    /// fetched again from remote storage.
    pub async fn read_block(self: &Arc<Self>, block: BlockId, admission: Admission) -> ChunkResult<Bytes> {
        match self.cache.lookup(&block).await {
            Ok(Some(data)) => return Ok(data),
            Ok(None) => {}
            Err(e) => debug!(%block, "cache lookup failed, fetching remotely: {e}"),
        }
        if let Some(data) = self.uploader.pending_data(&block) {
            return Ok(data);
        }
        self.load(block, Priority::High, admission).await
    }

    /// Fetch a block from remote storage and offer it to the cache
    pub async fn load(
        self: &Arc<Self>,
        block: BlockId,
        priority: Priority,
        admission: Admission,
    ) -> ChunkResult<Bytes> {
        let done = match self.inflight.entry(block) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(rx.clone());
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let result = this.fetch(block, priority, admission).await;
                    this.inflight.remove(&block);
                    let _ = tx.send(Some(result.map_err(Arc::new)));
                });
                rx
            }
        };
        wait_outcome(done).await
    }

    async fn fetch(&self, block: BlockId, priority: Priority, admission: Admission) -> ChunkResult<Bytes> {
        let _permit = self.pool.acquire(priority).await?;
        if let Some(limiter) = &self.limiter {
            limiter.acquire(u64::from(block.size)).await;
        }

        let key = block.key();
        let start = std::time::Instant::now();
        self.metrics.get.requests.fetch_add(1, Ordering::Relaxed);
        let raw = self
            .retry
            .run("get", block, self.get_timeout, &self.metrics.get.retries, || {
                self.storage.get(&key, 0, None)
            })
            .await
            .inspect_err(|_| {
                self.metrics.get.failures.fetch_add(1, Ordering::Relaxed);
            })?;
        self.metrics.get.latency.record_since(start);
        self.metrics
            .get
            .bytes
            .fetch_add(raw.len() as u64, Ordering::Relaxed);

        let data = decompress(&raw, block.size as usize).map_err(|e| ChunkError::Corrupted {
            block,
            reason: e.to_string(),
        })?;
        let data = Bytes::from(data);
        self.cache.admit(&block, &data, admission).await;
        debug!(%block, ?priority, "downloaded block");
        Ok(data)
    }

    /// Start low-priority fetches of blocks a reader is likely to want next
    ///
    /// Blocks already cached or being fetched are skipped, and so is
    /// everything beyond the outstanding prefetch cap. Failures are only
    /// counted.
    pub fn prefetch(self: &Arc<Self>, blocks: Vec<BlockId>) {
        for block in blocks {
            if self.cache.contains(&block) || self.inflight.contains_key(&block) {
                continue;
            }
            if self.prefetching.fetch_add(1, Ordering::AcqRel) >= self.max_prefetching {
                self.prefetching.fetch_sub(1, Ordering::AcqRel);
                return;
            }
            self.metrics.prefetches.fetch_add(1, Ordering::Relaxed);
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.load(block, Priority::Low, Admission::Prefetch).await {
                    this.metrics.prefetch_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(%block, "prefetch failed: {e}");
                }
                this.prefetching.fetch_sub(1, Ordering::AcqRel);
            });
        }
    }

    /// Materialise `[offset, offset + len)` of the view formed by `layers`
    ///
    /// Holes read as zeros. With `prefetch` set, the blocks following the
    /// last one read are fetched in the background.
    pub async fn read_view(
        self: &Arc<Self>,
        layers: &[Slice],
        offset: u64,
        len: u64,
        prefetch: bool,
    ) -> ChunkResult<Vec<u8>> {
        let size = usize::try_from(len)
            .map_err(|_| ChunkError::InvalidArgument(format!("read of {len} bytes")))?;
        let mut out = vec![0u8; size];
        let block_size = u64::from(self.block_size);

        let mut pieces = Vec::new();
        let mut last: Option<(Slice, u32)> = None;
        for segment in resolve(layers, offset, len) {
            let Source::Slice { slice, object_off } = segment.source else {
                continue;
            };
            let mut obj = object_off;
            let mut dst = segment.start - offset;
            let mut remaining = segment.len;
            while remaining > 0 {
                let index = obj / block_size;
                let block_start = index * block_size;
                let block_len = block_size.min(u64::from(slice.size) - block_start);
                let within = obj - block_start;
                let take = remaining.min(block_len - within);
                let index = u32::try_from(index)
                    .map_err(|_| ChunkError::Internal(format!("block index of {slice}")))?;
                pieces.push(Piece {
                    block: BlockId::new(slice.id, index, block_len as u32),
                    within: within as usize,
                    len: take as usize,
                    dst: dst as usize,
                });
                last = Some((slice, index));
                obj += take;
                dst += take;
                remaining -= take;
            }
        }

        let fetches = pieces.iter().map(|piece| {
            let admission = if piece.within == 0 && piece.len == piece.block.size as usize {
                Admission::FullRead
            } else {
                Admission::PartialRead
            };
            self.read_block(piece.block, admission)
        });
        let blocks = futures::future::try_join_all(fetches).await?;
        for (piece, data) in pieces.iter().zip(blocks) {
            let src = data
                .get(piece.within..piece.within + piece.len)
                .ok_or_else(|| ChunkError::Corrupted {
                    block: piece.block,
                    reason: format!("{} bytes, expected {}", data.len(), piece.block.size),
                })?;
            out[piece.dst..piece.dst + piece.len].copy_from_slice(src);
        }

        if let Some((slice, index)) = last.filter(|_| prefetch && self.prefetch > 0) {
            let ahead: Vec<BlockId> = slice
                .blocks(self.block_size)
                .into_iter()
                .skip(index as usize + 1)
                .take(self.prefetch)
                .collect();
            self.prefetch(ahead);
        }
        Ok(out)
    }
}

async fn wait_outcome(mut done: watch::Receiver<DownloadOutcome>) -> ChunkResult<Bytes> {
    let outcome = done
        .wait_for(Option::is_some)
        .await
        .map_err(|_| ChunkError::Internal("download task dropped".into()))?;
    match &*outcome {
        Some(Ok(data)) => Ok(data.clone()),
        Some(Err(e)) => Err(ChunkError::Shared(Arc::clone(e))),
        None => Err(ChunkError::Internal("download finished without a result".into())),
    }
}
