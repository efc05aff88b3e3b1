//! Upload pipeline
//!
//! Turns sealed blocks into remote objects. Every block has at most one
//! upload in flight; a second submission of the same block waits on the
//! first. Uploads run on a worker pool bounded by `max_upload`, share one
//! bandwidth bucket, and retry transient failures with backoff.
//!
//! In write-back mode blocks are parked in a delay queue for `upload_delay`
//! before they are submitted. [`Uploader::drain`] forces the queue and
//! waits for every outstanding upload, which is what a clean shutdown
//! relies on.

use crate::cache::CacheManager;
use crate::compress::{Compression, compress};
use crate::config::ChunkConfig;
use crate::error::{ChunkError, ChunkResult};
use crate::limiter::TokenBucket;
use crate::metrics::StoreMetrics;
use crate::retry::RetryPolicy;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use slatefs_common::BlockId;
use slatefs_object::ObjectStorage;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type UploadOutcome = Option<Result<(), Arc<ChunkError>>>;

/// An upload that has been submitted and not yet finished
#[derive(Clone)]
struct InflightUpload {
    /// Payload held in memory, when the block has no staging copy
    data: Option<Bytes>,
    done: watch::Receiver<UploadOutcome>,
}

struct Delayed {
    block: BlockId,
    data: Option<Bytes>,
}

/// Write-back delay queue ordered by due time
#[derive(Default)]
struct DelayQueue {
    queue: BTreeMap<(Instant, u64), Delayed>,
    index: HashMap<BlockId, (Instant, u64)>,
    seq: u64,
}

impl DelayQueue {
    fn push(&mut self, due: Instant, block: BlockId, data: Option<Bytes>) -> bool {
        if self.index.contains_key(&block) {
            return false;
        }
        self.seq += 1;
        let key = (due, self.seq);
        self.queue.insert(key, Delayed { block, data });
        self.index.insert(block, key);
        true
    }

    fn remove(&mut self, block: &BlockId) -> Option<Delayed> {
        let key = self.index.remove(block)?;
        self.queue.remove(&key)
    }

    fn next_due(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(due, _)| *due)
    }

    /// Pop everything due at `now`, or everything when `now` is `None`
    fn pop_due(&mut self, now: Option<Instant>) -> Vec<Delayed> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if now.is_some_and(|now| entry.key().0 > now) {
                break;
            }
            let delayed = entry.remove();
            self.index.remove(&delayed.block);
            due.push(delayed);
        }
        due
    }
}

/// Upload pipeline shared by the chunk store and the compactor
pub struct Uploader {
    storage: Arc<dyn ObjectStorage>,
    cache: Arc<CacheManager>,
    metrics: Arc<StoreMetrics>,
    compression: Compression,
    retry: RetryPolicy,
    put_timeout: Duration,
    upload_delay: Duration,
    workers: Semaphore,
    limiter: Option<TokenBucket>,
    inflight: DashMap<BlockId, InflightUpload>,
    delayed: Mutex<DelayQueue>,
    wake: Notify,
    /// Submitted plus delayed uploads not yet finished
    pending: AtomicUsize,
    idle: Notify,
    /// Background uploads that failed definitively
    failed: Mutex<Vec<BlockId>>,
}

impl Uploader {
    pub fn new(
        config: &ChunkConfig,
        storage: Arc<dyn ObjectStorage>,
        cache: Arc<CacheManager>,
        metrics: Arc<StoreMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            cache,
            metrics,
            compression: config.compress,
            retry: RetryPolicy::from_config(config),
            put_timeout: config.put_timeout(),
            upload_delay: config.upload_delay(),
            workers: Semaphore::new(config.max_upload),
            limiter: TokenBucket::for_limit(config.upload_limit, config.block_size),
            inflight: DashMap::new(),
            delayed: Mutex::new(DelayQueue::default()),
            wake: Notify::new(),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            failed: Mutex::new(Vec::new()),
        })
    }

    /// Upload blocks and wait until every one of them is durable
    ///
    /// Blocks without a payload are read back from their staging copy.
    /// Returns the first failure; the other uploads still run to completion.
    pub async fn upload(self: &Arc<Self>, blocks: Vec<(BlockId, Option<Bytes>)>) -> ChunkResult<()> {
        let waits: Vec<_> = blocks
            .into_iter()
            .map(|(block, data)| self.submit(block, data, false))
            .collect();
        let results = futures::future::join_all(waits.into_iter().map(wait_outcome)).await;
        results.into_iter().collect()
    }

    /// Queue a staged block for a background upload after `upload_delay`
    pub fn schedule(self: &Arc<Self>, block: BlockId, data: Option<Bytes>) {
        if self.upload_delay.is_zero() {
            drop(self.submit(block, data, true));
            return;
        }
        let due = Instant::now() + self.upload_delay;
        if self.delayed.lock().push(due, block, data) {
            self.pending.fetch_add(1, Ordering::AcqRel);
            self.wake.notify_one();
            debug!(%block, delay = ?self.upload_delay, "scheduled write-back upload");
        }
    }

    fn submit(
        self: &Arc<Self>,
        block: BlockId,
        data: Option<Bytes>,
        background: bool,
    ) -> watch::Receiver<UploadOutcome> {
        let tx = match self.inflight.entry(block) {
            dashmap::mapref::entry::Entry::Occupied(entry) => return entry.get().done.clone(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(InflightUpload {
                    data: data.clone(),
                    done: rx,
                });
                tx
            }
        };
        let done = tx.subscribe();
        self.pending.fetch_add(1, Ordering::AcqRel);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.put_block(block, data).await;
            if let Err(e) = &result {
                this.metrics.put.failures.fetch_add(1, Ordering::Relaxed);
                if background {
                    error!(%block, "write-back upload failed: {e}");
                    this.failed.lock().push(block);
                }
            }
            this.inflight.remove(&block);
            let _ = tx.send(Some(result.map_err(Arc::new)));
            this.finish_one();
        });
        done
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn put_block(&self, block: BlockId, data: Option<Bytes>) -> ChunkResult<()> {
        let data = match data {
            Some(data) => data,
            None => match self.cache.lookup(&block).await? {
                Some(data) => data,
                None => {
                    debug!(%block, "block removed before upload");
                    return Ok(());
                }
            },
        };

        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| ChunkError::Closed)?;
        let payload = Bytes::from(compress(self.compression, &data)?);
        if let Some(limiter) = &self.limiter {
            limiter.acquire(payload.len() as u64).await;
        }

        let key = block.key();
        let start = std::time::Instant::now();
        self.metrics.put.requests.fetch_add(1, Ordering::Relaxed);
        self.retry
            .run("put", block, self.put_timeout, &self.metrics.put.retries, || {
                self.storage.put(&key, payload.clone())
            })
            .await?;
        self.metrics.put.latency.record_since(start);
        self.metrics
            .put
            .bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        if let Err(e) = self.cache.confirm_durable(&block).await {
            warn!(%block, "uploaded block could not be marked clean: {e}");
        }
        debug!(%block, stored = payload.len(), "uploaded block");
        Ok(())
    }

    /// Drop a delayed upload that has not started; returns whether one was
    /// dropped
    pub fn cancel(&self, block: &BlockId) -> bool {
        let removed = self.delayed.lock().remove(block).is_some();
        if removed {
            self.finish_one();
            debug!(%block, "cancelled delayed upload");
        }
        removed
    }

    /// Wait for a running upload of `block`, ignoring its outcome
    pub async fn wait_inflight(&self, block: &BlockId) {
        let done = self.inflight.get(block).map(|entry| entry.done.clone());
        if let Some(done) = done {
            let _ = wait_outcome(done).await;
        }
    }

    /// In-memory payload of a block whose upload has not finished
    pub fn pending_data(&self, block: &BlockId) -> Option<Bytes> {
        if let Some(data) = self.inflight.get(block).and_then(|entry| entry.data.clone()) {
            return Some(data);
        }
        let delayed = self.delayed.lock();
        delayed
            .index
            .get(block)
            .and_then(|key| delayed.queue.get(key))
            .and_then(|entry| entry.data.clone())
    }

    /// Number of uploads submitted or delayed and not yet finished
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn release(self: &Arc<Self>, due: Vec<Delayed>) {
        for Delayed { block, data } in due {
            drop(self.submit(block, data, true));
            // The delay queue's claim on `pending` passes to the upload task
            self.finish_one();
        }
    }

    /// Submit every delayed upload now and wait until nothing is pending
    pub async fn drain(self: &Arc<Self>) {
        let due = self.delayed.lock().pop_due(None);
        if !due.is_empty() {
            info!(count = due.len(), "forcing delayed uploads");
        }
        self.release(due);

        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.pending() == 0 {
                break;
            }
            idle.await;
        }
    }

    /// Blocks whose background upload failed definitively, clearing the list
    pub fn take_failed(&self) -> Vec<BlockId> {
        std::mem::take(&mut *self.failed.lock())
    }

    /// Run the write-back delay queue until `shutdown` fires
    pub fn spawn_scheduler(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let next = this.delayed.lock().next_due();
                let sleep = tokio::time::sleep_until(
                    next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)),
                );
                tokio::select! {
                    () = sleep => {
                        let due = this.delayed.lock().pop_due(Some(Instant::now()));
                        this.release(due);
                    }
                    () = this.wake.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("upload scheduler stopped");
        })
    }
}

async fn wait_outcome(mut done: watch::Receiver<UploadOutcome>) -> ChunkResult<()> {
    let outcome = done
        .wait_for(Option::is_some)
        .await
        .map_err(|_| ChunkError::Internal("upload task dropped".into()))?;
    match &*outcome {
        Some(Err(e)) => Err(ChunkError::Shared(Arc::clone(e))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockState;
    use crate::config::CacheDir;
    use slatefs_object::{FaultKind, FlakyStorage, MemStorage};

    fn config() -> ChunkConfig {
        ChunkConfig {
            cache_dir: CacheDir::Memory,
            free_space: 0.0,
            io_retries: 3,
            retry_delay_ms: 1,
            retry_max_delay_ms: 2,
            ..ChunkConfig::default()
        }
    }

    async fn uploader(
        config: &ChunkConfig,
        storage: Arc<dyn ObjectStorage>,
    ) -> (Arc<Uploader>, Arc<CacheManager>, Arc<StoreMetrics>) {
        let metrics = StoreMetrics::new();
        let (cache, _) = CacheManager::open(config, Arc::clone(&metrics)).await.unwrap();
        let up = Uploader::new(config, storage, Arc::clone(&cache), Arc::clone(&metrics));
        (up, cache, metrics)
    }

    fn block(id: u64) -> BlockId {
        BlockId::new(id, 0, 5)
    }

    #[tokio::test]
    async fn test_upload_confirms_staged_block() {
        let mem = Arc::new(MemStorage::new());
        let (up, cache, metrics) = uploader(&config(), mem.clone()).await;
        let data = Bytes::from_static(b"hello");
        cache.stage(&block(1), &data).await.unwrap();

        up.upload(vec![(block(1), None)]).await.unwrap();
        assert!(mem.contains(&block(1).key()));
        assert_eq!(cache.state(&block(1)), Some(BlockState::Clean));
        assert_eq!(metrics.put.requests.load(Ordering::Relaxed), 1);
        assert_eq!(up.pending(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_share_one_upload() {
        let mem = Arc::new(MemStorage::new());
        let flaky = Arc::new(FlakyStorage::new(mem.clone()));
        flaky.set_latency(Duration::from_millis(20));
        let (up, _, _) = uploader(&config(), flaky.clone()).await;
        let data = Bytes::from_static(b"hello");

        let (a, b) = tokio::join!(
            up.upload(vec![(block(1), Some(data.clone()))]),
            up.upload(vec![(block(1), Some(data.clone()))]),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(flaky.put_attempts(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let mem = Arc::new(MemStorage::new());
        let flaky = Arc::new(FlakyStorage::new(mem.clone()));
        flaky.fail_puts(2, FaultKind::Transient);
        let (up, _, metrics) = uploader(&config(), flaky.clone()).await;

        up.upload(vec![(block(1), Some(Bytes::from_static(b"hello")))])
            .await
            .unwrap();
        assert_eq!(flaky.put_attempts(), 3);
        assert_eq!(metrics.put.retries.load(Ordering::Relaxed), 2);
        assert!(mem.contains(&block(1).key()));
    }

    #[tokio::test]
    async fn test_permanent_failure_surfaces_immediately() {
        let mem = Arc::new(MemStorage::new());
        let flaky = Arc::new(FlakyStorage::new(mem.clone()));
        flaky.fail_puts(1, FaultKind::Permanent);
        let (up, cache, _) = uploader(&config(), flaky.clone()).await;
        let data = Bytes::from_static(b"hello");
        cache.stage(&block(1), &data).await.unwrap();

        let err = up.upload(vec![(block(1), None)]).await.unwrap_err();
        assert!(matches!(&err, ChunkError::Shared(inner) if matches!(**inner, ChunkError::Storage(_))));
        assert_eq!(flaky.put_attempts(), 1);
        // Still staged: never marked durable
        assert_eq!(cache.state(&block(1)), Some(BlockState::Staging));
    }

    #[tokio::test]
    async fn test_hung_put_times_out() {
        let mem = Arc::new(MemStorage::new());
        let flaky = Arc::new(FlakyStorage::new(mem.clone()));
        flaky.fail_puts(1, FaultKind::Hang);
        let config = ChunkConfig {
            put_timeout_secs: 1,
            ..config()
        };
        let (up, _, _) = uploader(&config, flaky.clone()).await;

        up.upload(vec![(block(1), Some(Bytes::from_static(b"hello")))])
            .await
            .unwrap();
        assert_eq!(flaky.put_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writeback_delay_and_drain() {
        let mem = Arc::new(MemStorage::new());
        let config = ChunkConfig {
            writeback: true,
            upload_delay_ms: 60_000,
            ..config()
        };
        let (up, cache, _) = uploader(&config, mem.clone()).await;
        let (_tx, rx) = watch::channel(false);
        let scheduler = up.spawn_scheduler(rx);

        let data = Bytes::from_static(b"hello");
        cache.stage(&block(1), &data).await.unwrap();
        cache.stage(&block(2), &data).await.unwrap();
        up.schedule(block(1), None);
        up.schedule(block(2), None);
        assert_eq!(up.pending(), 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(mem.is_empty());

        assert!(up.cancel(&block(2)));
        assert!(!up.cancel(&block(2)));
        up.drain().await;
        assert!(mem.contains(&block(1).key()));
        assert!(!mem.contains(&block(2).key()));
        assert_eq!(up.pending(), 0);
        scheduler.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_uploads_when_due() {
        let mem = Arc::new(MemStorage::new());
        let config = ChunkConfig {
            writeback: true,
            upload_delay_ms: 500,
            ..config()
        };
        let (up, cache, _) = uploader(&config, mem.clone()).await;
        let (tx, rx) = watch::channel(false);
        let scheduler = up.spawn_scheduler(rx);

        let data = Bytes::from_static(b"hello");
        cache.stage(&block(1), &data).await.unwrap();
        up.schedule(block(1), None);

        tokio::time::sleep(Duration::from_secs(2)).await;
        up.drain().await;
        assert!(mem.contains(&block(1).key()));
        assert_eq!(cache.state(&block(1)), Some(BlockState::Clean));

        tx.send(true).unwrap();
        scheduler.await.unwrap();
    }

    #[tokio::test]
    async fn test_background_failures_are_recorded() {
        let mem = Arc::new(MemStorage::new());
        let flaky = Arc::new(FlakyStorage::new(mem.clone()));
        flaky.fail_puts(1, FaultKind::Permanent);
        let (up, _, _) = uploader(&config(), flaky.clone()).await;

        up.schedule(block(1), Some(Bytes::from_static(b"hello")));
        up.drain().await;
        assert_eq!(up.take_failed(), vec![block(1)]);
        assert!(up.take_failed().is_empty());
    }

    #[tokio::test]
    async fn test_pending_data_visible_until_uploaded() {
        let mem = Arc::new(MemStorage::new());
        let flaky = Arc::new(FlakyStorage::new(mem.clone()));
        flaky.set_latency(Duration::from_millis(50));
        let (up, _, _) = uploader(&config(), flaky.clone()).await;
        let data = Bytes::from_static(b"hello");

        up.schedule(block(1), Some(data.clone()));
        assert_eq!(up.pending_data(&block(1)), Some(data));
        up.wait_inflight(&block(1)).await;
        assert_eq!(up.pending_data(&block(1)), None);
    }
}
