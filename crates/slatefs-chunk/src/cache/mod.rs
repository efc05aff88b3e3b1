//! Local block cache
//!
//! The cache is a set of independent capacity pools, one per cache directory
//! (or a single memory pool). A block is always placed in the same pool,
//! chosen by rendezvous hashing of its identity, so adding or removing a
//! directory only moves the blocks that hashed to it.
//!
//! Entries are either *staging* (written locally, not yet durable remotely)
//! or *clean* (durable remotely). Only clean entries are ever evicted; a
//! staging entry leaves the cache through [`CacheManager::confirm_durable`]
//! or [`CacheManager::invalidate`].

mod disk;
mod memory;

pub use disk::{DiskDir, DiskSpace, ScanResult};

use crate::config::{CacheDir, ChunkConfig};
use crate::error::{ChunkError, ChunkResult};
use crate::metrics::StoreMetrics;
use bytes::Bytes;
use memory::MemoryDir;
use parking_lot::Mutex;
use slatefs_common::BlockId;
use slatefs_common::checksum::placement_hash;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// State of a cached block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Written locally, not yet durable remotely; never evicted
    Staging,
    /// Durable remotely; evictable
    Clean,
}

/// Why a downloaded block is offered to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The read covered the whole block
    FullRead,
    /// The read covered part of the block
    PartialRead,
    /// Speculative fetch ahead of a reader
    Prefetch,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    size: u64,
    state: BlockState,
    /// Logical access clock for LRU ordering
    atime: u64,
}

#[derive(Debug, Default)]
struct PoolIndex {
    entries: HashMap<BlockId, Entry>,
    used: u64,
}

impl PoolIndex {
    fn insert(&mut self, block: BlockId, entry: Entry) {
        if let Some(old) = self.entries.insert(block, entry) {
            self.used -= old.size;
        }
        self.used += entry.size;
    }

    fn remove(&mut self, block: &BlockId) -> Option<Entry> {
        let entry = self.entries.remove(block)?;
        self.used -= entry.size;
        Some(entry)
    }
}

enum Medium {
    Disk(DiskDir),
    Memory(MemoryDir),
}

struct Pool {
    name: String,
    seed: u64,
    medium: Medium,
    budget: u64,
    index: Mutex<PoolIndex>,
}

impl Pool {
    fn space(&self) -> Option<DiskSpace> {
        match &self.medium {
            Medium::Disk(dir) => dir.space(),
            Medium::Memory(_) => None,
        }
    }

    async fn write(&self, block: &BlockId, state: BlockState, data: &Bytes) -> std::io::Result<()> {
        match &self.medium {
            Medium::Disk(dir) => dir.write(block, state, data).await,
            Medium::Memory(mem) => {
                mem.write(block, data.clone());
                Ok(())
            }
        }
    }

    async fn read(&self, block: &BlockId, state: BlockState) -> ChunkResult<Option<Bytes>> {
        match &self.medium {
            Medium::Disk(dir) => dir.read(block, state).await,
            Medium::Memory(mem) => Ok(mem.read(block)),
        }
    }

    async fn remove(&self, block: &BlockId) {
        match &self.medium {
            Medium::Disk(dir) => dir.remove(block).await,
            Medium::Memory(mem) => mem.remove(block),
        }
    }
}

/// Snapshot of cache occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub blocks: u64,
    pub staging: u64,
    pub used_bytes: u64,
    pub capacity: u64,
}

/// Local cache manager
pub struct CacheManager {
    pools: Vec<Pool>,
    clock: AtomicU64,
    free_space: f32,
    cache_full_block: bool,
    metrics: Arc<StoreMetrics>,
}

impl CacheManager {
    /// Open every configured pool and index what is already there
    ///
    /// Returns the blocks found in staging areas; they were never confirmed
    /// durable and must be uploaded again.
    pub async fn open(
        config: &ChunkConfig,
        metrics: Arc<StoreMetrics>,
    ) -> ChunkResult<(Arc<Self>, Vec<BlockId>)> {
        let budget = config.pool_budget();
        let mut pools = Vec::new();
        let mut staged = Vec::new();
        let mut manager_clock = 0u64;

        match &config.cache_dir {
            CacheDir::Memory => pools.push(Pool {
                name: "memory".to_string(),
                seed: 0,
                medium: Medium::Memory(MemoryDir::default()),
                budget,
                index: Mutex::new(PoolIndex::default()),
            }),
            CacheDir::Disk(dirs) => {
                for path in dirs {
                    let dir = DiskDir::open(path, config.cache_mode, config.auto_create).await?;
                    let scan = dir.scan().await?;
                    let mut index = PoolIndex::default();
                    for block in &scan.clean {
                        manager_clock += 1;
                        index.insert(
                            *block,
                            Entry {
                                size: u64::from(block.size),
                                state: BlockState::Clean,
                                atime: manager_clock,
                            },
                        );
                    }
                    for block in &scan.staging {
                        manager_clock += 1;
                        index.insert(
                            *block,
                            Entry {
                                size: u64::from(block.size),
                                state: BlockState::Staging,
                                atime: manager_clock,
                            },
                        );
                    }
                    let name = path.display().to_string();
                    info!(
                        dir = %name,
                        clean = scan.clean.len(),
                        staging = scan.staging.len(),
                        used = index.used,
                        budget,
                        "opened cache directory"
                    );
                    staged.extend(scan.staging);
                    pools.push(Pool {
                        seed: placement_hash(name.as_bytes(), 0),
                        name,
                        medium: Medium::Disk(dir),
                        budget,
                        index: Mutex::new(index),
                    });
                }
            }
        }

        if pools.is_empty() {
            return Err(ChunkError::Config("no cache directory configured".into()));
        }
        let manager = Arc::new(Self {
            pools,
            clock: AtomicU64::new(manager_clock),
            free_space: config.free_space,
            cache_full_block: config.cache_full_block,
            metrics,
        });
        Ok((manager, staged))
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Pool a block always lives in
    fn pool_for(&self, block: &BlockId) -> &Pool {
        let mut key = [0u8; 12];
        key[..8].copy_from_slice(&block.slice_id.to_le_bytes());
        key[8..].copy_from_slice(&block.index.to_le_bytes());
        // `open` rejects an empty pool list
        let mut best = &self.pools[0];
        let mut best_score = placement_hash(&key, best.seed);
        for pool in &self.pools[1..] {
            let score = placement_hash(&key, pool.seed);
            if score > best_score {
                best = pool;
                best_score = score;
            }
        }
        best
    }

    /// Write a block locally as staging
    ///
    /// Staging may exceed the pool budget; it only fails when the disk
    /// itself is short of space or the write fails.
    pub async fn stage(&self, block: &BlockId, data: &Bytes) -> ChunkResult<()> {
        let pool = self.pool_for(block);
        let short = pool
            .space()
            .filter(|s| s.free_ratio() < f64::from(self.free_space));
        if let Some(space) = short {
            self.evict_pool(pool).await;
            let still_short = pool
                .space()
                .is_some_and(|s| s.free_ratio() < f64::from(self.free_space));
            if still_short {
                return Err(ChunkError::CacheFull(format!(
                    "{}: {} of {} bytes free",
                    pool.name, space.available, space.total
                )));
            }
        }

        pool.write(block, BlockState::Staging, data).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::StorageFull {
                ChunkError::CacheFull(format!("{}: {e}", pool.name))
            } else {
                ChunkError::Io(e)
            }
        })?;

        let atime = self.tick();
        pool.index.lock().insert(
            *block,
            Entry {
                size: u64::from(block.size),
                state: BlockState::Staging,
                atime,
            },
        );
        debug!(%block, pool = %pool.name, "staged block");
        self.evict_pool(pool).await;
        Ok(())
    }

    /// Mark a staged block durable; returns whether this call made the
    /// transition
    pub async fn confirm_durable(&self, block: &BlockId) -> ChunkResult<bool> {
        let pool = self.pool_for(block);
        let staged = pool
            .index
            .lock()
            .entries
            .get(block)
            .is_some_and(|e| e.state == BlockState::Staging);
        if !staged {
            return Ok(false);
        }

        let promoted = match &pool.medium {
            Medium::Disk(dir) => dir.promote(block).await?,
            Medium::Memory(_) => true,
        };
        if !promoted {
            return Ok(false);
        }

        let confirmed = {
            let mut index = pool.index.lock();
            match index.entries.get_mut(block) {
                Some(entry) if entry.state == BlockState::Staging => {
                    entry.state = BlockState::Clean;
                    true
                }
                _ => false,
            }
        };
        if confirmed {
            self.evict_pool(pool).await;
        } else {
            // Invalidated while being promoted
            if pool.index.lock().entries.get(block).is_none() {
                pool.remove(block).await;
            }
        }
        Ok(confirmed)
    }

    /// Read a cached block; a hit refreshes its recency
    ///
    /// A copy that fails verification is dropped and reported as
    /// corruption; the caller falls back to remote storage.
    pub async fn lookup(&self, block: &BlockId) -> ChunkResult<Option<Bytes>> {
        let pool = self.pool_for(block);
        let state = {
            let mut index = pool.index.lock();
            match index.entries.get_mut(block) {
                Some(entry) => {
                    entry.atime = self.tick();
                    Some(entry.state)
                }
                None => None,
            }
        };
        let Some(state) = state else {
            self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        match pool.read(block, state).await {
            Ok(Some(data)) => {
                self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(data))
            }
            Ok(None) => {
                self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) if e.is_corruption() => {
                warn!(%block, pool = %pool.name, "dropping corrupt cached block: {e}");
                self.metrics.cache_corruptions.fetch_add(1, Ordering::Relaxed);
                pool.index.lock().remove(block);
                pool.remove(block).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether a block is cached, in any state
    pub fn contains(&self, block: &BlockId) -> bool {
        self.pool_for(block).index.lock().entries.contains_key(block)
    }

    /// State of a cached block
    pub fn state(&self, block: &BlockId) -> Option<BlockState> {
        self.pool_for(block)
            .index
            .lock()
            .entries
            .get(block)
            .map(|e| e.state)
    }

    /// Offer a block fetched from remote storage to the cache as clean
    ///
    /// With `cache_full_block` off, blocks read in full are not admitted.
    pub async fn admit(&self, block: &BlockId, data: &Bytes, why: Admission) -> bool {
        if why == Admission::FullRead && !self.cache_full_block {
            return false;
        }
        let pool = self.pool_for(block);
        if pool.index.lock().entries.contains_key(block) {
            return false;
        }
        if pool
            .space()
            .is_some_and(|s| s.free_ratio() < f64::from(self.free_space))
        {
            self.evict_pool(pool).await;
            if pool
                .space()
                .is_some_and(|s| s.free_ratio() < f64::from(self.free_space))
            {
                debug!(%block, pool = %pool.name, "not caching block: disk short of space");
                return false;
            }
        }
        if let Err(e) = pool.write(block, BlockState::Clean, data).await {
            warn!(%block, pool = %pool.name, "failed to cache block: {e}");
            return false;
        }

        let atime = self.tick();
        {
            let mut index = pool.index.lock();
            if index.entries.contains_key(block) {
                return false;
            }
            index.insert(
                *block,
                Entry {
                    size: u64::from(block.size),
                    state: BlockState::Clean,
                    atime,
                },
            );
        }
        self.evict_pool(pool).await;
        true
    }

    /// Drop a block in any state; returns whether it was cached
    pub async fn invalidate(&self, block: &BlockId) -> bool {
        let pool = self.pool_for(block);
        let removed = pool.index.lock().remove(block).is_some();
        if removed {
            pool.remove(block).await;
            debug!(%block, pool = %pool.name, "invalidated cached block");
        }
        removed
    }

    /// Evict clean blocks from every pool that is over budget or short of
    /// disk space; returns how many blocks were evicted
    pub async fn evict_if_needed(&self) -> usize {
        let mut evicted = 0;
        for pool in &self.pools {
            evicted += self.evict_pool(pool).await;
        }
        evicted
    }

    /// Evict every clean block
    pub async fn purge_clean(&self) -> usize {
        let mut purged = 0;
        for pool in &self.pools {
            let victims: Vec<BlockId> = {
                let mut index = pool.index.lock();
                let victims: Vec<BlockId> = index
                    .entries
                    .iter()
                    .filter(|(_, e)| e.state == BlockState::Clean)
                    .map(|(b, _)| *b)
                    .collect();
                for block in &victims {
                    index.remove(block);
                }
                victims
            };
            for block in &victims {
                pool.remove(block).await;
            }
            purged += victims.len();
        }
        purged
    }

    async fn evict_pool(&self, pool: &Pool) -> usize {
        let over_budget = {
            let index = pool.index.lock();
            index.used.saturating_sub(pool.budget)
        };
        let disk_deficit = pool.space().map_or(0, |s| s.deficit(self.free_space));
        let target = over_budget.max(disk_deficit);
        if target == 0 {
            return 0;
        }

        let victims: Vec<BlockId> = {
            let mut index = pool.index.lock();
            let mut clean: Vec<(u64, BlockId, u64)> = index
                .entries
                .iter()
                .filter(|(_, e)| e.state == BlockState::Clean)
                .map(|(b, e)| (e.atime, *b, e.size))
                .collect();
            clean.sort_unstable_by_key(|(atime, _, _)| *atime);

            let mut freed = 0;
            let mut victims = Vec::new();
            for (_, block, size) in clean {
                if freed >= target {
                    break;
                }
                index.remove(&block);
                freed += size;
                victims.push(block);
            }
            victims
        };

        for block in &victims {
            pool.remove(block).await;
        }
        if !victims.is_empty() {
            self.metrics
                .cache_evictions
                .fetch_add(victims.len() as u64, Ordering::Relaxed);
            debug!(pool = %pool.name, evicted = victims.len(), target, "evicted clean blocks");
        }
        victims.len()
    }

    /// Blocks still waiting for remote durability
    pub fn staged_blocks(&self) -> Vec<BlockId> {
        let mut staged: Vec<BlockId> = self
            .pools
            .iter()
            .flat_map(|pool| {
                pool.index
                    .lock()
                    .entries
                    .iter()
                    .filter(|(_, e)| e.state == BlockState::Staging)
                    .map(|(b, _)| *b)
                    .collect::<Vec<_>>()
            })
            .collect();
        staged.sort_unstable();
        staged
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for pool in &self.pools {
            let index = pool.index.lock();
            stats.blocks += index.entries.len() as u64;
            stats.staging += index
                .entries
                .values()
                .filter(|e| e.state == BlockState::Staging)
                .count() as u64;
            stats.used_bytes += index.used;
            stats.capacity += pool.budget;
        }
        stats
    }

    /// Periodically re-check budgets and free space until `shutdown` fires
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = cache.evict_if_needed().await;
                        if evicted > 0 {
                            debug!(evicted, "cache maintenance evicted blocks");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("cache maintenance stopped");
        })
    }
}
