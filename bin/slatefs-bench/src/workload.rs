//! Write, overwrite, verify and compact a set of chunks

use anyhow::{Context, Result, bail, ensure};
use rand::Rng;
use slatefs_chunk::CachedStore;
use slatefs_common::{CHUNK_SIZE, ChunkId, Slice};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Shape of the workload
#[derive(Debug, Clone)]
pub struct Workload {
    pub chunks: u64,
    /// Bytes written sequentially into each chunk
    pub chunk_bytes: u64,
    /// Size of one write call
    pub write_bytes: u64,
    /// Random overwrites per chunk after the sequential pass
    pub overwrites: usize,
    /// Drop clean cached blocks before verifying
    pub cold_read: bool,
    pub compact: bool,
}

/// What a workload run did
#[derive(Debug, Default)]
pub struct Report {
    pub written: u64,
    pub read: u64,
    pub slices: usize,
    pub compacted: usize,
    pub write_time: Duration,
    pub read_time: Duration,
    pub compact_time: Duration,
}

impl Report {
    fn throughput(bytes: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        bytes as f64 / secs / f64::from(1u32 << 20)
    }

    /// Write throughput in MiB/s
    pub fn write_mibs(&self) -> f64 {
        Self::throughput(self.written, self.write_time)
    }

    /// Read throughput in MiB/s
    pub fn read_mibs(&self) -> f64 {
        Self::throughput(self.read, self.read_time)
    }
}

fn pattern(chunk_id: ChunkId, offset: u64, len: usize, seed: u8) -> Vec<u8> {
    (0..len as u64)
        .map(|i| ((chunk_id * 31 + offset + i) % 251) as u8 ^ seed)
        .collect()
}

impl Workload {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.chunks > 0, "at least one chunk is required");
        ensure!(
            self.chunk_bytes > 0 && self.chunk_bytes <= CHUNK_SIZE,
            "chunk bytes must be between 1 and {CHUNK_SIZE}"
        );
        ensure!(
            self.write_bytes > 0 && self.write_bytes <= self.chunk_bytes,
            "write size must be between 1 and the chunk bytes"
        );
        Ok(())
    }

    pub async fn run(&self, store: &CachedStore) -> Result<Report> {
        self.validate()?;
        let mut report = Report::default();
        for chunk_id in 1..=self.chunks {
            self.run_chunk(store, chunk_id, &mut report)
                .await
                .with_context(|| format!("chunk {chunk_id}"))?;
        }
        Ok(report)
    }

    async fn run_chunk(&self, store: &CachedStore, chunk_id: ChunkId, report: &mut Report) -> Result<()> {
        let size = usize::try_from(self.chunk_bytes)?;
        let step = usize::try_from(self.write_bytes)?;
        let mut expected = vec![0u8; size];

        let start = Instant::now();
        let mut slices: Vec<Slice> = Vec::new();
        for offset in (0..size).step_by(step) {
            let len = step.min(size - offset);
            let data = pattern(chunk_id, offset as u64, len, 0);
            store.write(chunk_id, offset as u64, &data).await?;
            expected[offset..offset + len].copy_from_slice(&data);
            report.written += len as u64;
        }
        slices.extend(store.flush(chunk_id).await?);

        let overwrites: Vec<(usize, usize)> = {
            let mut rng = rand::thread_rng();
            (0..self.overwrites)
                .map(|_| {
                    let len = rng.gen_range(1..=step.max(2) / 2);
                    (rng.gen_range(0..=size - len), len)
                })
                .collect()
        };
        for (i, (offset, len)) in overwrites.into_iter().enumerate() {
            let data = pattern(chunk_id, offset as u64, len, (i as u8).wrapping_add(1));
            store.write(chunk_id, offset as u64, &data).await?;
            expected[offset..offset + len].copy_from_slice(&data);
            report.written += len as u64;
            // One slice per overwrite
            slices.extend(store.flush(chunk_id).await?);
        }
        report.write_time += start.elapsed();
        report.slices += slices.len();
        debug!(chunk_id, slices = slices.len(), "chunk written");

        if self.cold_read {
            store.purge_cache().await;
        }
        let start = Instant::now();
        self.verify(store, chunk_id, &expected).await?;
        report.read += expected.len() as u64;
        report.read_time += start.elapsed();

        if self.compact && slices.len() > 1 {
            let start = Instant::now();
            let merged = store.compact(slices, chunk_id).await?;
            report.compact_time += start.elapsed();
            if let Some(merged) = merged {
                info!(chunk_id, slice = merged.id, "compacted");
                report.compacted += 1;
            }
            if self.cold_read {
                store.purge_cache().await;
            }
            self.verify(store, chunk_id, &expected)
                .await
                .context("after compaction")?;
        }
        Ok(())
    }

    async fn verify(&self, store: &CachedStore, chunk_id: ChunkId, expected: &[u8]) -> Result<()> {
        let step = usize::try_from(self.write_bytes)?;
        for offset in (0..expected.len()).step_by(step) {
            let len = step.min(expected.len() - offset);
            let got = store.read(chunk_id, offset as u64, len as u64).await?;
            if got[..] != expected[offset..offset + len] {
                bail!("data mismatch in [{offset}, {})", offset + len);
            }
        }
        Ok(())
    }
}
