//! SlateFS Bench - chunk store workload driver
//!
//! Opens a cached chunk store over a local-directory object store, writes,
//! overwrites, verifies and compacts a set of chunks, then drains the store.

mod workload;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use slatefs_chunk::{CacheDir, CachedStore, ChunkConfig, LocalIdAllocator, StoreMetrics};
use slatefs_object::LocalStorage;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use workload::Workload;

#[derive(Parser, Debug)]
#[command(name = "slatefs-bench")]
#[command(about = "Drive a SlateFS chunk store with a write/read/compact workload")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory used as object storage
    #[arg(long, default_value = "./slatefs-objects")]
    storage_dir: PathBuf,

    /// Volume UUID appended to each cache directory (random if unset)
    #[arg(long)]
    volume_uuid: Option<Uuid>,

    /// Block size in KiB
    #[arg(long)]
    block_size: Option<u32>,

    /// Compression algorithm: none, lz4 or zstd
    #[arg(long)]
    compress: Option<String>,

    /// Timeout of one download attempt in seconds
    #[arg(long)]
    get_timeout: Option<u64>,

    /// Timeout of one upload attempt in seconds
    #[arg(long)]
    put_timeout: Option<u64>,

    /// Attempts per object storage request
    #[arg(long)]
    io_retries: Option<u32>,

    /// Concurrent uploads
    #[arg(long)]
    max_uploads: Option<usize>,

    /// Concurrent deletions
    #[arg(long)]
    max_deletes: Option<usize>,

    /// Write buffer budget in MiB
    #[arg(long)]
    buffer_size: Option<u64>,

    /// Upload bandwidth limit in Mbps
    #[arg(long)]
    upload_limit: Option<u64>,

    /// Download bandwidth limit in Mbps
    #[arg(long)]
    download_limit: Option<u64>,

    /// Blocks to prefetch after a read
    #[arg(long)]
    prefetch: Option<usize>,

    /// Upload in the background after staging locally
    #[arg(long)]
    writeback: bool,

    /// Delay before a write-back upload in seconds
    #[arg(long)]
    upload_delay: Option<u64>,

    /// Cache directories separated by ':', or "memory"
    #[arg(long)]
    cache_dir: Option<String>,

    /// Cache capacity in MiB
    #[arg(long)]
    cache_size: Option<u64>,

    /// Minimum free space ratio on cache disks
    #[arg(long)]
    free_space_ratio: Option<f32>,

    /// Only cache blocks read partially
    #[arg(long)]
    cache_partial_only: bool,

    /// Chunks to write
    #[arg(long, default_value_t = 4)]
    chunks: u64,

    /// Bytes written into each chunk, in MiB
    #[arg(long, default_value_t = 16)]
    chunk_size: u64,

    /// Size of one write call in KiB
    #[arg(long, default_value_t = 128)]
    write_size: u64,

    /// Random overwrites per chunk
    #[arg(long, default_value_t = 8)]
    overwrites: usize,

    /// Drop clean cached blocks before each verification pass
    #[arg(long)]
    cold_read: bool,

    /// Skip compaction
    #[arg(long)]
    no_compact: bool,

    /// Print metrics in Prometheus text format when done
    #[arg(long)]
    metrics: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    chunk: ChunkConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Default)]
struct LoggingConfig {
    #[serde(default)]
    level: Option<String>,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

const fn mbps_to_bytes(mbps: u64) -> u64 {
    mbps * 1_000_000 / 8
}

/// Override file settings with command line flags
fn apply_args(args: &Args, config: &mut ChunkConfig, volume: Uuid) -> Result<()> {
    if let Some(kib) = args.block_size {
        config.block_size = kib * 1024;
    }
    if let Some(name) = &args.compress {
        config.compress = name.parse().context("--compress")?;
    }
    if let Some(secs) = args.get_timeout {
        config.get_timeout_secs = secs;
    }
    if let Some(secs) = args.put_timeout {
        config.put_timeout_secs = secs;
    }
    if let Some(retries) = args.io_retries {
        config.io_retries = retries;
    }
    if let Some(n) = args.max_uploads {
        config.max_upload = n;
    }
    if let Some(n) = args.max_deletes {
        config.max_deletes = n;
    }
    if let Some(mib) = args.buffer_size {
        config.buffer_size = mib << 20;
    }
    if let Some(mbps) = args.upload_limit {
        config.upload_limit = mbps_to_bytes(mbps);
    }
    if let Some(mbps) = args.download_limit {
        config.download_limit = mbps_to_bytes(mbps);
    }
    if let Some(n) = args.prefetch {
        config.prefetch = n;
    }
    if args.writeback {
        config.writeback = true;
    }
    if let Some(secs) = args.upload_delay {
        config.upload_delay_ms = secs * 1000;
    }
    if let Some(list) = &args.cache_dir {
        config.cache_dir = CacheDir::from_path_list(list);
    }
    // Volumes sharing a cache disk get separate directories
    if let CacheDir::Disk(dirs) = &mut config.cache_dir {
        for dir in dirs.iter_mut() {
            dir.push(volume.to_string());
        }
    }
    if let Some(mib) = args.cache_size {
        config.cache_size = mib << 20;
    }
    if let Some(ratio) = args.free_space_ratio {
        config.free_space = ratio;
    }
    if args.cache_partial_only {
        config.cache_full_block = false;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let file = load_config(args.config.as_ref())?;

    let log_level = if args.log_level != "info" {
        args.log_level.clone()
    } else {
        file.logging.level.clone().unwrap_or_else(|| args.log_level.clone())
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let volume = args.volume_uuid.unwrap_or_else(Uuid::new_v4);
    let mut config = file.chunk;
    apply_args(&args, &mut config, volume)?;
    if config.upload_delay_ms > 0 && !config.writeback {
        warn!("upload delay is ignored without write-back");
    }

    info!("Starting SlateFS bench");
    info!("Volume: {}", volume);
    info!("Object storage: {}", args.storage_dir.display());
    info!("Cache: {:?}", config.cache_dir);

    let storage = Arc::new(LocalStorage::open(&args.storage_dir).await?);
    let metrics = StoreMetrics::new();
    let store = CachedStore::open(
        config,
        storage,
        Arc::new(LocalIdAllocator::default()),
        Arc::clone(&metrics),
    )
    .await
    .context("failed to open chunk store")?;

    let workload = Workload {
        chunks: args.chunks,
        chunk_bytes: args.chunk_size << 20,
        write_bytes: args.write_size << 10,
        overwrites: args.overwrites,
        cold_read: args.cold_read,
        compact: !args.no_compact,
    };
    let outcome = workload.run(&store).await;
    let closed = store.close().await;

    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            error!("Workload failed: {:#}", e);
            return Err(e);
        }
    };
    closed.context("store did not drain cleanly")?;

    info!(
        written = report.written,
        read = report.read,
        slices = report.slices,
        compacted = report.compacted,
        "workload finished"
    );
    info!(
        "write {:.1} MiB/s, read {:.1} MiB/s, compaction {:?}, cache hit ratio {:.2}",
        report.write_mibs(),
        report.read_mibs(),
        report.compact_time,
        metrics.hit_ratio()
    );
    if args.metrics {
        print!("{}", store.render_metrics());
    }
    Ok(())
}
