//! On-disk cache directory
//!
//! Layout under each cache directory:
//!
//! ```text
//! <dir>/rawstaging/chunks/<a>/<b>/<slice>_<index>_<size>   not yet durable remotely
//! <dir>/raw/chunks/<a>/<b>/<slice>_<index>_<size>          durable remotely, evictable
//! ```
//!
//! Files hold the block payload followed by a CRC32C trailer. A file only
//! appears under its final name once fully written.

use super::BlockState;
use crate::error::{ChunkError, ChunkResult};
use bytes::Bytes;
use slatefs_common::{BlockChecksum, BlockId};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const STAGING_DIR: &str = "rawstaging";
const CLEAN_DIR: &str = "raw";
const TMP_SUFFIX: &str = ".tmp";

/// Blocks found in a cache directory at startup
#[derive(Debug, Default)]
pub struct ScanResult {
    pub clean: Vec<BlockId>,
    pub staging: Vec<BlockId>,
}

/// Space on the filesystem holding a cache directory
#[derive(Debug, Clone, Copy)]
pub struct DiskSpace {
    pub available: u64,
    pub total: u64,
}

impl DiskSpace {
    pub fn free_ratio(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.available as f64 / self.total as f64
    }

    /// Bytes to release to get back to `ratio` free
    pub fn deficit(&self, ratio: f32) -> u64 {
        let wanted = (f64::from(ratio) * self.total as f64) as u64;
        wanted.saturating_sub(self.available)
    }
}

/// One cache directory on local disk
#[derive(Debug)]
pub struct DiskDir {
    root: PathBuf,
    file_mode: u32,
    dir_mode: u32,
    tmp_seq: AtomicU64,
}

impl DiskDir {
    /// Open a cache directory, creating it when `auto_create` is set
    pub async fn open(root: &Path, file_mode: u32, auto_create: bool) -> ChunkResult<Self> {
        // Directories need search permission wherever files are readable
        let dir_mode = file_mode | ((file_mode & 0o444) >> 2);
        match fs::metadata(root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(ChunkError::Config(format!(
                    "cache path {} is not a directory",
                    root.display()
                )));
            }
            Err(e) if e.kind() == ErrorKind::NotFound && auto_create => {
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(dir_mode)
                    .create(root)
                    .await?;
                debug!(dir = %root.display(), "created cache directory");
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ChunkError::Config(format!(
                    "cache directory {} does not exist",
                    root.display()
                )));
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            root: root.to_path_buf(),
            file_mode,
            dir_mode,
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, block: &BlockId, state: BlockState) -> PathBuf {
        let area = match state {
            BlockState::Staging => STAGING_DIR,
            BlockState::Clean => CLEAN_DIR,
        };
        self.root.join(area).join(block.key())
    }

    async fn ensure_parent(&self, path: &Path) -> std::io::Result<()> {
        match path.parent() {
            Some(dir) => {
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(self.dir_mode)
                    .create(dir)
                    .await
            }
            None => Ok(()),
        }
    }

    /// Write a block file atomically
    pub async fn write(&self, block: &BlockId, state: BlockState, data: &[u8]) -> std::io::Result<()> {
        let path = self.path(block, state);
        self.ensure_parent(&path).await?;
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_file_name(format!("{}.{seq}{TMP_SUFFIX}", block.file_name()));

        let sealed = BlockChecksum::seal(data);
        let result = async {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(self.file_mode)
                .open(&tmp)
                .await?;
            file.write_all(&sealed).await?;
            if state == BlockState::Staging {
                file.sync_data().await?;
            }
            drop(file);
            fs::rename(&tmp, &path).await
        }
        .await;
        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result
    }

    /// Read and verify a block file; `None` when it does not exist
    ///
    /// A staging read that races with promotion falls through to the clean
    /// copy.
    pub async fn read(&self, block: &BlockId, state: BlockState) -> ChunkResult<Option<Bytes>> {
        let mut candidates = vec![self.path(block, state)];
        if state == BlockState::Staging {
            candidates.push(self.path(block, BlockState::Clean));
        }
        for path in candidates {
            match fs::read(&path).await {
                Ok(sealed) => {
                    let payload = BlockChecksum::open(&sealed, block.size as usize).map_err(|e| {
                        ChunkError::Corrupted {
                            block: *block,
                            reason: e.to_string(),
                        }
                    })?;
                    return Ok(Some(Bytes::copy_from_slice(payload)));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Move a staged block into the clean area; false when it is gone
    pub async fn promote(&self, block: &BlockId) -> std::io::Result<bool> {
        let from = self.path(block, BlockState::Staging);
        let to = self.path(block, BlockState::Clean);
        self.ensure_parent(&to).await?;
        match fs::rename(&from, &to).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove every copy of a block
    pub async fn remove(&self, block: &BlockId) {
        for state in [BlockState::Staging, BlockState::Clean] {
            let path = self.path(block, state);
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "failed to remove cached block: {e}"),
            }
        }
    }

    /// Free space of the filesystem holding this directory
    pub fn space(&self) -> Option<DiskSpace> {
        match nix::sys::statvfs::statvfs(&self.root) {
            Ok(stat) => {
                let frag = stat.fragment_size() as u64;
                Some(DiskSpace {
                    available: stat.blocks_available() as u64 * frag,
                    total: stat.blocks() as u64 * frag,
                })
            }
            Err(e) => {
                warn!(dir = %self.root.display(), "statvfs failed: {e}");
                None
            }
        }
    }

    /// Index the blocks already present; leftover temporary files are removed
    pub async fn scan(&self) -> ChunkResult<ScanResult> {
        let mut result = ScanResult::default();
        for (area, out) in [
            (CLEAN_DIR, &mut result.clean),
            (STAGING_DIR, &mut result.staging),
        ] {
            let mut stack = vec![self.root.join(area)];
            while let Some(dir) = stack.pop() {
                let mut entries = match fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    if entry.file_type().await?.is_dir() {
                        stack.push(path);
                        continue;
                    }
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.ends_with(TMP_SUFFIX) {
                        let _ = fs::remove_file(&path).await;
                        continue;
                    }
                    match BlockId::parse(&name) {
                        Some(block) => out.push(block),
                        None => debug!(path = %path.display(), "ignoring unknown file in cache"),
                    }
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_promote() {
        let tmp = TempDir::new().unwrap();
        let dir = DiskDir::open(tmp.path(), 0o600, true).await.unwrap();
        let block = BlockId::new(1_234, 0, 5);

        dir.write(&block, BlockState::Staging, b"hello").await.unwrap();
        let staged = tmp.path().join("rawstaging").join(block.key());
        assert!(staged.exists());
        assert_eq!(
            &dir.read(&block, BlockState::Staging).await.unwrap().unwrap()[..],
            b"hello"
        );

        assert!(dir.promote(&block).await.unwrap());
        assert!(!staged.exists());
        assert!(tmp.path().join("raw").join(block.key()).exists());
        // A stale staging read still finds the promoted copy
        assert!(dir.read(&block, BlockState::Staging).await.unwrap().is_some());
        assert!(!dir.promote(&block).await.unwrap());

        dir.remove(&block).await;
        assert!(dir.read(&block, BlockState::Clean).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let dir = DiskDir::open(&tmp.path().join("cache"), 0o600, true).await.unwrap();
        let block = BlockId::new(1, 0, 1);
        dir.write(&block, BlockState::Clean, b"x").await.unwrap();

        let meta = std::fs::metadata(tmp.path().join("cache/raw").join(block.key())).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_missing_dir_without_auto_create() {
        let tmp = TempDir::new().unwrap();
        let err = DiskDir::open(&tmp.path().join("absent"), 0o600, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkError::Config(_)));
    }

    #[tokio::test]
    async fn test_corrupt_file_detected() {
        let tmp = TempDir::new().unwrap();
        let dir = DiskDir::open(tmp.path(), 0o600, true).await.unwrap();
        let block = BlockId::new(9, 1, 4);
        dir.write(&block, BlockState::Clean, b"abcd").await.unwrap();

        let path = tmp.path().join("raw").join(block.key());
        let mut raw = std::fs::read(&path).unwrap();
        raw[0] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        let err = dir.read(&block, BlockState::Clean).await.unwrap_err();
        assert!(err.is_corruption());
    }

    #[tokio::test]
    async fn test_scan() {
        let tmp = TempDir::new().unwrap();
        let dir = DiskDir::open(tmp.path(), 0o600, true).await.unwrap();
        let clean = BlockId::new(1, 0, 2);
        let staged = BlockId::new(2_000_001, 3, 2);
        dir.write(&clean, BlockState::Clean, b"cc").await.unwrap();
        dir.write(&staged, BlockState::Staging, b"ss").await.unwrap();

        let leftover = tmp.path().join("raw/chunks/0/0/1_0_2.7.tmp");
        std::fs::write(&leftover, b"partial").unwrap();

        let scan = dir.scan().await.unwrap();
        assert_eq!(scan.clean, vec![clean]);
        assert_eq!(scan.staging, vec![staged]);
        assert!(!leftover.exists());
    }

    #[test]
    fn test_space_deficit() {
        let space = DiskSpace {
            available: 50,
            total: 1_000,
        };
        assert!((space.free_ratio() - 0.05).abs() < 1e-9);
        assert_eq!(space.deficit(0.1), 50);
        assert_eq!(space.deficit(0.01), 0);
    }
}
