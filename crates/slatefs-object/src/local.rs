//! Local directory object storage
//!
//! Each key maps to a file under the root directory. Writes go to a
//! temporary sibling first and are renamed into place, so a reader never
//! observes a partially written object.

use crate::{ObjectStorage, resolve_range};
use async_trait::async_trait;
use bytes::Bytes;
use slatefs_common::{Error, Result};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

const TMP_SUFFIX: &str = ".tmp";

/// Object storage rooted at a local directory
pub struct LocalStorage {
    root: PathBuf,
    name: String,
    tmp_seq: AtomicU64,
}

impl LocalStorage {
    /// Open (creating if needed) a storage root
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        let name = format!("file://{}", root.display());
        debug!(root = %root.display(), "opened local object storage");
        Ok(Self {
            root,
            name,
            tmp_seq: AtomicU64::new(0),
        })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|c| c == ".." || c.is_empty()) {
            return Err(Error::invalid_argument(format!("invalid object key: {key:?}")));
        }
        Ok(self.root.join(key))
    }

    fn not_found(key: &str, err: std::io::Error) -> Error {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::not_found(key)
        } else {
            Error::DiskIo(err)
        }
    }

    async fn walk(&self, dir: PathBuf, out: &mut Vec<String>) -> Result<()> {
        let mut stack = vec![dir];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.to_string_lossy().ends_with(TMP_SUFFIX) {
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(&self.root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_file_name(format!(
            "{}.{seq}{TMP_SUFFIX}",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        ));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_data().await?;
        drop(file);
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, key: &str, offset: u64, length: Option<u64>) -> Result<Bytes> {
        let path = self.path_for(key)?;
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| Self::not_found(key, e))?;
        let size = file.metadata().await?.len();
        let range = resolve_range(key, size, offset, length)?;
        let mut buf = vec![0u8; range.len()];
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| Self::not_found(key, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.walk(self.root.clone(), &mut keys).await?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    async fn head(&self, key: &str) -> Result<u64> {
        let path = self.path_for(key)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| Self::not_found(key, e))?;
        Ok(meta.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = LocalStorage::open(dir.path()).await.unwrap();

        let key = "chunks/0/0/7_0_11";
        store.put(key, Bytes::from_static(b"hello world")).await.unwrap();
        assert!(dir.path().join(key).exists());

        assert_eq!(&store.get(key, 0, None).await.unwrap()[..], b"hello world");
        assert_eq!(&store.get(key, 6, Some(5)).await.unwrap()[..], b"world");
        assert_eq!(store.head(key).await.unwrap(), 11);

        store.delete(key).await.unwrap();
        assert!(store.get(key, 0, None).await.unwrap_err().is_not_found());
        assert!(store.delete(key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_overwrite_and_list() {
        let dir = TempDir::new().unwrap();
        let store = LocalStorage::open(dir.path()).await.unwrap();

        store.put("chunks/0/0/1_0_1", Bytes::from_static(b"a")).await.unwrap();
        store.put("chunks/0/0/1_0_1", Bytes::from_static(b"b")).await.unwrap();
        store.put("chunks/0/2/2001_0_1", Bytes::from_static(b"c")).await.unwrap();

        assert_eq!(&store.get("chunks/0/0/1_0_1", 0, None).await.unwrap()[..], b"b");
        assert_eq!(
            store.list("chunks/").await.unwrap(),
            vec!["chunks/0/0/1_0_1", "chunks/0/2/2001_0_1"]
        );
        assert_eq!(store.list("chunks/0/2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = LocalStorage::open(dir.path()).await.unwrap();
        let err = store
            .put("../escape", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
