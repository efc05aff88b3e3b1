//! In-memory object storage

use crate::{ObjectStorage, resolve_range};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use slatefs_common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Request counters, useful for asserting cache behaviour in tests
#[derive(Debug, Default)]
pub struct RequestCounts {
    pub puts: AtomicU64,
    pub gets: AtomicU64,
    pub deletes: AtomicU64,
}

/// Object storage backed by an in-process ordered map
#[derive(Debug, Default)]
pub struct MemStorage {
    objects: RwLock<BTreeMap<String, Bytes>>,
    counts: RequestCounts,
}

impl MemStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Whether `key` exists
    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().contains_key(key)
    }

    /// Raw stored bytes of an object
    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.objects.read().get(key).cloned()
    }

    /// Total stored bytes
    pub fn total_bytes(&self) -> u64 {
        self.objects.read().values().map(|v| v.len() as u64).sum()
    }

    pub fn puts(&self) -> u64 {
        self.counts.puts.load(Ordering::Relaxed)
    }

    pub fn gets(&self) -> u64 {
        self.counts.gets.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.counts.deletes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ObjectStorage for MemStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.counts.puts.fetch_add(1, Ordering::Relaxed);
        self.objects.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str, offset: u64, length: Option<u64>) -> Result<Bytes> {
        self.counts.gets.fetch_add(1, Ordering::Relaxed);
        let data = self
            .objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(key))?;
        let range = resolve_range(key, data.len() as u64, offset, length)?;
        Ok(data.slice(range))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.counts.deletes.fetch_add(1, Ordering::Relaxed);
        self.objects
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn head(&self, key: &str) -> Result<u64> {
        self.objects
            .read()
            .get(key)
            .map(|v| v.len() as u64)
            .ok_or_else(|| Error::not_found(key))
    }
}
