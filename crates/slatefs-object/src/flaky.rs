//! Fault-injecting storage wrapper
//!
//! Wraps another backend and fails, delays or stalls requests on demand.
//! Used to drive the retry, timeout and corruption paths of the chunk store.

use crate::ObjectStorage;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use slatefs_common::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Kind of fault to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Retryable failure (service unavailable)
    Transient,
    /// Non-retryable failure (access denied)
    Permanent,
    /// Never completes; only a caller-side timeout ends the request
    Hang,
    /// Succeeds but returns a truncated payload (gets only)
    Truncate,
}

#[derive(Debug, Default)]
struct FaultPlan {
    put_faults: u32,
    put_kind: Option<FaultKind>,
    get_faults: u32,
    get_kind: Option<FaultKind>,
    failure_rate: f64,
    latency: Duration,
}

/// Storage wrapper that injects faults into another backend
pub struct FlakyStorage {
    inner: Arc<dyn ObjectStorage>,
    plan: Mutex<FaultPlan>,
    injected: AtomicU64,
    puts: AtomicU64,
    gets: AtomicU64,
}

impl FlakyStorage {
    pub fn new(inner: Arc<dyn ObjectStorage>) -> Self {
        Self {
            inner,
            plan: Mutex::new(FaultPlan::default()),
            injected: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
        }
    }

    /// Fail the next `count` puts with `kind`
    pub fn fail_puts(&self, count: u32, kind: FaultKind) {
        let mut plan = self.plan.lock();
        plan.put_faults = count;
        plan.put_kind = Some(kind);
    }

    /// Fail the next `count` gets with `kind`
    pub fn fail_gets(&self, count: u32, kind: FaultKind) {
        let mut plan = self.plan.lock();
        plan.get_faults = count;
        plan.get_kind = Some(kind);
    }

    /// Fail any request with probability `rate` (transient)
    pub fn set_failure_rate(&self, rate: f64) {
        self.plan.lock().failure_rate = rate.clamp(0.0, 1.0);
    }

    /// Delay every request by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.plan.lock().latency = latency;
    }

    /// Faults injected so far
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    /// Put attempts seen, including failed ones
    pub fn put_attempts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Get attempts seen, including failed ones
    pub fn get_attempts(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    fn take_fault(&self, put: bool) -> (Option<FaultKind>, Duration) {
        let mut guard = self.plan.lock();
        let plan = &mut *guard;
        let latency = plan.latency;
        let (faults, kind) = if put {
            (&mut plan.put_faults, plan.put_kind)
        } else {
            (&mut plan.get_faults, plan.get_kind)
        };
        if *faults > 0 {
            *faults -= 1;
            return (kind, latency);
        }
        let rate = plan.failure_rate;
        if rate > 0.0 && rand::thread_rng().gen_bool(rate) {
            return (Some(FaultKind::Transient), latency);
        }
        (None, latency)
    }

    async fn inject(&self, key: &str, kind: FaultKind) -> Result<()> {
        self.injected.fetch_add(1, Ordering::Relaxed);
        match kind {
            FaultKind::Transient => Err(Error::ServiceUnavailable(format!("injected fault on {key}"))),
            FaultKind::Permanent => Err(Error::AccessDenied(format!("injected fault on {key}"))),
            FaultKind::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
            FaultKind::Truncate => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStorage for FlakyStorage {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        let (fault, latency) = self.take_fault(true);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(kind) = fault {
            self.inject(key, kind).await?;
        }
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str, offset: u64, length: Option<u64>) -> Result<Bytes> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let (fault, latency) = self.take_fault(false);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match fault {
            Some(FaultKind::Truncate) => {
                self.injected.fetch_add(1, Ordering::Relaxed);
                let data = self.inner.get(key, offset, length).await?;
                Ok(data.slice(..data.len() / 2))
            }
            Some(kind) => {
                self.inject(key, kind).await?;
                self.inner.get(key, offset, length).await
            }
            None => self.inner.get(key, offset, length).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn head(&self, key: &str) -> Result<u64> {
        self.inner.head(key).await
    }
}
