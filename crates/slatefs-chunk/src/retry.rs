//! Retry with capped exponential backoff and jitter for remote block I/O

use crate::config::ChunkConfig;
use crate::error::{ChunkError, ChunkResult};
use slatefs_common::BlockId;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// Retry policy shared by the upload and download pipelines
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts in total, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &ChunkConfig) -> Self {
        Self {
            max_attempts: config.io_retries.max(1),
            base_delay_ms: config.retry_delay_ms,
            max_delay_ms: config.retry_max_delay_ms.max(config.retry_delay_ms),
        }
    }

    /// Run `f` until it succeeds, fails permanently, or the budget runs out
    ///
    /// Each attempt is bounded by `timeout`; an expired attempt counts as a
    /// transient failure. `retries` is bumped once per retried attempt.
    pub async fn run<T, F, Fut>(
        &self,
        op: &'static str,
        block: BlockId,
        timeout: Duration,
        retries: &AtomicU64,
        mut f: F,
    ) -> ChunkResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = slatefs_common::Result<T>>,
    {
        let mut delay_ms = self.base_delay_ms;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match tokio::time::timeout(timeout, f()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_retryable() => e,
                Ok(Err(e)) => return Err(ChunkError::Storage(e)),
                Err(_) => slatefs_common::Error::Timeout,
            };

            if attempt >= self.max_attempts {
                if matches!(err, slatefs_common::Error::Timeout) && attempt == 1 {
                    return Err(ChunkError::Timeout { op, block, timeout });
                }
                return Err(ChunkError::RetriesExhausted {
                    op,
                    block,
                    attempts: attempt,
                    source: err,
                });
            }

            warn!(
                %block,
                attempt,
                max_attempts = self.max_attempts,
                "{op}: transient error, retrying: {err}"
            );
            retries.fetch_add(1, Ordering::Relaxed);
            let jitter = rand::random::<u64>() % delay_ms.max(1);
            tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
            delay_ms = delay_ms.saturating_mul(2).min(self.max_delay_ms);
        }
    }
}
