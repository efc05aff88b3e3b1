//! Bandwidth limiting for the upload and download pipelines
//!
//! A single [`TokenBucket`] is shared by every worker of a pipeline, so the
//! configured limit bounds aggregate throughput rather than per-worker
//! throughput.
//!
//! Tokens are bytes. [`TokenBucket::acquire`] never rejects: a request larger
//! than the available tokens drives the bucket into debt and the caller sleeps
//! until the debt is repaid. Over any window of `t` seconds the bucket grants
//! at most `burst + rate * t` bytes.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct BucketState {
    /// Available tokens; negative while in debt
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    /// Tokens added per second
    rate: f64,
    /// Maximum tokens (burst capacity)
    burst: f64,
}

impl TokenBucket {
    /// Create a new token bucket
    ///
    /// # Arguments
    /// * `rate` - Bytes per second (sustained rate)
    /// * `burst` - Maximum bytes granted without waiting
    #[must_use]
    pub fn new(rate: u64, burst: u64) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            rate: rate.max(1) as f64,
            burst,
        }
    }

    /// Bucket for a bandwidth limit, or `None` when the limit is 0 (unlimited)
    ///
    /// The burst is a tenth of a second of traffic, but never less than one
    /// block so a full block can start without waiting on an idle bucket.
    #[must_use]
    pub fn for_limit(bytes_per_sec: u64, block_size: u32) -> Option<Self> {
        if bytes_per_sec == 0 {
            return None;
        }
        let burst = (bytes_per_sec / 10).max(u64::from(block_size));
        Some(Self::new(bytes_per_sec, burst))
    }

    /// Try to acquire tokens without blocking
    ///
    /// Returns true if tokens were acquired, false if rate limited
    pub fn try_acquire(&self, count: u64) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        let needed = count as f64;
        if state.tokens < needed {
            return false;
        }
        state.tokens -= needed;
        true
    }

    /// Acquire `count` tokens, waiting for the bucket to refill if needed
    pub async fn acquire(&self, count: u64) {
        let wait = {
            let mut state = self.state.lock();
            self.refill(&mut state);
            state.tokens -= count as f64;
            if state.tokens >= 0.0 {
                return;
            }
            Duration::from_secs_f64(-state.tokens / self.rate)
        };
        tokio::time::sleep(wait).await;
    }

    /// Currently available tokens (0 while in debt)
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens.max(0.0) as u64
    }

    /// Sustained rate in bytes per second
    pub fn rate(&self) -> u64 {
        self.rate as u64
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = elapsed.mul_add(self.rate, state.tokens).min(self.burst);
        state.last_refill = now;
    }
}
