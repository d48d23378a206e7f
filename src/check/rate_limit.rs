//! Aggregate bandwidth limiting for throughput tests

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by every throughput worker
///
/// Tokens are bytes. A take that overdraws the bucket leaves it in debt and
/// the caller sleeps until the debt is paid back, so concurrent readers share
/// the configured rate instead of racing for it.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    inner: Option<Mutex<Bucket>>,
}

impl TokenBucket {
    /// Bucket refilling at `rate` bytes per second, holding at most `capacity`
    pub fn new(rate: f64, capacity: f64) -> Self {
        if rate <= 0.0 {
            return Self::unlimited();
        }
        let capacity = capacity.max(1.0);
        Self {
            rate,
            capacity,
            inner: Some(Mutex::new(Bucket {
                tokens: capacity,
                last: Instant::now(),
            })),
        }
    }

    /// Bucket for an aggregate ceiling in MB/s, 0 for none
    pub fn from_mbps(mbps: u32) -> Self {
        let rate = f64::from(mbps) * 1024.0 * 1024.0;
        Self::new(rate, rate / 10.0)
    }

    pub fn unlimited() -> Self {
        Self {
            rate: 0.0,
            capacity: 0.0,
            inner: None,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.inner.is_some()
    }

    /// Account for `n` bytes, waiting if the bucket is in debt
    pub async fn take(&self, n: usize) {
        let Some(inner) = &self.inner else {
            return;
        };
        let wait = {
            let mut bucket = inner.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last).as_secs_f64();
            bucket.last = now;
            bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
            bucket.tokens -= n as f64;
            if bucket.tokens < 0.0 {
                Some(Duration::from_secs_f64(-bucket.tokens / self.rate))
            } else {
                None
            }
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::unlimited()
    }
}
