//! Minimum-spacing rate limiter
//!
//! Calls that arrive too soon wait for the remaining interval instead of
//! being rejected. The lock is held across the wait, so waiting callers are
//! released one at a time in arrival order.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub struct RateLimiter {
    name: &'static str,
    min_interval: Duration,
    last_run: Mutex<Option<Instant>>,
    limit_hits: AtomicU64,
}

impl RateLimiter {
    pub fn new(name: &'static str, min_interval: Duration) -> Self {
        Self {
            name,
            min_interval,
            last_run: Mutex::new(None),
            limit_hits: AtomicU64::new(0),
        }
    }

    /// Wait until at least `min_interval` has passed since the previous call
    pub async fn acquire(&self) {
        let mut last_run = self.last_run.lock().await;

        while let Some(previous) = *last_run {
            let elapsed = previous.elapsed();
            if elapsed >= self.min_interval {
                break;
            }
            let wait = self.min_interval - elapsed;
            self.limit_hits.fetch_add(1, Ordering::Relaxed);
            debug!("Rate limit hit on {}, waiting {:?}", self.name, wait);
            tokio::time::sleep(wait).await;
        }

        *last_run = Some(Instant::now());
    }

    /// Run `f` once the spacing allows it
    pub async fn run<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire().await;
        f().await
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Number of calls that had to wait
    pub fn limit_hits(&self) -> u64 {
        self.limit_hits.load(Ordering::Relaxed)
    }
}
