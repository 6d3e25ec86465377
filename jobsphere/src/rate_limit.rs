// Token-bucket admission control for job execution
//
// Acquisition is non-blocking: an invocation that finds the bucket empty is
// skipped, not queued. Replenishment and capacity are both the job's
// concurrency ceiling, so a full elapsed period always refills the bucket to
// capacity and partial-period accounting is unnecessary.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

/// In-process token bucket: `capacity` tokens, `capacity` more every
/// `period`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    period: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, period: Duration) -> Self {
        Self {
            capacity,
            period,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Attempt a single non-blocking token acquisition.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;

        if state.last_refill.elapsed() >= self.period {
            state.tokens = self.capacity;
            state.last_refill = Instant::now();
        }

        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            debug!(capacity = self.capacity, period_ms = self.period.as_millis() as u64, "token bucket empty");
            false
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}
