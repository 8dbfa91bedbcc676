//! Requeue rate limiting.
//!
//! Failed keys back off exponentially per item; a token bucket provides
//! global fairness across items sharing a queue. The default controller
//! limiter is the max of both, so a pathological key cannot starve the queue
//! and a burst of distinct keys cannot stampede the store.

use rand::Rng;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Decides how long a failed item waits before requeue.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before the item may be retried. Calling `when` records one
    /// more failure for the item.
    fn when(&self, item: &K) -> Duration;

    /// Reset the failure count for an item after success or drop.
    fn forget(&self, item: &K);

    /// Failures recorded for the item so far.
    fn retries(&self, item: &K) -> u32;
}

/// Per-item exponential backoff with jitter.
///
/// delay = base * 2^failures, capped, with up to 10% added jitter so
/// synchronized failures fan out.
pub struct ItemExponentialBackoff<K> {
    base: Duration,
    cap: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ItemExponentialBackoff<K> {
    pub fn new(base: Duration, cap: Duration) -> Self {
        ItemExponentialBackoff {
            base,
            cap,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, u32>> {
        match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<K: Eq + Hash + Clone + Send + Sync> RateLimiter<K> for ItemExponentialBackoff<K> {
    fn when(&self, item: &K) -> Duration {
        let exponent = {
            let mut failures = self.lock();
            let entry = failures.entry(item.clone()).or_insert(0);
            let exponent = *entry;
            *entry = entry.saturating_add(1);
            exponent
        };

        let base_secs = self.base.as_secs_f64();
        let backoff = base_secs * 2f64.powi(exponent.min(62) as i32);
        let jittered = backoff * (1.0 + rand::thread_rng().gen::<f64>() * 0.1);
        let capped = jittered.min(self.cap.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    fn forget(&self, item: &K) {
        self.lock().remove(item);
    }

    fn retries(&self, item: &K) -> u32 {
        self.lock().get(item).copied().unwrap_or(0)
    }
}

/// Token bucket limiter shared by all items on a queue.
///
/// Reservations may go negative, so callers are told how long to wait for
/// the token they just claimed.
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: f64) -> Self {
        TokenBucket {
            qps,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    fn reserve(&self) -> Duration {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
        state.last_refill = now;
        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.qps)
        }
    }
}

impl<K: Send + Sync> RateLimiter<K> for TokenBucket {
    fn when(&self, _item: &K) -> Duration {
        self.reserve()
    }

    fn forget(&self, _item: &K) {}

    fn retries(&self, _item: &K) -> u32 {
        0
    }
}

/// Combines limiters by taking the worst (longest) delay.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        MaxOfRateLimiter { limiters }
    }
}

impl<K: Send + Sync> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &K) {
        for l in &self.limiters {
            l.forget(item);
        }
    }

    fn retries(&self, item: &K) -> u32 {
        self.limiters.iter().map(|l| l.retries(item)).max().unwrap_or(0)
    }
}

/// Default controller limiter: 5 ms..1000 s per-item exponential backoff
/// combined with a 10 qps / 100 burst fairness bucket.
pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialBackoff::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(TokenBucket::new(10.0, 100.0)),
    ])
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "ratelimit_test.rs"]
mod tests;
