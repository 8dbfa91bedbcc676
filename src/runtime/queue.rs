//! Rate-limited work queue.
//!
//! Semantics for consumers:
//! - a key added while already pending coalesces to a single entry;
//! - a key added while being processed is re-queued only after `done`, so a
//!   given key is dispatched to at most one worker at any instant;
//! - `shutdown` stops intake and wakes blocked getters once the queue drains.

use crate::runtime::ratelimit::RateLimiter;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

pub struct RateLimitedQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
    /// Self-handle for the delayed-add tasks
    me: Weak<RateLimitedQueue<K>>,
}

impl<K> RateLimitedQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(limiter: Box<dyn RateLimiter<K>>) -> Arc<Self> {
        Arc::new_cyclic(|me| RateLimitedQueue {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter,
            me: me.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add a key for processing. Idempotent: a key already pending
    /// coalesces, a key in flight is parked until `done`.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Schedule a delayed add. Zero delays add immediately.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let Some(queue) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Requeue with the backoff the rate limiter assigns this key.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.limiter.when(&key);
        self.add_after(key, delay);
    }

    /// Reset the retry counter after success or a deliberate drop.
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    /// Failures recorded against the key since it was last forgotten.
    pub fn retries(&self, key: &K) -> u32 {
        self.limiter.retries(key)
    }

    /// Obtain one key for exclusive processing. Blocks until a key is
    /// available; returns `None` once the queue shuts down and drains.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    // Leave a wakeup for the next waiter if more work exists
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a key's processing complete, releasing any parked re-add.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Pending entries (not counting in-flight ones).
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting work and wake every blocked getter. Idempotent;
    /// inflight items still complete and `done` still functions.
    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "queue_test.rs"]
mod tests;
