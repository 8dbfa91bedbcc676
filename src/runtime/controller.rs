//! Controller: a worker pool draining a rate-limited queue of keys.
//!
//! Workers hold a key exclusively from `get` to `done`, dispatch it to the
//! reconciler, and requeue on transient failure with bounded retries. The
//! queue lock is never held across a reconciliation.

use crate::api::deployment::Phase;
use crate::api::key::Key;
use crate::runtime::context::ControllerContext;
use crate::runtime::queue::RateLimitedQueue;
use crate::server::shutdown::ShutdownSignal;
use crate::store::StoreError;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// Retries before a key is dropped and the controller reports unhealthy.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// How long a dropped key keeps the controller reporting unhealthy.
pub const UNHEALTHY_RECOVERY_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller {0} already started")]
    AlreadyStarted(String),
}

/// What a reconciler asks the runtime to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    pub requeue_after: Option<Duration>,
}

impl Action {
    /// Nothing further; wait for the next watch event.
    pub fn done() -> Self {
        Action { requeue_after: None }
    }

    /// Check back after the given delay.
    pub fn requeue(after: Duration) -> Self {
        Action {
            requeue_after: Some(after),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid phase transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("no capacity: {0}")]
    NoCapacity(String),

    #[error("dependency cycle: {0}")]
    CycleDetected(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    /// Transient errors are requeued with backoff; permanent ones are
    /// surfaced on the object and dropped without retry.
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcileError::Store(e) => e.is_transient(),
            ReconcileError::Transient(_) | ReconcileError::NoCapacity(_) => true,
            ReconcileError::InvalidConfig(_)
            | ReconcileError::InvalidTransition { .. }
            | ReconcileError::CycleDetected(_)
            | ReconcileError::Internal(_) => false,
        }
    }
}

/// A keyed reconciler. Receives only the key and must re-fetch the object
/// under its workspace scope.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, key: &Key) -> Result<Action, ReconcileError>;
}

/// Latch raised when a key exhausts its retry budget; clears itself after
/// the recovery window.
pub struct HealthLatch {
    window: Duration,
    last_drop: Mutex<Option<Instant>>,
}

impl HealthLatch {
    pub fn new(window: Duration) -> Self {
        HealthLatch {
            window,
            last_drop: Mutex::new(None),
        }
    }

    pub fn mark_unhealthy(&self) {
        let mut last = match self.last_drop.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = Some(Instant::now());
    }

    pub fn is_healthy(&self) -> bool {
        let last = match self.last_drop.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match *last {
            Some(at) => at.elapsed() >= self.window,
            None => true,
        }
    }
}

pub struct Controller<R: Reconciler> {
    name: String,
    queue: Arc<RateLimitedQueue<Key>>,
    reconciler: Arc<R>,
    context: Arc<ControllerContext>,
    workers: usize,
    max_retries: u32,
    started: AtomicBool,
    health: HealthLatch,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(
        name: &str,
        queue: Arc<RateLimitedQueue<Key>>,
        reconciler: Arc<R>,
        context: Arc<ControllerContext>,
        workers: usize,
    ) -> Arc<Self> {
        Arc::new(Controller {
            name: name.to_string(),
            queue,
            reconciler,
            context,
            workers,
            max_retries: DEFAULT_MAX_RETRIES,
            started: AtomicBool::new(false),
            health: HealthLatch::new(UNHEALTHY_RECOVERY_WINDOW),
        })
    }

    pub fn queue(&self) -> &Arc<RateLimitedQueue<Key>> {
        &self.queue
    }

    /// True unless a key was recently dropped after exhausting retries.
    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    /// Run the worker pool until `shutdown` fires and the queue drains.
    ///
    /// # Errors
    /// `AlreadyStarted` if called twice on the same controller.
    pub async fn start(
        self: Arc<Self>,
        shutdown: ShutdownSignal,
    ) -> Result<(), ControllerError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ControllerError::AlreadyStarted(self.name.clone()));
        }

        info!(
            controller = %self.name,
            workers = self.workers,
            "Starting controller"
        );

        // Propagate cancellation to the queue so blocked getters wake up
        let stopper = {
            let queue = Arc::clone(&self.queue);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                queue.shutdown();
            })
        };

        let mut handles = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let controller = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                controller.worker_loop(worker_id).await;
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(controller = %self.name, error = ?e, "Worker task failed");
            }
        }
        stopper.abort();

        info!(controller = %self.name, "Controller drained and stopped");
        Ok(())
    }

    async fn worker_loop(&self, worker_id: usize) {
        while let Some(key) = self.queue.get().await {
            self.process(worker_id, key).await;
            self.context
                .metrics
                .queue_depth
                .with_label_values(&[&self.name])
                .set(self.queue.len() as i64);
        }
    }

    async fn process(&self, worker_id: usize, key: Key) {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.reconciler.reconcile(&key))
            .catch_unwind()
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(Ok(action)) => {
                self.queue.forget(&key);
                self.context.metrics.record_success(&self.name, elapsed);
                if let Some(delay) = action.requeue_after {
                    self.queue.add_after(key.clone(), delay);
                }
            }
            Ok(Err(err)) if err.is_transient() => {
                self.context.metrics.record_error(&self.name, elapsed);
                let retries = self.queue.retries(&key);
                if retries < self.max_retries {
                    warn!(
                        controller = %self.name,
                        key = %key,
                        retries = retries,
                        error = %err,
                        "Reconcile failed, requeueing with backoff"
                    );
                    self.queue.add_rate_limited(key.clone());
                } else {
                    error!(
                        controller = %self.name,
                        key = %key,
                        retries = retries,
                        error = %err,
                        "Retry budget exhausted, dropping key"
                    );
                    self.queue.forget(&key);
                    self.context.metrics.record_drop(&self.name);
                    self.health.mark_unhealthy();
                }
            }
            Ok(Err(err)) => {
                // Permanent: the reconciler has surfaced it on the object
                self.context.metrics.record_error(&self.name, elapsed);
                warn!(
                    controller = %self.name,
                    key = %key,
                    error = %err,
                    "Reconcile failed permanently, not retrying"
                );
                self.queue.forget(&key);
            }
            Err(panic) => {
                self.context.metrics.record_error(&self.name, elapsed);
                error!(
                    controller = %self.name,
                    worker = worker_id,
                    key = %key,
                    panic = ?panic,
                    "Reconciler panicked; recovering worker"
                );
                // One requeue after a panic, then the key is dropped
                if self.queue.retries(&key) == 0 {
                    self.queue.add_rate_limited(key.clone());
                } else {
                    self.queue.forget(&key);
                    self.context.metrics.record_drop(&self.name);
                    self.health.mark_unhealthy();
                }
            }
        }

        self.queue.done(&key);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "controller_test.rs"]
mod tests;
