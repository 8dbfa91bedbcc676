//! Traffic manager: realizes a declared canary weight as a replica split
//! between the stable and candidate sets on the physical platform.
//!
//! The platform itself is a capability; absence of the target workload is
//! fatal to an operation, absence of auxiliary route plumbing is not.

use crate::api::deployment::{Deployment, TargetRef};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

/// Workload kinds the traffic manager can drive.
pub const SUPPORTED_TARGET_KINDS: &[&str] = &["Deployment", "StatefulSet", "ReplicaSet"];

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("invalid traffic weight {0}, must be in 0..=100")]
    InvalidWeight(i32),

    #[error("invalid traffic config: {0}")]
    InvalidConfig(String),

    #[error("target {0} not found on platform")]
    TargetMissing(String),

    #[error("platform error: {0}")]
    Platform(String),
}

impl TrafficError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TrafficError::TargetMissing(_) | TrafficError::Platform(_))
    }
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("target {0} not found")]
    TargetNotFound(String),

    #[error("platform unavailable: {0}")]
    Unavailable(String),
}

/// Observed readiness of the two working sets behind a target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkloadHealth {
    pub healthy: bool,
    pub ready_candidate: i32,
    pub ready_stable: i32,
}

/// Platform capability for realizing traffic splits.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Scale both working sets to the given replica counts.
    async fn set_weight(
        &self,
        target: &TargetRef,
        candidate_replicas: i32,
        stable_replicas: i32,
    ) -> Result<(), PlatformError>;

    /// Create the candidate working set if absent, scale it otherwise.
    async fn ensure_candidate_working_set(
        &self,
        target: &TargetRef,
        replicas: i32,
    ) -> Result<(), PlatformError>;

    /// Tear down the candidate working set.
    async fn delete_candidate_working_set(&self, target: &TargetRef) -> Result<(), PlatformError>;

    /// Propagate weights to service-level routing. Auxiliary: callers treat
    /// failures as non-fatal.
    async fn update_route_backends(
        &self,
        target: &TargetRef,
        candidate_weight: i32,
        stable_weight: i32,
    ) -> Result<(), PlatformError>;

    /// Observed readiness of the target's working sets.
    async fn workload_health(&self, target: &TargetRef) -> Result<WorkloadHealth, PlatformError>;

    /// Point the stable identity (labels, selectors, template) at the
    /// candidate after a successful rollout.
    async fn promote_candidate(&self, target: &TargetRef) -> Result<(), PlatformError>;
}

/// Replica split realized for a weight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrafficSplit {
    pub weight: i32,
    pub candidate_replicas: i32,
    pub stable_replicas: i32,
}

/// Split `total` replicas for a candidate weight percentage.
///
/// candidate = ⌊total·w/100⌋ with two floor rules: a non-zero weight always
/// gets at least one candidate replica, and a weight below 100 always keeps
/// at least one stable replica. Zero total yields (0, 0).
///
/// # Returns
/// Tuple of (stable_replicas, candidate_replicas)
pub fn split_replicas(total: i32, weight: i32) -> (i32, i32) {
    if total <= 0 {
        return (0, 0);
    }

    let mut candidate = (total as i64 * weight as i64 / 100) as i32;
    let mut stable = total - candidate;

    if weight > 0 && candidate == 0 {
        candidate = 1;
        stable = total - 1;
    }
    if weight < 100 && stable == 0 {
        stable = 1;
        candidate = total - 1;
    }

    (stable, candidate)
}

pub struct TrafficManager {
    platform: std::sync::Arc<dyn PlatformClient>,
}

impl TrafficManager {
    pub fn new(platform: std::sync::Arc<dyn PlatformClient>) -> Self {
        TrafficManager { platform }
    }

    pub fn platform(&self) -> &std::sync::Arc<dyn PlatformClient> {
        &self.platform
    }

    /// Realize `weight` percent candidate traffic for the deployment.
    ///
    /// Ensures the candidate working set exists, scales both sets, then
    /// best-effort propagates the weights to service routing.
    ///
    /// # Errors
    /// * `InvalidWeight` when `weight` is outside 0..=100
    /// * `TargetMissing`/`Platform` when the workload cannot be driven
    pub async fn set_traffic_weight(
        &self,
        deployment: &Deployment,
        weight: i32,
    ) -> Result<TrafficSplit, TrafficError> {
        if !(0..=100).contains(&weight) {
            return Err(TrafficError::InvalidWeight(weight));
        }

        let target = &deployment.spec.target;
        let (stable_replicas, candidate_replicas) =
            split_replicas(deployment.spec.replicas, weight);

        self.platform
            .ensure_candidate_working_set(target, candidate_replicas)
            .await
            .map_err(map_platform_error)?;

        self.platform
            .set_weight(target, candidate_replicas, stable_replicas)
            .await
            .map_err(map_platform_error)?;

        // Route propagation is auxiliary; a missing route must not undo the
        // replica change
        if let Err(e) = self
            .platform
            .update_route_backends(target, weight, 100 - weight)
            .await
        {
            warn!(
                target = %target.name,
                error = %e,
                "Route backend update failed (non-fatal)"
            );
        }

        info!(
            target = %target.name,
            weight = weight,
            candidate_replicas = candidate_replicas,
            stable_replicas = stable_replicas,
            "Traffic weight realized"
        );

        Ok(TrafficSplit {
            weight,
            candidate_replicas,
            stable_replicas,
        })
    }

    /// Current weights computed from observed ready replicas.
    ///
    /// # Returns
    /// (candidate_weight, stable_weight); (0, 100) when nothing is ready.
    pub async fn current_traffic_weights(
        &self,
        deployment: &Deployment,
    ) -> Result<(i32, i32), TrafficError> {
        let health = self
            .platform
            .workload_health(&deployment.spec.target)
            .await
            .map_err(map_platform_error)?;

        let total = health.ready_candidate + health.ready_stable;
        if total == 0 {
            return Ok((0, 100));
        }
        let candidate = (health.ready_candidate as f64 / total as f64 * 100.0).round() as i32;
        Ok((candidate, 100 - candidate))
    }

    /// Validate the traffic-facing parts of a deployment spec.
    pub fn validate_traffic_config(deployment: &Deployment) -> Result<(), TrafficError> {
        let target = &deployment.spec.target;
        if target.name.is_empty() {
            return Err(TrafficError::InvalidConfig(
                "spec.target.name cannot be empty".to_string(),
            ));
        }
        if !SUPPORTED_TARGET_KINDS.contains(&target.kind.as_str()) {
            return Err(TrafficError::InvalidConfig(format!(
                "unsupported target kind {:?}, expected one of {:?}",
                target.kind, SUPPORTED_TARGET_KINDS
            )));
        }
        for (i, step) in deployment.spec.steps.iter().enumerate() {
            if !(0..=100).contains(&step.weight) {
                return Err(TrafficError::InvalidConfig(format!(
                    "steps[{}].weight must be 0-100, got {}",
                    i, step.weight
                )));
            }
        }
        if let Some(current) = deployment.status.as_ref().and_then(|s| s.current_weight) {
            if !(0..=100).contains(&current) {
                return Err(TrafficError::InvalidConfig(format!(
                    "status.currentWeight out of range: {}",
                    current
                )));
            }
        }
        Ok(())
    }
}

fn map_platform_error(e: PlatformError) -> TrafficError {
    match e {
        PlatformError::TargetNotFound(name) => TrafficError::TargetMissing(name),
        PlatformError::Unavailable(msg) => TrafficError::Platform(msg),
    }
}

/// In-process platform used by tests and single-node simulations.
///
/// Tracks per-target replica state and records every operation for
/// assertions.
#[derive(Default)]
pub struct InMemoryPlatform {
    targets: Mutex<HashMap<String, TargetState>>,
    calls: Mutex<Vec<String>>,
    fail_routes: std::sync::atomic::AtomicBool,
}

#[derive(Clone, Debug, Default)]
pub struct TargetState {
    pub candidate_exists: bool,
    pub candidate_replicas: i32,
    pub stable_replicas: i32,
    pub route: Option<(i32, i32)>,
    pub healthy: bool,
    pub promoted: bool,
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        InMemoryPlatform::default()
    }

    /// Register a target workload so operations against it succeed.
    pub fn register_target(&self, name: &str, stable_replicas: i32) {
        self.lock_targets().insert(
            name.to_string(),
            TargetState {
                stable_replicas,
                healthy: true,
                ..Default::default()
            },
        );
    }

    pub fn set_healthy(&self, name: &str, healthy: bool) {
        if let Some(state) = self.lock_targets().get_mut(name) {
            state.healthy = healthy;
        }
    }

    /// Make route updates fail, simulating missing service plumbing.
    pub fn fail_routes(&self, fail: bool) {
        self.fail_routes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn target_state(&self, name: &str) -> Option<TargetState> {
        self.lock_targets().get(name).cloned()
    }

    /// Operation log, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.lock_calls().clone()
    }

    fn record(&self, call: String) {
        self.lock_calls().push(call);
    }

    fn lock_targets(&self) -> std::sync::MutexGuard<'_, HashMap<String, TargetState>> {
        match self.targets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl PlatformClient for InMemoryPlatform {
    async fn set_weight(
        &self,
        target: &TargetRef,
        candidate_replicas: i32,
        stable_replicas: i32,
    ) -> Result<(), PlatformError> {
        self.record(format!(
            "set_weight({}, candidate={}, stable={})",
            target.name, candidate_replicas, stable_replicas
        ));
        let mut targets = self.lock_targets();
        let state = targets
            .get_mut(&target.name)
            .ok_or_else(|| PlatformError::TargetNotFound(target.name.clone()))?;
        state.candidate_replicas = candidate_replicas;
        state.stable_replicas = stable_replicas;
        Ok(())
    }

    async fn ensure_candidate_working_set(
        &self,
        target: &TargetRef,
        replicas: i32,
    ) -> Result<(), PlatformError> {
        self.record(format!(
            "ensure_candidate({}, replicas={})",
            target.name, replicas
        ));
        let mut targets = self.lock_targets();
        let state = targets
            .get_mut(&target.name)
            .ok_or_else(|| PlatformError::TargetNotFound(target.name.clone()))?;
        state.candidate_exists = true;
        state.candidate_replicas = replicas;
        Ok(())
    }

    async fn delete_candidate_working_set(&self, target: &TargetRef) -> Result<(), PlatformError> {
        self.record(format!("delete_candidate({})", target.name));
        let mut targets = self.lock_targets();
        let state = targets
            .get_mut(&target.name)
            .ok_or_else(|| PlatformError::TargetNotFound(target.name.clone()))?;
        state.candidate_exists = false;
        state.candidate_replicas = 0;
        Ok(())
    }

    async fn update_route_backends(
        &self,
        target: &TargetRef,
        candidate_weight: i32,
        stable_weight: i32,
    ) -> Result<(), PlatformError> {
        self.record(format!(
            "update_route({}, candidate={}, stable={})",
            target.name, candidate_weight, stable_weight
        ));
        if self.fail_routes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PlatformError::Unavailable("route not found".to_string()));
        }
        let mut targets = self.lock_targets();
        let state = targets
            .get_mut(&target.name)
            .ok_or_else(|| PlatformError::TargetNotFound(target.name.clone()))?;
        state.route = Some((candidate_weight, stable_weight));
        Ok(())
    }

    async fn workload_health(&self, target: &TargetRef) -> Result<WorkloadHealth, PlatformError> {
        let targets = self.lock_targets();
        let state = targets
            .get(&target.name)
            .ok_or_else(|| PlatformError::TargetNotFound(target.name.clone()))?;
        Ok(WorkloadHealth {
            healthy: state.healthy,
            ready_candidate: state.candidate_replicas,
            ready_stable: state.stable_replicas,
        })
    }

    async fn promote_candidate(&self, target: &TargetRef) -> Result<(), PlatformError> {
        self.record(format!("promote_candidate({})", target.name));
        let mut targets = self.lock_targets();
        let state = targets
            .get_mut(&target.name)
            .ok_or_else(|| PlatformError::TargetNotFound(target.name.clone()))?;
        // The candidate pods take over the stable identity
        state.stable_replicas += state.candidate_replicas;
        state.candidate_replicas = 0;
        state.promoted = true;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "traffic_test.rs"]
mod tests;
