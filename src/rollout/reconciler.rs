//! Deployment reconciler.
//!
//! Fetches the object by key, validates it, consults the state machine, and
//! realizes exactly one transition per pass: traffic side effects first,
//! then a status-only commit with preconditions. Every non-successful
//! terminal outcome surfaces as a Ready=False condition.

use crate::analysis::MetricAnalyzer;
use crate::api::deployment::{
    CanaryStep, Deployment, Phase, StrategyKind, CONDITION_ANALYZING, CONDITION_PROGRESSING,
    CONDITION_READY,
};
use crate::api::key::Key;
use crate::api::{set_condition, Condition, ConditionStatus};
use crate::placement::graph::{DependencyGraph, EdgeType, GraphError};
use crate::placement::{PlacementEngine, PlacementPolicy, PlacementRequest};
use crate::rollout::machine::{
    self, decide, gate, validate_transition, Decision, MachineInput, StepCompletion,
};
use crate::runtime::context::ControllerContext;
use crate::runtime::controller::{Action, ReconcileError, Reconciler};
use crate::store::committer::{commit_status, CommitError};
use crate::store::{ObjectStore, StoreError};
use crate::traffic::{TrafficError, TrafficManager};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Requeue bounds for quiescent steps, so a paused rollout neither spins
/// nor oversleeps its own timer.
const MIN_REQUEUE: Duration = Duration::from_secs(5);
const MAX_REQUEUE: Duration = Duration::from_secs(300);

/// Requeue used right after a committed transition to keep the machine
/// moving without waiting for a watch event.
const TRANSITION_REQUEUE: Duration = Duration::from_secs(1);

/// Bound on best-effort candidate teardown.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

pub struct DeploymentReconciler<S> {
    store: Arc<S>,
    traffic: Arc<TrafficManager>,
    analyzer: Arc<MetricAnalyzer>,
    placement: Arc<PlacementEngine>,
    context: Arc<ControllerContext>,
}

impl<S> DeploymentReconciler<S>
where
    S: ObjectStore<Deployment> + 'static,
{
    pub fn new(
        store: Arc<S>,
        traffic: Arc<TrafficManager>,
        analyzer: Arc<MetricAnalyzer>,
        placement: Arc<PlacementEngine>,
        context: Arc<ControllerContext>,
    ) -> Arc<Self> {
        Arc::new(DeploymentReconciler {
            store,
            traffic,
            analyzer,
            placement,
            context,
        })
    }

    /// Steps driving the machine. Non-canary strategies collapse to a
    /// single immediate full-promotion step.
    fn effective_steps(deployment: &Deployment) -> Vec<CanaryStep> {
        match deployment.spec.strategy {
            StrategyKind::Canary => deployment.spec.steps.clone(),
            StrategyKind::BlueGreen | StrategyKind::Rolling | StrategyKind::Recreate => {
                vec![CanaryStep {
                    weight: 100,
                    duration_seconds: Some(0),
                }]
            }
        }
    }

    /// The analysis gate only applies to canary rollouts; other strategies
    /// promote unconditionally once their single step is realized.
    fn gated(deployment: &Deployment) -> bool {
        deployment.spec.strategy == StrategyKind::Canary
    }

    fn validate(deployment: &Deployment) -> Result<(), String> {
        if deployment.spec.replicas < 0 {
            return Err(format!(
                "spec.replicas must be >= 0, got {}",
                deployment.spec.replicas
            ));
        }
        if deployment.spec.stable_version.is_empty() {
            return Err("spec.stableVersion cannot be empty".to_string());
        }
        if deployment.spec.candidate_version.is_empty() {
            return Err("spec.candidateVersion cannot be empty".to_string());
        }
        if deployment.spec.strategy == StrategyKind::Canary {
            machine::validate_steps(&deployment.spec.steps)?;
        }
        if let Some(analysis) = &deployment.spec.analysis {
            if let Some(threshold) = analysis.success_threshold {
                if threshold > 100 {
                    return Err(format!(
                        "spec.analysis.successThreshold must be 0-100, got {}",
                        threshold
                    ));
                }
            }
        }
        if let Some(placement) = &deployment.spec.placement {
            PlacementPolicy::parse(&placement.policy).map_err(|e| e.to_string())?;
        }
        TrafficManager::validate_traffic_config(deployment).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn phase_of(deployment: &Deployment) -> Phase {
        deployment
            .status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or(Phase::Pending)
    }

    /// Apply a validated transition onto the desired status, touching the
    /// step timer only when the step index actually changes.
    fn apply_transition(
        desired: &mut Deployment,
        from: Phase,
        to: Phase,
        step_index: Option<usize>,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        validate_transition(from, to).map_err(|e| ReconcileError::InvalidTransition {
            from: e.from,
            to: e.to,
        })?;

        let status = desired.status.get_or_insert_with(Default::default);
        let previous_step = status.current_step_index;
        status.phase = Some(to);
        status.message = Some(message);
        if let Some(step) = step_index {
            status.current_step_index = Some(step as i32);
            if previous_step != Some(step as i32) {
                // Written once per step; re-entry never restarts the timer
                status.step_start_time = Some(now);
            }
        }
        Ok(())
    }

    fn set_phase_conditions(desired: &mut Deployment, to: Phase, reason: &str, now: DateTime<Utc>) {
        let Some(status) = desired.status.as_mut() else {
            return;
        };
        let progressing = matches!(
            to,
            Phase::Progressing | Phase::Analyzing | Phase::Promoting | Phase::Pending
        );
        set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_PROGRESSING,
                if progressing {
                    ConditionStatus::True
                } else {
                    ConditionStatus::False
                },
                reason,
                "",
                now,
            ),
        );
        set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_ANALYZING,
                if to == Phase::Analyzing {
                    ConditionStatus::True
                } else {
                    ConditionStatus::False
                },
                reason,
                "",
                now,
            ),
        );
        match to {
            Phase::Succeeded => set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_READY, ConditionStatus::True, reason, "", now),
            ),
            Phase::Failed => {
                let message = status.message.clone().unwrap_or_default();
                set_condition(
                    &mut status.conditions,
                    Condition::new(CONDITION_READY, ConditionStatus::False, reason, &message, now),
                );
            }
            _ => {}
        }
    }

    async fn commit(
        &self,
        observed: &Deployment,
        desired: &Deployment,
    ) -> Result<(), ReconcileError> {
        match commit_status(self.store.as_ref(), observed, desired).await {
            Ok(_) => Ok(()),
            Err(CommitError::Store(e)) => Err(e.into()),
            Err(e) => Err(ReconcileError::Internal(e.to_string())),
        }
    }

    /// Surface a permanent validation failure on the object.
    async fn fail_validation(
        &self,
        observed: &Deployment,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        let mut desired = observed.clone();
        let status = desired.status.get_or_insert_with(Default::default);
        status.message = Some(message.to_string());
        set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                "InvalidSpec",
                message,
                now,
            ),
        );
        self.commit(observed, &desired).await
    }

    /// Tear traffic down and best-effort delete the candidate working set.
    /// Used for both gate failures and rollbacks; errors are logged, never
    /// fatal, so cleanup cannot wedge a terminating rollout.
    async fn remediate(&self, deployment: &Deployment) {
        let teardown = async {
            if let Err(e) = self.traffic.set_traffic_weight(deployment, 0).await {
                warn!(
                    deployment = %deployment.metadata.name,
                    error = %e,
                    "Failed to zero candidate traffic during teardown (non-fatal)"
                );
            }
            if let Err(e) = self
                .traffic
                .platform()
                .delete_candidate_working_set(&deployment.spec.target)
                .await
            {
                warn!(
                    deployment = %deployment.metadata.name,
                    error = %e,
                    "Failed to delete candidate working set (non-fatal)"
                );
            }
        };
        if tokio::time::timeout(CLEANUP_TIMEOUT, teardown).await.is_err() {
            warn!(
                deployment = %deployment.metadata.name,
                "Candidate teardown timed out (non-fatal)"
            );
        }
    }

    fn record_weight_metric(&self, deployment: &Deployment, weight: i32) {
        self.context
            .metrics
            .traffic_weight
            .with_label_values(&[&deployment.metadata.workspace, &deployment.metadata.name])
            .set(weight as i64);
    }

    fn track_phase_metric(&self, from: Option<Phase>, to: Phase) {
        if from == Some(to) {
            return;
        }
        if let Some(from) = from {
            self.context
                .metrics
                .rollouts_active
                .with_label_values(&[&from.to_string()])
                .dec();
        }
        self.context
            .metrics
            .rollouts_active
            .with_label_values(&[&to.to_string()])
            .inc();
    }

    /// Choose target clusters when the rollout first starts.
    async fn place_if_needed(
        &self,
        observed: &Deployment,
        desired: &mut Deployment,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        let Some(placement_spec) = &observed.spec.placement else {
            return Ok(());
        };
        let already_placed = observed
            .status
            .as_ref()
            .map(|s| !s.target_clusters.is_empty())
            .unwrap_or(false);
        if already_placed {
            return Ok(());
        }

        let policy = PlacementPolicy::parse(&placement_spec.policy)
            .map_err(|e| ReconcileError::InvalidConfig(e.to_string()))?;
        let request = PlacementRequest {
            policy,
            location: placement_spec.location.clone(),
            count: placement_spec.clusters.unwrap_or(1),
        };
        let result = self
            .placement
            .place(&request)
            .await
            .map_err(|e| ReconcileError::Transient(e.to_string()))?;

        if result.is_empty() {
            let mut failed = observed.clone();
            let status = failed.status.get_or_insert_with(Default::default);
            status.message = Some(result.reason.clone());
            set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_READY,
                    ConditionStatus::False,
                    "NoCapacity",
                    &result.reason,
                    now,
                ),
            );
            self.commit(observed, &failed).await?;
            return Err(ReconcileError::NoCapacity(result.reason));
        }

        info!(
            deployment = %observed.metadata.name,
            workspace = %observed.metadata.workspace,
            clusters = ?result.clusters,
            reason = %result.reason,
            "Placement selected target clusters"
        );
        let status = desired.status.get_or_insert_with(Default::default);
        status.target_clusters = result.clusters;
        Ok(())
    }

    fn map_traffic_error(e: TrafficError) -> ReconcileError {
        if e.is_transient() {
            ReconcileError::Transient(e.to_string())
        } else {
            ReconcileError::InvalidConfig(e.to_string())
        }
    }

    /// Gate the start of a rollout on its workspace dependency graph.
    ///
    /// Builds the graph from every deployment in the workspace (hard edge
    /// from each dependency to its dependent). A cycle through this object
    /// is fatal and surfaced on it; a dependency that has not succeeded yet
    /// parks the rollout.
    async fn dependency_gate(
        &self,
        observed: &Deployment,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, ReconcileError> {
        if observed.spec.depends_on.is_empty() {
            return Ok(None);
        }

        let workspace = &observed.metadata.workspace;
        let peers = self
            .store
            .list(workspace, &crate::store::Selector::everything())
            .await?;

        let mut graph = DependencyGraph::new();
        for peer in &peers {
            graph.add_node(&peer.metadata.name);
            for dependency in &peer.spec.depends_on {
                graph.add_edge(dependency, &peer.metadata.name, EdgeType::Hard);
            }
        }

        if let Err(GraphError::CycleDetected { path }) = graph.execution_order() {
            if path.contains(&observed.metadata.name) {
                let message = format!("dependency cycle: {}", path.join(" -> "));
                let mut failed = observed.clone();
                let status = failed.status.get_or_insert_with(Default::default);
                status.message = Some(message.clone());
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        CONDITION_READY,
                        ConditionStatus::False,
                        "DependencyCycle",
                        &message,
                        now,
                    ),
                );
                self.commit(observed, &failed).await?;
                return Err(ReconcileError::CycleDetected(message));
            }
            // A cycle elsewhere in the workspace does not block this object
        }

        for dependency in &observed.spec.depends_on {
            let succeeded = peers
                .iter()
                .find(|p| &p.metadata.name == dependency)
                .and_then(|p| p.status.as_ref())
                .and_then(|s| s.phase)
                .map(|p| p == Phase::Succeeded)
                .unwrap_or(false);
            if !succeeded {
                return Ok(Some(dependency.clone()));
            }
        }
        Ok(None)
    }
}

#[async_trait::async_trait]
impl<S> Reconciler for DeploymentReconciler<S>
where
    S: ObjectStore<Deployment> + 'static,
{
    async fn reconcile(&self, key: &Key) -> Result<Action, ReconcileError> {
        // Only the key crosses the queue; always re-read under the
        // workspace scope
        let observed = match self.store.get(&key.workspace, &key.name).await {
            Ok(d) => d,
            Err(StoreError::NotFound { .. }) => {
                info!(key = %key, "Deployment gone, nothing to reconcile");
                return Ok(Action::done());
            }
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();

        if let Err(message) = Self::validate(&observed) {
            error!(
                deployment = %key.name,
                workspace = %key.workspace,
                error = %message,
                "Deployment spec validation failed"
            );
            self.fail_validation(&observed, &message, now).await?;
            return Err(ReconcileError::InvalidConfig(message));
        }

        let mut desired = observed.clone();
        {
            let status = desired.status.get_or_insert_with(Default::default);
            status.observed_generation = Some(desired.metadata.generation);
        }

        self.place_if_needed(&observed, &mut desired, now).await?;

        let steps = Self::effective_steps(&observed);
        let phase = Self::phase_of(&observed);

        // Dependencies only gate the start; an in-flight rollout keeps going
        if phase == Phase::Pending {
            if let Some(waiting_on) = self.dependency_gate(&observed, now).await? {
                let message = format!("Waiting for dependency {} to succeed", waiting_on);
                info!(
                    deployment = %key.name,
                    workspace = %key.workspace,
                    dependency = %waiting_on,
                    "Rollout parked on dependency"
                );
                {
                    let status = desired.status.get_or_insert_with(Default::default);
                    status.message = Some(message.clone());
                    set_condition(
                        &mut status.conditions,
                        Condition::new(
                            CONDITION_PROGRESSING,
                            ConditionStatus::False,
                            "AwaitingDependencies",
                            &message,
                            now,
                        ),
                    );
                }
                self.commit(&observed, &desired).await?;
                return Ok(Action::requeue(Duration::from_secs(10)));
            }
        }
        let step_index = observed
            .status
            .as_ref()
            .and_then(|s| s.current_step_index)
            .unwrap_or(0)
            .max(0) as usize;

        // Platform probe feeds rollback trigger (c); an unreadable target
        // is not evidence of unhealth
        let platform_healthy = match self
            .traffic
            .platform()
            .workload_health(&observed.spec.target)
            .await
        {
            Ok(health) => health.healthy,
            Err(_) => true,
        };

        let empty_history = Vec::new();
        let history = observed
            .status
            .as_ref()
            .map(|s| &s.analysis_history)
            .unwrap_or(&empty_history);

        let input = MachineInput {
            phase,
            step_index,
            step_start: observed.status.as_ref().and_then(|s| s.step_start_time),
            creation: observed.metadata.creation_timestamp,
            now,
            step_duration: observed.step_duration(step_index),
            progress_deadline: observed.progress_deadline(),
            history,
            steps: &steps,
            platform_healthy,
        };
        let decision = decide(&input);

        let action = match decision {
            Decision::Start => {
                let weight = steps.first().map(|s| s.weight).unwrap_or(100);
                let split = self
                    .traffic
                    .set_traffic_weight(&observed, weight)
                    .await
                    .map_err(Self::map_traffic_error)?;
                Self::apply_transition(
                    &mut desired,
                    phase,
                    Phase::Progressing,
                    Some(0),
                    format!("Starting rollout at step 0 ({}% traffic)", weight),
                    now,
                )?;
                if let Some(status) = desired.status.as_mut() {
                    status.current_weight = Some(split.weight);
                }
                Self::set_phase_conditions(&mut desired, Phase::Progressing, "StepTrafficRealized", now);
                self.record_weight_metric(&observed, split.weight);
                info!(
                    deployment = %key.name,
                    workspace = %key.workspace,
                    weight = weight,
                    candidate_replicas = split.candidate_replicas,
                    stable_replicas = split.stable_replicas,
                    "Rollout started"
                );
                Action::requeue(clamp_requeue(input.step_duration))
            }

            Decision::Hold { remaining } => {
                // Quiescent: nothing to change, check back near the timer
                Action::requeue(clamp_requeue(remaining))
            }

            Decision::BeginAnalysis => {
                if Self::gated(&observed) {
                    Self::apply_transition(
                        &mut desired,
                        phase,
                        Phase::Analyzing,
                        None,
                        format!("Step {} duration elapsed, starting analysis", step_index),
                        now,
                    )?;
                    Self::set_phase_conditions(&mut desired, Phase::Analyzing, "StepDurationElapsed", now);
                } else {
                    // Ungated strategies skip the gate entirely
                    Self::apply_transition(
                        &mut desired,
                        phase,
                        Phase::Analyzing,
                        None,
                        format!(
                            "Analysis skipped for {} strategy",
                            observed.spec.strategy
                        ),
                        now,
                    )?;
                    Self::set_phase_conditions(&mut desired, Phase::Analyzing, "AnalysisSkipped", now);
                }
                Action::requeue(TRANSITION_REQUEUE)
            }

            Decision::RunAnalysisGate => {
                if Self::gated(&observed) {
                    let results = self.analyzer.analyze(&observed, now).await;
                    let outcome = gate(&results, observed.success_threshold());
                    {
                        let status = desired.status.get_or_insert_with(Default::default);
                        status.record_analysis(results);
                        status.last_analysis_time = Some(now);
                    }

                    if outcome.passed {
                        Self::apply_transition(
                            &mut desired,
                            phase,
                            Phase::Promoting,
                            None,
                            format!(
                                "Analysis gate passed with score {} (threshold {})",
                                outcome.score,
                                observed.success_threshold()
                            ),
                            now,
                        )?;
                        Self::set_phase_conditions(&mut desired, Phase::Promoting, "AnalysisPassed", now);
                    } else {
                        // The gate never loops: a failed step ends the rollout
                        warn!(
                            deployment = %key.name,
                            workspace = %key.workspace,
                            score = outcome.score,
                            threshold = observed.success_threshold(),
                            "Analysis gate failed, terminating rollout"
                        );
                        self.remediate(&observed).await;
                        Self::apply_transition(
                            &mut desired,
                            phase,
                            Phase::Failed,
                            None,
                            format!(
                                "Analysis gate failed with score {} (threshold {})",
                                outcome.score,
                                observed.success_threshold()
                            ),
                            now,
                        )?;
                        if let Some(status) = desired.status.as_mut() {
                            status.current_weight = Some(0);
                        }
                        Self::set_phase_conditions(&mut desired, Phase::Failed, "AnalysisFailed", now);
                        self.record_weight_metric(&observed, 0);
                    }
                } else {
                    Self::apply_transition(
                        &mut desired,
                        phase,
                        Phase::Promoting,
                        None,
                        "Promotion without analysis".to_string(),
                        now,
                    )?;
                    Self::set_phase_conditions(&mut desired, Phase::Promoting, "AnalysisSkipped", now);
                }
                Action::requeue(TRANSITION_REQUEUE)
            }

            Decision::CompleteStep(StepCompletion::NextStep(next)) => {
                let weight = steps.get(next).map(|s| s.weight).unwrap_or(100);
                let split = self
                    .traffic
                    .set_traffic_weight(&observed, weight)
                    .await
                    .map_err(Self::map_traffic_error)?;
                Self::apply_transition(
                    &mut desired,
                    phase,
                    Phase::Progressing,
                    Some(next),
                    format!("Advanced to step {} ({}% traffic)", next, weight),
                    now,
                )?;
                if let Some(status) = desired.status.as_mut() {
                    status.current_weight = Some(split.weight);
                }
                Self::set_phase_conditions(&mut desired, Phase::Progressing, "StepTrafficRealized", now);
                self.record_weight_metric(&observed, split.weight);
                Action::requeue(clamp_requeue(observed.step_duration(next)))
            }

            Decision::CompleteStep(StepCompletion::FinalStep) => {
                // Make sure the platform really carries 100% candidate
                self.traffic
                    .set_traffic_weight(&observed, 100)
                    .await
                    .map_err(Self::map_traffic_error)?;
                self.traffic
                    .platform()
                    .promote_candidate(&observed.spec.target)
                    .await
                    .map_err(|e| ReconcileError::Transient(e.to_string()))?;
                // Candidate working set is spent once promoted
                if let Err(e) = self
                    .traffic
                    .platform()
                    .delete_candidate_working_set(&observed.spec.target)
                    .await
                {
                    warn!(
                        deployment = %key.name,
                        error = %e,
                        "Failed to delete candidate working set after promotion (non-fatal)"
                    );
                }
                Self::apply_transition(
                    &mut desired,
                    phase,
                    Phase::Succeeded,
                    None,
                    "Rollout completed: 100% traffic to candidate".to_string(),
                    now,
                )?;
                if let Some(status) = desired.status.as_mut() {
                    status.current_weight = Some(100);
                }
                Self::set_phase_conditions(&mut desired, Phase::Succeeded, "RolloutSucceeded", now);
                self.record_weight_metric(&observed, 100);
                info!(
                    deployment = %key.name,
                    workspace = %key.workspace,
                    "Rollout succeeded"
                );
                Action::done()
            }

            Decision::Rollback(reason) => {
                warn!(
                    deployment = %key.name,
                    workspace = %key.workspace,
                    reason = %reason,
                    "Rollback triggered"
                );
                if validate_transition(phase, Phase::RollingBack).is_ok() {
                    Self::apply_transition(
                        &mut desired,
                        phase,
                        Phase::RollingBack,
                        None,
                        format!("Rolling back: {}", reason),
                        now,
                    )?;
                    Self::set_phase_conditions(&mut desired, Phase::RollingBack, reason.reason_code(), now);
                    Action::requeue(TRANSITION_REQUEUE)
                } else {
                    // Phases without a RollingBack edge fail directly
                    self.remediate(&observed).await;
                    Self::apply_transition(
                        &mut desired,
                        phase,
                        Phase::Failed,
                        None,
                        format!("Rollout failed: {}", reason),
                        now,
                    )?;
                    if let Some(status) = desired.status.as_mut() {
                        status.current_weight = Some(0);
                    }
                    Self::set_phase_conditions(&mut desired, Phase::Failed, reason.reason_code(), now);
                    self.record_weight_metric(&observed, 0);
                    Action::done()
                }
            }

            Decision::ExecuteRollback => {
                self.remediate(&observed).await;
                let message = observed
                    .status
                    .as_ref()
                    .and_then(|s| s.message.clone())
                    .unwrap_or_else(|| "Rolled back".to_string());
                Self::apply_transition(&mut desired, phase, Phase::Failed, None, message, now)?;
                if let Some(status) = desired.status.as_mut() {
                    status.current_weight = Some(0);
                }
                Self::set_phase_conditions(&mut desired, Phase::Failed, "RolledBack", now);
                self.record_weight_metric(&observed, 0);
                Action::done()
            }

            Decision::Finished => Action::done(),
        };

        let new_phase = desired.status.as_ref().and_then(|s| s.phase);
        self.commit(&observed, &desired).await?;
        if let Some(new_phase) = new_phase {
            self.track_phase_metric(
                observed.status.as_ref().and_then(|s| s.phase),
                new_phase,
            );
        }

        Ok(action)
    }
}

/// Clamp a requeue interval so quiescent steps poll lazily but never
/// oversleep past their own timer.
fn clamp_requeue(remaining: Duration) -> Duration {
    remaining.clamp(MIN_REQUEUE, MAX_REQUEUE)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "reconciler_test.rs"]
mod tests;
