use super::*;
use crate::analysis::provider::MockMetricProvider;
use crate::analysis::InternalMetrics;
use crate::api::cluster::ClusterHealthSnapshot;
use crate::api::deployment::{
    AnalysisConfig, DeploymentSpec, MetricKind, MetricQuery, PlacementSpec, TargetRef,
    ThresholdType,
};
use crate::api::{condition_is_true, get_condition, ObjectMeta};
use crate::placement::{ClusterProvider, EligibleCluster, PlacementError};
use crate::store::memory::MemoryStore;
use crate::store::{Patch, Subresource};
use crate::traffic::InMemoryPlatform;
use serde_json::json;

struct StaticClusters {
    names: Vec<String>,
}

#[async_trait::async_trait]
impl ClusterProvider for StaticClusters {
    async fn eligible_clusters(&self) -> Result<Vec<EligibleCluster>, PlacementError> {
        Ok(self
            .names
            .iter()
            .map(|name| EligibleCluster {
                name: name.clone(),
                location: Some("eu-west".to_string()),
                load: 0.1,
                snapshot: ClusterHealthSnapshot {
                    cluster: name.clone(),
                    last_check: Utc::now(),
                    healthy: true,
                    error: None,
                    node_count: 3,
                    version: Some("v1.30.0".to_string()),
                    capacity_cpu_millis: 12_000,
                    capacity_memory_bytes: 48 << 30,
                    conditions: Vec::new(),
                },
            })
            .collect())
    }
}

struct Harness {
    store: Arc<MemoryStore<Deployment>>,
    platform: Arc<InMemoryPlatform>,
    provider: Arc<MockMetricProvider>,
    reconciler: Arc<DeploymentReconciler<MemoryStore<Deployment>>>,
}

fn harness_with_clusters(clusters: Vec<String>) -> Harness {
    let store = Arc::new(MemoryStore::<Deployment>::new());
    let platform = Arc::new(InMemoryPlatform::new());
    platform.register_target("web", 10);
    let provider = Arc::new(MockMetricProvider::new());
    let analyzer = Arc::new(MetricAnalyzer::new(
        Some(provider.clone() as Arc<_>),
        Arc::new(InternalMetrics::new()),
    ));
    let placement = Arc::new(PlacementEngine::new(Arc::new(StaticClusters {
        names: clusters,
    })));
    let traffic = Arc::new(TrafficManager::new(platform.clone() as Arc<_>));
    let context = ControllerContext::new().unwrap();
    let reconciler = DeploymentReconciler::new(store.clone(), traffic, analyzer, placement, context);
    Harness {
        store,
        platform,
        provider,
        reconciler,
    }
}

fn harness() -> Harness {
    harness_with_clusters(vec!["cluster-1".to_string()])
}

fn passing_metrics() -> AnalysisConfig {
    AnalysisConfig {
        metrics: vec![MetricQuery {
            name: "error-rate".to_string(),
            kind: MetricKind::ErrorRate,
            query: Some("error_rate{pod=\"{{candidate}}\"}".to_string()),
            threshold: 5.0,
            threshold_type: ThresholdType::LessThan,
            weight: Some(10),
        }],
        success_threshold: Some(95),
        interval_seconds: None,
    }
}

fn deployment(weights: &[i32]) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            workspace: "tenant-a".to_string(),
            name: "web".to_string(),
            ..Default::default()
        },
        spec: DeploymentSpec {
            strategy: StrategyKind::Canary,
            target: TargetRef {
                kind: "Deployment".to_string(),
                name: "web".to_string(),
            },
            stable_version: "v1".to_string(),
            candidate_version: "v2".to_string(),
            replicas: 10,
            steps: weights
                .iter()
                .map(|w| CanaryStep {
                    weight: *w,
                    duration_seconds: Some(0), // steps elapse immediately
                })
                .collect(),
            step_duration_seconds: None,
            progress_deadline_seconds: None,
            analysis: Some(passing_metrics()),
            placement: None,
            depends_on: Vec::new(),
        },
        status: None,
    }
}

fn key() -> Key {
    Key::workspace_scoped("tenant-a", "web")
}

/// Reconcile until the rollout reaches a terminal phase.
async fn drive(h: &Harness, max_passes: usize) -> Deployment {
    for _ in 0..max_passes {
        h.reconciler.reconcile(&key()).await.unwrap();
        let current = h.store.get("tenant-a", "web").await.unwrap();
        if let Some(phase) = current.status.as_ref().and_then(|s| s.phase) {
            if phase.is_terminal() {
                return current;
            }
        }
    }
    h.store.get("tenant-a", "web").await.unwrap()
}

// Happy-path canary over 10/50/100 with passing analysis.
#[tokio::test]
async fn test_happy_path_canary_succeeds() {
    let h = harness();
    h.provider.set_value("error_rate", 1.0);
    h.store.create(deployment(&[10, 50, 100])).unwrap();

    let done = drive(&h, 20).await;

    let status = done.status.unwrap();
    assert_eq!(status.phase, Some(Phase::Succeeded));
    assert_eq!(status.current_weight, Some(100));
    assert!(condition_is_true(&status.conditions, "Ready"));
    assert!(!status.analysis_history.is_empty());
    assert_eq!(status.observed_generation, Some(done.metadata.generation));

    // The final weight call carried w=100 and the stable set owns all
    // replicas after promotion
    let calls = h.platform.calls();
    assert!(calls
        .iter()
        .any(|c| c == "set_weight(web, candidate=10, stable=0)"));
    let state = h.platform.target_state("web").unwrap();
    assert!(state.promoted);
    assert_eq!(state.stable_replicas, 10);
    assert_eq!(state.candidate_replicas, 0);
    assert!(!state.candidate_exists);
}

// The analysis gate fails at score 80 < threshold 95; the
// rollout terminates and traffic returns to stable.
#[tokio::test]
async fn test_analysis_gate_failure_terminates() {
    let h = harness();
    let mut d = deployment(&[10, 100]);
    d.spec.analysis = Some(AnalysisConfig {
        metrics: vec![
            MetricQuery {
                name: "error-rate".to_string(),
                kind: MetricKind::ErrorRate,
                query: Some("error_rate".to_string()),
                threshold: 5.0,
                threshold_type: ThresholdType::LessThan,
                weight: Some(40),
            },
            MetricQuery {
                name: "latency-p99".to_string(),
                kind: MetricKind::Latency,
                query: Some("latency_p99".to_string()),
                threshold: 200.0,
                threshold_type: ThresholdType::LessThan,
                weight: Some(10),
            },
        ],
        success_threshold: Some(95),
        interval_seconds: None,
    });
    h.provider.set_value("error_rate", 1.0); // passes, weight 40
    h.provider.set_value("latency_p99", 900.0); // fails, weight 10 → score 80
    h.store.create(d).unwrap();

    let done = drive(&h, 10).await;

    let status = done.status.unwrap();
    assert_eq!(status.phase, Some(Phase::Failed));
    assert_eq!(status.current_weight, Some(0));
    let ready = get_condition(&status.conditions, "Ready").unwrap();
    assert_eq!(ready.reason, "AnalysisFailed");
    assert!(status.message.unwrap().contains("score 80"));

    // Remediation zeroed the candidate traffic
    let calls = h.platform.calls();
    assert!(calls
        .iter()
        .any(|c| c == "set_weight(web, candidate=0, stable=10)"));
    let state = h.platform.target_state("web").unwrap();
    assert!(!state.candidate_exists);
    assert!(!state.promoted);
}

// Progress deadline exceeded forces RollingBack then Failed even
// though analysis would pass.
#[tokio::test]
async fn test_progress_deadline_rollback() {
    let h = harness();
    h.provider.set_value("error_rate", 1.0);

    let mut d = deployment(&[10, 100]);
    d.spec.progress_deadline_seconds = Some(5);
    // Long steps so only the deadline can end this rollout
    for step in &mut d.spec.steps {
        step.duration_seconds = Some(3600);
    }
    d.metadata.creation_timestamp = Some(Utc::now() - chrono::Duration::seconds(6));
    h.store.create(d).unwrap();

    // Seed a mid-flight status so the rollback path (not the Pending
    // shortcut) is exercised
    let status_patch = Patch::merge(json!({
        "status": {
            "phase": "Progressing",
            "currentStepIndex": 0,
            "currentWeight": 10,
            "stepStartTime": Utc::now().to_rfc3339(),
        }
    }));
    h.store
        .patch("tenant-a", "web", &status_patch, Some(Subresource::Status))
        .await
        .unwrap();

    // First pass: trigger fires, phase moves to RollingBack
    h.reconciler.reconcile(&key()).await.unwrap();
    let mid = h.store.get("tenant-a", "web").await.unwrap();
    assert_eq!(mid.status.as_ref().unwrap().phase, Some(Phase::RollingBack));

    // Second pass: cleanup executes and the rollout fails terminally
    h.reconciler.reconcile(&key()).await.unwrap();
    let done = h.store.get("tenant-a", "web").await.unwrap();
    let status = done.status.unwrap();
    assert_eq!(status.phase, Some(Phase::Failed));
    assert_eq!(status.current_weight, Some(0));
    assert!(!condition_is_true(&status.conditions, "Ready"));

    let calls = h.platform.calls();
    assert!(calls.iter().any(|c| c.contains("delete_candidate")));
}

// Pending rollouts past their deadline fail directly: Pending has no
// RollingBack edge.
#[tokio::test]
async fn test_pending_deadline_fails_directly() {
    let h = harness();
    let mut d = deployment(&[10, 100]);
    d.spec.progress_deadline_seconds = Some(5);
    d.metadata.creation_timestamp = Some(Utc::now() - chrono::Duration::seconds(60));
    h.store.create(d).unwrap();

    h.reconciler.reconcile(&key()).await.unwrap();

    let done = h.store.get("tenant-a", "web").await.unwrap();
    assert_eq!(done.status.unwrap().phase, Some(Phase::Failed));
}

// Re-reconciling inside the step window changes nothing
// and never restarts the step timer.
#[tokio::test]
async fn test_reentry_does_not_restart_step_timer() {
    let h = harness();
    let mut d = deployment(&[10, 100]);
    for step in &mut d.spec.steps {
        step.duration_seconds = Some(3600);
    }
    h.store.create(d).unwrap();

    // First pass starts the rollout
    h.reconciler.reconcile(&key()).await.unwrap();
    let first = h.store.get("tenant-a", "web").await.unwrap();
    let first_status = first.status.clone().unwrap();
    assert_eq!(first_status.phase, Some(Phase::Progressing));
    let started_at = first_status.step_start_time.unwrap();

    // Subsequent passes hold: same phase, same step, same timer
    for _ in 0..3 {
        h.reconciler.reconcile(&key()).await.unwrap();
    }
    let later = h.store.get("tenant-a", "web").await.unwrap();
    let later_status = later.status.unwrap();
    assert_eq!(later_status.phase, Some(Phase::Progressing));
    assert_eq!(later_status.current_step_index, Some(0));
    assert_eq!(later_status.step_start_time.unwrap(), started_at);

    // Traffic was realized exactly once
    let weight_calls = h
        .platform
        .calls()
        .iter()
        .filter(|c| c.starts_with("ensure_candidate"))
        .count();
    assert_eq!(weight_calls, 1);
}

#[tokio::test]
async fn test_platform_unhealth_triggers_rollback() {
    let h = harness();
    h.provider.set_value("error_rate", 1.0);
    let mut d = deployment(&[10, 100]);
    for step in &mut d.spec.steps {
        step.duration_seconds = Some(3600);
    }
    h.store.create(d).unwrap();

    h.reconciler.reconcile(&key()).await.unwrap();
    h.platform.set_healthy("web", false);

    h.reconciler.reconcile(&key()).await.unwrap();
    let mid = h.store.get("tenant-a", "web").await.unwrap();
    assert_eq!(mid.status.as_ref().unwrap().phase, Some(Phase::RollingBack));

    h.reconciler.reconcile(&key()).await.unwrap();
    let done = h.store.get("tenant-a", "web").await.unwrap();
    assert_eq!(done.status.unwrap().phase, Some(Phase::Failed));
}

#[tokio::test]
async fn test_invalid_spec_surfaces_condition_and_permanent_error() {
    let h = harness();
    let mut d = deployment(&[10, 100]);
    d.spec.steps[1].weight = 50; // final step must be 100
    h.store.create(d).unwrap();

    let err = h.reconciler.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::InvalidConfig(_)));
    assert!(!err.is_transient());

    let stored = h.store.get("tenant-a", "web").await.unwrap();
    let status = stored.status.unwrap();
    let ready = get_condition(&status.conditions, "Ready").unwrap();
    assert_eq!(ready.status, crate::api::ConditionStatus::False);
    assert_eq!(ready.reason, "InvalidSpec");
}

#[tokio::test]
async fn test_missing_deployment_is_noop() {
    let h = harness();

    let action = h.reconciler.reconcile(&key()).await.unwrap();
    assert_eq!(action, Action::done());
}

#[tokio::test]
async fn test_placement_records_target_clusters() {
    let h = harness_with_clusters(vec!["cluster-a".to_string(), "cluster-b".to_string()]);
    h.provider.set_value("error_rate", 1.0);
    let mut d = deployment(&[100]);
    d.spec.placement = Some(PlacementSpec {
        policy: "spread".to_string(),
        location: None,
        clusters: Some(2),
    });
    h.store.create(d).unwrap();

    h.reconciler.reconcile(&key()).await.unwrap();

    let stored = h.store.get("tenant-a", "web").await.unwrap();
    let clusters = stored.status.unwrap().target_clusters;
    assert_eq!(clusters.len(), 2);
    assert!(clusters.contains(&"cluster-a".to_string()));
    assert!(clusters.contains(&"cluster-b".to_string()));
}

#[tokio::test]
async fn test_placement_no_capacity_is_surfaced_and_transient() {
    let h = harness_with_clusters(vec![]);
    let mut d = deployment(&[100]);
    d.spec.placement = Some(PlacementSpec {
        policy: "any".to_string(),
        location: None,
        clusters: Some(1),
    });
    h.store.create(d).unwrap();

    let err = h.reconciler.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::NoCapacity(_)));
    assert!(err.is_transient());

    let stored = h.store.get("tenant-a", "web").await.unwrap();
    let status = stored.status.unwrap();
    let ready = get_condition(&status.conditions, "Ready").unwrap();
    assert_eq!(ready.reason, "NoCapacity");
    assert!(status.message.unwrap().contains("no eligible clusters"));
}

// Non-canary strategies collapse to one ungated full promotion.
#[tokio::test]
async fn test_rolling_strategy_promotes_without_analysis() {
    let h = harness();
    let mut d = deployment(&[]);
    d.spec.strategy = StrategyKind::Rolling;
    d.spec.steps = Vec::new();
    d.spec.analysis = None;
    h.store.create(d).unwrap();

    let done = drive(&h, 10).await;

    let status = done.status.unwrap();
    assert_eq!(status.phase, Some(Phase::Succeeded));
    // No analysis ran for the ungated strategy
    assert!(status.analysis_history.is_empty());
    assert!(h.platform.target_state("web").unwrap().promoted);
}

// A rollout parks until every dependency in its workspace has succeeded,
// then starts on its own.
#[tokio::test]
async fn test_dependency_gates_start_until_dependency_succeeds() {
    let h = harness();
    h.provider.set_value("error_rate", 1.0);
    h.platform.register_target("db", 2);

    let mut db = deployment(&[100]);
    db.metadata.name = "db".to_string();
    db.spec.target.name = "db".to_string();
    h.store.create(db).unwrap();

    let mut web = deployment(&[100]);
    web.spec.depends_on = vec!["db".to_string()];
    h.store.create(web).unwrap();

    // web parks: db has not succeeded
    h.reconciler.reconcile(&key()).await.unwrap();
    let parked = h.store.get("tenant-a", "web").await.unwrap();
    let parked_status = parked.status.unwrap();
    assert_eq!(parked_status.phase, None);
    assert!(parked_status.message.unwrap().contains("db"));
    // No traffic realized for the parked rollout
    assert!(!h.platform.calls().iter().any(|c| c.contains("(web")));

    // Drive db to completion, then web proceeds
    let db_key = Key::workspace_scoped("tenant-a", "db");
    for _ in 0..10 {
        h.reconciler.reconcile(&db_key).await.unwrap();
    }
    let db_done = h.store.get("tenant-a", "db").await.unwrap();
    assert_eq!(db_done.status.unwrap().phase, Some(Phase::Succeeded));

    let web_done = drive(&h, 10).await;
    assert_eq!(web_done.status.unwrap().phase, Some(Phase::Succeeded));
}

// A dependency cycle is unschedulable: surfaced on the object, never
// silently broken.
#[tokio::test]
async fn test_dependency_cycle_is_fatal_to_placement() {
    let h = harness();
    h.platform.register_target("api", 2);

    let mut web = deployment(&[100]);
    web.spec.depends_on = vec!["api".to_string()];
    h.store.create(web).unwrap();

    let mut api = deployment(&[100]);
    api.metadata.name = "api".to_string();
    api.spec.target.name = "api".to_string();
    api.spec.depends_on = vec!["web".to_string()];
    h.store.create(api).unwrap();

    let err = h.reconciler.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::CycleDetected(_)));
    assert!(!err.is_transient());

    let stored = h.store.get("tenant-a", "web").await.unwrap();
    let status = stored.status.unwrap();
    let ready = get_condition(&status.conditions, "Ready").unwrap();
    assert_eq!(ready.reason, "DependencyCycle");
    assert!(status.message.unwrap().contains("cycle"));
}

// Terminal objects are left alone entirely.
#[tokio::test]
async fn test_terminal_phase_is_quiescent() {
    let h = harness();
    h.provider.set_value("error_rate", 1.0);
    h.store.create(deployment(&[100])).unwrap();

    let done = drive(&h, 10).await;
    assert_eq!(done.status.as_ref().unwrap().phase, Some(Phase::Succeeded));
    let calls_before = h.platform.calls().len();

    let action = h.reconciler.reconcile(&key()).await.unwrap();
    assert_eq!(action, Action::done());
    assert_eq!(h.platform.calls().len(), calls_before);
}
