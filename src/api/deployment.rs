//! Deployment object: the declarative record of a progressive rollout.
//!
//! Owned exclusively by the deployment controller within the object's
//! workspace. Spec is written by clients; status is written only through the
//! status committer.

use crate::api::{Condition, ObjectMeta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Recognized deployment condition types.
pub const CONDITION_PROGRESSING: &str = "Progressing";
pub const CONDITION_ANALYZING: &str = "Analyzing";
pub const CONDITION_READY: &str = "Ready";

/// Number of analysis results retained in status history.
pub const ANALYSIS_HISTORY_LIMIT: usize = 10;

/// Default seconds a step holds traffic before analysis.
pub const DEFAULT_STEP_DURATION_SECONDS: u64 = 300;

/// Default seconds before the whole rollout is considered stuck.
pub const DEFAULT_PROGRESS_DEADLINE_SECONDS: u64 = 1800;

/// Default weighted success score (percent) required to promote a step.
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 95;

/// Default weight for a metric query that does not set one.
pub const DEFAULT_METRIC_WEIGHT: u32 = 10;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Deployment {
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DeploymentStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// Rollout strategy; only canary drives the step machinery
    pub strategy: StrategyKind,

    /// Reference to the workload realized on the physical platform
    pub target: TargetRef,

    /// Version currently serving stable traffic
    pub stable_version: String,

    /// Version being rolled out
    pub candidate_version: String,

    /// Total desired replicas across stable and candidate sets
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Ordered traffic-weight steps; each weight is the cumulative
    /// percentage (0..100) directed to the candidate
    #[serde(default)]
    pub steps: Vec<CanaryStep>,

    /// Seconds each step holds before analysis; default 300
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_duration_seconds: Option<u64>,

    /// Seconds before the rollout is considered stuck; default 1800
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_deadline_seconds: Option<u64>,

    /// Metric-gated promotion configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisConfig>,

    /// Cluster selection request evaluated when the rollout starts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement: Option<PlacementSpec>,

    /// Deployments in the same workspace that must succeed before this
    /// rollout starts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

fn default_replicas() -> i32 {
    1
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Canary,
    BlueGreen,
    Rolling,
    Recreate,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyKind::Canary => "canary",
            StrategyKind::BlueGreen => "blue-green",
            StrategyKind::Rolling => "rolling",
            StrategyKind::Recreate => "recreate",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    /// Workload kind on the physical platform (e.g. "Deployment")
    pub kind: String,
    pub name: String,
}

/// One {weight, duration} entry in a canary strategy.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanaryStep {
    /// Cumulative percentage of traffic to the candidate (0..100)
    pub weight: i32,

    /// Per-step hold override in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisConfig {
    /// Metric queries evaluated at each analysis gate; a built-in default
    /// set applies when empty
    #[serde(default)]
    pub metrics: Vec<MetricQuery>,

    /// Weighted success score (percent) required to promote; default 95
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,

    /// Seconds between analysis evaluations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
}

/// What an observed metric measures.
///
/// The kind selects the internal aggregator when no external source is
/// configured; the `query` string is reserved for the external source.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MetricKind {
    ErrorRate,
    Latency,
    Throughput,
    Cpu,
    Memory,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::ErrorRate => "error-rate",
            MetricKind::Latency => "latency",
            MetricKind::Throughput => "throughput",
            MetricKind::Cpu => "cpu",
            MetricKind::Memory => "memory",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ThresholdType {
    LessThan,
    GreaterThan,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricQuery {
    pub name: String,

    pub kind: MetricKind,

    /// PromQL-compatible query sent to the external source only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    pub threshold: f64,

    pub threshold_type: ThresholdType,

    /// Relative weight in the success score; default 10
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl MetricQuery {
    pub fn weight_or_default(&self) -> u32 {
        self.weight.unwrap_or(DEFAULT_METRIC_WEIGHT)
    }
}

/// Immutable record of one metric evaluation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub metric_name: String,
    pub value: f64,
    pub threshold: f64,
    pub threshold_type: ThresholdType,
    pub passed: bool,
    pub weight: u32,
    pub timestamp: DateTime<Utc>,

    /// Set when the metric could not be observed; `passed` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Cluster selection request embedded in the spec.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementSpec {
    pub policy: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Number of clusters requested; default 1
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clusters: Option<usize>,
}

/// Phase of a progressive rollout.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Pending,
    Progressing,
    Analyzing,
    Promoting,
    Succeeded,
    Failed,
    RollingBack,
}

impl Phase {
    /// Terminal phases accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Progressing => "Progressing",
            Phase::Analyzing => "Analyzing",
            Phase::Promoting => "Promoting",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
            Phase::RollingBack => "RollingBack",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    /// Index into spec.steps of the step currently holding traffic
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_index: Option<i32>,

    /// Candidate traffic percentage most recently realized
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_weight: Option<i32>,

    /// When the current step began holding traffic; written once per step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_start_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_analysis_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Clusters chosen by the placement engine when the rollout started
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_clusters: Vec<String>,

    /// Most recent analysis results, bounded to the last ten
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub analysis_history: Vec<AnalysisResult>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DeploymentStatus {
    /// Append analysis results, keeping only the newest
    /// [`ANALYSIS_HISTORY_LIMIT`] entries.
    pub fn record_analysis(&mut self, results: impl IntoIterator<Item = AnalysisResult>) {
        self.analysis_history.extend(results);
        let len = self.analysis_history.len();
        if len > ANALYSIS_HISTORY_LIMIT {
            self.analysis_history.drain(0..len - ANALYSIS_HISTORY_LIMIT);
        }
    }
}

impl Deployment {
    /// Effective step hold duration for the given step index.
    pub fn step_duration(&self, step_index: usize) -> std::time::Duration {
        let secs = self
            .spec
            .steps
            .get(step_index)
            .and_then(|s| s.duration_seconds)
            .or(self.spec.step_duration_seconds)
            .unwrap_or(DEFAULT_STEP_DURATION_SECONDS);
        std::time::Duration::from_secs(secs)
    }

    /// Effective progress deadline.
    pub fn progress_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.spec
                .progress_deadline_seconds
                .unwrap_or(DEFAULT_PROGRESS_DEADLINE_SECONDS),
        )
    }

    /// Effective success threshold for the analysis gate.
    pub fn success_threshold(&self) -> u32 {
        self.spec
            .analysis
            .as_ref()
            .and_then(|a| a.success_threshold)
            .unwrap_or(DEFAULT_SUCCESS_THRESHOLD)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "deployment_test.rs"]
mod tests;
