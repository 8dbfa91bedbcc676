//! Metric analysis for promotion gating.
//!
//! The analyzer evaluates a deployment's configured metric queries (or a
//! built-in default set) and produces ordered [`AnalysisResult`]s. Values
//! come from the external time-series source when one is configured and
//! reachable, otherwise from the internal aggregators selected by
//! [`MetricKind`].

pub mod latency;
pub mod provider;

use crate::api::deployment::{
    AnalysisResult, Deployment, MetricKind, MetricQuery, ThresholdType,
};
use crate::analysis::latency::LatencyAggregator;
use crate::analysis::provider::{MetricError, MetricProvider};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Health score reported when no metric produced a result, chosen so
/// missing telemetry neither promotes nor fails a rollout by itself.
pub const NEUTRAL_HEALTH_SCORE: f64 = 50.0;

/// Gauge cell that distinguishes "never set" from zero.
struct GaugeCell(AtomicU64);

impl GaugeCell {
    fn new() -> Self {
        GaugeCell(AtomicU64::new(f64::NAN.to_bits()))
    }

    fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    fn get(&self) -> Option<f64> {
        let value = f64::from_bits(self.0.load(Ordering::Relaxed));
        if value.is_nan() {
            None
        } else {
            Some(value)
        }
    }
}

/// In-process observations used when no external source is configured.
///
/// Request outcomes and latency samples are fed by the data path; the
/// resource gauges by whichever probe owns them.
pub struct InternalMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    latency: LatencyAggregator,
    throughput_rps: GaugeCell,
    cpu_percent: GaugeCell,
    memory_bytes: GaugeCell,
}

impl Default for InternalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl InternalMetrics {
    pub fn new() -> Self {
        InternalMetrics {
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latency: LatencyAggregator::default(),
            throughput_rps: GaugeCell::new(),
            cpu_percent: GaugeCell::new(),
            memory_bytes: GaugeCell::new(),
        }
    }

    pub fn record_request(&self, errored: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if errored {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_latency(&self, latency: Duration, labels: BTreeMap<String, String>) {
        self.latency.add_sample(latency, labels);
    }

    pub fn latency(&self) -> &LatencyAggregator {
        &self.latency
    }

    pub fn set_throughput_rps(&self, value: f64) {
        self.throughput_rps.set(value);
    }

    pub fn set_cpu_percent(&self, value: f64) {
        self.cpu_percent.set(value);
    }

    pub fn set_memory_bytes(&self, value: f64) {
        self.memory_bytes.set(value);
    }

    /// Current observation for a metric kind.
    pub fn value_for(&self, kind: MetricKind) -> Result<f64, MetricError> {
        match kind {
            MetricKind::ErrorRate => {
                let requests = self.requests.load(Ordering::Relaxed);
                if requests == 0 {
                    return Err(MetricError::Unavailable(
                        "no requests observed".to_string(),
                    ));
                }
                let errors = self.errors.load(Ordering::Relaxed);
                Ok(errors as f64 / requests as f64 * 100.0)
            }
            MetricKind::Latency => self
                .latency
                .percentile(99.0)
                .ok_or_else(|| MetricError::Unavailable("no latency samples".to_string())),
            MetricKind::Throughput => self
                .throughput_rps
                .get()
                .ok_or_else(|| MetricError::Unavailable("throughput not observed".to_string())),
            MetricKind::Cpu => self
                .cpu_percent
                .get()
                .ok_or_else(|| MetricError::Unavailable("cpu not observed".to_string())),
            MetricKind::Memory => self
                .memory_bytes
                .get()
                .ok_or_else(|| MetricError::Unavailable("memory not observed".to_string())),
        }
    }
}

/// Built-in queries used when a deployment configures none:
/// error rate < 5% (weight 20), latency p99 < 200 ms (weight 15),
/// CPU utilization < 80% (weight 10). Order is fixed.
pub fn default_metric_queries() -> Vec<MetricQuery> {
    vec![
        MetricQuery {
            name: "error-rate".to_string(),
            kind: MetricKind::ErrorRate,
            query: None,
            threshold: 5.0,
            threshold_type: ThresholdType::LessThan,
            weight: Some(20),
        },
        MetricQuery {
            name: "latency-p99".to_string(),
            kind: MetricKind::Latency,
            query: None,
            threshold: 200.0,
            threshold_type: ThresholdType::LessThan,
            weight: Some(15),
        },
        MetricQuery {
            name: "cpu-utilization".to_string(),
            kind: MetricKind::Cpu,
            query: None,
            threshold: 80.0,
            threshold_type: ThresholdType::LessThan,
            weight: Some(10),
        },
    ]
}

/// Weighted success score as an integer percentage with truncation.
/// An empty or zero-weight result set scores 0.
pub fn gate_score(results: &[AnalysisResult]) -> u32 {
    let total_weight: u64 = results.iter().map(|r| r.weight as u64).sum();
    if total_weight == 0 {
        return 0;
    }
    let passed_weight: u64 = results
        .iter()
        .filter(|r| r.passed)
        .map(|r| r.weight as u64)
        .sum();
    (passed_weight * 100 / total_weight) as u32
}

/// Weighted health score as a float; 50.0 when nothing was measured so
/// missing telemetry does not bias the rollout.
pub fn health_score(results: &[AnalysisResult]) -> f64 {
    let total_weight: f64 = results.iter().map(|r| r.weight as f64).sum();
    if total_weight == 0.0 {
        return NEUTRAL_HEALTH_SCORE;
    }
    let passed_weight: f64 = results
        .iter()
        .filter(|r| r.passed)
        .map(|r| r.weight as f64)
        .sum();
    passed_weight / total_weight * 100.0
}

pub struct MetricAnalyzer {
    provider: Option<Arc<dyn MetricProvider>>,
    internal: Arc<InternalMetrics>,
}

impl MetricAnalyzer {
    pub fn new(provider: Option<Arc<dyn MetricProvider>>, internal: Arc<InternalMetrics>) -> Self {
        MetricAnalyzer { provider, internal }
    }

    pub fn internal(&self) -> &Arc<InternalMetrics> {
        &self.internal
    }

    /// Label set describing the deployment's identity, available to every
    /// configured query.
    pub fn identity_labels(deployment: &Deployment) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(
            "candidate".to_string(),
            format!("{}-candidate", deployment.spec.target.name),
        );
        labels.insert(
            "candidate_version".to_string(),
            deployment.spec.candidate_version.clone(),
        );
        labels.insert(
            "stable_version".to_string(),
            deployment.spec.stable_version.clone(),
        );
        labels.insert("target".to_string(), deployment.spec.target.name.clone());
        labels.insert(
            "namespace".to_string(),
            deployment
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
        );
        labels
    }

    /// Evaluate all configured metric queries (or the default set) in
    /// order. Duplicate metrics are evaluated twice; an unobservable metric
    /// yields a failed result rather than an error.
    pub async fn analyze(
        &self,
        deployment: &Deployment,
        now: DateTime<Utc>,
    ) -> Vec<AnalysisResult> {
        let configured = deployment
            .spec
            .analysis
            .as_ref()
            .map(|a| a.metrics.clone())
            .unwrap_or_default();
        let queries = if configured.is_empty() {
            default_metric_queries()
        } else {
            configured
        };

        let labels = Self::identity_labels(deployment);
        let mut results = Vec::with_capacity(queries.len());
        for query in &queries {
            results.push(self.evaluate(query, &labels, now).await);
        }
        results
    }

    async fn evaluate(
        &self,
        query: &MetricQuery,
        labels: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> AnalysisResult {
        let observed = self.observe(query, labels, now).await;

        match observed {
            Ok(value) => {
                let passed = match query.threshold_type {
                    ThresholdType::LessThan => value < query.threshold,
                    ThresholdType::GreaterThan => value > query.threshold,
                };
                AnalysisResult {
                    metric_name: query.name.clone(),
                    value,
                    threshold: query.threshold,
                    threshold_type: query.threshold_type,
                    passed,
                    weight: query.weight_or_default(),
                    timestamp: now,
                    error: None,
                }
            }
            Err(e) => {
                warn!(
                    metric = %query.name,
                    error = %e,
                    "Metric unavailable, recording failed result"
                );
                AnalysisResult {
                    metric_name: query.name.clone(),
                    value: 0.0,
                    threshold: query.threshold,
                    threshold_type: query.threshold_type,
                    passed: false,
                    weight: query.weight_or_default(),
                    timestamp: now,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn observe(
        &self,
        query: &MetricQuery,
        labels: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<f64, MetricError> {
        if let (Some(provider), Some(promql)) = (&self.provider, &query.query) {
            match provider.query(promql, labels, now).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        metric = %query.name,
                        error = %e,
                        "External metric source failed, falling back to internal aggregator"
                    );
                }
            }
        }
        self.internal.value_for(query.kind)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "analysis_test.rs"]
mod tests;
