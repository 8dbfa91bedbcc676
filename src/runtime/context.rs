//! Shared controller context.
//!
//! One context is constructed per process and handed to every controller;
//! it owns the Prometheus registry so no collector needs a global singleton.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::Arc;

/// Prometheus collectors shared by all controllers.
///
/// Clone is cheap (collectors are Arc internally).
#[derive(Clone)]
pub struct RuntimeMetrics {
    /// Total reconciliations by controller and result (success, error, drop)
    pub reconciliations_total: IntCounterVec,
    /// Reconciliation duration in seconds per controller
    pub reconcile_duration_seconds: HistogramVec,
    /// Pending keys per controller queue
    pub queue_depth: IntGaugeVec,
    /// Current candidate traffic weight per rollout (0-100)
    pub traffic_weight: IntGaugeVec,
    /// Active rollouts by phase
    pub rollouts_active: IntGaugeVec,
    /// Cluster health (1 healthy, 0 unhealthy)
    pub cluster_healthy: IntGaugeVec,
}

impl RuntimeMetrics {
    fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let reconciliations_total = IntCounterVec::new(
            Opts::new(
                "lautta_reconciliations_total",
                "Total number of reconciliations",
            ),
            &["controller", "result"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        let reconcile_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "lautta_reconcile_duration_seconds",
                "Duration of reconciliation in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["controller"],
        )?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("lautta_queue_depth", "Pending keys per controller queue"),
            &["controller"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let traffic_weight = IntGaugeVec::new(
            Opts::new(
                "lautta_traffic_weight",
                "Current candidate traffic weight percentage",
            ),
            &["workspace", "deployment"],
        )?;
        registry.register(Box::new(traffic_weight.clone()))?;

        let rollouts_active = IntGaugeVec::new(
            Opts::new("lautta_rollouts_active", "Number of rollouts by phase"),
            &["phase"],
        )?;
        registry.register(Box::new(rollouts_active.clone()))?;

        let cluster_healthy = IntGaugeVec::new(
            Opts::new(
                "lautta_cluster_healthy",
                "Cluster probe health (1 healthy, 0 unhealthy)",
            ),
            &["cluster"],
        )?;
        registry.register(Box::new(cluster_healthy.clone()))?;

        Ok(RuntimeMetrics {
            reconciliations_total,
            reconcile_duration_seconds,
            queue_depth,
            traffic_weight,
            rollouts_active,
            cluster_healthy,
        })
    }

    pub fn record_success(&self, controller: &str, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&[controller, "success"])
            .inc();
        self.reconcile_duration_seconds
            .with_label_values(&[controller])
            .observe(duration_secs);
    }

    pub fn record_error(&self, controller: &str, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&[controller, "error"])
            .inc();
        self.reconcile_duration_seconds
            .with_label_values(&[controller])
            .observe(duration_secs);
    }

    pub fn record_drop(&self, controller: &str) {
        self.reconciliations_total
            .with_label_values(&[controller, "drop"])
            .inc();
    }
}

/// Process-wide controller context.
///
/// Constructed exactly once in `main` (or per test); controllers receive it
/// by `Arc` instead of reaching for global registries.
pub struct ControllerContext {
    registry: Registry,
    pub metrics: RuntimeMetrics,
}

impl ControllerContext {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();
        let metrics = RuntimeMetrics::register(&registry)?;
        Ok(Arc::new(ControllerContext { registry, metrics }))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_context_registers_collectors_once() {
        let ctx = ControllerContext::new().unwrap();

        ctx.metrics.record_success("deployment", 0.05);
        ctx.metrics.record_error("deployment", 0.10);
        ctx.metrics.record_drop("deployment");

        let families = ctx.registry().gather();
        let total = families
            .iter()
            .find(|f| f.get_name() == "lautta_reconciliations_total")
            .expect("counter registered");
        let sum: f64 = total
            .get_metric()
            .iter()
            .map(|m| m.get_counter().get_value())
            .sum();
        assert_eq!(sum, 3.0);
    }

    #[test]
    fn test_two_contexts_do_not_collide() {
        // Separate registries per context: no global-singleton clashes
        let a = ControllerContext::new().unwrap();
        let b = ControllerContext::new().unwrap();

        a.metrics.record_success("deployment", 0.01);
        let b_families = b.registry().gather();
        let b_total: f64 = b_families
            .iter()
            .filter(|f| f.get_name() == "lautta_reconciliations_total")
            .flat_map(|f| f.get_metric())
            .map(|m| m.get_counter().get_value())
            .sum();
        assert_eq!(b_total, 0.0);
    }
}
