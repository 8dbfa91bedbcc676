use lautta::analysis::provider::{MetricProvider, PrometheusProvider};
use lautta::analysis::{InternalMetrics, MetricAnalyzer};
use lautta::api::cluster::ClusterRegistration;
use lautta::api::deployment::Deployment;
use lautta::cluster::{ClusterProber, ClusterReconciler, HealthRegistry, MockClusterApi, RegistryClusterProvider};
use lautta::placement::PlacementEngine;
use lautta::rollout::DeploymentReconciler;
use lautta::runtime::{
    default_controller_rate_limiter, run_informer, Controller, ControllerContext,
    RateLimitedQueue,
};
use lautta::server::{run_admin_server, shutdown_channel, wait_for_signal, ReadinessState};
use lautta::store::memory::MemoryStore;
use lautta::traffic::{InMemoryPlatform, TrafficManager};
use std::sync::Arc;
use tracing::{info, warn};

/// Default port for the admin endpoints
const ADMIN_PORT: u16 = 8080;

/// Default worker pool sizes
const DEPLOYMENT_WORKERS: usize = 5;
const CLUSTER_WORKERS: usize = 2;

/// Workspace holding ClusterRegistration objects
const DEFAULT_CLUSTER_WORKSPACE: &str = "root";

fn env_u16(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting lautta deployment control plane");

    // Coordinated shutdown for every component
    let (shutdown_controller, shutdown_signal) = shutdown_channel();

    // Readiness state (initially not ready)
    let readiness = ReadinessState::new();

    // One context per process owns the metrics registry
    let context = ControllerContext::new()?;

    // Admin server in the background
    let admin_port = env_u16("LAUTTA_ADMIN_PORT", ADMIN_PORT);
    let admin_handle = {
        let readiness = readiness.clone();
        let context = Arc::clone(&context);
        let shutdown = shutdown_signal.clone();
        tokio::spawn(async move {
            if let Err(e) = run_admin_server(admin_port, readiness, context, shutdown).await {
                warn!(error = %e, "Admin server failed");
            }
        })
    };
    info!(port = admin_port, "Admin server task spawned");

    // Object stores. Persistence is an external collaborator; the in-memory
    // store carries declarative state for a single-process deployment and
    // is rebuilt from list+watch on restart.
    let deployments = Arc::new(MemoryStore::<Deployment>::new());
    let clusters = Arc::new(MemoryStore::<ClusterRegistration>::new());

    // External metric source (optional; internal aggregators otherwise)
    let prometheus_address =
        std::env::var("LAUTTA_PROMETHEUS_ADDRESS").unwrap_or_else(|_| String::new());
    let provider: Option<Arc<dyn MetricProvider>> = if prometheus_address.is_empty() {
        info!("Metric source not configured - falling back to internal aggregators");
        None
    } else {
        info!(address = %prometheus_address, "Metric source configured");
        Some(Arc::new(PrometheusProvider::new(prometheus_address)))
    };
    let internal_metrics = Arc::new(InternalMetrics::new());
    let analyzer = Arc::new(MetricAnalyzer::new(provider, internal_metrics));

    // Platform and cluster API capabilities. Real drivers are external
    // collaborators; the in-process implementations back local runs.
    let platform = Arc::new(InMemoryPlatform::new());
    let traffic = Arc::new(TrafficManager::new(platform));
    let cluster_api = Arc::new(MockClusterApi::new());
    let prober = Arc::new(ClusterProber::new(cluster_api));

    // Cluster health registry feeds the placement engine
    let registry = Arc::new(HealthRegistry::new());
    let cluster_workspace = std::env::var("LAUTTA_CLUSTER_WORKSPACE")
        .unwrap_or_else(|_| DEFAULT_CLUSTER_WORKSPACE.to_string());
    let placement = Arc::new(PlacementEngine::new(Arc::new(RegistryClusterProvider::new(
        Arc::clone(&clusters),
        Arc::clone(&registry),
        &cluster_workspace,
    ))));

    // Controllers with their queues
    let deployment_queue = RateLimitedQueue::new(Box::new(default_controller_rate_limiter()));
    let deployment_reconciler = DeploymentReconciler::new(
        Arc::clone(&deployments),
        traffic,
        analyzer,
        placement,
        Arc::clone(&context),
    );
    let deployment_controller = Controller::new(
        "deployment",
        Arc::clone(&deployment_queue),
        deployment_reconciler,
        Arc::clone(&context),
        env_usize("LAUTTA_DEPLOYMENT_WORKERS", DEPLOYMENT_WORKERS),
    );

    let cluster_queue = RateLimitedQueue::new(Box::new(default_controller_rate_limiter()));
    let cluster_reconciler = ClusterReconciler::new(
        Arc::clone(&clusters),
        prober,
        Arc::clone(&registry),
        Arc::clone(&context),
    );
    let cluster_controller = Controller::new(
        "cluster",
        Arc::clone(&cluster_queue),
        cluster_reconciler,
        Arc::clone(&context),
        env_usize("LAUTTA_CLUSTER_WORKERS", CLUSTER_WORKERS),
    );

    // Informers: watch events become workspace-qualified keys
    let deployment_informer = tokio::spawn(run_informer(
        "deployment",
        deployments.watch_all(),
        deployment_queue,
        shutdown_signal.clone(),
    ));
    let cluster_informer = tokio::spawn(run_informer(
        "cluster",
        clusters.watch_all(),
        cluster_queue,
        shutdown_signal.clone(),
    ));

    // Mark ready: stores are watchable and controllers are about to run
    readiness.set_ready();
    info!("Controllers ready, starting reconciliation loops");

    let deployment_handle = tokio::spawn(deployment_controller.start(shutdown_signal.clone()));
    let cluster_handle = tokio::spawn(cluster_controller.start(shutdown_signal.clone()));

    // Run until a termination signal arrives
    let signal = wait_for_signal().await;
    info!(signal = signal, "Initiating graceful shutdown");
    // Stop advertising readiness while draining
    readiness.set_not_ready();
    shutdown_controller.shutdown();

    // Controllers drain their queues before returning
    for (name, handle) in [
        ("deployment", deployment_handle),
        ("cluster", cluster_handle),
    ] {
        match handle.await {
            Ok(Ok(())) => info!(controller = name, "Controller stopped"),
            Ok(Err(e)) => warn!(controller = name, error = %e, "Controller exited with error"),
            Err(e) => warn!(controller = name, error = %e, "Controller task failed"),
        }
    }

    deployment_informer.abort();
    cluster_informer.abort();
    admin_handle.abort();

    info!("lautta control plane shut down gracefully");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_env_helpers_fall_back_to_defaults() {
        assert_eq!(env_u16("LAUTTA_TEST_UNSET_PORT", 8080), 8080);
        assert_eq!(env_usize("LAUTTA_TEST_UNSET_WORKERS", 5), 5);
    }

    #[test]
    fn test_env_helpers_parse_values() {
        std::env::set_var("LAUTTA_TEST_PORT", "9090");
        assert_eq!(env_u16("LAUTTA_TEST_PORT", 8080), 9090);
        std::env::remove_var("LAUTTA_TEST_PORT");

        // Zero workers would deadlock the pool; rejected in favor of the
        // default
        std::env::set_var("LAUTTA_TEST_WORKERS", "0");
        assert_eq!(env_usize("LAUTTA_TEST_WORKERS", 5), 5);
        std::env::remove_var("LAUTTA_TEST_WORKERS");
    }
}
