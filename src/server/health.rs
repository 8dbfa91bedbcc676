//! Admin HTTP endpoints.
//!
//! - `/healthz` - Liveness: is the process alive?
//! - `/readyz` - Readiness: are the controllers initialized?
//! - `/health` - JSON health report `{status, timestamp}`
//! - `/metrics` - Prometheus text exposition
//! - `/metrics/json` - the same data as structured JSON
//! - `/metrics/metadata` - collector listing

use crate::runtime::context::ControllerContext;
use crate::server::metrics::{encode_json, encode_text, metadata_json};
use crate::server::shutdown::ShutdownSignal;
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Shared state for readiness tracking.
///
/// The process flips this once the controllers are wired and watching.
#[derive(Debug, Clone)]
pub struct ReadinessState {
    ready: Arc<std::sync::atomic::AtomicBool>,
}

impl ReadinessState {
    /// Create a new readiness state (initially not ready).
    pub fn new() -> Self {
        Self {
            ready: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Mark not ready (e.g. during shutdown) so probes return 503 and
    /// traffic drains away.
    pub fn set_not_ready(&self) {
        self.ready.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for ReadinessState {
    fn default() -> Self {
        Self::new()
    }
}

/// Combined state for the admin endpoints.
#[derive(Clone)]
pub struct ServerState {
    readiness: ReadinessState,
    context: Arc<ControllerContext>,
}

impl ServerState {
    pub fn new(readiness: ReadinessState, context: Arc<ControllerContext>) -> Self {
        Self { readiness, context }
    }
}

/// Liveness probe: if this responds, the process is alive.
async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 when ready, 503 otherwise.
async fn readyz(State(state): State<ServerState>) -> StatusCode {
    if state.readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// JSON health report.
async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    let status = if state.readiness.is_ready() {
        "ok"
    } else {
        "starting"
    };
    Json(json!({
        "status": status,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Prometheus text exposition.
async fn metrics(State(state): State<ServerState>) -> impl IntoResponse {
    match encode_text(state.context.registry()) {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

/// Structured JSON rendering of the same metric data.
async fn metrics_json(State(state): State<ServerState>) -> impl IntoResponse {
    Json(encode_json(state.context.registry()))
}

/// Collector metadata listing.
async fn metrics_metadata(State(state): State<ServerState>) -> impl IntoResponse {
    Json(metadata_json(state.context.registry()))
}

/// Build the admin router; split out so tests can drive handlers through a
/// real listener.
pub fn admin_router(readiness: ReadinessState, context: Arc<ControllerContext>) -> Router {
    let state = ServerState::new(readiness, context);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/metrics/json", get(metrics_json))
        .route("/metrics/metadata", get(metrics_metadata))
        .with_state(state)
}

/// Run the admin server until shutdown fires.
pub async fn run_admin_server(
    port: u16,
    readiness: ReadinessState,
    context: Arc<ControllerContext>,
    shutdown: ShutdownSignal,
) -> Result<(), std::io::Error> {
    let app = admin_router(readiness, context);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    // Log after successful bind - the server is actually listening
    info!(port = %port, "Admin server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(std::io::Error::other)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "health_test.rs"]
mod tests;
