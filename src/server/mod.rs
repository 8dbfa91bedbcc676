//! Admin HTTP surface and process lifecycle.
//!
//! Endpoints:
//! - `/healthz` - liveness probe (process is running)
//! - `/readyz` - readiness probe (controllers are wired and watching)
//! - `/health` - JSON health report
//! - `/metrics` - Prometheus text exposition
//! - `/metrics/json` - structured JSON rendering of the same data
//! - `/metrics/metadata` - collector listing
//!
//! Also provides graceful shutdown handling for SIGTERM/SIGINT.

mod health;
pub mod metrics;
pub mod shutdown;

pub use health::{admin_router, run_admin_server, ReadinessState};
pub use metrics::{encode_json, encode_text, metadata_json};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};
