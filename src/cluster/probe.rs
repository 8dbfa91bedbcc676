//! Cluster health probing.
//!
//! Each probe checks connectivity (server version), lists a bounded number
//! of nodes, and confirms the system namespace exists. Success yields a
//! healthy snapshot with capacity aggregated over Ready nodes; any failed
//! step yields an unhealthy snapshot carrying the error.

use crate::api::cluster::{
    ClusterHealthSnapshot, ClusterRegistration, CONDITION_AUTHORIZED,
    CONDITION_CAPABILITY_DETECTED, CONDITION_HEALTHY, CONDITION_REACHABLE,
};
use crate::api::{set_condition, Condition, ConditionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// Probe cadence.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Nodes fetched per probe; larger clusters are sampled.
pub const DEFAULT_NODE_LIST_LIMIT: usize = 500;

/// Namespace whose presence marks a functional control plane.
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "kube-system";

pub const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("cluster unreachable: {0}")]
    Unreachable(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("probe failed: {0}")]
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub name: String,
    pub ready: bool,
    pub cpu_millis: i64,
    pub memory_bytes: i64,
}

/// Minimal API surface a physical cluster must expose to the prober.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn server_version(&self, endpoint: &str) -> Result<String, ProbeError>;

    async fn list_nodes(&self, endpoint: &str, limit: usize)
        -> Result<Vec<NodeInfo>, ProbeError>;

    async fn namespace_exists(&self, endpoint: &str, namespace: &str)
        -> Result<bool, ProbeError>;
}

pub struct ClusterProber {
    api: std::sync::Arc<dyn ClusterApi>,
    node_limit: usize,
    system_namespace: String,
}

impl ClusterProber {
    pub fn new(api: std::sync::Arc<dyn ClusterApi>) -> Self {
        ClusterProber {
            api,
            node_limit: DEFAULT_NODE_LIST_LIMIT,
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
        }
    }

    /// Probe one cluster and build its snapshot. Never errors: failures are
    /// encoded in the snapshot so the registry always has a current view.
    pub async fn probe(
        &self,
        registration: &ClusterRegistration,
        now: DateTime<Utc>,
    ) -> ClusterHealthSnapshot {
        let cluster = registration.metadata.name.as_str();
        let endpoint = registration.spec.endpoint.as_str();

        // Step 1: connectivity + authorization via the version endpoint
        let version = match timeout(CONNECTIVITY_TIMEOUT, self.api.server_version(endpoint)).await
        {
            Ok(Ok(version)) => version,
            Ok(Err(e)) => return Self::failed_snapshot(cluster, now, &e),
            Err(_) => {
                return Self::failed_snapshot(
                    cluster,
                    now,
                    &ProbeError::Timeout("connectivity probe"),
                )
            }
        };

        // Step 2: bounded node listing for capacity aggregation
        let nodes = match timeout(
            HEALTH_CHECK_TIMEOUT,
            self.api.list_nodes(endpoint, self.node_limit),
        )
        .await
        {
            Ok(Ok(nodes)) => nodes,
            Ok(Err(e)) => return Self::failed_snapshot(cluster, now, &e),
            Err(_) => {
                return Self::failed_snapshot(cluster, now, &ProbeError::Timeout("node listing"))
            }
        };

        // Step 3: the system namespace must exist
        match timeout(
            VALIDATION_TIMEOUT,
            self.api.namespace_exists(endpoint, &self.system_namespace),
        )
        .await
        {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                return Self::failed_snapshot(
                    cluster,
                    now,
                    &ProbeError::Failed(format!(
                        "system namespace {:?} missing",
                        self.system_namespace
                    )),
                )
            }
            Ok(Err(e)) => return Self::failed_snapshot(cluster, now, &e),
            Err(_) => {
                return Self::failed_snapshot(
                    cluster,
                    now,
                    &ProbeError::Timeout("namespace validation"),
                )
            }
        }

        let (cpu_millis, memory_bytes) = nodes
            .iter()
            .filter(|n| n.ready)
            .fold((0i64, 0i64), |(cpu, mem), n| {
                (cpu + n.cpu_millis, mem + n.memory_bytes)
            });

        let mut conditions = Vec::new();
        for condition_type in [
            CONDITION_REACHABLE,
            CONDITION_AUTHORIZED,
            CONDITION_HEALTHY,
            CONDITION_CAPABILITY_DETECTED,
        ] {
            set_condition(
                &mut conditions,
                Condition::new(condition_type, ConditionStatus::True, "ProbeSucceeded", "", now),
            );
        }

        ClusterHealthSnapshot {
            cluster: cluster.to_string(),
            last_check: now,
            healthy: true,
            error: None,
            node_count: nodes.len() as u32,
            version: Some(version),
            capacity_cpu_millis: cpu_millis,
            capacity_memory_bytes: memory_bytes,
            conditions,
        }
    }

    fn failed_snapshot(
        cluster: &str,
        now: DateTime<Utc>,
        error: &ProbeError,
    ) -> ClusterHealthSnapshot {
        let mut snapshot = ClusterHealthSnapshot::failed(cluster, now, error.to_string());

        let reachable = !matches!(error, ProbeError::Unreachable(_) | ProbeError::Timeout(_));
        let authorized = !matches!(error, ProbeError::Unauthorized(_));

        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new(
                CONDITION_REACHABLE,
                if reachable {
                    ConditionStatus::True
                } else {
                    ConditionStatus::False
                },
                "Probe",
                &error.to_string(),
                now,
            ),
        );
        set_condition(
            &mut conditions,
            Condition::new(
                CONDITION_AUTHORIZED,
                if authorized {
                    ConditionStatus::True
                } else {
                    ConditionStatus::False
                },
                "Probe",
                &error.to_string(),
                now,
            ),
        );
        set_condition(
            &mut conditions,
            Condition::new(
                CONDITION_HEALTHY,
                ConditionStatus::False,
                "ProbeFailed",
                &error.to_string(),
                now,
            ),
        );
        set_condition(
            &mut conditions,
            Condition::new(
                CONDITION_CAPABILITY_DETECTED,
                ConditionStatus::False,
                "ProbeFailed",
                "",
                now,
            ),
        );
        snapshot.conditions = conditions;
        snapshot
    }
}

/// Scripted cluster API for tests and single-process simulations.
#[derive(Default)]
pub struct MockClusterApi {
    clusters: Mutex<HashMap<String, MockCluster>>,
}

#[derive(Clone)]
pub struct MockCluster {
    pub version: String,
    pub nodes: Vec<NodeInfo>,
    pub has_system_namespace: bool,
    pub failure: Option<MockFailure>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MockFailure {
    Unreachable,
    Unauthorized,
}

impl MockClusterApi {
    pub fn new() -> Self {
        MockClusterApi::default()
    }

    pub fn add_cluster(&self, endpoint: &str, cluster: MockCluster) {
        self.lock().insert(endpoint.to_string(), cluster);
    }

    pub fn set_failure(&self, endpoint: &str, failure: Option<MockFailure>) {
        if let Some(cluster) = self.lock().get_mut(endpoint) {
            cluster.failure = failure;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MockCluster>> {
        match self.clusters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn cluster(&self, endpoint: &str) -> Result<MockCluster, ProbeError> {
        let clusters = self.lock();
        let cluster = clusters
            .get(endpoint)
            .ok_or_else(|| ProbeError::Unreachable(format!("no route to {}", endpoint)))?;
        match cluster.failure {
            Some(MockFailure::Unreachable) => {
                Err(ProbeError::Unreachable("connection refused".to_string()))
            }
            Some(MockFailure::Unauthorized) => {
                Err(ProbeError::Unauthorized("token rejected".to_string()))
            }
            None => Ok(cluster.clone()),
        }
    }
}

#[async_trait]
impl ClusterApi for MockClusterApi {
    async fn server_version(&self, endpoint: &str) -> Result<String, ProbeError> {
        Ok(self.cluster(endpoint)?.version)
    }

    async fn list_nodes(
        &self,
        endpoint: &str,
        limit: usize,
    ) -> Result<Vec<NodeInfo>, ProbeError> {
        let mut nodes = self.cluster(endpoint)?.nodes;
        nodes.truncate(limit);
        Ok(nodes)
    }

    async fn namespace_exists(
        &self,
        endpoint: &str,
        _namespace: &str,
    ) -> Result<bool, ProbeError> {
        Ok(self.cluster(endpoint)?.has_system_namespace)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "probe_test.rs"]
mod tests;
