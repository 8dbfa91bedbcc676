//! ClusterRegistration object and cluster health snapshots.

use crate::api::{condition_is_true, Condition, ObjectMeta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Recognized cluster condition types.
pub const CONDITION_REACHABLE: &str = "Reachable";
pub const CONDITION_AUTHORIZED: &str = "Authorized";
pub const CONDITION_HEALTHY: &str = "Healthy";
pub const CONDITION_CAPABILITY_DETECTED: &str = "CapabilityDetected";
pub const CONDITION_CLUSTER_READY: &str = "Ready";

/// Heartbeats older than this make a cluster ineligible for placement.
pub const DEFAULT_HEARTBEAT_STALENESS: Duration = Duration::from_secs(90);

/// Record of a physical target cluster.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClusterRegistration {
    pub metadata: ObjectMeta,
    pub spec: ClusterSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ClusterStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// API endpoint URL of the physical cluster
    pub endpoint: String,

    /// PEM-encoded CA bundle for TLS verification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,

    /// Declared location (region/zone tag) used by placement filters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Declared infrastructure provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Declared capacity caps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<CapacityCaps>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapacityCaps {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_millis: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_workloads: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<ClusterCapabilities>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated: Option<AllocatedResources>,
}

/// Capabilities detected by the health probe.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCapabilities {
    pub server_version: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_kinds: Vec<String>,

    pub node_count: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
}

/// Resource usage attributed to workloads placed by this control plane.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedResources {
    #[serde(default)]
    pub cpu_millis: i64,

    #[serde(default)]
    pub memory_bytes: i64,

    #[serde(default)]
    pub workloads: u32,
}

impl ClusterRegistration {
    /// Eligibility for placement: Ready=True and a heartbeat within the
    /// staleness window.
    pub fn is_eligible(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        if !condition_is_true(&status.conditions, CONDITION_CLUSTER_READY) {
            return false;
        }
        match status.last_heartbeat_time {
            Some(beat) => {
                let age = now.signed_duration_since(beat);
                age.num_seconds() >= 0 && (age.num_seconds() as u64) <= staleness.as_secs()
            }
            None => false,
        }
    }
}

/// Point-in-time health and capacity view of one cluster.
///
/// Overwritten atomically by each probe; readers always receive copies.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHealthSnapshot {
    pub cluster: String,
    pub last_check: DateTime<Utc>,
    pub healthy: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub node_count: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Aggregate CPU capacity over Ready nodes, in millicores
    pub capacity_cpu_millis: i64,

    /// Aggregate memory capacity over Ready nodes, in bytes
    pub capacity_memory_bytes: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ClusterHealthSnapshot {
    /// An unhealthy snapshot recording a probe failure.
    pub fn failed(cluster: &str, now: DateTime<Utc>, error: String) -> Self {
        ClusterHealthSnapshot {
            cluster: cluster.to_string(),
            last_check: now,
            healthy: false,
            error: Some(error),
            node_count: 0,
            version: None,
            capacity_cpu_millis: 0,
            capacity_memory_bytes: 0,
            conditions: Vec::new(),
        }
    }
}
