//! Placement engine: selects target clusters for a workload by policy,
//! health and capacity.

pub mod graph;

use crate::api::cluster::ClusterHealthSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::info;

/// Reason attached to an empty selection; callers map it to a no-capacity
/// failure.
pub const REASON_NO_ELIGIBLE_CLUSTERS: &str = "no eligible clusters";

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("cluster provider failed: {0}")]
    Provider(String),

    #[error("unknown placement policy {0:?}")]
    UnknownPolicy(String),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementPolicy {
    /// Provider order, first come first served
    Any,
    /// Least-loaded clusters first
    Spread,
    /// Most-loaded clusters (that still have room) first
    Concentrate,
    /// Provider order within the requested location
    LocationFilter,
}

impl PlacementPolicy {
    pub fn parse(raw: &str) -> Result<Self, PlacementError> {
        match raw {
            "any" => Ok(PlacementPolicy::Any),
            "spread" => Ok(PlacementPolicy::Spread),
            "concentrate" => Ok(PlacementPolicy::Concentrate),
            "location-filter" => Ok(PlacementPolicy::LocationFilter),
            other => Err(PlacementError::UnknownPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for PlacementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlacementPolicy::Any => "any",
            PlacementPolicy::Spread => "spread",
            PlacementPolicy::Concentrate => "concentrate",
            PlacementPolicy::LocationFilter => "location-filter",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct PlacementRequest {
    pub policy: PlacementPolicy,
    pub location: Option<String>,
    /// Number of clusters requested; defaults to 1
    pub count: usize,
}

impl PlacementRequest {
    pub fn new(policy: PlacementPolicy) -> Self {
        PlacementRequest {
            policy,
            location: None,
            count: 1,
        }
    }
}

/// A cluster currently eligible for placement, with its latest health
/// snapshot and a load fraction in [0, 1].
#[derive(Clone, Debug)]
pub struct EligibleCluster {
    pub name: String,
    pub location: Option<String>,
    pub load: f64,
    pub snapshot: ClusterHealthSnapshot,
}

/// Capability producing the current eligibility set.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    async fn eligible_clusters(&self) -> Result<Vec<EligibleCluster>, PlacementError>;
}

/// Ordered selection plus a human-readable reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementResult {
    pub clusters: Vec<String>,
    pub reason: String,
}

impl PlacementResult {
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

pub struct PlacementEngine {
    provider: std::sync::Arc<dyn ClusterProvider>,
}

impl PlacementEngine {
    pub fn new(provider: std::sync::Arc<dyn ClusterProvider>) -> Self {
        PlacementEngine { provider }
    }

    /// Select up to `request.count` clusters.
    ///
    /// An empty selection is a legitimate outcome carrying the reason
    /// [`REASON_NO_ELIGIBLE_CLUSTERS`]; callers decide whether that is
    /// fatal for their workload.
    pub async fn place(&self, request: &PlacementRequest) -> Result<PlacementResult, PlacementError> {
        let mut clusters = self.provider.eligible_clusters().await?;

        if let Some(location) = &request.location {
            clusters.retain(|c| c.location.as_ref() == Some(location));
        }

        rank(&mut clusters, request.policy);

        if clusters.is_empty() {
            return Ok(PlacementResult {
                clusters: Vec::new(),
                reason: REASON_NO_ELIGIBLE_CLUSTERS.to_string(),
            });
        }

        let requested = request.count.max(1);
        let selected: Vec<String> = clusters
            .iter()
            .take(requested)
            .map(|c| c.name.clone())
            .collect();

        let reason = if selected.len() < requested {
            format!(
                "selected {} of {} requested clusters (policy {})",
                selected.len(),
                requested,
                request.policy
            )
        } else {
            format!("selected {} clusters (policy {})", selected.len(), request.policy)
        };

        info!(
            policy = %request.policy,
            requested = requested,
            selected = selected.len(),
            "Placement computed"
        );

        Ok(PlacementResult {
            clusters: selected,
            reason,
        })
    }
}

/// Order candidates according to the policy. Sorting is stable, so ties
/// keep provider order.
fn rank(clusters: &mut Vec<EligibleCluster>, policy: PlacementPolicy) {
    match policy {
        PlacementPolicy::Any | PlacementPolicy::LocationFilter => {}
        PlacementPolicy::Spread => {
            clusters.sort_by(|a, b| {
                a.load
                    .partial_cmp(&b.load)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        PlacementPolicy::Concentrate => {
            // Full clusters cannot take more work
            clusters.retain(|c| c.load < 1.0);
            clusters.sort_by(|a, b| {
                b.load
                    .partial_cmp(&a.load)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "placement_test.rs"]
mod tests;
