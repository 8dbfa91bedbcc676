//! Cluster health registry.
//!
//! Snapshot map guarded by a reader/writer lock. Every read returns a deep
//! copy so callers can never mutate shared state. The registry also backs
//! the placement engine's cluster provider.

use crate::api::cluster::{ClusterHealthSnapshot, ClusterRegistration, DEFAULT_HEARTBEAT_STALENESS};
use crate::placement::{ClusterProvider, EligibleCluster, PlacementError};
use crate::store::{ObjectStore, Selector};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Default)]
pub struct HealthRegistry {
    snapshots: RwLock<HashMap<String, ClusterHealthSnapshot>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        HealthRegistry::default()
    }

    /// Atomically replace a cluster's snapshot.
    pub fn upsert(&self, snapshot: ClusterHealthSnapshot) {
        let mut snapshots = self.write();
        snapshots.insert(snapshot.cluster.clone(), snapshot);
    }

    /// Deep copy of one snapshot.
    pub fn get(&self, cluster: &str) -> Option<ClusterHealthSnapshot> {
        self.read().get(cluster).cloned()
    }

    /// Deep copies of every snapshot, sorted by cluster name.
    pub fn all(&self) -> Vec<ClusterHealthSnapshot> {
        let mut snapshots: Vec<ClusterHealthSnapshot> = self.read().values().cloned().collect();
        snapshots.sort_by(|a, b| a.cluster.cmp(&b.cluster));
        snapshots
    }

    pub fn remove(&self, cluster: &str) -> Option<ClusterHealthSnapshot> {
        self.write().remove(cluster)
    }

    pub fn healthy_count(&self) -> usize {
        self.read().values().filter(|s| s.healthy).count()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ClusterHealthSnapshot>> {
        match self.snapshots.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ClusterHealthSnapshot>> {
        match self.snapshots.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Placement provider backed by ClusterRegistrations and the health
/// registry: a cluster is offered when its registration is eligible
/// and its latest snapshot is healthy.
pub struct RegistryClusterProvider<S> {
    store: Arc<S>,
    registry: Arc<HealthRegistry>,
    workspace: String,
    staleness: Duration,
}

impl<S> RegistryClusterProvider<S>
where
    S: ObjectStore<ClusterRegistration>,
{
    pub fn new(store: Arc<S>, registry: Arc<HealthRegistry>, workspace: &str) -> Self {
        RegistryClusterProvider {
            store,
            registry,
            workspace: workspace.to_string(),
            staleness: DEFAULT_HEARTBEAT_STALENESS,
        }
    }

    /// Load fraction for ranking: allocated over declared capacity, with a
    /// workload-count fallback when no CPU cap is declared.
    fn load_fraction(registration: &ClusterRegistration) -> f64 {
        let Some(status) = &registration.status else {
            return 0.0;
        };
        let Some(allocated) = &status.allocated else {
            return 0.0;
        };
        if let Some(cpu_cap) = registration
            .spec
            .capacity
            .as_ref()
            .and_then(|c| c.cpu_millis)
            .filter(|cap| *cap > 0)
        {
            return (allocated.cpu_millis as f64 / cpu_cap as f64).clamp(0.0, 1.0);
        }
        if let Some(max_workloads) = registration
            .spec
            .capacity
            .as_ref()
            .and_then(|c| c.max_workloads)
            .filter(|cap| *cap > 0)
        {
            return (allocated.workloads as f64 / max_workloads as f64).clamp(0.0, 1.0);
        }
        0.0
    }
}

#[async_trait]
impl<S> ClusterProvider for RegistryClusterProvider<S>
where
    S: ObjectStore<ClusterRegistration>,
{
    async fn eligible_clusters(&self) -> Result<Vec<EligibleCluster>, PlacementError> {
        let registrations = self
            .store
            .list(&self.workspace, &Selector::everything())
            .await
            .map_err(|e| PlacementError::Provider(e.to_string()))?;

        let now = Utc::now();
        let mut eligible = Vec::new();
        for registration in registrations {
            if !registration.is_eligible(now, self.staleness) {
                continue;
            }
            let Some(snapshot) = self.registry.get(&registration.metadata.name) else {
                continue;
            };
            if !snapshot.healthy {
                continue;
            }
            eligible.push(EligibleCluster {
                name: registration.metadata.name.clone(),
                location: registration.spec.location.clone(),
                load: Self::load_fraction(&registration),
                snapshot,
            });
        }
        Ok(eligible)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "registry_test.rs"]
mod tests;
