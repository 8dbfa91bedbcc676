//! ClusterRegistration reconciler.
//!
//! Each pass probes the physical cluster, publishes the snapshot to the
//! health registry, and commits the registration's status conditions and
//! heartbeat. Status never touches spec (the committer enforces it).

use crate::api::cluster::{
    ClusterCapabilities, ClusterRegistration, CONDITION_CLUSTER_READY,
};
use crate::api::key::Key;
use crate::api::{set_condition, Condition, ConditionStatus};
use crate::cluster::probe::{ClusterProber, DEFAULT_PROBE_INTERVAL};
use crate::cluster::registry::HealthRegistry;
use crate::runtime::context::ControllerContext;
use crate::runtime::controller::{Action, ReconcileError, Reconciler};
use crate::store::committer::{commit_status, CommitError};
use crate::store::{ObjectStore, StoreError};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ClusterReconciler<S> {
    store: Arc<S>,
    prober: Arc<ClusterProber>,
    registry: Arc<HealthRegistry>,
    context: Arc<ControllerContext>,
}

impl<S> ClusterReconciler<S>
where
    S: ObjectStore<ClusterRegistration> + 'static,
{
    pub fn new(
        store: Arc<S>,
        prober: Arc<ClusterProber>,
        registry: Arc<HealthRegistry>,
        context: Arc<ControllerContext>,
    ) -> Arc<Self> {
        Arc::new(ClusterReconciler {
            store,
            prober,
            registry,
            context,
        })
    }
}

#[async_trait::async_trait]
impl<S> Reconciler for ClusterReconciler<S>
where
    S: ObjectStore<ClusterRegistration> + 'static,
{
    async fn reconcile(&self, key: &Key) -> Result<Action, ReconcileError> {
        let registration = match self.store.get(&key.workspace, &key.name).await {
            Ok(r) => r,
            Err(StoreError::NotFound { .. }) => {
                // Deregistered: drop the snapshot, nothing left to probe
                if self.registry.remove(&key.name).is_some() {
                    info!(cluster = %key.name, "Removed snapshot for deleted registration");
                }
                return Ok(Action::done());
            }
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        let snapshot = self.prober.probe(&registration, now).await;
        self.registry.upsert(snapshot.clone());
        self.context
            .metrics
            .cluster_healthy
            .with_label_values(&[&key.name])
            .set(i64::from(snapshot.healthy));

        if !snapshot.healthy {
            warn!(
                cluster = %key.name,
                error = ?snapshot.error,
                "Cluster probe failed"
            );
        }

        let mut desired = registration.clone();
        let status = desired.status.get_or_insert_with(Default::default);

        // Probe conditions are regenerated wholesale each pass
        for condition in &snapshot.conditions {
            set_condition(&mut status.conditions, condition.clone());
        }
        set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_CLUSTER_READY,
                if snapshot.healthy {
                    ConditionStatus::True
                } else {
                    ConditionStatus::False
                },
                if snapshot.healthy {
                    "ProbeSucceeded"
                } else {
                    "ProbeFailed"
                },
                snapshot.error.as_deref().unwrap_or(""),
                now,
            ),
        );

        if snapshot.healthy {
            // Heartbeat records the last successful contact
            status.last_heartbeat_time = Some(now);
            status.capabilities = Some(ClusterCapabilities {
                server_version: snapshot.version.clone().unwrap_or_default(),
                resource_kinds: status
                    .capabilities
                    .as_ref()
                    .map(|c| c.resource_kinds.clone())
                    .unwrap_or_default(),
                node_count: snapshot.node_count,
                features: status
                    .capabilities
                    .as_ref()
                    .map(|c| c.features.clone())
                    .unwrap_or_default(),
            });
        }

        match commit_status(self.store.as_ref(), &registration, &desired).await {
            Ok(_) => {}
            Err(CommitError::Store(e)) => return Err(e.into()),
            Err(e) => return Err(ReconcileError::Internal(e.to_string())),
        }

        Ok(Action::requeue(DEFAULT_PROBE_INTERVAL))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "reconciler_test.rs"]
mod tests;
