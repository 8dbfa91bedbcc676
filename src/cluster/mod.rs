//! Cluster fleet health: periodic probes, snapshot registry, and the
//! ClusterRegistration reconciler.

pub mod probe;
pub mod reconciler;
pub mod registry;

pub use probe::{ClusterApi, ClusterProber, MockClusterApi, NodeInfo, ProbeError};
pub use reconciler::ClusterReconciler;
pub use registry::{HealthRegistry, RegistryClusterProvider};
