//! Object store capability.
//!
//! The core consumes declarative objects through this trait; persistence is
//! an external collaborator. Patches use JSON-merge semantics and the status
//! subresource never alters spec.

pub mod committer;
pub mod memory;

use crate::api::ObjectMeta;
use async_trait::async_trait;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::pin::Pin;
use thiserror::Error;

/// Anything the store can hold: serializable, workspace-scoped, with shared
/// object metadata.
pub trait StoredObject:
    Clone + Send + Sync + Serialize + DeserializeOwned + PartialEq + 'static
{
    fn kind() -> &'static str;
    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;
}

impl StoredObject for crate::api::deployment::Deployment {
    fn kind() -> &'static str {
        "Deployment"
    }
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl StoredObject for crate::api::cluster::ClusterRegistration {
    fn kind() -> &'static str {
        "ClusterRegistration"
    }
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {workspace}|{name} not found")]
    NotFound {
        kind: &'static str,
        workspace: String,
        name: String,
    },

    #[error("version conflict on {kind} {workspace}|{name}: {detail}")]
    Conflict {
        kind: &'static str,
        workspace: String,
        name: String,
        detail: String,
    },

    #[error("invalid object: {0}")]
    InvalidObject(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Conflicts and availability failures are retryable; the rest are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Unavailable(_))
    }
}

/// Label selector for list operations. Empty selects everything.
#[derive(Clone, Debug, Default)]
pub struct Selector {
    pub labels: BTreeMap<String, String>,
}

impl Selector {
    pub fn everything() -> Self {
        Selector::default()
    }

    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| meta.labels.get(k) == Some(v))
    }
}

/// A watch event. Deletions may arrive as tombstones when the store has
/// already dropped the object; consumers must recover the object reference
/// before computing a key.
#[derive(Clone, Debug)]
pub enum WatchEvent<T> {
    Added(T),
    Updated(T),
    Deleted(Tombstone<T>),
}

#[derive(Clone, Debug)]
pub enum Tombstone<T> {
    /// Last known state of the deleted object
    Object(T),
    /// The store lost the object; only its identity survived
    Unknown { workspace: String, name: String },
}

impl<T: StoredObject> WatchEvent<T> {
    /// Workspace the event belongs to.
    pub fn workspace(&self) -> &str {
        match self {
            WatchEvent::Added(o) | WatchEvent::Updated(o) => &o.metadata().workspace,
            WatchEvent::Deleted(Tombstone::Object(o)) => &o.metadata().workspace,
            WatchEvent::Deleted(Tombstone::Unknown { workspace, .. }) => workspace,
        }
    }
}

pub type WatchStream<T> = Pin<Box<dyn Stream<Item = WatchEvent<T>> + Send>>;

/// Patch preconditions; a mismatch fails the patch with `Conflict`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Preconditions {
    pub uid: Option<String>,
    pub resource_version: Option<String>,
}

/// JSON merge patch with optional preconditions.
#[derive(Clone, Debug, PartialEq)]
pub struct Patch {
    pub body: Value,
    pub preconditions: Option<Preconditions>,
}

impl Patch {
    pub fn merge(body: Value) -> Self {
        Patch {
            body,
            preconditions: None,
        }
    }

    pub fn with_preconditions(mut self, preconditions: Preconditions) -> Self {
        self.preconditions = Some(preconditions);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subresource {
    Status,
}

/// The store capability consumed by all controllers.
///
/// Every operation is workspace-scoped; implementations must not leak
/// objects across workspaces.
#[async_trait]
pub trait ObjectStore<T: StoredObject>: Send + Sync {
    async fn get(&self, workspace: &str, name: &str) -> Result<T, StoreError>;

    async fn list(&self, workspace: &str, selector: &Selector) -> Result<Vec<T>, StoreError>;

    async fn watch(&self, workspace: &str) -> Result<WatchStream<T>, StoreError>;

    /// Apply a JSON merge patch. A `Status` subresource patch only touches
    /// status; spec and metadata in the body are ignored by the store.
    async fn patch(
        &self,
        workspace: &str,
        name: &str,
        patch: &Patch,
        subresource: Option<Subresource>,
    ) -> Result<T, StoreError>;
}

/// Apply RFC 7386 JSON merge-patch semantics: objects merge recursively,
/// `null` removes, anything else replaces.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            let target_map = match target.as_object_mut() {
                Some(m) => m,
                None => return,
            };
            for (k, v) in patch_map {
                if v.is_null() {
                    target_map.remove(k);
                } else {
                    let entry = target_map.entry(k.clone()).or_insert(Value::Null);
                    apply_merge_patch(entry, v);
                }
            }
        }
        other => {
            *target = other.clone();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_patch_merges_objects() {
        let mut target = json!({"a": 1, "b": {"c": 2, "d": 3}});
        apply_merge_patch(&mut target, &json!({"b": {"c": 9}}));

        assert_eq!(target, json!({"a": 1, "b": {"c": 9, "d": 3}}));
    }

    #[test]
    fn test_merge_patch_null_removes() {
        let mut target = json!({"a": 1, "b": 2});
        apply_merge_patch(&mut target, &json!({"b": null}));

        assert_eq!(target, json!({"a": 1}));
    }

    #[test]
    fn test_merge_patch_replaces_scalars_and_arrays() {
        let mut target = json!({"a": [1, 2, 3]});
        apply_merge_patch(&mut target, &json!({"a": [9]}));

        assert_eq!(target, json!({"a": [9]}));
    }

    #[test]
    fn test_selector_matches_labels() {
        let mut meta = ObjectMeta::default();
        meta.labels.insert("app".to_string(), "web".to_string());
        meta.labels.insert("tier".to_string(), "front".to_string());

        let mut selector = Selector::default();
        selector.labels.insert("app".to_string(), "web".to_string());
        assert!(selector.matches(&meta));

        selector.labels.insert("tier".to_string(), "back".to_string());
        assert!(!selector.matches(&meta));

        assert!(Selector::everything().matches(&meta));
    }
}
