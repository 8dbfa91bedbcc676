//! Status committer.
//!
//! Controllers never write whole objects back. They compute a desired status
//! and commit it here: a minimal JSON merge patch of `status` only, with uid
//! and resourceVersion preconditions so concurrent writers fail instead of
//! losing updates. A spec or metadata diff reaching the committer is a
//! programmer error and takes the process down.

use crate::store::{ObjectStore, Patch, Preconditions, StoreError, StoredObject, Subresource};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("status commit for {kind} attempted to modify spec: {detail}")]
    SpecModified { kind: &'static str, detail: String },

    #[error("status commit for {kind} attempted to modify metadata")]
    MetadataModified { kind: &'static str },

    #[error("object cannot be serialized: {0}")]
    Serialization(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Minimal merge patch turning `old` into `new`.
///
/// Objects diff recursively, removed keys map to `null`, everything else is
/// replaced wholesale (arrays included, per merge-patch semantics).
pub fn merge_diff(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut patch = Map::new();
            for (k, new_val) in new_map {
                match old_map.get(k) {
                    Some(old_val) if old_val == new_val => {}
                    Some(old_val) => {
                        patch.insert(k.clone(), merge_diff(old_val, new_val));
                    }
                    None => {
                        patch.insert(k.clone(), new_val.clone());
                    }
                }
            }
            for k in old_map.keys() {
                if !new_map.contains_key(k) {
                    patch.insert(k.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

/// Build the status-only patch for a (old, new) object pair.
///
/// # Returns
/// * `Ok(None)` - statuses are identical, nothing to commit
/// * `Ok(Some(patch))` - minimal status patch with preconditions from `old`
/// * `Err(SpecModified | MetadataModified)` - the pair differs outside
///   status; the caller must treat this as fatal
pub fn build_status_patch<T: StoredObject>(old: &T, new: &T) -> Result<Option<Patch>, CommitError> {
    let old_value =
        serde_json::to_value(old).map_err(|e| CommitError::Serialization(e.to_string()))?;
    let new_value =
        serde_json::to_value(new).map_err(|e| CommitError::Serialization(e.to_string()))?;

    let old_spec = old_value.get("spec").cloned().unwrap_or(Value::Null);
    let new_spec = new_value.get("spec").cloned().unwrap_or(Value::Null);
    if old_spec != new_spec {
        let diff = merge_diff(&old_spec, &new_spec);
        return Err(CommitError::SpecModified {
            kind: T::kind(),
            detail: diff.to_string(),
        });
    }

    if old_value.get("metadata") != new_value.get("metadata") {
        return Err(CommitError::MetadataModified { kind: T::kind() });
    }

    let old_status = old_value.get("status").cloned().unwrap_or(Value::Null);
    let new_status = new_value.get("status").cloned().unwrap_or(Value::Null);
    if old_status == new_status {
        return Ok(None);
    }

    let status_patch = merge_diff(&old_status, &new_status);
    let meta = old.metadata();
    let patch = Patch::merge(serde_json::json!({ "status": status_patch })).with_preconditions(
        Preconditions {
            uid: meta.uid.clone(),
            resource_version: meta.resource_version.clone(),
        },
    );
    Ok(Some(patch))
}

/// Commit `new`'s status against the store.
///
/// A spec or metadata diff between `old` and `new` is a programmer error:
/// the committer logs it and aborts the process rather than risking a
/// corrupted declarative record.
///
/// # Returns
/// * `Ok(None)` - no change was needed
/// * `Ok(Some(obj))` - the stored object after the patch
/// * `Err(Store(Conflict))` - another writer won; requeue and retry
pub async fn commit_status<T: StoredObject>(
    store: &dyn ObjectStore<T>,
    old: &T,
    new: &T,
) -> Result<Option<T>, CommitError> {
    let patch = match build_status_patch(old, new) {
        Ok(None) => return Ok(None),
        Ok(Some(patch)) => patch,
        Err(fatal @ (CommitError::SpecModified { .. } | CommitError::MetadataModified { .. })) => {
            error!(
                kind = T::kind(),
                workspace = %old.metadata().workspace,
                name = %old.metadata().name,
                error = %fatal,
                "FATAL: status committer received a non-status diff"
            );
            if cfg!(test) {
                panic!("status committer received a non-status diff: {}", fatal);
            }
            std::process::abort();
        }
        Err(other) => return Err(other),
    };

    let meta = old.metadata();
    let updated = store
        .patch(&meta.workspace, &meta.name, &patch, Some(Subresource::Status))
        .await?;
    Ok(Some(updated))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "committer_test.rs"]
mod tests;
