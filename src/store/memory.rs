//! In-memory object store.
//!
//! Backs tests and single-process deployments. Behaves like the external
//! store contract: uid assignment, monotonically increasing resource
//! versions, generation bumps on spec changes, merge-patch semantics with
//! preconditions, and per-workspace watch fan-out.

use crate::store::{
    apply_merge_patch, ObjectStore, Patch, Selector, StoreError, StoredObject, Subresource,
    Tombstone, WatchEvent, WatchStream,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

struct Watcher<T> {
    workspace: Option<String>,
    tx: mpsc::UnboundedSender<WatchEvent<T>>,
}

pub struct MemoryStore<T: StoredObject> {
    objects: Mutex<HashMap<(String, String), T>>,
    next_version: AtomicU64,
    watchers: Mutex<Vec<Watcher<T>>>,
}

impl<T: StoredObject> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: StoredObject> MemoryStore<T> {
    pub fn new() -> Self {
        MemoryStore {
            objects: Mutex::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            watchers: Mutex::new(Vec::new()),
        }
    }

    fn bump_version(&self) -> String {
        self.next_version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn lock_objects(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), T>> {
        match self.objects.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn broadcast(&self, event: WatchEvent<T>) {
        let mut watchers = match self.watchers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let workspace = event.workspace().to_string();
        watchers.retain(|w| {
            let interested = w
                .workspace
                .as_ref()
                .map(|ws| *ws == workspace)
                .unwrap_or(true);
            if !interested {
                return true;
            }
            // Drop watchers whose receiver side has gone away
            w.tx.send(event.clone()).is_ok()
        });
    }

    /// Create a new object, assigning uid, resource version, generation and
    /// creation timestamp.
    pub fn create(&self, mut obj: T) -> Result<T, StoreError> {
        let meta = obj.metadata_mut();
        if meta.workspace.is_empty() || meta.name.is_empty() {
            return Err(StoreError::InvalidObject(
                "workspace and name are required".to_string(),
            ));
        }
        meta.uid = Some(Uuid::new_v4().to_string());
        meta.generation = 1;
        meta.resource_version = Some(self.bump_version());
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Utc::now());
        }
        let key = (meta.workspace.clone(), meta.name.clone());

        {
            let mut objects = self.lock_objects();
            if objects.contains_key(&key) {
                return Err(StoreError::Conflict {
                    kind: T::kind(),
                    workspace: key.0,
                    name: key.1,
                    detail: "already exists".to_string(),
                });
            }
            objects.insert(key, obj.clone());
        }

        self.broadcast(WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    /// Delete an object, emitting a deletion event carrying the last known
    /// state.
    pub fn delete(&self, workspace: &str, name: &str) -> Result<T, StoreError> {
        let removed = {
            let mut objects = self.lock_objects();
            objects.remove(&(workspace.to_string(), name.to_string()))
        };
        match removed {
            Some(obj) => {
                self.broadcast(WatchEvent::Deleted(Tombstone::Object(obj.clone())));
                Ok(obj)
            }
            None => Err(StoreError::NotFound {
                kind: T::kind(),
                workspace: workspace.to_string(),
                name: name.to_string(),
            }),
        }
    }

    /// Watch every workspace. Used by in-process informers that serve the
    /// whole fleet; the per-workspace contract method filters instead.
    pub fn watch_all(&self) -> WatchStream<T> {
        self.register_watcher(None)
    }

    fn register_watcher(&self, workspace: Option<String>) -> WatchStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Replay current state as Added events so consumers start from a
        // complete snapshot (list+watch semantics).
        {
            let objects = self.lock_objects();
            for ((ws, _), obj) in objects.iter() {
                let interested = workspace.as_ref().map(|w| w == ws).unwrap_or(true);
                if interested {
                    let _ = tx.send(WatchEvent::Added(obj.clone()));
                }
            }
        }

        {
            let mut watchers = match self.watchers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            watchers.push(Watcher { workspace, tx });
        }

        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|ev| (ev, rx))
        }))
    }

    fn check_preconditions(obj: &T, patch: &Patch) -> Result<(), StoreError> {
        let Some(pre) = &patch.preconditions else {
            return Ok(());
        };
        let meta = obj.metadata();
        if let Some(uid) = &pre.uid {
            if meta.uid.as_ref() != Some(uid) {
                return Err(StoreError::Conflict {
                    kind: T::kind(),
                    workspace: meta.workspace.clone(),
                    name: meta.name.clone(),
                    detail: "uid precondition failed".to_string(),
                });
            }
        }
        if let Some(rv) = &pre.resource_version {
            if meta.resource_version.as_ref() != Some(rv) {
                return Err(StoreError::Conflict {
                    kind: T::kind(),
                    workspace: meta.workspace.clone(),
                    name: meta.name.clone(),
                    detail: format!(
                        "resourceVersion precondition failed: want {}, have {}",
                        rv,
                        meta.resource_version.as_deref().unwrap_or("<none>")
                    ),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T: StoredObject> ObjectStore<T> for MemoryStore<T> {
    async fn get(&self, workspace: &str, name: &str) -> Result<T, StoreError> {
        let objects = self.lock_objects();
        objects
            .get(&(workspace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: T::kind(),
                workspace: workspace.to_string(),
                name: name.to_string(),
            })
    }

    async fn list(&self, workspace: &str, selector: &Selector) -> Result<Vec<T>, StoreError> {
        let objects = self.lock_objects();
        let mut out: Vec<T> = objects
            .iter()
            .filter(|((ws, _), obj)| ws == workspace && selector.matches(obj.metadata()))
            .map(|(_, obj)| obj.clone())
            .collect();
        out.sort_by(|a, b| a.metadata().name.cmp(&b.metadata().name));
        Ok(out)
    }

    async fn watch(&self, workspace: &str) -> Result<WatchStream<T>, StoreError> {
        Ok(self.register_watcher(Some(workspace.to_string())))
    }

    async fn patch(
        &self,
        workspace: &str,
        name: &str,
        patch: &Patch,
        subresource: Option<Subresource>,
    ) -> Result<T, StoreError> {
        let updated = {
            let mut objects = self.lock_objects();
            let key = (workspace.to_string(), name.to_string());
            let current = objects.get(&key).ok_or_else(|| StoreError::NotFound {
                kind: T::kind(),
                workspace: workspace.to_string(),
                name: name.to_string(),
            })?;

            Self::check_preconditions(current, patch)?;

            let mut value = serde_json::to_value(current)
                .map_err(|e| StoreError::InvalidObject(e.to_string()))?;
            let old_spec = value.get("spec").cloned().unwrap_or(Value::Null);

            match subresource {
                Some(Subresource::Status) => {
                    // Only the status field of the body is honored
                    let status_patch = patch.body.get("status").cloned().unwrap_or(Value::Null);
                    if !status_patch.is_null() {
                        let obj_map = value.as_object_mut().ok_or_else(|| {
                            StoreError::InvalidObject("object is not a JSON map".to_string())
                        })?;
                        let entry = obj_map.entry("status".to_string()).or_insert(Value::Null);
                        apply_merge_patch(entry, &status_patch);
                    }
                }
                None => {
                    apply_merge_patch(&mut value, &patch.body);
                }
            }

            let mut next: T = serde_json::from_value(value)
                .map_err(|e| StoreError::InvalidObject(e.to_string()))?;

            // Identity is immutable regardless of what the patch carried
            let current_meta = current.metadata().clone();
            let spec_changed = {
                let next_value = serde_json::to_value(&next)
                    .map_err(|e| StoreError::InvalidObject(e.to_string()))?;
                next_value.get("spec").cloned().unwrap_or(Value::Null) != old_spec
            };
            {
                let meta = next.metadata_mut();
                meta.workspace = current_meta.workspace;
                meta.name = current_meta.name;
                meta.namespace = current_meta.namespace;
                meta.uid = current_meta.uid;
                meta.creation_timestamp = current_meta.creation_timestamp;
                meta.generation = if spec_changed && subresource.is_none() {
                    current_meta.generation + 1
                } else {
                    current_meta.generation
                };
                meta.resource_version = Some(self.bump_version());
            }

            objects.insert(key, next.clone());
            next
        };

        self.broadcast(WatchEvent::Updated(updated.clone()));
        Ok(updated)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "memory_test.rs"]
mod tests;
