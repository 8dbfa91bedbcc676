//! Informer plumbing: translate object-store watch events into
//! workspace-qualified keys on a controller queue.

use crate::api::key::Key;
use crate::runtime::queue::RateLimitedQueue;
use crate::server::shutdown::ShutdownSignal;
use crate::store::{StoredObject, Tombstone, WatchEvent, WatchStream};
use futures::StreamExt;
use std::sync::Arc;
use tracing::info;

/// Key for any watch event, recovering identity from tombstones so deletion
/// handlers never silently drop work.
pub fn key_for_event<T: StoredObject>(event: &WatchEvent<T>) -> Key {
    match event {
        WatchEvent::Added(obj) | WatchEvent::Updated(obj) => Key::for_object(obj.metadata()),
        WatchEvent::Deleted(Tombstone::Object(obj)) => Key::for_object(obj.metadata()),
        WatchEvent::Deleted(Tombstone::Unknown { workspace, name }) => {
            Key::workspace_scoped(workspace, name)
        }
    }
}

/// Pump watch events onto the queue until the stream ends or shutdown
/// fires. Coalescing happens inside the queue.
pub async fn run_informer<T: StoredObject>(
    name: &str,
    mut events: WatchStream<T>,
    queue: Arc<RateLimitedQueue<Key>>,
    shutdown: ShutdownSignal,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(informer = name, "Informer stopping on shutdown");
                return;
            }
            event = events.next() => {
                match event {
                    Some(event) => queue.add(key_for_event(&event)),
                    None => {
                        info!(informer = name, "Watch stream ended");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::api::cluster::{ClusterRegistration, ClusterSpec};
    use crate::api::ObjectMeta;

    fn registration(workspace: &str, name: &str) -> ClusterRegistration {
        ClusterRegistration {
            metadata: ObjectMeta {
                workspace: workspace.to_string(),
                name: name.to_string(),
                ..Default::default()
            },
            spec: ClusterSpec {
                endpoint: "https://example:6443".to_string(),
                ca_bundle: None,
                location: None,
                provider: None,
                capacity: None,
            },
            status: None,
        }
    }

    #[test]
    fn test_key_for_added_and_updated() {
        let reg = registration("root", "cluster-1");

        let added = WatchEvent::Added(reg.clone());
        let updated = WatchEvent::Updated(reg);

        assert_eq!(key_for_event(&added).to_string(), "root|cluster-1");
        assert_eq!(key_for_event(&updated).to_string(), "root|cluster-1");
    }

    // Deletion with an unknown tombstone still yields a usable key.
    #[test]
    fn test_key_for_unknown_tombstone() {
        let event: WatchEvent<ClusterRegistration> = WatchEvent::Deleted(Tombstone::Unknown {
            workspace: "root".to_string(),
            name: "gone".to_string(),
        });

        assert_eq!(key_for_event(&event).to_string(), "root|gone");
    }
}
