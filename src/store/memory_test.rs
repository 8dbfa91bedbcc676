use super::*;
use crate::api::deployment::{
    CanaryStep, Deployment, DeploymentSpec, DeploymentStatus, Phase, StrategyKind, TargetRef,
};
use crate::api::ObjectMeta;
use crate::store::Preconditions;
use futures::StreamExt;
use serde_json::json;

fn deployment(workspace: &str, name: &str) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            workspace: workspace.to_string(),
            name: name.to_string(),
            ..Default::default()
        },
        spec: DeploymentSpec {
            strategy: StrategyKind::Canary,
            target: TargetRef {
                kind: "Deployment".to_string(),
                name: name.to_string(),
            },
            stable_version: "v1".to_string(),
            candidate_version: "v2".to_string(),
            replicas: 3,
            steps: vec![CanaryStep {
                weight: 100,
                duration_seconds: None,
            }],
            step_duration_seconds: None,
            progress_deadline_seconds: None,
            analysis: None,
            placement: None,
            depends_on: Vec::new(),
        },
        status: None,
    }
}

#[tokio::test]
async fn test_create_assigns_identity() {
    let store = MemoryStore::<Deployment>::new();

    let created = store.create(deployment("tenant-a", "web")).unwrap();

    assert!(created.metadata.uid.is_some());
    assert!(created.metadata.resource_version.is_some());
    assert_eq!(created.metadata.generation, 1);
    assert!(created.metadata.creation_timestamp.is_some());
}

#[tokio::test]
async fn test_get_not_found() {
    let store = MemoryStore::<Deployment>::new();

    let err = store.get("tenant-a", "missing").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_list_is_workspace_scoped() {
    let store = MemoryStore::<Deployment>::new();
    store.create(deployment("tenant-a", "web")).unwrap();
    store.create(deployment("tenant-a", "api")).unwrap();
    store.create(deployment("tenant-b", "web")).unwrap();

    let listed = store.list("tenant-a", &Selector::everything()).await.unwrap();

    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|d| d.metadata.workspace == "tenant-a"));
}

#[tokio::test]
async fn test_status_patch_updates_status_only() {
    let store = MemoryStore::<Deployment>::new();
    let created = store.create(deployment("tenant-a", "web")).unwrap();

    // A status patch smuggling a spec change must leave spec untouched
    let patch = Patch::merge(json!({
        "spec": {"candidateVersion": "v9"},
        "status": {"phase": "Progressing", "currentStepIndex": 0}
    }));
    let updated = store
        .patch("tenant-a", "web", &patch, Some(Subresource::Status))
        .await
        .unwrap();

    assert_eq!(updated.spec.candidate_version, "v2");
    let status = updated.status.unwrap();
    assert_eq!(status.phase, Some(Phase::Progressing));
    assert_eq!(status.current_step_index, Some(0));
    // Status writes never bump the generation
    assert_eq!(updated.metadata.generation, created.metadata.generation);
}

#[tokio::test]
async fn test_spec_patch_bumps_generation() {
    let store = MemoryStore::<Deployment>::new();
    store.create(deployment("tenant-a", "web")).unwrap();

    let patch = Patch::merge(json!({"spec": {"candidateVersion": "v3"}}));
    let updated = store.patch("tenant-a", "web", &patch, None).await.unwrap();

    assert_eq!(updated.spec.candidate_version, "v3");
    assert_eq!(updated.metadata.generation, 2);
}

#[tokio::test]
async fn test_resource_version_precondition_conflict() {
    let store = MemoryStore::<Deployment>::new();
    let created = store.create(deployment("tenant-a", "web")).unwrap();

    // First writer wins
    let patch = Patch::merge(json!({"status": {"phase": "Progressing"}}))
        .with_preconditions(Preconditions {
            uid: created.metadata.uid.clone(),
            resource_version: created.metadata.resource_version.clone(),
        });
    store
        .patch("tenant-a", "web", &patch, Some(Subresource::Status))
        .await
        .unwrap();

    // Second writer holds the stale version and must be rejected
    let err = store
        .patch("tenant-a", "web", &patch, Some(Subresource::Status))
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::Conflict { .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_watch_replays_and_streams() {
    let store = MemoryStore::<Deployment>::new();
    store.create(deployment("tenant-a", "web")).unwrap();

    let mut stream = store.watch("tenant-a").await.unwrap();

    // Existing object replayed as Added
    match stream.next().await.unwrap() {
        WatchEvent::Added(d) => assert_eq!(d.metadata.name, "web"),
        other => panic!("expected Added, got {:?}", other),
    }

    // Live update flows through
    let patch = Patch::merge(json!({"status": {"phase": "Pending"}}));
    store
        .patch("tenant-a", "web", &patch, Some(Subresource::Status))
        .await
        .unwrap();
    match stream.next().await.unwrap() {
        WatchEvent::Updated(d) => {
            assert_eq!(d.status.unwrap().phase, Some(Phase::Pending));
        }
        other => panic!("expected Updated, got {:?}", other),
    }

    // Deletion carries the last known object
    store.delete("tenant-a", "web").unwrap();
    match stream.next().await.unwrap() {
        WatchEvent::Deleted(Tombstone::Object(d)) => assert_eq!(d.metadata.name, "web"),
        other => panic!("expected Deleted tombstone, got {:?}", other),
    }
}

#[tokio::test]
async fn test_watch_filters_other_workspaces() {
    let store = MemoryStore::<Deployment>::new();
    let mut stream = store.watch("tenant-a").await.unwrap();

    store.create(deployment("tenant-b", "web")).unwrap();
    store.create(deployment("tenant-a", "api")).unwrap();

    // Only the tenant-a event arrives
    match stream.next().await.unwrap() {
        WatchEvent::Added(d) => assert_eq!(d.metadata.workspace, "tenant-a"),
        other => panic!("expected Added, got {:?}", other),
    }
}

#[tokio::test]
async fn test_full_status_replace_via_merge() {
    let store = MemoryStore::<Deployment>::new();
    store.create(deployment("tenant-a", "web")).unwrap();

    let status = DeploymentStatus {
        phase: Some(Phase::Analyzing),
        current_step_index: Some(1),
        ..Default::default()
    };
    let patch = Patch::merge(json!({"status": serde_json::to_value(&status).unwrap()}));
    let updated = store
        .patch("tenant-a", "web", &patch, Some(Subresource::Status))
        .await
        .unwrap();

    assert_eq!(updated.status.unwrap().current_step_index, Some(1));
}
