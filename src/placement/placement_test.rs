use super::*;
use chrono::{DateTime, Utc};
use std::sync::Arc;

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
}

fn eligible(name: &str, location: &str, load: f64) -> EligibleCluster {
    EligibleCluster {
        name: name.to_string(),
        location: Some(location.to_string()),
        load,
        snapshot: ClusterHealthSnapshot {
            cluster: name.to_string(),
            last_check: ts(0),
            healthy: true,
            error: None,
            node_count: 3,
            version: Some("v1.30.0".to_string()),
            capacity_cpu_millis: 12_000,
            capacity_memory_bytes: 48 << 30,
            conditions: Vec::new(),
        },
    }
}

struct StaticProvider {
    clusters: Vec<EligibleCluster>,
}

#[async_trait]
impl ClusterProvider for StaticProvider {
    async fn eligible_clusters(&self) -> Result<Vec<EligibleCluster>, PlacementError> {
        Ok(self.clusters.clone())
    }
}

fn engine(clusters: Vec<EligibleCluster>) -> PlacementEngine {
    PlacementEngine::new(Arc::new(StaticProvider { clusters }))
}

#[tokio::test]
async fn test_any_policy_keeps_provider_order() {
    let engine = engine(vec![
        eligible("c1", "eu", 0.9),
        eligible("c2", "eu", 0.1),
        eligible("c3", "us", 0.5),
    ]);

    let result = engine
        .place(&PlacementRequest {
            policy: PlacementPolicy::Any,
            location: None,
            count: 2,
        })
        .await
        .unwrap();

    assert_eq!(result.clusters, vec!["c1", "c2"]);
}

#[tokio::test]
async fn test_spread_prefers_least_loaded() {
    let engine = engine(vec![
        eligible("busy", "eu", 0.8),
        eligible("idle", "eu", 0.1),
        eligible("medium", "eu", 0.5),
    ]);

    let result = engine
        .place(&PlacementRequest {
            policy: PlacementPolicy::Spread,
            location: None,
            count: 3,
        })
        .await
        .unwrap();

    assert_eq!(result.clusters, vec!["idle", "medium", "busy"]);
}

#[tokio::test]
async fn test_concentrate_prefers_most_loaded_with_room() {
    let engine = engine(vec![
        eligible("idle", "eu", 0.1),
        eligible("full", "eu", 1.0),
        eligible("busy", "eu", 0.8),
    ]);

    let result = engine
        .place(&PlacementRequest {
            policy: PlacementPolicy::Concentrate,
            location: None,
            count: 3,
        })
        .await
        .unwrap();

    // Full clusters are skipped entirely
    assert_eq!(result.clusters, vec!["busy", "idle"]);
}

#[tokio::test]
async fn test_location_filter() {
    let engine = engine(vec![
        eligible("eu-1", "eu-west", 0.2),
        eligible("us-1", "us-east", 0.1),
        eligible("eu-2", "eu-west", 0.3),
    ]);

    let result = engine
        .place(&PlacementRequest {
            policy: PlacementPolicy::LocationFilter,
            location: Some("eu-west".to_string()),
            count: 5,
        })
        .await
        .unwrap();

    assert_eq!(result.clusters, vec!["eu-1", "eu-2"]);
    // Fewer than requested: the reason says so
    assert!(result.reason.contains("2 of 5"));
}

#[tokio::test]
async fn test_empty_selection_is_legitimate() {
    let engine = engine(vec![]);

    let result = engine
        .place(&PlacementRequest::new(PlacementPolicy::Any))
        .await
        .unwrap();

    assert!(result.is_empty());
    assert_eq!(result.reason, REASON_NO_ELIGIBLE_CLUSTERS);
}

#[tokio::test]
async fn test_count_defaults_to_one() {
    let engine = engine(vec![eligible("c1", "eu", 0.1), eligible("c2", "eu", 0.2)]);

    let result = engine
        .place(&PlacementRequest {
            policy: PlacementPolicy::Any,
            location: None,
            count: 0,
        })
        .await
        .unwrap();

    assert_eq!(result.clusters.len(), 1);
}

#[test]
fn test_policy_parse() {
    assert_eq!(PlacementPolicy::parse("any").unwrap(), PlacementPolicy::Any);
    assert_eq!(
        PlacementPolicy::parse("spread").unwrap(),
        PlacementPolicy::Spread
    );
    assert_eq!(
        PlacementPolicy::parse("concentrate").unwrap(),
        PlacementPolicy::Concentrate
    );
    assert_eq!(
        PlacementPolicy::parse("location-filter").unwrap(),
        PlacementPolicy::LocationFilter
    );
    assert!(PlacementPolicy::parse("round-robin").is_err());
}
