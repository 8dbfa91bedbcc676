//! External metric source.
//!
//! Queries a PromQL-compatible time-series endpoint through its instant
//! query API. A missing provider is acceptable: the analyzer falls back to
//! internal aggregators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricError {
    #[error("metric source HTTP error: {0}")]
    Http(String),

    #[error("failed to parse metric response: {0}")]
    Parse(String),

    #[error("no data returned for query")]
    NoData,

    #[error("metric unavailable: {0}")]
    Unavailable(String),
}

/// Capability for fetching one scalar observation.
///
/// Vector results collapse to their first sample.
#[async_trait]
pub trait MetricProvider: Send + Sync {
    async fn query(
        &self,
        query: &str,
        labels: &BTreeMap<String, String>,
        at: DateTime<Utc>,
    ) -> Result<f64, MetricError>;
}

/// Instant query response format of the PromQL HTTP API.
#[derive(Debug, Deserialize)]
struct InstantQueryResponse {
    status: String,
    data: InstantQueryData,
}

#[derive(Debug, Deserialize)]
struct InstantQueryData {
    result: Vec<InstantQueryResult>,
}

#[derive(Debug, Deserialize)]
struct InstantQueryResult {
    value: (f64, String), // [timestamp, value_as_string]
}

/// Parse an instant query response and extract the first sample as f64.
fn parse_instant_query(json_response: &str) -> Result<f64, MetricError> {
    let response: InstantQueryResponse = serde_json::from_str(json_response)
        .map_err(|e| MetricError::Parse(format!("invalid JSON: {}", e)))?;

    if response.status != "success" {
        return Err(MetricError::Http(format!(
            "query failed with status: {}",
            response.status
        )));
    }

    let result = response.data.result.first().ok_or(MetricError::NoData)?;

    result
        .value
        .1
        .parse::<f64>()
        .map_err(|e| MetricError::Parse(format!("invalid value: {}", e)))
}

/// Substitute `{{label}}` placeholders in a query template.
///
/// Deployment identity labels (candidate name, versions, target, namespace)
/// are available to every configured query.
fn render_query(template: &str, labels: &BTreeMap<String, String>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in labels {
        rendered = rendered.replace(&format!("{{{{{}}}}}", key), value);
    }
    rendered
}

/// PromQL-over-HTTP metric provider.
pub struct PrometheusProvider {
    address: String,
    client: reqwest::Client,
}

impl PrometheusProvider {
    pub fn new(address: String) -> Self {
        PrometheusProvider {
            address,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MetricProvider for PrometheusProvider {
    async fn query(
        &self,
        query: &str,
        labels: &BTreeMap<String, String>,
        at: DateTime<Utc>,
    ) -> Result<f64, MetricError> {
        let rendered = render_query(query, labels);
        let url = format!("{}/api/v1/query", self.address);
        let at_time = at.timestamp().to_string();

        let response = self
            .client
            .get(&url)
            .query(&[("query", rendered.as_str()), ("time", at_time.as_str())])
            .send()
            .await
            .map_err(|e| MetricError::Http(format!("request failed: {}", e)))?;

        let body = response
            .text()
            .await
            .map_err(|e| MetricError::Http(format!("failed to read response: {}", e)))?;

        parse_instant_query(&body)
    }
}

/// Scripted provider for tests and simulations: values keyed by rendered
/// query substring.
#[derive(Default)]
pub struct MockMetricProvider {
    responses: std::sync::Mutex<Vec<(String, Result<f64, String>)>>,
}

impl MockMetricProvider {
    pub fn new() -> Self {
        MockMetricProvider::default()
    }

    /// Respond with `value` for any query containing `fragment`.
    pub fn set_value(&self, fragment: &str, value: f64) {
        let mut responses = self.lock();
        responses.push((fragment.to_string(), Ok(value)));
    }

    /// Fail any query containing `fragment`.
    pub fn set_error(&self, fragment: &str, error: &str) {
        let mut responses = self.lock();
        responses.push((fragment.to_string(), Err(error.to_string())));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, Result<f64, String>)>> {
        match self.responses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl MetricProvider for MockMetricProvider {
    async fn query(
        &self,
        query: &str,
        labels: &BTreeMap<String, String>,
        _at: DateTime<Utc>,
    ) -> Result<f64, MetricError> {
        let rendered = render_query(query, labels);
        let responses = self.lock();
        for (fragment, outcome) in responses.iter() {
            if rendered.contains(fragment.as_str()) {
                return match outcome {
                    Ok(v) => Ok(*v),
                    Err(e) => Err(MetricError::Unavailable(e.clone())),
                };
            }
        }
        Err(MetricError::NoData)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_instant_query_with_data() {
        let json = r#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {}, "value": [1234567890.1, "5.2"]}
                ]
            }
        }"#;

        assert_eq!(parse_instant_query(json).unwrap(), 5.2);
    }

    // Vector results collapse to the first sample
    #[test]
    fn test_parse_instant_query_takes_first_sample() {
        let json = r#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {}, "value": [1234567890.1, "1.5"]},
                    {"metric": {}, "value": [1234567890.1, "9.9"]}
                ]
            }
        }"#;

        assert_eq!(parse_instant_query(json).unwrap(), 1.5);
    }

    #[test]
    fn test_parse_instant_query_no_data() {
        let json = r#"{
            "status": "success",
            "data": {"resultType": "vector", "result": []}
        }"#;

        assert!(matches!(parse_instant_query(json), Err(MetricError::NoData)));
    }

    #[test]
    fn test_parse_instant_query_invalid_json() {
        assert!(matches!(
            parse_instant_query("not valid json"),
            Err(MetricError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_instant_query_error_status() {
        let json = r#"{"status": "error", "data": {"result": []}}"#;

        assert!(matches!(parse_instant_query(json), Err(MetricError::Http(_))));
    }

    #[test]
    fn test_render_query_substitutes_labels() {
        let mut labels = BTreeMap::new();
        labels.insert("candidate".to_string(), "web-canary".to_string());
        labels.insert("namespace".to_string(), "prod".to_string());

        let query = r#"rate(http_requests_total{pod="{{candidate}}",ns="{{namespace}}"}[2m])"#;
        let rendered = render_query(query, &labels);

        assert_eq!(
            rendered,
            r#"rate(http_requests_total{pod="web-canary",ns="prod"}[2m])"#
        );
    }

    #[tokio::test]
    async fn test_mock_provider_matches_fragments() {
        let provider = MockMetricProvider::new();
        provider.set_value("error_rate", 2.5);
        provider.set_error("latency", "scrape failed");

        let labels = BTreeMap::new();
        let value = provider
            .query("error_rate{app=\"x\"}", &labels, Utc::now())
            .await
            .unwrap();
        assert_eq!(value, 2.5);

        let err = provider
            .query("latency_p99{app=\"x\"}", &labels, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, MetricError::Unavailable(_)));

        let missing = provider.query("unknown", &labels, Utc::now()).await;
        assert!(matches!(missing, Err(MetricError::NoData)));
    }
}
