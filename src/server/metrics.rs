//! Metric encodings for the admin surface.
//!
//! The registry itself lives on the [`crate::runtime::ControllerContext`];
//! this module only renders it: Prometheus text exposition, a structured
//! JSON mirror of the same data, and a collector metadata listing.

use prometheus::proto::MetricType;
use prometheus::{Encoder, Registry, TextEncoder};
use serde_json::{json, Value};

/// Encode all metrics in Prometheus text exposition format.
pub fn encode_text(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e)))
}

fn type_name(metric_type: MetricType) -> &'static str {
    match metric_type {
        MetricType::COUNTER => "counter",
        MetricType::GAUGE => "gauge",
        MetricType::HISTOGRAM => "histogram",
        MetricType::SUMMARY => "summary",
        MetricType::UNTYPED => "untyped",
    }
}

/// Encode all metrics as structured JSON:
/// `[{name, help, type, metrics: [{labels, value | sampleCount+sampleSum+
/// buckets | quantiles}]}]`.
pub fn encode_json(registry: &Registry) -> Value {
    let families: Vec<Value> = registry
        .gather()
        .iter()
        .map(|family| {
            let metrics: Vec<Value> = family
                .get_metric()
                .iter()
                .map(|metric| {
                    let labels: serde_json::Map<String, Value> = metric
                        .get_label()
                        .iter()
                        .map(|pair| {
                            (
                                pair.get_name().to_string(),
                                Value::String(pair.get_value().to_string()),
                            )
                        })
                        .collect();

                    match family.get_field_type() {
                        MetricType::COUNTER => json!({
                            "labels": labels,
                            "value": metric.get_counter().get_value(),
                        }),
                        MetricType::GAUGE => json!({
                            "labels": labels,
                            "value": metric.get_gauge().get_value(),
                        }),
                        MetricType::HISTOGRAM => {
                            let histogram = metric.get_histogram();
                            let buckets: Vec<Value> = histogram
                                .get_bucket()
                                .iter()
                                .map(|bucket| {
                                    json!({
                                        "upperBound": bucket.get_upper_bound(),
                                        "cumulativeCount": bucket.get_cumulative_count(),
                                    })
                                })
                                .collect();
                            json!({
                                "labels": labels,
                                "sampleCount": histogram.get_sample_count(),
                                "sampleSum": histogram.get_sample_sum(),
                                "buckets": buckets,
                            })
                        }
                        MetricType::SUMMARY => {
                            let summary = metric.get_summary();
                            let quantiles: Vec<Value> = summary
                                .get_quantile()
                                .iter()
                                .map(|quantile| {
                                    json!({
                                        "quantile": quantile.get_quantile(),
                                        "value": quantile.get_value(),
                                    })
                                })
                                .collect();
                            json!({
                                "labels": labels,
                                "sampleCount": summary.get_sample_count(),
                                "sampleSum": summary.get_sample_sum(),
                                "quantiles": quantiles,
                            })
                        }
                        MetricType::UNTYPED => json!({
                            "labels": labels,
                            "value": metric.get_untyped().get_value(),
                        }),
                    }
                })
                .collect();

            json!({
                "name": family.get_name(),
                "help": family.get_help(),
                "type": type_name(family.get_field_type()),
                "metrics": metrics,
            })
        })
        .collect();

    Value::Array(families)
}

/// Collector listing: name, help and type for every registered family.
pub fn metadata_json(registry: &Registry) -> Value {
    let collectors: Vec<Value> = registry
        .gather()
        .iter()
        .map(|family| {
            json!({
                "name": family.get_name(),
                "help": family.get_help(),
                "type": type_name(family.get_field_type()),
            })
        })
        .collect();
    json!({ "collectors": collectors })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "metrics_test.rs"]
mod tests;
