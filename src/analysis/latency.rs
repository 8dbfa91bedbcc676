//! Bounded-memory latency percentile estimation over a sliding window.
//!
//! Samples land in an unordered buffer capped at `max_samples`; entries
//! older than the window are pruned in place on every add. The sorted view
//! needed for percentiles is built lazily on the first read after an add and
//! cached until the next write.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::Duration;

/// Default sliding window width.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

/// Default maximum buffered samples.
pub const DEFAULT_MAX_SAMPLES: usize = 10_000;

/// One observed latency with its labels.
#[derive(Clone, Debug)]
pub struct LatencySample {
    pub timestamp: DateTime<Utc>,
    pub latency: Duration,
    pub labels: BTreeMap<String, String>,
}

/// Summary statistics over the samples currently inside the window.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub stddev_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub p999_ms: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

struct AggregatorState {
    samples: VecDeque<LatencySample>,
    /// Sorted millisecond values; rebuilt lazily, invalidated by writes
    sorted: Option<Vec<f64>>,
    last_updated: Option<DateTime<Utc>>,
}

pub struct LatencyAggregator {
    window: Duration,
    max_samples: usize,
    state: RwLock<AggregatorState>,
}

impl Default for LatencyAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MAX_SAMPLES)
    }
}

impl LatencyAggregator {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        LatencyAggregator {
            window,
            max_samples,
            state: RwLock::new(AggregatorState {
                samples: VecDeque::new(),
                sorted: None,
                last_updated: None,
            }),
        }
    }

    /// Record a sample stamped with the current time. O(1) amortized.
    pub fn add_sample(&self, latency: Duration, labels: BTreeMap<String, String>) {
        self.add_sample_at(Utc::now(), latency, labels);
    }

    /// Record a sample with an explicit timestamp.
    pub fn add_sample_at(
        &self,
        now: DateTime<Utc>,
        latency: Duration,
        labels: BTreeMap<String, String>,
    ) {
        let mut state = self.write_state();
        state.samples.push_back(LatencySample {
            timestamp: now,
            latency,
            labels,
        });
        Self::prune(&mut state, now, self.window, self.max_samples);
        state.sorted = None;
        state.last_updated = Some(now);
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut state = self.write_state();
        state.samples.clear();
        state.sorted = None;
        state.last_updated = None;
    }

    /// Samples currently buffered (after pruning at the last write).
    pub fn count(&self) -> usize {
        self.read_state().samples.len()
    }

    /// Interpolated percentile in milliseconds.
    ///
    /// Accepts `p` in [0, 1] or [0, 100]; values above 1 are treated as
    /// percentages. Returns `None` when no samples are buffered.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        {
            let state = self.read_state();
            if let Some(sorted) = &state.sorted {
                return Self::percentile_of(sorted, p);
            }
        }
        let mut state = self.write_state();
        Self::ensure_sorted(&mut state);
        state
            .sorted
            .as_ref()
            .and_then(|sorted| Self::percentile_of(sorted, p))
    }

    /// Full statistics over the current window.
    pub fn stats(&self) -> LatencyStats {
        let mut state = self.write_state();
        Self::ensure_sorted(&mut state);
        let last_updated = state.last_updated;
        let Some(sorted) = state.sorted.as_ref() else {
            return LatencyStats::default();
        };
        if sorted.is_empty() {
            return LatencyStats {
                last_updated,
                ..Default::default()
            };
        }

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let mean = sum / count as f64;
        let variance = sorted
            .iter()
            .map(|v| {
                let d = v - mean;
                d * d
            })
            .sum::<f64>()
            / count as f64;

        let pct = |p: f64| Self::percentile_of(sorted, p).unwrap_or(0.0);

        LatencyStats {
            count,
            min_ms: sorted[0],
            max_ms: sorted[count - 1],
            mean_ms: mean,
            median_ms: pct(50.0),
            stddev_ms: variance.sqrt(),
            p50_ms: pct(50.0),
            p90_ms: pct(90.0),
            p95_ms: pct(95.0),
            p99_ms: pct(99.0),
            p999_ms: pct(99.9),
            last_updated,
        }
    }

    fn prune(
        state: &mut AggregatorState,
        now: DateTime<Utc>,
        window: Duration,
        max_samples: usize,
    ) {
        let cutoff = now - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        state.samples.retain(|s| s.timestamp > cutoff);
        while state.samples.len() > max_samples {
            state.samples.pop_front();
        }
    }

    fn ensure_sorted(state: &mut AggregatorState) {
        if state.sorted.is_none() {
            let mut values: Vec<f64> = state
                .samples
                .iter()
                .map(|s| s.latency.as_secs_f64() * 1000.0)
                .collect();
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            state.sorted = Some(values);
        }
    }

    fn percentile_of(sorted: &[f64], p: f64) -> Option<f64> {
        if sorted.is_empty() {
            return None;
        }
        // Accept both fractional [0,1] and percentage [0,100] inputs
        let fraction = if p > 1.0 { p / 100.0 } else { p };
        let fraction = fraction.clamp(0.0, 1.0);

        let rank = fraction * (sorted.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        if lower == upper {
            return Some(sorted[lower]);
        }
        let weight = rank - lower as f64;
        Some(sorted[lower] * (1.0 - weight) + sorted[upper] * weight)
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, AggregatorState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, AggregatorState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "latency_test.rs"]
mod tests;
