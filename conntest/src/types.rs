//! Report type definitions
//!
//! Defines the data handed from the aggregator to reporters at every flush,
//! and the order statistics computed over one window of samples.

use serde::{Deserialize, Serialize};
use snat_common::constants::{PERCENTILE_MEDIAN, PERCENTILE_P95, PERCENTILE_P99};
use std::time::Duration;

/// Snapshot of the run-scoped attempt and error totals
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Attempts received since the run started
    pub total_attempts: u64,
    /// Failed attempts received since the run started
    pub total_errors: u64,
}

/// Order statistics for one non-empty window
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WindowStats {
    /// Number of samples in the window
    pub samples: u64,
    /// Number of failed samples in the window
    pub errors: u64,
    /// Slowest attempt
    #[serde(rename = "max_ms", with = "duration_ms")]
    pub max: Duration,
    /// 99th percentile
    #[serde(rename = "p99_ms", with = "duration_ms")]
    pub p99: Duration,
    /// 95th percentile
    #[serde(rename = "p95_ms", with = "duration_ms")]
    pub p95: Duration,
    /// 50th percentile
    #[serde(rename = "median_ms", with = "duration_ms")]
    pub median: Duration,
    /// Arithmetic mean
    #[serde(rename = "mean_ms", with = "duration_ms")]
    pub mean: Duration,
    /// Attempts per second over the nominal window length, truncated
    pub rate: u64,
}

/// What a flush produced
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WindowOutcome {
    /// The window closed without any sample
    NoData,
    /// Statistics over the window's samples
    Stats(WindowStats),
}

/// Everything a reporter receives at the end of a window
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WindowReport {
    /// RFC 3339 timestamp of the flush
    pub timestamp: String,
    /// Nominal window length in seconds
    pub period_secs: u64,
    /// Run-scoped totals at flush time
    pub totals: CounterSnapshot,
    /// Window statistics, or the no-data marker
    pub outcome: WindowOutcome,
}

impl WindowReport {
    /// Statistics, if the window had any sample
    pub fn stats(&self) -> Option<&WindowStats> {
        match &self.outcome {
            WindowOutcome::Stats(stats) => Some(stats),
            WindowOutcome::NoData => None,
        }
    }
}

/// Index of the `rank`th percentile in a sorted sequence of `len` items
///
/// Uses `floor((len - 1) * rank / 100)`, without interpolation.
/// `len` must be non-zero.
pub fn percentile_index(len: usize, rank: usize) -> usize {
    (len - 1) * rank / 100
}

/// Compute window statistics from sample durations
///
/// # Arguments
///
/// * `durations` - Durations of every sample in the window (sorted in place)
/// * `errors` - Number of failed samples among them
/// * `period_secs` - Nominal window length used for the rate
///
/// # Returns
///
/// `None` for an empty window
pub fn calculate_window_stats(
    mut durations: Vec<Duration>,
    errors: u64,
    period_secs: u64,
) -> Option<WindowStats> {
    if durations.is_empty() {
        return None;
    }

    durations.sort_unstable();
    let len = durations.len();

    let percentile = |rank: usize| durations[percentile_index(len, rank)];

    let total_nanos: u128 = durations.iter().map(Duration::as_nanos).sum();
    let mean_nanos = total_nanos / len as u128;

    Some(WindowStats {
        samples: len as u64,
        errors,
        max: durations[len - 1],
        p99: percentile(PERCENTILE_P99),
        p95: percentile(PERCENTILE_P95),
        median: percentile(PERCENTILE_MEDIAN),
        mean: Duration::from_nanos(mean_nanos.min(u64::MAX as u128) as u64),
        rate: len as u64 / period_secs.max(1),
    })
}

/// Duration as fractional milliseconds
pub fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

/// Serde helper storing durations as fractional milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(super::as_millis_f64(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        if !ms.is_finite() || ms < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_nanos((ms * 1_000_000.0).round() as u64))
    }
}
