//! Sample collection and window aggregation
//!
//! Buffers samples for the current window and keeps the run-scoped totals.

use crate::types::*;
use snat_common::Sample;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::Instant;

/// Attempt and error totals for the whole run
///
/// Only `record` and `snapshot` touch the counters. Attempts are always
/// incremented before errors and read after them, so a snapshot never shows
/// more errors than attempts.
#[derive(Debug, Default)]
pub struct RunCounters {
    attempts: AtomicU64,
    errors: AtomicU64,
}

impl RunCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one attempt
    pub fn record(&self, failed: bool) {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        if failed {
            self.errors.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Read both totals
    pub fn snapshot(&self) -> CounterSnapshot {
        let total_errors = self.errors.load(Ordering::Acquire);
        let total_attempts = self.attempts.load(Ordering::Acquire);
        CounterSnapshot {
            total_attempts,
            total_errors,
        }
    }
}

/// Samples received since the last flush
#[derive(Debug)]
pub struct Window {
    samples: Vec<Sample>,
    errors: u64,
    started_at: Instant,
    duration_target: Duration,
}

impl Window {
    /// Create an empty window of the given nominal length
    pub fn new(duration_target: Duration) -> Self {
        Self {
            samples: Vec::new(),
            errors: 0,
            started_at: Instant::now(),
            duration_target,
        }
    }

    /// Append a sample in arrival order
    pub fn push(&mut self, sample: Sample) {
        if sample.failed {
            self.errors += 1;
        }
        self.samples.push(sample);
    }

    /// Number of buffered samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window has no sample
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Failed samples in the window
    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Buffered samples in arrival order
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Nominal window length
    pub fn duration_target(&self) -> Duration {
        self.duration_target
    }

    /// Compute statistics over a copy of the durations
    pub fn stats(&self) -> Option<WindowStats> {
        let durations = self.samples.iter().map(|s| s.elapsed).collect();
        calculate_window_stats(durations, self.errors, self.duration_target.as_secs())
    }

    /// Start a new window, keeping the buffer's capacity
    pub fn reset(&mut self) {
        self.samples.clear();
        self.errors = 0;
        self.started_at = Instant::now();
    }

    /// Time since the window started
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Collector feeding samples into the current window
///
/// Owned by the aggregator task; ingestion and flush never overlap.
pub struct WindowCollector {
    window: Window,
    counters: Arc<RunCounters>,
}

impl WindowCollector {
    /// Create a new collector
    ///
    /// # Arguments
    ///
    /// * `summary_interval` - Nominal window length
    /// * `counters` - Run-scoped totals, shared with whoever wants to read them
    pub fn new(summary_interval: Duration, counters: Arc<RunCounters>) -> Self {
        Self {
            window: Window::new(summary_interval),
            counters,
        }
    }

    /// Add a sample to the current window
    pub fn add_sample(&mut self, sample: Sample) {
        self.counters.record(sample.failed);
        self.window.push(sample);
    }

    /// Close the current window
    ///
    /// # Returns
    ///
    /// WindowReport with the window statistics, or the no-data marker when
    /// the window is empty
    pub fn flush(&mut self) -> WindowReport {
        let outcome = match self.window.stats() {
            Some(stats) => WindowOutcome::Stats(stats),
            None => WindowOutcome::NoData,
        };

        log::debug!(
            "Closing window after {:?} with {} samples",
            self.window.age(),
            self.window.len()
        );
        self.window.reset();

        WindowReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            period_secs: self.window.duration_target().as_secs(),
            totals: self.counters.snapshot(),
            outcome,
        }
    }

    /// Current window reference
    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Run-scoped totals
    pub fn counters(&self) -> &Arc<RunCounters> {
        &self.counters
    }
}
