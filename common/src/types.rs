//! Shared data structures between probe workers and the aggregator

use core::time::Duration;

/// Outcome of one probe attempt
///
/// Created by a probe worker once the attempt completes or fails and then
/// handed over to the aggregator through the sample channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sample {
    /// Time from dispatch to completion or failure
    pub elapsed: Duration,
    /// True if the attempt did not complete successfully
    pub failed: bool,
}

impl Sample {
    /// Sample for an attempt that completed
    pub const fn success(elapsed: Duration) -> Self {
        Self {
            elapsed,
            failed: false,
        }
    }

    /// Sample for an attempt that errored or timed out
    pub const fn failure(elapsed: Duration) -> Self {
        Self {
            elapsed,
            failed: true,
        }
    }

    /// Elapsed time in milliseconds, truncated
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }
}
