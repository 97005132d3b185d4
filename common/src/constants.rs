//! Shared constants for the connection tester
//!
//! These constants are used by the client, the target server and the
//! statistics code so that defaults stay consistent across the workspace.

// ============================================================================
// Client Defaults
// ============================================================================

/// Default interval between two attempts of one worker (microseconds)
pub const DEFAULT_DIAL_INTERVAL_US: u64 = 100_000;

/// Default per-attempt timeout (milliseconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 500;

/// Timeouts at or above this value blur the per-second rate (milliseconds)
pub const RECOMMENDED_MAX_TIMEOUT_MS: u64 = 1_000;

/// Default statistics summary interval (seconds)
pub const DEFAULT_SUMMARY_INTERVAL_SECS: u64 = 5;

// ============================================================================
// Server Defaults
// ============================================================================

/// Default listen address of the target server
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

// ============================================================================
// Channel Sizes
// ============================================================================

/// Capacity of the channel between probe workers and the aggregator
pub const SAMPLE_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// Latency Thresholds
// ============================================================================

/// Successful attempts slower than this are logged (milliseconds)
pub const SLOW_ATTEMPT_THRESHOLD_MS: u64 = 500;

// ============================================================================
// Percentiles
// ============================================================================

/// 99th percentile rank
pub const PERCENTILE_P99: usize = 99;

/// 95th percentile rank
pub const PERCENTILE_P95: usize = 95;

/// Median rank
pub const PERCENTILE_MEDIAN: usize = 50;
