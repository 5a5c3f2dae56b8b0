//! System-wide default constants.
//!
//! Every tunable in `PipelineConfig` defaults to a value from here.
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Retry Policy
// ============================================================================

/// Total attempts per stage (first dispatch included) before it fails.
pub const STAGE_MAX_ATTEMPTS: u32 = 3;

// ============================================================================
// Publish Backoff
// ============================================================================

/// First backoff delay after a failed publish (ms).
pub const PUBLISH_BASE_DELAY_MS: u64 = 100;

/// Backoff ceiling (ms).
pub const PUBLISH_MAX_DELAY_MS: u64 = 5_000;

/// Publish attempts before a dispatch is left to the timeout sweep.
pub const PUBLISH_MAX_ATTEMPTS: u32 = 5;

/// Maximum backoff multiplier exponent.
///
/// `2^10 = 1024x base delay`, always capped by `PUBLISH_MAX_DELAY_MS`.
pub const PUBLISH_MAX_BACKOFF_EXPONENT: u32 = 10;

/// Slack added to the worst-case backoff before the sweep takes over a
/// publish another task still holds (s). Covers a slow broker acknowledgement.
pub const PUBLISH_LEASE_MARGIN_SECS: u64 = 10;

// ============================================================================
// Timeouts
// ============================================================================

/// How long a dispatched stage may stay silent before a synthetic failure (s).
pub const STAGE_TIMEOUT_SECS: u64 = 300;

/// Interval between timeout sweeps (s).
pub const SWEEP_INTERVAL_SECS: u64 = 30;

/// Interval between archive pruning passes (s). 3 600 = hourly.
pub const ARCHIVE_PRUNE_INTERVAL_SECS: u64 = 3_600;

// ============================================================================
// Message Bus
// ============================================================================

/// Concurrent handler invocations per subscription.
pub const MAX_CONCURRENT_HANDLERS: usize = 64;

/// Delay before a nacked message is delivered again (ms).
pub const REDELIVERY_DELAY_MS: u64 = 500;

/// Redeliveries of one message before it is dead-lettered.
pub const MAX_REDELIVERIES: u32 = 10;

// ============================================================================
// Storage
// ============================================================================

/// Default data directory.
pub const DATA_DIR: &str = "./data";

/// Tracker database directory name under the data directory.
pub const TRACKER_DB_NAME: &str = "tracker.db";

/// Archived submissions older than this are pruned (days).
pub const ARCHIVE_RETENTION_DAYS: u32 = 30;

/// CAS rounds before a tracker update reports contention.
pub const MAX_CAS_RETRIES: u32 = 64;

// ============================================================================
// Simulation
// ============================================================================

/// Simulated worker latency range (ms).
pub const SIMULATED_MIN_LATENCY_MS: u64 = 20;
pub const SIMULATED_MAX_LATENCY_MS: u64 = 250;
