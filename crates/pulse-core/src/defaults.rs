//! Centralized default constants for the Pulse job engine.
//!
//! **This module is the single source of truth** for all shared default
//! values. The engine crates reference these constants instead of defining
//! their own magic numbers; every one of them can be overridden through the
//! environment (see the `from_env` constructors in `pulse-jobs`).

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default maximum attempt count before a job is finalized as failed.
pub const JOB_MAX_ATTEMPTS: i32 = 3;

/// Default job priority. Lower values are served first.
pub const JOB_DEFAULT_PRIORITY: i32 = 100;

/// Default job worker poll interval in milliseconds (used when a claim
/// returns nothing).
pub const JOB_POLL_INTERVAL_MS: u64 = 500;

/// Default maximum concurrent jobs per worker process.
pub const JOB_WORKER_CONCURRENCY: usize = 4;

/// Default per-job execution timeout in seconds (5 minutes).
///
/// A handler exceeding this is treated as a transient failure. The handler
/// future is dropped in-process; work delegated outside the process is not
/// cancelled (see `pulse-jobs::worker`).
pub const JOB_EXECUTION_TIMEOUT_SECS: u64 = 300;

/// Default grace period when draining in-flight jobs on worker stop.
pub const JOB_STOP_GRACE_SECS: u64 = 30;

/// Back-off applied to the poll loop after a store error.
pub const STORE_ERROR_BACKOFF_MS: u64 = 5_000;

// =============================================================================
// RETRY / BACKOFF
// =============================================================================

/// Base delay before the first retry, in seconds.
pub const JOB_BACKOFF_BASE_SECS: u64 = 30;

/// Upper bound on the retry delay, in seconds (1 hour).
pub const JOB_BACKOFF_CAP_SECS: u64 = 3_600;

// =============================================================================
// REAPER
// =============================================================================

/// Default interval between stale-job sweeps, in seconds.
pub const JOB_REAPER_INTERVAL_SECS: u64 = 60;

// =============================================================================
// STATS
// =============================================================================

/// Window over which per-job-type throughput is aggregated, in seconds.
pub const STATS_THROUGHPUT_WINDOW_SECS: u64 = 3_600;

// =============================================================================
// EVENTS
// =============================================================================

/// Capacity of the worker event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// PAGINATION
// =============================================================================

/// Default page size for job listing.
pub const PAGE_LIMIT: i64 = 50;

/// Default page offset.
pub const PAGE_OFFSET: i64 = 0;
