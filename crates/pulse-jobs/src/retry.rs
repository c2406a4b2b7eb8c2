//! Retry policy and the shared failure-recording routine.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

use pulse_core::{defaults, Job, JobStatus, JobStore, Result, TransitionUpdate};

/// Exponential backoff with a cap.
///
/// `delay(attempts) = min(base * 2^(attempts - 1), cap)`, so successive
/// retry delays are non-decreasing and bounded.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry, in seconds.
    pub base_secs: u64,
    /// Upper bound on any retry delay, in seconds.
    pub cap_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_secs: defaults::JOB_BACKOFF_BASE_SECS,
            cap_secs: defaults::JOB_BACKOFF_CAP_SECS,
        }
    }
}

impl RetryPolicy {
    /// Create a policy from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_BACKOFF_BASE_SECS` | `30` | Delay before the first retry |
    /// | `JOB_BACKOFF_CAP_SECS` | `3600` | Maximum retry delay |
    pub fn from_env() -> Self {
        let base_secs = std::env::var("JOB_BACKOFF_BASE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_BACKOFF_BASE_SECS);

        let cap_secs = std::env::var("JOB_BACKOFF_CAP_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_BACKOFF_CAP_SECS)
            .max(base_secs);

        Self { base_secs, cap_secs }
    }

    /// Backoff delay after the given (1-based) attempt number, in seconds.
    pub fn delay_secs(&self, attempts: i32) -> u64 {
        let exponent = attempts.max(1) as u32 - 1;
        // A shift that would lose bits wraps rather than saturates, so any
        // exponent that cannot fit resolves straight to the cap.
        if exponent >= self.base_secs.leading_zeros() {
            return self.cap_secs;
        }
        (self.base_secs << exponent).min(self.cap_secs)
    }

    /// When a job failing now becomes claimable again.
    pub fn next_attempt_at(&self, attempts: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + ChronoDuration::seconds(self.delay_secs(attempts) as i64)
    }
}

/// The status a failure was resolved to, or `Lost` when the conditional
/// transition found the job no longer `processing` (e.g. the reaper and a
/// worker raced and the other writer won).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Retried,
    Failed,
    Lost,
}

/// Record a handler failure for a job currently `processing`.
///
/// `attempts` was already incremented by the claim. Transient failures with
/// attempts remaining go to `retry` with a backoff-delayed `scheduled_at`;
/// exhausted or permanent failures go to `failed`. Both paths run through
/// the store's conditional transition, so a job that actually finished just
/// before this call is never corrupted.
pub async fn record_failure(
    store: &dyn JobStore,
    job: &Job,
    error: &str,
    permanent: bool,
    policy: &RetryPolicy,
) -> Result<FailureDisposition> {
    let now = Utc::now();
    let retryable = !permanent && job.attempts < job.max_attempts;

    let applied = if retryable {
        store
            .transition(
                job.id,
                JobStatus::Processing,
                JobStatus::Retry,
                TransitionUpdate {
                    error_message: Some(error.to_string()),
                    scheduled_at: Some(policy.next_attempt_at(job.attempts, now)),
                    completed_at: None,
                },
            )
            .await?
    } else {
        store
            .transition(
                job.id,
                JobStatus::Processing,
                JobStatus::Failed,
                TransitionUpdate {
                    error_message: Some(error.to_string()),
                    scheduled_at: None,
                    completed_at: Some(now),
                },
            )
            .await?
    };

    if !applied {
        debug!(
            subsystem = "queue",
            op = "record_failure",
            job_id = %job.id,
            job_type = %job.job_type,
            "Failure transition lost the race; job already left processing"
        );
        return Ok(FailureDisposition::Lost);
    }

    if retryable {
        debug!(
            subsystem = "queue",
            op = "record_failure",
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            delay_secs = policy.delay_secs(job.attempts),
            error,
            "Job scheduled for retry"
        );
        Ok(FailureDisposition::Retried)
    } else {
        warn!(
            subsystem = "queue",
            op = "record_failure",
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            permanent,
            error,
            "Job finalized as failed"
        );
        Ok(FailureDisposition::Failed)
    }
}
