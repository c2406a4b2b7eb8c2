//! Data model for the Pulse job engine.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Well-known platform job type strings.
///
/// The engine treats `job_type` as an opaque string; these constants exist
/// so producers and handler registrations agree on spelling. Payload shape
/// per type is validated at the handler boundary, never by the engine.
pub mod job_types {
    /// Fetch new items from an RSS/podcast/Reddit feed source.
    pub const FEED_FETCH: &str = "feed_fetch";
    /// Process a fetched content item (clean, extract, summarize).
    pub const CONTENT_PROCESS: &str = "content_process";
    /// Generate the daily market analysis.
    pub const DAILY_ANALYSIS: &str = "daily_analysis";
    /// Transcribe podcast/video audio.
    pub const TRANSCRIBE_AUDIO: &str = "transcribe_audio";
    /// Compare past predictions against observed outcomes.
    pub const PREDICTION_COMPARISON: &str = "prediction_comparison";
    /// Housekeeping (old row cleanup, cache eviction).
    pub const CLEANUP: &str = "cleanup";
}

/// Status of a job in the queue.
///
/// State machine:
/// `pending → processing → {completed | retry | failed}`;
/// `retry → processing` (once `scheduled_at` elapses);
/// `pending → failed` (cancel);
/// any terminal or `retry` → `pending` (explicit admin reset only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed and executing on exactly one worker.
    Processing,
    /// Failed transiently; claimable again once `scheduled_at` elapses.
    Retry,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished unsuccessfully (or cancelled/expired). Terminal.
    Failed,
}

impl JobStatus {
    /// The wire/database representation of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Retry => "retry",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Parse a status from its wire/database representation.
    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "retry" => Some(JobStatus::Retry),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Whether no further automatic transitions occur from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// All terminal statuses.
    pub const TERMINAL: [JobStatus; 2] = [JobStatus::Completed, JobStatus::Failed];
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque unique identifier, assigned at creation, immutable.
    pub id: Uuid,
    /// Identifies which registered handler processes this job.
    pub job_type: String,
    /// Arbitrary structured data passed to the handler.
    pub payload: JsonValue,
    /// Derived identifier preventing duplicate concurrent jobs for the
    /// same logical work. At most one non-terminal row exists per
    /// `(job_type, dedup_key)`.
    pub dedup_key: Option<String>,
    /// Lower value is served first.
    pub priority: i32,
    pub status: JobStatus,
    /// Incremented by the atomic claim. `attempts <= max_attempts` always.
    pub attempts: i32,
    pub max_attempts: i32,
    /// Set only on failed/retry transitions caused by a handler error,
    /// a timeout, cancellation, or expiry.
    pub error_message: Option<String>,
    /// Earliest time the job becomes claimable (delay and backoff).
    pub scheduled_at: DateTime<Utc>,
    /// A job past this time is never claimed and is swept to `failed`.
    pub expires_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for inserting a new job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub job_type: String,
    pub payload: JsonValue,
    pub dedup_key: Option<String>,
    pub priority: i32,
    pub max_attempts: i32,
    pub scheduled_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Filter for job listing.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
}

/// Queue depth by status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub retry: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

/// Per-job-type throughput over a recent window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTypeThroughput {
    pub job_type: String,
    pub completed: i64,
    pub failed: i64,
    /// Average wall-clock duration of completed jobs, milliseconds.
    pub avg_duration_ms: Option<f64>,
}

/// Full stats response for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub counts: QueueStats,
    /// Throughput keyed by job type over the recent window.
    pub throughput: HashMap<String, JobTypeThroughput>,
    /// Window length in seconds the throughput was computed over.
    pub window_secs: u64,
}

/// Worker pool status for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub paused: bool,
    pub concurrency: usize,
    pub in_flight: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Retry,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_status_parse_unknown() {
        assert_eq!(JobStatus::parse("running"), None);
        assert_eq!(JobStatus::parse(""), None);
        assert_eq!(JobStatus::parse("PENDING"), None);
    }

    #[test]
    fn test_status_terminality() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Retry.is_terminal());
    }

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&JobStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
        let back: JobStatus = serde_json::from_str("\"retry\"").unwrap();
        assert_eq!(back, JobStatus::Retry);
    }

    #[test]
    fn test_job_serialization() {
        let job = Job {
            id: Uuid::nil(),
            job_type: job_types::FEED_FETCH.to_string(),
            payload: serde_json::json!({"sourceId": "abc"}),
            dedup_key: Some("abc".to_string()),
            priority: 1,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            error_message: None,
            scheduled_at: Utc::now(),
            expires_at: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"job_type\":\"feed_fetch\""));
        assert!(json.contains("\"status\":\"pending\""));

        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.dedup_key, job.dedup_key);
    }

    #[test]
    fn test_job_type_strings_are_unique() {
        let mut names = vec![
            job_types::FEED_FETCH,
            job_types::CONTENT_PROCESS,
            job_types::DAILY_ANALYSIS,
            job_types::TRANSCRIBE_AUDIO,
            job_types::PREDICTION_COMPARISON,
            job_types::CLEANUP,
        ];
        let len = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), len);
    }
}
