//! Job handler contract.
//!
//! The engine is payload-agnostic: a handler receives the raw JSON payload
//! and validates its own shape at this boundary (typically by
//! deserializing into a per-type struct with `serde`).

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use pulse_core::Job;

/// Context provided to job handlers.
pub struct JobContext {
    /// The job being processed.
    pub job: Job,
}

impl JobContext {
    /// Create a new job context.
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    /// The job id.
    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    /// The raw job payload.
    pub fn payload(&self) -> &JsonValue {
        &self.job.payload
    }

    /// Attempt number for this execution (1-based; set by the claim).
    pub fn attempt(&self) -> i32 {
        self.job.attempts
    }
}

/// Result of a handler execution.
#[derive(Debug)]
pub enum JobOutcome {
    /// Job completed successfully.
    Success,
    /// Transient failure: retry with backoff until attempts are exhausted.
    Retry(String),
    /// Permanent failure (e.g. malformed payload): fail immediately,
    /// skipping any remaining attempts.
    Fatal(String),
}

/// Trait for job handlers.
///
/// One handler is registered per job type string; the worker pool
/// dispatches each claimed job to the handler whose `job_type` matches.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job type string this handler processes (e.g. `"feed_fetch"`).
    fn job_type(&self) -> &str;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobOutcome;
}

/// No-op handler for testing and wiring checks.
pub struct NoOpHandler {
    job_type: String,
}

impl NoOpHandler {
    /// Create a new no-op handler for the given job type.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
        }
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn execute(&self, _ctx: JobContext) -> JobOutcome {
        JobOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulse_core::{job_types, JobStatus};
    use serde::Deserialize;

    fn make_job(job_type: &str, payload: JsonValue) -> Job {
        Job {
            id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            payload,
            dedup_key: None,
            priority: 100,
            status: JobStatus::Processing,
            attempts: 1,
            max_attempts: 3,
            error_message: None,
            scheduled_at: Utc::now(),
            expires_at: None,
            started_at: Some(Utc::now()),
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_noop_handler() {
        let handler = NoOpHandler::new(job_types::FEED_FETCH);
        assert_eq!(handler.job_type(), "feed_fetch");

        let ctx = JobContext::new(make_job(job_types::FEED_FETCH, serde_json::json!({})));
        let outcome = handler.execute(ctx).await;
        assert!(matches!(outcome, JobOutcome::Success));
    }

    #[test]
    fn test_context_accessors() {
        let job = make_job(job_types::CLEANUP, serde_json::json!({"olderThanDays": 7}));
        let id = job.id;
        let ctx = JobContext::new(job);
        assert_eq!(ctx.job_id(), id);
        assert_eq!(ctx.attempt(), 1);
        assert_eq!(ctx.payload()["olderThanDays"], 7);
    }

    /// Typed payload validation happens at the handler boundary: a handler
    /// deserializes into its own struct and signals `Fatal` on shape errors.
    #[tokio::test]
    async fn test_typed_payload_handler_rejects_malformed_input() {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct FeedFetchPayload {
            source_id: String,
        }

        struct FeedFetchHandler;

        #[async_trait]
        impl JobHandler for FeedFetchHandler {
            fn job_type(&self) -> &str {
                job_types::FEED_FETCH
            }

            async fn execute(&self, ctx: JobContext) -> JobOutcome {
                match serde_json::from_value::<FeedFetchPayload>(ctx.payload().clone()) {
                    Ok(payload) => {
                        assert!(!payload.source_id.is_empty());
                        JobOutcome::Success
                    }
                    Err(e) => JobOutcome::Fatal(format!("Malformed payload: {e}")),
                }
            }
        }

        let handler = FeedFetchHandler;

        let ok = JobContext::new(make_job(
            job_types::FEED_FETCH,
            serde_json::json!({"sourceId": "abc"}),
        ));
        assert!(matches!(handler.execute(ok).await, JobOutcome::Success));

        let bad = JobContext::new(make_job(job_types::FEED_FETCH, serde_json::json!({})));
        assert!(matches!(handler.execute(bad).await, JobOutcome::Fatal(_)));
    }
}
