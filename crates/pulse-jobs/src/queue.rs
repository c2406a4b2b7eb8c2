//! Client-facing queue service.
//!
//! One `JobQueue` instance is constructed explicitly at process startup and
//! injected into everything that enqueues or administers jobs (HTTP layer,
//! schedulers, workers). There is deliberately no global instance: ambient
//! singletons with their own dedup state are how duplicate jobs happen.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info};
use uuid::Uuid;

use pulse_core::{
    defaults, new_v7, Error, Job, JobFilter, JobStatus, JobStore, NewJob, QueueSnapshot, Result,
    TransitionUpdate,
};

/// Error message recorded when a pending job is cancelled.
pub const CANCELLED_ERROR: &str = "Cancelled";

/// Defaults applied to enqueued jobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Priority assigned when the producer does not specify one.
    pub default_priority: i32,
    /// Attempt budget assigned when the producer does not specify one.
    pub default_max_attempts: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_priority: defaults::JOB_DEFAULT_PRIORITY,
            default_max_attempts: defaults::JOB_MAX_ATTEMPTS,
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_DEFAULT_PRIORITY` | `100` | Priority when unspecified (lower runs first) |
    /// | `JOB_MAX_ATTEMPTS` | `3` | Attempt budget when unspecified |
    pub fn from_env() -> Self {
        let default_priority = std::env::var("JOB_DEFAULT_PRIORITY")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(defaults::JOB_DEFAULT_PRIORITY);

        let default_max_attempts = std::env::var("JOB_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(defaults::JOB_MAX_ATTEMPTS)
            .max(1);

        Self {
            default_priority,
            default_max_attempts,
        }
    }
}

/// Per-call enqueue options.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Lower value is served first. Falls back to the queue default.
    pub priority: Option<i32>,
    /// Seconds before the job becomes claimable.
    pub delay_seconds: i64,
    /// Deduplication key: at most one non-terminal job may exist per
    /// `(job_type, dedup_key)`. `None` disables deduplication.
    pub dedup_key: Option<String>,
    /// Attempt budget, clamped to at least 1. Falls back to the queue
    /// default.
    pub max_attempts: Option<i32>,
    /// Past this instant the job is never claimed and is swept to failed.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Client-facing API over the job store: enqueue, inspect, retry, cancel,
/// delete, bulk-clear.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
}

impl JobQueue {
    /// Create a queue service over the given store.
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self { store, config }
    }

    /// Access the underlying store (shared with worker pool and reaper).
    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    /// Enqueue a job and return its id. Never blocks on execution.
    ///
    /// When `dedup_key` is set and a non-terminal job with the same
    /// `(job_type, dedup_key)` already exists, that job's id is returned
    /// and nothing is inserted — idempotent enqueue, not an error.
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: JsonValue,
        opts: EnqueueOptions,
    ) -> Result<Uuid> {
        let now = Utc::now();
        let id = new_v7();

        let job = NewJob {
            id,
            job_type: job_type.to_string(),
            payload,
            dedup_key: opts.dedup_key,
            priority: opts.priority.unwrap_or(self.config.default_priority),
            // A budget below 1 would let the claim's attempts increment
            // break `attempts <= max_attempts`.
            max_attempts: opts
                .max_attempts
                .unwrap_or(self.config.default_max_attempts)
                .max(1),
            scheduled_at: now + ChronoDuration::seconds(opts.delay_seconds.max(0)),
            expires_at: opts.expires_at,
        };
        let dedup_key = job.dedup_key.clone();

        let result_id = self.store.insert(job).await?;

        if result_id == id {
            info!(
                subsystem = "queue",
                op = "enqueue",
                job_id = %result_id,
                job_type,
                dedup_key = dedup_key.as_deref(),
                "Job enqueued"
            );
        } else {
            debug!(
                subsystem = "queue",
                op = "enqueue",
                job_id = %result_id,
                job_type,
                dedup_key = dedup_key.as_deref(),
                "Enqueue deduplicated onto existing active job"
            );
        }

        Ok(result_id)
    }

    /// Fetch a job by id.
    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        self.store.get(id).await
    }

    /// List jobs matching the filter, newest first.
    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>> {
        self.store.list(filter, limit, offset).await
    }

    /// Aggregate queue statistics for the admin surface.
    pub async fn get_stats(&self) -> Result<QueueSnapshot> {
        let counts = self.store.queue_stats().await?;
        let window_secs = defaults::STATS_THROUGHPUT_WINDOW_SECS;
        let throughput = self
            .store
            .throughput(window_secs)
            .await?
            .into_iter()
            .map(|t| (t.job_type.clone(), t))
            .collect::<HashMap<_, _>>();

        Ok(QueueSnapshot {
            counts,
            throughput,
            window_secs,
        })
    }

    /// Re-run a failed job by inserting a fresh one.
    ///
    /// Valid only when the job is `failed`. The new job copies the type,
    /// payload, priority, dedup key, and attempt budget, with attempts back
    /// at zero; the failed row stays behind as history. This is the
    /// canonical operator "try again" action — [`reset_job`] is the
    /// same-row debug variant.
    ///
    /// [`reset_job`]: JobQueue::reset_job
    pub async fn retry_job(&self, id: Uuid) -> Result<Uuid> {
        let job = self.store.get(id).await?.ok_or(Error::JobNotFound(id))?;
        if job.status != JobStatus::Failed {
            return Err(Error::InvalidState {
                job_id: id,
                status: job.status,
                operation: "retry",
            });
        }

        let new_id = self
            .store
            .insert(NewJob {
                id: new_v7(),
                job_type: job.job_type.clone(),
                payload: job.payload.clone(),
                dedup_key: job.dedup_key.clone(),
                priority: job.priority,
                max_attempts: job.max_attempts,
                scheduled_at: Utc::now(),
                expires_at: None,
            })
            .await?;

        info!(
            subsystem = "queue",
            op = "retry",
            job_id = %id,
            new_job_id = %new_id,
            job_type = %job.job_type,
            "Failed job re-enqueued as new job"
        );
        Ok(new_id)
    }

    /// Mutate a terminal or `retry` job back to `pending` in place:
    /// attempts, error, and execution timestamps cleared.
    ///
    /// Secondary/debug tool — prefer [`retry_job`], which preserves the
    /// failed row for auditing.
    ///
    /// [`retry_job`]: JobQueue::retry_job
    pub async fn reset_job(&self, id: Uuid) -> Result<()> {
        if self.store.reset(id, Utc::now()).await? {
            info!(subsystem = "queue", op = "reset", job_id = %id, "Job reset to pending");
            return Ok(());
        }
        self.invalid_state(id, "reset").await
    }

    /// Cancel a pending job: `pending → failed` with a recorded message.
    ///
    /// Cancellation is cooperative: a `processing` job cannot be
    /// interrupted and this returns `InvalidState` for it (and for any
    /// other non-pending status).
    pub async fn cancel_job(&self, id: Uuid) -> Result<()> {
        let applied = self
            .store
            .transition(
                id,
                JobStatus::Pending,
                JobStatus::Failed,
                TransitionUpdate {
                    error_message: Some(CANCELLED_ERROR.to_string()),
                    scheduled_at: None,
                    completed_at: Some(Utc::now()),
                },
            )
            .await?;

        if applied {
            info!(subsystem = "queue", op = "cancel", job_id = %id, "Pending job cancelled");
            return Ok(());
        }
        self.invalid_state(id, "cancel").await
    }

    /// Delete one job. Rejected while `processing`.
    pub async fn delete_job(&self, id: Uuid) -> Result<()> {
        self.store.delete(id).await?;
        info!(subsystem = "queue", op = "delete", job_id = %id, "Job deleted");
        Ok(())
    }

    /// Bulk-delete terminal jobs older than the cutoff. Returns the number
    /// of rows removed; non-terminal rows are never touched.
    pub async fn clear_terminal(
        &self,
        statuses: &[JobStatus],
        older_than_days: i64,
    ) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(older_than_days.max(0));
        let removed = self.store.bulk_delete_terminal(statuses, cutoff).await?;
        info!(
            subsystem = "queue",
            op = "clear_terminal",
            job_count = removed,
            older_than_days,
            "Cleared terminal jobs"
        );
        Ok(removed)
    }

    /// Shared rejection path: the conditional write did not apply, so
    /// report the job's actual current state (or absence) to the caller.
    async fn invalid_state(&self, id: Uuid, operation: &'static str) -> Result<()> {
        match self.store.get(id).await? {
            Some(job) => Err(Error::InvalidState {
                job_id: id,
                status: job.status,
                operation,
            }),
            None => Err(Error::JobNotFound(id)),
        }
    }
}
