//! Persistence contract for the job engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Job, JobFilter, JobStatus, JobTypeThroughput, NewJob, QueueStats};

/// Fields written alongside a conditional status transition.
///
/// `None` leaves the column untouched, except that any transition to
/// `completed` clears `error_message`: errors belong only to rows that
/// are `failed` or awaiting `retry`.
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub error_message: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Durable record of every job; the single source of truth for
/// coordination across any number of worker processes.
///
/// Every coordination guarantee is enforced here — atomic claiming,
/// conditional transitions, and the dedup uniqueness constraint — never by
/// application-level locking. All writers go through [`claim_next`] and
/// [`transition`]; there is no raw status update in the engine.
///
/// [`claim_next`]: JobStore::claim_next
/// [`transition`]: JobStore::transition
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Append a new job row.
    ///
    /// When `dedup_key` is set, the check and the insert are one atomic
    /// operation: if a non-terminal row with the same
    /// `(job_type, dedup_key)` already exists, its id is returned and no
    /// row is inserted. Idempotent enqueue is success, not an error.
    async fn insert(&self, job: NewJob) -> Result<Uuid>;

    /// Return the non-terminal job with this `(job_type, dedup_key)`,
    /// if one exists.
    async fn find_active_by_dedup_key(
        &self,
        job_type: &str,
        dedup_key: &str,
    ) -> Result<Option<Job>>;

    /// Atomically claim up to `max_batch` ready jobs.
    ///
    /// Selects rows with status `pending` or `retry`, `scheduled_at <=
    /// now`, and `expires_at` unset or in the future, ordered by
    /// `priority` ascending then `created_at` ascending, and flips each to
    /// `processing` with `started_at = now` and `attempts += 1` in the
    /// same statement that selected it. Two concurrent callers never both
    /// claim the same row.
    async fn claim_next(&self, max_batch: usize, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Conditional status transition.
    ///
    /// Applies only if the row's current status equals `from`; returns
    /// `false` when it does not (e.g. a reaper sweep racing a worker's own
    /// completion). Never errors on a lost race.
    async fn transition(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        update: TransitionUpdate,
    ) -> Result<bool>;

    /// Mutate a terminal or `retry` row back to `pending`: attempts,
    /// error, and execution timestamps cleared, `scheduled_at = now`.
    /// Returns `false` if the row is absent or not in an eligible status.
    async fn reset(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Delete one row. Fails with `InvalidState` while `processing` and
    /// `JobNotFound` when absent.
    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Bulk-delete rows in the given terminal statuses whose
    /// `completed_at` precedes the cutoff. Non-terminal statuses in
    /// `statuses` are ignored. Returns the number of rows removed.
    async fn bulk_delete_terminal(
        &self,
        statuses: &[JobStatus],
        older_than: DateTime<Utc>,
    ) -> Result<u64>;

    /// Fetch a job by id.
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// List jobs matching the filter, newest first.
    async fn list(&self, filter: &JobFilter, limit: i64, offset: i64) -> Result<Vec<Job>>;

    /// Queue depth by status.
    async fn queue_stats(&self) -> Result<QueueStats>;

    /// Per-job-type completion/failure counts and average duration over
    /// the trailing window.
    async fn throughput(&self, window_secs: u64) -> Result<Vec<JobTypeThroughput>>;

    /// Rows still `processing` whose `started_at` is at or before the
    /// cutoff — candidates abandoned by a crashed worker.
    async fn stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Finalize expired pending/retry rows as `failed` with a recorded
    /// error message. Returns the number of rows swept.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}
