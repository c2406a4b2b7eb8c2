//! PostgreSQL job store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use pulse_core::{
    Error, Job, JobFilter, JobStatus, JobStore, JobTypeThroughput, NewJob, QueueStats, Result,
    TransitionUpdate,
};

/// Columns returned for every job row, in [`parse_job_row`] order.
const JOB_COLUMNS: &str = "id, job_type, payload, dedup_key, priority, status, attempts, \
     max_attempts, error_message, scheduled_at, expires_at, started_at, completed_at, created_at";

/// Error message recorded when an expired job is swept to `failed`.
pub const EXPIRED_ERROR: &str = "Expired before execution";

/// PostgreSQL implementation of [`JobStore`].
///
/// Every coordination primitive is a single SQL statement: claims use
/// `FOR UPDATE SKIP LOCKED`, transitions are conditional updates, and
/// enqueue deduplication rides the partial unique index on
/// `(job_type, dedup_key)` over non-terminal rows.
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
}

impl PgJobStore {
    /// Create a new PgJobStore with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: sqlx::postgres::PgRow) -> Job {
        let status: String = row.get("status");
        Job {
            id: row.get("id"),
            job_type: row.get("job_type"),
            payload: row.get("payload"),
            dedup_key: row.get("dedup_key"),
            priority: row.get("priority"),
            // The CHECK constraint guarantees a known value.
            status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
            error_message: row.get("error_message"),
            scheduled_at: row.get("scheduled_at"),
            expires_at: row.get("expires_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            created_at: row.get("created_at"),
        }
    }

    /// Keep only terminal statuses, as their wire strings.
    fn terminal_strings(statuses: &[JobStatus]) -> Vec<String> {
        statuses
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.as_str().to_string())
            .collect()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: NewJob) -> Result<Uuid> {
        let now = Utc::now();

        if job.dedup_key.is_none() {
            sqlx::query(
                "INSERT INTO job_queue (id, job_type, payload, dedup_key, priority, status, \
                 max_attempts, scheduled_at, expires_at, created_at)
                 VALUES ($1, $2, $3, NULL, $4, 'pending', $5, $6, $7, $8)",
            )
            .bind(job.id)
            .bind(&job.job_type)
            .bind(&job.payload)
            .bind(job.priority)
            .bind(job.max_attempts)
            .bind(job.scheduled_at)
            .bind(job.expires_at)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
            return Ok(job.id);
        }

        // Atomic check+insert: the partial unique index on
        // (job_type, dedup_key) over non-terminal rows arbitrates between
        // concurrent enqueues. On conflict the existing active row's id is
        // returned. Two rounds cover the window where the conflicting row
        // reaches a terminal state between the insert and the lookup.
        for _ in 0..2 {
            let inserted = sqlx::query_scalar::<_, Uuid>(
                "INSERT INTO job_queue (id, job_type, payload, dedup_key, priority, status, \
                 max_attempts, scheduled_at, expires_at, created_at)
                 VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8, $9)
                 ON CONFLICT (job_type, dedup_key)
                     WHERE dedup_key IS NOT NULL
                       AND status IN ('pending', 'processing', 'retry')
                     DO NOTHING
                 RETURNING id",
            )
            .bind(job.id)
            .bind(&job.job_type)
            .bind(&job.payload)
            .bind(&job.dedup_key)
            .bind(job.priority)
            .bind(job.max_attempts)
            .bind(job.scheduled_at)
            .bind(job.expires_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

            if let Some(id) = inserted {
                return Ok(id);
            }

            let existing = self
                .find_active_by_dedup_key(&job.job_type, job.dedup_key.as_deref().unwrap_or(""))
                .await?;
            if let Some(existing) = existing {
                debug!(
                    subsystem = "db",
                    op = "insert",
                    job_type = %job.job_type,
                    dedup_key = job.dedup_key.as_deref(),
                    existing_id = %existing.id,
                    "Deduplicated enqueue onto existing active job"
                );
                return Ok(existing.id);
            }
        }

        Err(Error::Internal(
            "Deduplicated insert lost two consecutive races".to_string(),
        ))
    }

    async fn find_active_by_dedup_key(
        &self,
        job_type: &str,
        dedup_key: &str,
    ) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job_queue
             WHERE job_type = $1 AND dedup_key = $2
               AND status IN ('pending', 'processing', 'retry')
             LIMIT 1"
        ))
        .bind(job_type)
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_job_row))
    }

    async fn claim_next(&self, max_batch: usize, now: DateTime<Utc>) -> Result<Vec<Job>> {
        if max_batch == 0 {
            return Ok(Vec::new());
        }

        // Single-statement claim: SKIP LOCKED keeps concurrent claimers
        // from blocking on, or double-claiming, the same rows.
        let rows = sqlx::query(&format!(
            "UPDATE job_queue
             SET status = 'processing', started_at = $1, attempts = attempts + 1
             WHERE id IN (
                 SELECT id FROM job_queue
                 WHERE status IN ('pending', 'retry')
                   AND scheduled_at <= $1
                   AND (expires_at IS NULL OR expires_at > $1)
                 ORDER BY priority ASC, created_at ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(now)
        .bind(max_batch as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_job_row).collect())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        update: TransitionUpdate,
    ) -> Result<bool> {
        // A row entering `completed` carries no failure, so any error left
        // over from an earlier retry is cleared.
        let result = sqlx::query(
            "UPDATE job_queue
             SET status = $3,
                 error_message = CASE WHEN $3 = 'completed' THEN NULL
                                      ELSE COALESCE($4, error_message) END,
                 scheduled_at = COALESCE($5, scheduled_at),
                 completed_at = COALESCE($6, completed_at)
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(&update.error_message)
        .bind(update.scheduled_at)
        .bind(update.completed_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn reset(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE job_queue
             SET status = 'pending', attempts = 0, error_message = NULL,
                 scheduled_at = $2, started_at = NULL, completed_at = NULL
             WHERE id = $1 AND status IN ('completed', 'failed', 'retry')",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM job_queue WHERE id = $1 AND status <> 'processing'")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM job_queue WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;

        match status.as_deref().and_then(JobStatus::parse) {
            Some(status) => Err(Error::InvalidState {
                job_id: id,
                status,
                operation: "delete",
            }),
            None => Err(Error::JobNotFound(id)),
        }
    }

    async fn bulk_delete_terminal(
        &self,
        statuses: &[JobStatus],
        older_than: DateTime<Utc>,
    ) -> Result<u64> {
        let statuses = Self::terminal_strings(statuses);
        if statuses.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            "DELETE FROM job_queue
             WHERE status = ANY($1)
               AND completed_at IS NOT NULL
               AND completed_at < $2",
        )
        .bind(&statuses)
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job_queue WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_job_row))
    }

    async fn list(&self, filter: &JobFilter, limit: i64, offset: i64) -> Result<Vec<Job>> {
        let mut conditions = Vec::new();
        let mut param_idx = 1;

        if filter.status.is_some() {
            conditions.push(format!("status = ${param_idx}"));
            param_idx += 1;
        }
        if filter.job_type.is_some() {
            conditions.push(format!("job_type = ${param_idx}"));
            param_idx += 1;
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            "SELECT {JOB_COLUMNS} FROM job_queue
             {where_clause}
             ORDER BY created_at DESC
             LIMIT ${param_idx} OFFSET ${}",
            param_idx + 1
        );

        let mut q = sqlx::query(&query);
        if let Some(status) = filter.status {
            q = q.bind(status.as_str());
        }
        if let Some(ref job_type) = filter.job_type {
            q = q.bind(job_type);
        }
        q = q.bind(limit).bind(offset);

        let rows = q.fetch_all(&self.pool).await.map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_job_row).collect())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'retry') AS retry,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) AS total
             FROM job_queue",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.get::<i64, _>("pending"),
            processing: row.get::<i64, _>("processing"),
            retry: row.get::<i64, _>("retry"),
            completed: row.get::<i64, _>("completed"),
            failed: row.get::<i64, _>("failed"),
            total: row.get::<i64, _>("total"),
        })
    }

    async fn throughput(&self, window_secs: u64) -> Result<Vec<JobTypeThroughput>> {
        let since = Utc::now() - Duration::seconds(window_secs as i64);

        let rows = sqlx::query(
            "SELECT job_type,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                (AVG(EXTRACT(EPOCH FROM (completed_at - started_at)) * 1000.0)
                    FILTER (WHERE status = 'completed' AND started_at IS NOT NULL)
                )::float8 AS avg_duration_ms
             FROM job_queue
             WHERE completed_at IS NOT NULL AND completed_at > $1
             GROUP BY job_type",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| JobTypeThroughput {
                job_type: row.get("job_type"),
                completed: row.get("completed"),
                failed: row.get("failed"),
                avg_duration_ms: row.get("avg_duration_ms"),
            })
            .collect())
    }

    async fn stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job_queue
             WHERE status = 'processing'
               AND started_at IS NOT NULL
               AND started_at <= $1
             ORDER BY started_at ASC"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_job_row).collect())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE job_queue
             SET status = 'failed', completed_at = $1, error_message = $2
             WHERE status IN ('pending', 'retry')
               AND expires_at IS NOT NULL
               AND expires_at <= $1",
        )
        .bind(now)
        .bind(EXPIRED_ERROR)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_strings_filters_non_terminal() {
        let strings = PgJobStore::terminal_strings(&[
            JobStatus::Completed,
            JobStatus::Pending,
            JobStatus::Failed,
            JobStatus::Processing,
            JobStatus::Retry,
        ]);
        assert_eq!(strings, vec!["completed".to_string(), "failed".to_string()]);
    }

    #[test]
    fn test_terminal_strings_empty_for_non_terminal_input() {
        let strings =
            PgJobStore::terminal_strings(&[JobStatus::Pending, JobStatus::Processing]);
        assert!(strings.is_empty());
    }

    #[test]
    fn test_job_columns_covers_model() {
        // One column per Job field, same order as parse_job_row reads them.
        assert_eq!(JOB_COLUMNS.split(',').count(), 14);
    }
}
