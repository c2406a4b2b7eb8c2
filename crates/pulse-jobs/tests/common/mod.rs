//! In-memory `JobStore` double for engine tests.
//!
//! Mirrors the Postgres store's contract: atomic claim-and-flip, conditional
//! transitions, dedup on insert. Every method takes the single mutex for its
//! whole body, so each call is atomic exactly like its SQL counterpart.

// Each test binary compiles this module; not all of them use every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use pulse_jobs::{
    Error, Job, JobFilter, JobStatus, JobStore, JobTypeThroughput, NewJob, QueueStats, Result,
    TransitionUpdate,
};

const EXPIRED_ERROR: &str = "Expired before execution";

const ACTIVE: [JobStatus; 3] = [JobStatus::Pending, JobStatus::Processing, JobStatus::Retry];

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot a job without going through the trait.
    pub fn snapshot(&self, id: Uuid) -> Option<Job> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    /// Backdate `started_at` to simulate a job orphaned by a crashed worker.
    pub fn set_started_at(&self, id: Uuid, started_at: DateTime<Utc>) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&id) {
            job.started_at = Some(started_at);
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    /// Count jobs currently in the given status.
    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.status == status)
            .count()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, new: NewJob) -> Result<Uuid> {
        let mut jobs = self.jobs.lock().unwrap();

        if let Some(key) = &new.dedup_key {
            let existing = jobs.values().find(|j| {
                j.job_type == new.job_type
                    && j.dedup_key.as_deref() == Some(key.as_str())
                    && ACTIVE.contains(&j.status)
            });
            if let Some(existing) = existing {
                return Ok(existing.id);
            }
        }

        let job = Job {
            id: new.id,
            job_type: new.job_type,
            payload: new.payload,
            dedup_key: new.dedup_key,
            priority: new.priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts,
            error_message: None,
            scheduled_at: new.scheduled_at,
            expires_at: new.expires_at,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        };
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn find_active_by_dedup_key(
        &self,
        job_type: &str,
        dedup_key: &str,
    ) -> Result<Option<Job>> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .values()
            .find(|j| {
                j.job_type == job_type
                    && j.dedup_key.as_deref() == Some(dedup_key)
                    && ACTIVE.contains(&j.status)
            })
            .cloned())
    }

    async fn claim_next(&self, max_batch: usize, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut jobs = self.jobs.lock().unwrap();

        let mut ready: Vec<Uuid> = jobs
            .values()
            .filter(|j| {
                matches!(j.status, JobStatus::Pending | JobStatus::Retry)
                    && j.scheduled_at <= now
                    && j.expires_at.map_or(true, |e| e > now)
            })
            .map(|j| j.id)
            .collect();
        ready.sort_by_key(|id| {
            let j = &jobs[id];
            (j.priority, j.created_at)
        });
        ready.truncate(max_batch);

        let mut claimed = Vec::with_capacity(ready.len());
        for id in ready {
            let job = jobs.get_mut(&id).unwrap();
            job.status = JobStatus::Processing;
            job.started_at = Some(now);
            job.attempts += 1;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        update: TransitionUpdate,
    ) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job) if job.status == from => {
                job.status = to;
                if to == JobStatus::Completed {
                    job.error_message = None;
                } else if update.error_message.is_some() {
                    job.error_message = update.error_message;
                }
                if let Some(at) = update.scheduled_at {
                    job.scheduled_at = at;
                }
                if update.completed_at.is_some() {
                    job.completed_at = update.completed_at;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job)
                if matches!(
                    job.status,
                    JobStatus::Completed | JobStatus::Failed | JobStatus::Retry
                ) =>
            {
                job.status = JobStatus::Pending;
                job.attempts = 0;
                job.error_message = None;
                job.started_at = None;
                job.completed_at = None;
                job.scheduled_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get(&id) {
            None => Err(Error::JobNotFound(id)),
            Some(job) if job.status == JobStatus::Processing => Err(Error::InvalidState {
                job_id: id,
                status: job.status,
                operation: "delete",
            }),
            Some(_) => {
                jobs.remove(&id);
                Ok(())
            }
        }
    }

    async fn bulk_delete_terminal(
        &self,
        statuses: &[JobStatus],
        older_than: DateTime<Utc>,
    ) -> Result<u64> {
        let terminal: Vec<JobStatus> = statuses
            .iter()
            .copied()
            .filter(|s| s.is_terminal())
            .collect();
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, j| {
            !(terminal.contains(&j.status) && j.completed_at.map_or(false, |at| at < older_than))
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter, limit: i64, offset: i64) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().unwrap();
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .filter(|j| {
                filter
                    .job_type
                    .as_deref()
                    .map_or(true, |t| j.job_type == t)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let jobs = self.jobs.lock().unwrap();
        let mut stats = QueueStats::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Retry => stats.retry += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
            stats.total += 1;
        }
        Ok(stats)
    }

    async fn throughput(&self, window_secs: u64) -> Result<Vec<JobTypeThroughput>> {
        let since = Utc::now() - chrono::Duration::seconds(window_secs as i64);
        let jobs = self.jobs.lock().unwrap();
        let mut by_type: HashMap<String, (i64, i64, Vec<f64>)> = HashMap::new();
        for job in jobs.values() {
            if !job.status.is_terminal() || job.completed_at.map_or(true, |at| at <= since) {
                continue;
            }
            let entry = by_type.entry(job.job_type.clone()).or_default();
            match job.status {
                JobStatus::Completed => entry.0 += 1,
                JobStatus::Failed => entry.1 += 1,
                _ => unreachable!(),
            }
            if let (Some(started), Some(completed)) = (job.started_at, job.completed_at) {
                entry.2.push((completed - started).num_milliseconds() as f64);
            }
        }
        Ok(by_type
            .into_iter()
            .map(|(job_type, (completed, failed, durations))| JobTypeThroughput {
                job_type,
                completed,
                failed,
                avg_duration_ms: if durations.is_empty() {
                    None
                } else {
                    Some(durations.iter().sum::<f64>() / durations.len() as f64)
                },
            })
            .collect())
    }

    async fn stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Processing
                    && j.started_at.map_or(false, |at| at <= cutoff)
            })
            .cloned()
            .collect())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut swept = 0;
        for job in jobs.values_mut() {
            if matches!(job.status, JobStatus::Pending | JobStatus::Retry)
                && job.expires_at.map_or(false, |at| at <= now)
            {
                job.status = JobStatus::Failed;
                job.error_message = Some(EXPIRED_ERROR.to_string());
                job.completed_at = Some(now);
                swept += 1;
            }
        }
        Ok(swept)
    }
}
