//! Background job queue and worker engine.
//!
//! All coordination lives in the backing store (Postgres in production):
//! enqueueing is an insert, claiming is an atomic batch update, and every
//! status change is a conditional transition. Workers hold no state a crash
//! could lose — anything orphaned mid-flight is recovered by the reaper.
//!
//! The moving parts:
//! - [`JobQueue`] — client-facing enqueue/inspect/admin API
//! - [`WorkerPool`] — bounded-concurrency claim-and-execute loop
//! - [`StaleJobReaper`] — periodic recovery of orphaned and expired jobs
//! - [`JobHandler`] — the per-job-type execution contract
//!
//! ```no_run
//! use std::sync::Arc;
//! use pulse_db::Database;
//! use pulse_jobs::{
//!     EnqueueOptions, JobQueue, QueueConfig, ReaperConfig, StaleJobReaper, WorkerConfig,
//!     WorkerPool,
//! };
//!
//! # async fn run() -> pulse_core::Result<()> {
//! let db = Database::connect("postgres://localhost/pulse").await?;
//! let store = Arc::new(db.jobs.clone());
//!
//! let queue = JobQueue::new(store.clone(), QueueConfig::from_env());
//! let pool = WorkerPool::new(store.clone(), WorkerConfig::from_env());
//! pool.start().await;
//! let reaper = StaleJobReaper::new(store, ReaperConfig::from_env()).start();
//!
//! let job_id = queue
//!     .enqueue(
//!         "feed_fetch",
//!         serde_json::json!({"sourceId": "abc"}),
//!         EnqueueOptions {
//!             dedup_key: Some("feed_fetch:abc".to_string()),
//!             ..Default::default()
//!         },
//!     )
//!     .await?;
//! let _ = job_id;
//!
//! pool.stop().await;
//! reaper.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod handler;
pub mod queue;
pub mod reaper;
pub mod retry;
pub mod worker;

pub use handler::{JobContext, JobHandler, JobOutcome, NoOpHandler};
pub use queue::{EnqueueOptions, JobQueue, QueueConfig, CANCELLED_ERROR};
pub use reaper::{ReaperConfig, ReaperHandle, StaleJobReaper};
pub use retry::{record_failure, FailureDisposition, RetryPolicy};
pub use worker::{WorkerConfig, WorkerEvent, WorkerPool};

// Core model and trait types, re-exported so engine consumers need only
// this crate.
pub use pulse_core::{
    job_types, Error, Job, JobFilter, JobStatus, JobStore, JobTypeThroughput, NewJob, QueueSnapshot,
    QueueStats, Result, TransitionUpdate, WorkerStatus,
};
