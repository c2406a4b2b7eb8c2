//! Bounded-concurrency worker pool.
//!
//! The pool repeatedly claims ready jobs (up to its free capacity) through
//! the store's atomic `claim_next` and dispatches each to the handler
//! registered for its job type. Any number of pools across any number of
//! processes may poll the same store; the store's row locking is the only
//! coordination between them.
//!
//! ## Timeout semantics
//!
//! A handler exceeding the execution timeout is treated as a transient
//! failure. The handler future is dropped, which stops in-process work at
//! its next await point — but work the handler delegated elsewhere
//! (subprocesses, remote API calls) keeps running unobserved. Cancellation
//! does not propagate past the process boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pulse_core::{defaults, Job, JobStatus, JobStore, TransitionUpdate, WorkerStatus};

use crate::handler::{JobContext, JobHandler, JobOutcome};
use crate::retry::{record_failure, FailureDisposition, RetryPolicy};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum number of concurrently executing jobs.
    pub concurrency: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Per-job execution timeout (see module docs for semantics).
    pub execution_timeout: Duration,
    /// How long `stop()` waits for in-flight jobs before giving up on them.
    pub stop_grace: Duration,
    /// Back-off applied to the poll loop after a store error.
    pub store_error_backoff: Duration,
    /// Whether job processing is enabled at all.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: defaults::JOB_WORKER_CONCURRENCY,
            poll_interval: Duration::from_millis(defaults::JOB_POLL_INTERVAL_MS),
            execution_timeout: Duration::from_secs(defaults::JOB_EXECUTION_TIMEOUT_SECS),
            stop_grace: Duration::from_secs(defaults::JOB_STOP_GRACE_SECS),
            store_error_backoff: Duration::from_millis(defaults::STORE_ERROR_BACKOFF_MS),
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_WORKER_CONCURRENCY` | `4` | Max concurrent jobs |
    /// | `JOB_POLL_INTERVAL_MS` | `500` | Polling interval when the queue is empty |
    /// | `JOB_EXECUTION_TIMEOUT_SECS` | `300` | Per-job execution timeout |
    /// | `JOB_STOP_GRACE_SECS` | `30` | Drain grace period on stop |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let concurrency = std::env::var("JOB_WORKER_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::JOB_WORKER_CONCURRENCY)
            .max(1);

        let poll_interval_ms = std::env::var("JOB_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_POLL_INTERVAL_MS);

        let execution_timeout_secs = std::env::var("JOB_EXECUTION_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_EXECUTION_TIMEOUT_SECS);

        let stop_grace_secs = std::env::var("JOB_STOP_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_STOP_GRACE_SECS);

        Self {
            concurrency,
            poll_interval: Duration::from_millis(poll_interval_ms),
            execution_timeout: Duration::from_secs(execution_timeout_secs),
            stop_grace: Duration::from_secs(stop_grace_secs),
            store_error_backoff: Duration::from_millis(defaults::STORE_ERROR_BACKOFF_MS),
            enabled,
        }
    }

    /// Set the concurrency limit.
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Set the empty-queue poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the per-job execution timeout.
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the worker pool.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A claimed job was dispatched to its handler.
    JobStarted { job_id: Uuid, job_type: String },
    /// A job completed successfully.
    JobCompleted {
        job_id: Uuid,
        job_type: String,
        duration_ms: u64,
    },
    /// A job failed transiently and was scheduled for retry.
    JobRetried {
        job_id: Uuid,
        job_type: String,
        error: String,
    },
    /// A job was finalized as failed.
    JobFailed {
        job_id: Uuid,
        job_type: String,
        error: String,
    },
    /// The pool started claiming.
    WorkerStarted,
    /// The pool stopped (after drain).
    WorkerStopped,
}

/// Shared mutable pool state, visible to the admin surface.
#[derive(Debug, Default)]
struct PoolState {
    running: AtomicBool,
    paused: AtomicBool,
    in_flight: AtomicUsize,
}

/// Decrements the in-flight gauge when a job task finishes, even if the
/// handler panicked.
struct InFlightGuard(Arc<PoolState>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Control handles for the running loop.
struct RunControl {
    shutdown_tx: mpsc::Sender<()>,
    done_rx: oneshot::Receiver<()>,
}

/// Bounded-concurrency execution loop over a shared [`JobStore`].
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    config: WorkerConfig,
    retry: RetryPolicy,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
    event_tx: broadcast::Sender<WorkerEvent>,
    state: Arc<PoolState>,
    control: Mutex<Option<RunControl>>,
}

impl WorkerPool {
    /// Create a new worker pool over the given store.
    pub fn new(store: Arc<dyn JobStore>, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            store,
            config,
            retry: RetryPolicy::default(),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            state: Arc::new(PoolState::default()),
            control: Mutex::new(None),
        }
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Register a handler for its job type. A later registration for the
    /// same type replaces the earlier one.
    pub async fn register_handler<H: JobHandler + 'static>(&self, handler: H) {
        let job_type = handler.job_type().to_string();
        let mut handlers = self.handlers.write().await;
        handlers.insert(job_type.clone(), Arc::new(handler));
        debug!(subsystem = "worker", op = "register", job_type, "Registered job handler");
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Stop claiming new jobs without stopping the pool. In-flight jobs
    /// keep running.
    pub fn pause(&self) {
        self.state.paused.store(true, Ordering::SeqCst);
        info!(subsystem = "worker", op = "pause", "Job claiming PAUSED");
    }

    /// Resume claiming.
    pub fn resume(&self) {
        self.state.paused.store(false, Ordering::SeqCst);
        info!(subsystem = "worker", op = "resume", "Job claiming RESUMED");
    }

    /// Whether claiming is currently paused.
    pub fn is_paused(&self) -> bool {
        self.state.paused.load(Ordering::Relaxed)
    }

    /// Current pool status for the admin surface.
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            running: self.state.running.load(Ordering::Relaxed),
            paused: self.state.paused.load(Ordering::Relaxed),
            concurrency: self.config.concurrency,
            in_flight: self.state.in_flight.load(Ordering::Relaxed),
        }
    }

    /// Start the claim loop. Idempotent: a second call while running is a
    /// no-op.
    pub async fn start(&self) {
        if !self.config.enabled {
            info!(subsystem = "worker", "Job worker is disabled, not starting");
            return;
        }

        let mut control = self.control.lock().await;
        if self.state.running.swap(true, Ordering::SeqCst) {
            warn!(subsystem = "worker", op = "start", "Worker pool already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = oneshot::channel();

        let ctx = RunCtx {
            store: self.store.clone(),
            config: self.config.clone(),
            retry: self.retry.clone(),
            handlers: self.handlers.clone(),
            event_tx: self.event_tx.clone(),
            state: self.state.clone(),
        };

        tokio::spawn(async move {
            ctx.run(shutdown_rx).await;
            let _ = done_tx.send(());
        });

        *control = Some(RunControl {
            shutdown_tx,
            done_rx,
        });

        info!(
            subsystem = "worker",
            op = "start",
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            execution_timeout_secs = self.config.execution_timeout.as_secs(),
            "Worker pool started"
        );
    }

    /// Stop the pool gracefully: stop claiming, then wait for in-flight
    /// jobs up to the configured grace period.
    pub async fn stop(&self) {
        let control = self.control.lock().await.take();
        let Some(control) = control else {
            debug!(subsystem = "worker", op = "stop", "Worker pool not running");
            return;
        };

        let _ = control.shutdown_tx.send(()).await;
        let _ = control.done_rx.await;
        info!(subsystem = "worker", op = "stop", "Worker pool stopped");
    }

    /// Stop and start again with the same configuration and handlers.
    pub async fn restart(&self) {
        self.stop().await;
        self.start().await;
    }
}

/// Reference bundle moved into the spawned claim loop.
struct RunCtx {
    store: Arc<dyn JobStore>,
    config: WorkerConfig,
    retry: RetryPolicy,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
    event_tx: broadcast::Sender<WorkerEvent>,
    state: Arc<PoolState>,
}

impl RunCtx {
    /// Claim loop: keeps up to `concurrency` jobs in flight, refilling
    /// capacity as tasks finish instead of waiting for whole batches.
    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            // Harvest finished tasks without blocking.
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    error!(subsystem = "worker", error = ?e, "Job task panicked");
                }
            }

            // A dropped sender means the pool itself is gone; stop too.
            match shutdown_rx.try_recv() {
                Ok(()) | Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }

            let capacity = self.config.concurrency.saturating_sub(tasks.len());

            if capacity == 0 {
                // At capacity: wait for a slot or a shutdown signal.
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = tasks.join_next() => {
                        if let Some(Err(e)) = result {
                            error!(subsystem = "worker", error = ?e, "Job task panicked");
                        }
                    }
                }
                continue;
            }

            if self.state.paused.load(Ordering::Relaxed) {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            match self.store.claim_next(capacity, Utc::now()).await {
                Ok(jobs) if !jobs.is_empty() => {
                    debug!(
                        subsystem = "worker",
                        op = "claim",
                        job_count = jobs.len(),
                        "Claimed job batch"
                    );
                    for job in jobs {
                        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
                        let exec = ExecCtx {
                            store: self.store.clone(),
                            retry: self.retry.clone(),
                            handlers: self.handlers.clone(),
                            event_tx: self.event_tx.clone(),
                            execution_timeout: self.config.execution_timeout,
                        };
                        let guard = InFlightGuard(self.state.clone());
                        tasks.spawn(async move {
                            let _guard = guard;
                            exec.execute_job(job).await;
                        });
                    }
                    // No sleep: immediately try to refill remaining capacity.
                }
                Ok(_) => {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    // Transient by contract: back off and poll again.
                    error!(
                        subsystem = "worker",
                        op = "claim",
                        error = %e,
                        "Failed to claim jobs; backing off"
                    );
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = sleep(self.config.store_error_backoff) => {}
                    }
                }
            }
        }

        // Graceful drain: no new claims, wait for in-flight jobs up to the
        // grace period. Jobs still running past it stay `processing` and
        // are recovered by the reaper.
        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(
                subsystem = "worker",
                op = "drain",
                job_count = in_flight,
                grace_secs = self.config.stop_grace.as_secs(),
                "Draining in-flight jobs"
            );
            let drained = timeout(self.config.stop_grace, async {
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        error!(subsystem = "worker", error = ?e, "Job task panicked");
                    }
                }
            })
            .await;

            if drained.is_err() {
                warn!(
                    subsystem = "worker",
                    op = "drain",
                    job_count = tasks.len(),
                    "Grace period elapsed; abandoning in-flight jobs to the reaper"
                );
                tasks.abort_all();
            }
        }

        self.state.running.store(false, Ordering::SeqCst);
        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
    }
}

/// Reference bundle for executing a single claimed job in a spawned task.
struct ExecCtx {
    store: Arc<dyn JobStore>,
    retry: RetryPolicy,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
    event_tx: broadcast::Sender<WorkerEvent>,
    execution_timeout: Duration,
}

impl ExecCtx {
    async fn execute_job(self, job: Job) {
        let start = Instant::now();
        let job_id = job.id;
        let job_type = job.job_type.clone();

        info!(
            subsystem = "worker",
            op = "execute",
            job_id = %job_id,
            job_type = %job_type,
            attempt = job.attempts,
            "Processing job"
        );
        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            job_id,
            job_type: job_type.clone(),
        });

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&job_type).cloned()
        };

        let outcome = match handler {
            Some(handler) => {
                let ctx = JobContext::new(job.clone());
                match timeout(self.execution_timeout, handler.execute(ctx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => JobOutcome::Retry(format!(
                        "Execution timed out after {}s",
                        self.execution_timeout.as_secs()
                    )),
                }
            }
            None => JobOutcome::Fatal(format!("No handler registered for job type: {job_type}")),
        };

        // A store error on any finalization path leaves the row in
        // `processing` for the reaper; the failure is logged, never
        // swallowed.
        match outcome {
            JobOutcome::Success => {
                let transition = self
                    .store
                    .transition(
                        job_id,
                        JobStatus::Processing,
                        JobStatus::Completed,
                        TransitionUpdate {
                            error_message: None,
                            scheduled_at: None,
                            completed_at: Some(Utc::now()),
                        },
                    )
                    .await;
                match transition {
                    Ok(true) => {
                        let duration_ms = start.elapsed().as_millis() as u64;
                        info!(
                            subsystem = "worker",
                            op = "execute",
                            job_id = %job_id,
                            job_type = %job_type,
                            duration_ms,
                            success = true,
                            "Job completed"
                        );
                        let _ = self.event_tx.send(WorkerEvent::JobCompleted {
                            job_id,
                            job_type,
                            duration_ms,
                        });
                    }
                    Ok(false) => {
                        // Reaper got there first; the retry/failure it
                        // recorded stands.
                        warn!(
                            subsystem = "worker",
                            job_id = %job_id,
                            "Completion lost the race; job already left processing"
                        );
                    }
                    Err(e) => {
                        error!(
                            subsystem = "worker",
                            job_id = %job_id,
                            error = %e,
                            "Failed to mark job as completed"
                        );
                    }
                }
            }
            JobOutcome::Retry(err) => self.finalize_failure(&job, &err, false).await,
            JobOutcome::Fatal(err) => self.finalize_failure(&job, &err, true).await,
        }
    }

    async fn finalize_failure(&self, job: &Job, err: &str, permanent: bool) {
        match record_failure(self.store.as_ref(), job, err, permanent, &self.retry).await {
            Ok(FailureDisposition::Retried) => {
                let _ = self.event_tx.send(WorkerEvent::JobRetried {
                    job_id: job.id,
                    job_type: job.job_type.clone(),
                    error: err.to_string(),
                });
            }
            Ok(FailureDisposition::Failed) => {
                let _ = self.event_tx.send(WorkerEvent::JobFailed {
                    job_id: job.id,
                    job_type: job.job_type.clone(),
                    error: err.to_string(),
                });
            }
            Ok(FailureDisposition::Lost) => {}
            Err(e) => {
                error!(
                    subsystem = "worker",
                    job_id = %job.id,
                    error = %e,
                    "Failed to record job failure"
                );
            }
        }
    }
}
