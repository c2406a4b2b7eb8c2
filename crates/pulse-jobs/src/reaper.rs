//! Stale-job reaper.
//!
//! A worker crash leaves its claimed jobs stuck in `processing` with no one
//! to finalize them. The reaper periodically finds rows whose `started_at`
//! is older than the execution timeout and routes each through the same
//! failure path a worker would use, so crashed jobs retry with backoff or
//! fail out exactly like handler errors. It also sweeps expired
//! `pending`/`retry` rows to `failed`.
//!
//! Every recovery write is a conditional transition from `processing`, so a
//! worker that is merely slow and finishes after the sweep started cannot
//! have its result overwritten.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use pulse_core::{defaults, JobStore, Result};

use crate::retry::{record_failure, FailureDisposition, RetryPolicy};

/// Configuration for the reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Sleep between sweeps.
    pub interval: Duration,
    /// A `processing` row older than this is presumed orphaned. Should
    /// match or exceed the worker execution timeout.
    pub stale_after: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(defaults::JOB_REAPER_INTERVAL_SECS),
            stale_after: Duration::from_secs(defaults::JOB_EXECUTION_TIMEOUT_SECS),
        }
    }
}

impl ReaperConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_REAPER_INTERVAL_SECS` | `60` | Sleep between sweeps |
    /// | `JOB_EXECUTION_TIMEOUT_SECS` | `300` | Staleness threshold for `processing` rows |
    pub fn from_env() -> Self {
        let interval_secs = std::env::var("JOB_REAPER_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_REAPER_INTERVAL_SECS);

        let stale_after_secs = std::env::var("JOB_EXECUTION_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_EXECUTION_TIMEOUT_SECS);

        Self {
            interval: Duration::from_secs(interval_secs),
            stale_after: Duration::from_secs(stale_after_secs),
        }
    }

    /// Set the sweep interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the staleness threshold.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

/// Shutdown handle for a running reaper loop.
pub struct ReaperHandle {
    shutdown_tx: oneshot::Sender<()>,
    done_rx: oneshot::Receiver<()>,
}

impl ReaperHandle {
    /// Signal the loop to stop and wait for the in-progress sweep to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.done_rx.await;
        info!(subsystem = "reaper", op = "stop", "Reaper stopped");
    }
}

/// Periodic recovery sweep over the job store.
pub struct StaleJobReaper {
    store: Arc<dyn JobStore>,
    config: ReaperConfig,
    retry: RetryPolicy,
}

impl StaleJobReaper {
    /// Create a reaper over the given store.
    pub fn new(store: Arc<dyn JobStore>, config: ReaperConfig) -> Self {
        Self {
            store,
            config,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Spawn the sweep loop and return its shutdown handle.
    pub fn start(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        info!(
            subsystem = "reaper",
            op = "start",
            interval_secs = self.config.interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            "Reaper started"
        );

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = sleep(self.config.interval) => {}
                }
                if let Err(e) = self.sweep().await {
                    error!(subsystem = "reaper", op = "sweep", error = %e, "Reaper sweep failed");
                }
            }
            let _ = done_tx.send(());
        });

        ReaperHandle {
            shutdown_tx,
            done_rx,
        }
    }

    /// One recovery pass: reclaim orphaned `processing` rows, then sweep
    /// expired ready rows. Public so tests and one-shot maintenance jobs
    /// can run it directly.
    pub async fn sweep(&self) -> Result<()> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(self.config.stale_after)
                .unwrap_or_else(|_| chrono::Duration::days(365));

        let stale = self.store.stale_processing(cutoff).await?;
        if !stale.is_empty() {
            warn!(
                subsystem = "reaper",
                op = "sweep",
                job_count = stale.len(),
                stale_after_secs = self.config.stale_after.as_secs(),
                "Recovering stale processing jobs"
            );
        }

        for job in &stale {
            let error = format!(
                "Execution exceeded {}s; presumed orphaned by a crashed worker",
                self.config.stale_after.as_secs()
            );
            match record_failure(self.store.as_ref(), job, &error, false, &self.retry).await {
                Ok(FailureDisposition::Lost) => {
                    // The worker finished between our read and the write.
                    debug!(
                        subsystem = "reaper",
                        job_id = %job.id,
                        "Stale job resolved itself before recovery"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(
                        subsystem = "reaper",
                        job_id = %job.id,
                        error = %e,
                        "Failed to recover stale job"
                    );
                }
            }
        }

        let expired = self.store.sweep_expired(now).await?;
        if expired > 0 {
            info!(
                subsystem = "reaper",
                op = "sweep",
                job_count = expired,
                "Expired jobs swept to failed"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reaper_config_default() {
        let config = ReaperConfig::default();
        assert_eq!(
            config.interval,
            Duration::from_secs(defaults::JOB_REAPER_INTERVAL_SECS)
        );
        assert_eq!(
            config.stale_after,
            Duration::from_secs(defaults::JOB_EXECUTION_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_reaper_config_builder() {
        let config = ReaperConfig::default()
            .with_interval(Duration::from_secs(5))
            .with_stale_after(Duration::from_secs(10));
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.stale_after, Duration::from_secs(10));
    }
}
