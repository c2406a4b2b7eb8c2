//! Error types for the Pulse job engine.

use thiserror::Error;
use uuid::Uuid;

use crate::models::JobStatus;

/// Result type alias using the engine's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for job engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error).
    ///
    /// Propagates to the caller without partial state mutation; the worker
    /// pool treats this as transient during polling and backs off.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// An admin operation was requested on a job whose current status does
    /// not permit it. The job is left untouched.
    #[error("Invalid state: cannot {operation} job {job_id} in status {status}")]
    InvalidState {
        job_id: Uuid,
        status: JobStatus,
        operation: &'static str,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_job_not_found() {
        let id = Uuid::nil();
        let err = Error::JobNotFound(id);
        assert_eq!(err.to_string(), format!("Job not found: {}", id));
    }

    #[test]
    fn test_error_display_invalid_state() {
        let id = Uuid::nil();
        let err = Error::InvalidState {
            job_id: id,
            status: JobStatus::Processing,
            operation: "cancel",
        };
        assert_eq!(
            err.to_string(),
            format!("Invalid state: cannot cancel job {} in status processing", id)
        );
    }

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("JOB_WORKER_CONCURRENCY must be >= 1".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: JOB_WORKER_CONCURRENCY must be >= 1"
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        match err {
            Error::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
