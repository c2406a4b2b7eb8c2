//! # pulse-db
//!
//! PostgreSQL persistence layer for the Pulse job engine.
//!
//! This crate provides:
//! - Connection pool management
//! - [`PgJobStore`], the Postgres implementation of `pulse_core::JobStore`
//! - Schema migrations for the `job_queue` table
//!
//! ## Example
//!
//! ```rust,ignore
//! use pulse_db::Database;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/pulse").await?;
//!     db.migrate().await?;
//!
//!     let stats = db.jobs.queue_stats().await?;
//!     println!("pending: {}", stats.pending);
//!     Ok(())
//! }
//! ```

pub mod jobs;
pub mod pool;

// Re-export core types
pub use pulse_core::*;

pub use jobs::PgJobStore;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};

/// Combined database context.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Job store for queue coordination.
    pub jobs: PgJobStore,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: PgJobStore::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Run pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("Migration failed: {e}")))?;
        Ok(())
    }
}
