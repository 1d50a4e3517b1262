//! Database connection pool, migrations, and health check.
//!
//! The pool backs both the jobs backlog and the control queues; all of
//! them are pgmq queues in the same database.

pub mod pgmq;

use crate::error::Result;
use crate::store::validate_queue_name;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Run a `SELECT 1` against the pool.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        validate_queue_name(queue_name)?;
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue_name.to_string()),
                KeyValue::new("operation", "create"),
            ],
        );
        Ok(())
    }

    /// Create every queue named in the settings.
    pub async fn ensure_queues(&self, settings: &crate::config::QueueSettings) -> Result<()> {
        for queue in [
            &settings.jobs_queue,
            &settings.worker_queue,
            &settings.populator_queue,
        ] {
            self.create_queue(queue).await?;
        }
        Ok(())
    }
}
