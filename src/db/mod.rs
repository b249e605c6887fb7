//! Database connection pool, migrations, and health check.
//!
//! The same pool backs the task queue, the primary store reader, and any
//! producer transaction that enqueues tasks.

pub mod primary;
pub mod queue;
pub mod reindex;

pub use primary::{PgPrimaryStore, UpdatedColumn};
pub use queue::{PgClaim, PgTaskQueue, QueueStats};

use crate::error::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

/// Database handle. Owns the connection pool shared across all modules.
#[derive(Clone)]
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
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Begin a producer transaction. Tasks enqueued on it become visible to
    /// claimers only when it commits.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Claim-side handle on the `task_queue` table.
    pub fn task_queue(&self) -> PgTaskQueue {
        PgTaskQueue::new(self.pool.clone())
    }

    /// Primary store reader over `table`.
    pub fn primary_store(&self, table: &str) -> Result<PgPrimaryStore> {
        PgPrimaryStore::new(self.pool.clone(), table)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
