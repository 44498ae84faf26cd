//! Database connection pool, migrations, and health check.
//!
//! The `queue_tasks` table is the only shared mutable state in the system.
//! Every worker, the watchdog, and every producer coordinate through it.

pub mod tasks;

use crate::config::QueueConfig;
use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool shared across all modules.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres with a pool sized for the default worker count.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, QueueConfig::default().min_connections()).await
    }

    /// Connect to Postgres with an explicit pool size. Size it above the
    /// worker count so the watchdog and producers are never starved.
    pub async fn connect_with(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
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

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
