//! The shared database handle threaded through every loader component.

use crate::error::LoaderError;
use crate::loader::transaction::TransactionCoordinator;
use sqlx::migrate::Migrator;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Pool plus the one transaction coordinator allowed per handle.
///
/// Cloning shares both, so every clone sees the same "active transaction" flag.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    coordinator: TransactionCoordinator,
}

impl Database {
    /// Connect to `url`, creating the database file when it does not exist.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, LoaderError> {
        if !url.starts_with("sqlite:") {
            return Err(LoaderError::Config(format!(
                "unsupported database url '{url}', expected sqlite:"
            )));
        }

        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| LoaderError::Config(format!("invalid database url '{url}': {e}")))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(LoaderError::Connection)?;

        log::debug!("connected to {}", url);
        Ok(Self::from_pool(pool))
    }

    /// A private in-memory database on a single long-lived connection.
    pub async fn in_memory() -> Result<Self, LoaderError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(LoaderError::Connection)?
            .foreign_keys(true);

        // Every connection to :memory: is a separate database, so keep exactly one
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(LoaderError::Connection)?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        let coordinator = TransactionCoordinator::new(pool.clone());
        Self { pool, coordinator }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>, LoaderError> {
        self.pool.acquire().await.map_err(LoaderError::from)
    }

    /// Cheap round trip used as a connectivity probe.
    pub async fn ping(&self) -> Result<(), LoaderError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Create or upgrade the tables the loader writes.
///
/// Idempotent: migrations that were already applied are skipped.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), LoaderError> {
    log::info!("checking database migration state");
    MIGRATOR.run(pool).await?;
    log::info!("database migrations up to date");
    Ok(())
}
