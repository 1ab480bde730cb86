//! Persistence contracts the engine talks to, plus the bundled SQLite adapter.

pub mod models;
pub mod sqlite;

pub use models::*;
pub use sqlite::SqliteStore;
pub use sqlx::SqlitePool;

use crate::error::SyncResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Read side of the schedule CRUD layer
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Active schedules due at `time_of_day` (`HH:mm`) on `day_of_week` (0 = Sunday)
    async fn find_active(
        &self,
        time_of_day: &str,
        day_of_week: u8,
    ) -> SyncResult<Vec<ScheduleDefinition>>;

    /// Record when a schedule last ran; unknown ids are ignored
    async fn update_last_run(&self, id: &str, mode: SyncMode, at: DateTime<Utc>)
        -> SyncResult<()>;
}

/// Append-only store of execution records
#[async_trait]
pub trait ExecutionLogStore: Send + Sync {
    async fn create(&self, record: &ExecutionRecord) -> SyncResult<LogHandle>;

    /// Append outcomes and grow the record's totals by them
    async fn append(&self, handle: LogHandle, outcomes: &[TransferOutcome]) -> SyncResult<()>;

    /// Mark the record terminal
    async fn finalize(&self, handle: LogHandle, end_time: DateTime<Utc>) -> SyncResult<()>;
}

/// Open (or create) the database file and run migrations
pub async fn open_pool(db_path: &Path) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5) // SQLite is a single file, a few connections are enough
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// In-memory database, used by tests
pub async fn memory_pool() -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

    // a single connection that never expires, otherwise the data is lost
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}
