use super::models::*;
use super::{ExecutionLogStore, ScheduleStore};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

/// SQLite implementation of both store contracts
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<SqlitePool>,
}

impl SqliteStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Insert or update a schedule
    pub async fn save_schedule(&self, schedule: &ScheduleDefinition) -> SyncResult<()> {
        schedule.validate()?;
        let days = serde_json::to_string(&normalize_days(&schedule.days_of_week))?;
        let now = Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO schedules (id, name, source_path, destination_path, recycle_path, mode, time_of_day,
                                   days_of_week, active, recycle_enabled, last_archived_at, last_synced_at,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                source_path = excluded.source_path,
                destination_path = excluded.destination_path,
                recycle_path = excluded.recycle_path,
                mode = excluded.mode,
                time_of_day = excluded.time_of_day,
                days_of_week = excluded.days_of_week,
                active = excluded.active,
                recycle_enabled = excluded.recycle_enabled,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&schedule.id)
        .bind(&schedule.name)
        .bind(&schedule.source_path)
        .bind(&schedule.destination_path)
        .bind(&schedule.recycle_path)
        .bind(schedule.mode.to_string())
        .bind(&schedule.time_of_day)
        .bind(&days)
        .bind(schedule.active)
        .bind(schedule.recycle_enabled)
        .bind(schedule.last_archived_at.map(|t| t.timestamp_millis()))
        .bind(schedule.last_synced_at.map(|t| t.timestamp_millis()))
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;

        Ok(())
    }

    pub async fn load_schedule(&self, id: &str) -> SyncResult<Option<ScheduleDefinition>> {
        let row = sqlx::query_as::<_, ScheduleRow>("SELECT * FROM schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;

        row.map(ScheduleDefinition::try_from).transpose()
    }

    pub async fn load_schedules(&self) -> SyncResult<Vec<ScheduleDefinition>> {
        let rows = sqlx::query_as::<_, ScheduleRow>("SELECT * FROM schedules ORDER BY created_at DESC")
            .fetch_all(&*self.db)
            .await?;

        rows.into_iter().map(ScheduleDefinition::try_from).collect()
    }

    pub async fn delete_schedule(&self, id: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Load a full execution record, outcomes in append order
    pub async fn load_record(&self, handle: LogHandle) -> SyncResult<Option<ExecutionRecord>> {
        let Some(row) =
            sqlx::query_as::<_, ExecutionLogRow>("SELECT * FROM execution_logs WHERE id = ?")
                .bind(handle.0)
                .fetch_optional(&*self.db)
                .await?
        else {
            return Ok(None);
        };

        let files = sqlx::query_as::<_, ExecutionFileRow>(
            "SELECT path, size_bytes, status, error_message FROM execution_files WHERE log_id = ? ORDER BY seq",
        )
        .bind(handle.0)
        .fetch_all(&*self.db)
        .await?;

        Ok(Some(ExecutionRecord {
            schedule_id: row.schedule_id,
            mode: SyncMode::try_from(row.mode.as_str())?,
            source: row.source,
            destination: row.destination,
            start_time: DateTime::<Utc>::from_timestamp_millis(row.start_time).unwrap_or_default(),
            end_time: row.end_time.and_then(DateTime::<Utc>::from_timestamp_millis),
            total_files: row.total_files as u64,
            total_bytes: row.total_bytes as u64,
            files: files.into_iter().map(TransferOutcome::from).collect(),
        }))
    }

    /// Most recent runs of a schedule, newest first
    pub async fn recent_records(&self, schedule_id: &str, limit: i64) -> SyncResult<Vec<LogHandle>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM execution_logs WHERE schedule_id = ? ORDER BY start_time DESC, id DESC LIMIT ?",
        )
        .bind(schedule_id)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;

        Ok(ids.into_iter().map(|(id,)| LogHandle(id)).collect())
    }
}

#[async_trait]
impl ScheduleStore for SqliteStore {
    async fn find_active(
        &self,
        time_of_day: &str,
        day_of_week: u8,
    ) -> SyncResult<Vec<ScheduleDefinition>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            "SELECT * FROM schedules WHERE active = 1 AND time_of_day = ?",
        )
        .bind(time_of_day)
        .fetch_all(&*self.db)
        .await?;

        // days are stored as a JSON array, filter membership here
        let mut due = Vec::new();
        for row in rows {
            let schedule = ScheduleDefinition::try_from(row)?;
            if schedule.is_due(time_of_day, day_of_week) {
                due.push(schedule);
            }
        }
        Ok(due)
    }

    async fn update_last_run(&self, id: &str, mode: SyncMode, at: DateTime<Utc>) -> SyncResult<()> {
        let column = match mode {
            SyncMode::Archive => "last_archived_at",
            SyncMode::Sync => "last_synced_at",
        };
        let result = sqlx::query(&format!("UPDATE schedules SET {} = ? WHERE id = ?", column))
            .bind(at.timestamp_millis())
            .bind(id)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            debug!("no schedule row for {}, last-run not recorded", id);
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionLogStore for SqliteStore {
    async fn create(&self, record: &ExecutionRecord) -> SyncResult<LogHandle> {
        let result = sqlx::query(
            r#"INSERT INTO execution_logs
               (schedule_id, mode, source, destination, start_time, end_time, total_files, total_bytes)
               VALUES (?, ?, ?, ?, ?, NULL, 0, 0)"#,
        )
        .bind(&record.schedule_id)
        .bind(record.mode.to_string())
        .bind(&record.source)
        .bind(&record.destination)
        .bind(record.start_time.timestamp_millis())
        .execute(&*self.db)
        .await?;

        Ok(LogHandle(result.last_insert_rowid()))
    }

    async fn append(&self, handle: LogHandle, outcomes: &[TransferOutcome]) -> SyncResult<()> {
        if outcomes.is_empty() {
            return Ok(());
        }
        let totals = ExecutionTotals::of(outcomes);
        let mut tx = self.db.begin().await?;

        let updated = sqlx::query(
            r#"UPDATE execution_logs
               SET total_files = total_files + ?, total_bytes = total_bytes + ?
               WHERE id = ? AND end_time IS NULL"#,
        )
        .bind(totals.total_files as i64)
        .bind(totals.total_bytes as i64)
        .bind(handle.0)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(SyncError::Persistence(format!(
                "execution log {} is missing or already finalized",
                handle.0
            )));
        }

        for outcome in outcomes {
            sqlx::query(
                r#"INSERT INTO execution_files (log_id, path, size_bytes, status, error_message)
                   VALUES (?, ?, ?, ?, ?)"#,
            )
            .bind(handle.0)
            .bind(&outcome.path)
            .bind(outcome.size_bytes as i64)
            .bind(outcome.status.to_string())
            .bind(&outcome.error_message)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn finalize(&self, handle: LogHandle, end_time: DateTime<Utc>) -> SyncResult<()> {
        let result =
            sqlx::query("UPDATE execution_logs SET end_time = ? WHERE id = ? AND end_time IS NULL")
                .bind(end_time.timestamp_millis())
                .bind(handle.0)
                .execute(&*self.db)
                .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::Persistence(format!(
                "execution log {} is missing or already finalized",
                handle.0
            )));
        }
        Ok(())
    }
}
