use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Run mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Copy new/updated files, never delete at the destination
    Archive,
    /// Mirror the source, removing (or recycling) extraneous destination files
    Sync,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Archive => write!(f, "archive"),
            SyncMode::Sync => write!(f, "sync"),
        }
    }
}

impl TryFrom<&str> for SyncMode {
    type Error = SyncError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        // tolerate JSON-quoted values
        match s.trim_matches('"') {
            "archive" => Ok(SyncMode::Archive),
            "sync" => Ok(SyncMode::Sync),
            other => Err(SyncError::InvalidSchedule(format!("invalid mode: {}", other))),
        }
    }
}

/// Schedule definition, owned by the schedule CRUD layer; the engine only reads it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDefinition {
    pub id: String,
    pub name: String,
    pub source_path: String,
    pub destination_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recycle_path: Option<String>,
    pub mode: SyncMode,
    /// Local wall-clock time, `HH:mm`
    pub time_of_day: String,
    /// 0 = Sunday .. 6 = Saturday
    pub days_of_week: Vec<u8>,
    pub active: bool,
    pub recycle_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_archived_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl ScheduleDefinition {
    /// Create an active schedule without recycling
    pub fn new(
        name: impl Into<String>,
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
        mode: SyncMode,
        time_of_day: impl Into<String>,
        days_of_week: Vec<u8>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            recycle_path: None,
            mode,
            time_of_day: time_of_day.into(),
            days_of_week: normalize_days(&days_of_week),
            active: true,
            recycle_enabled: false,
            last_archived_at: None,
            last_synced_at: None,
        }
    }

    /// Enable soft-delete into `path`
    pub fn with_recycle(mut self, path: impl Into<String>) -> Self {
        self.recycle_path = Some(path.into());
        self.recycle_enabled = true;
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        if parse_time_of_day(&self.time_of_day).is_none() {
            return Err(SyncError::InvalidSchedule(format!(
                "time must be HH:mm, got {:?}",
                self.time_of_day
            )));
        }
        if let Some(day) = self.days_of_week.iter().find(|d| **d > 6) {
            return Err(SyncError::InvalidSchedule(format!(
                "days must be between 0 (Sun) and 6 (Sat), got {}",
                day
            )));
        }
        if self.source_path.trim().is_empty() || self.destination_path.trim().is_empty() {
            return Err(SyncError::InvalidSchedule(
                "source and destination are required".to_string(),
            ));
        }
        if self.mode == SyncMode::Sync
            && self.recycle_enabled
            && self.recycle_path.as_deref().map_or(true, |p| p.trim().is_empty())
        {
            return Err(SyncError::InvalidSchedule(
                "recycle is enabled but no recycle path is set".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether this schedule is due at the given minute and weekday
    pub fn is_due(&self, time_of_day: &str, day_of_week: u8) -> bool {
        self.active && self.time_of_day == time_of_day && self.days_of_week.contains(&day_of_week)
    }

    /// Recycle directory, only when soft-delete applies to this schedule
    pub fn effective_recycle_path(&self) -> Option<PathBuf> {
        if self.mode == SyncMode::Sync && self.recycle_enabled {
            self.recycle_path.as_ref().map(PathBuf::from)
        } else {
            None
        }
    }
}

/// Deduplicate and sort weekday numbers
pub fn normalize_days(days: &[u8]) -> Vec<u8> {
    let mut out = days.to_vec();
    out.sort_unstable();
    out.dedup();
    out
}

/// Parse `HH:mm` into (hour, minute)
pub fn parse_time_of_day(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

/// Per-file outcome status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Copied,
    Updated,
    Deleted,
    Error,
}

impl OutcomeStatus {
    /// Only transferred files contribute to byte totals
    pub fn counts_bytes(self) -> bool {
        matches!(self, OutcomeStatus::Copied | OutcomeStatus::Updated)
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeStatus::Copied => write!(f, "copied"),
            OutcomeStatus::Updated => write!(f, "updated"),
            OutcomeStatus::Deleted => write!(f, "deleted"),
            OutcomeStatus::Error => write!(f, "error"),
        }
    }
}

impl From<&str> for OutcomeStatus {
    fn from(s: &str) -> Self {
        match s {
            "copied" => OutcomeStatus::Copied,
            "updated" => OutcomeStatus::Updated,
            "deleted" => OutcomeStatus::Deleted,
            _ => OutcomeStatus::Error,
        }
    }
}

/// Result of processing one classified entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    pub path: String,
    pub size_bytes: u64,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TransferOutcome {
    pub fn new(path: impl Into<String>, size_bytes: u64, status: OutcomeStatus) -> Self {
        Self {
            path: path.into(),
            size_bytes,
            status,
            error_message: None,
        }
    }

    pub fn error(path: impl Into<String>, size_bytes: u64, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size_bytes,
            status: OutcomeStatus::Error,
            error_message: Some(message.into()),
        }
    }
}

/// Aggregate counters of an execution record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTotals {
    pub total_files: u64,
    pub total_bytes: u64,
}

impl ExecutionTotals {
    pub fn accumulate(&mut self, outcomes: &[TransferOutcome]) {
        for outcome in outcomes {
            self.total_files += 1;
            if outcome.status.counts_bytes() {
                self.total_bytes += outcome.size_bytes;
            }
        }
    }

    pub fn of(outcomes: &[TransferOutcome]) -> Self {
        let mut totals = Self::default();
        totals.accumulate(outcomes);
        totals
    }
}

/// Persisted record of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub schedule_id: String,
    pub mode: SyncMode,
    pub source: String,
    pub destination: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_files: u64,
    pub total_bytes: u64,
    pub files: Vec<TransferOutcome>,
}

impl ExecutionRecord {
    /// A fresh record with zero totals
    pub fn start(
        schedule_id: impl Into<String>,
        mode: SyncMode,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            schedule_id: schedule_id.into(),
            mode,
            source: source.into(),
            destination: destination.into(),
            start_time: Utc::now(),
            end_time: None,
            total_files: 0,
            total_bytes: 0,
            files: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Opaque handle returned by the execution log store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogHandle(pub i64);

// Database rows
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduleRow {
    pub id: String,
    pub name: String,
    pub source_path: String,
    pub destination_path: String,
    pub recycle_path: Option<String>,
    pub mode: String,
    pub time_of_day: String,
    pub days_of_week: String,
    pub active: bool,
    pub recycle_enabled: bool,
    pub last_archived_at: Option<i64>,
    pub last_synced_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<ScheduleRow> for ScheduleDefinition {
    type Error = SyncError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        let days: Vec<u8> = serde_json::from_str(&row.days_of_week)?;
        Ok(ScheduleDefinition {
            id: row.id,
            name: row.name,
            source_path: row.source_path,
            destination_path: row.destination_path,
            recycle_path: row.recycle_path,
            mode: SyncMode::try_from(row.mode.as_str())?,
            time_of_day: row.time_of_day,
            days_of_week: days,
            active: row.active,
            recycle_enabled: row.recycle_enabled,
            last_archived_at: row.last_archived_at.and_then(DateTime::<Utc>::from_timestamp_millis),
            last_synced_at: row.last_synced_at.and_then(DateTime::<Utc>::from_timestamp_millis),
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExecutionLogRow {
    pub id: i64,
    pub schedule_id: String,
    pub mode: String,
    pub source: String,
    pub destination: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub total_files: i64,
    pub total_bytes: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExecutionFileRow {
    pub path: String,
    pub size_bytes: i64,
    pub status: String,
    pub error_message: Option<String>,
}

impl From<ExecutionFileRow> for TransferOutcome {
    fn from(row: ExecutionFileRow) -> Self {
        TransferOutcome {
            path: row.path,
            size_bytes: row.size_bytes as u64,
            status: OutcomeStatus::from(row.status.as_str()),
            error_message: row.error_message,
        }
    }
}
