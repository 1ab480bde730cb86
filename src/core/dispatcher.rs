//! Schedule dispatcher - minute ticks, manual triggers and the running set

use super::executor::RunSummary;
use super::runner::{RunTarget, Runner};
use crate::db::{ScheduleStore, SyncMode};
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Datelike, Local, Timelike};
use scopeguard::ScopeGuard;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ids of the schedules currently executing
#[derive(Debug, Clone, Default)]
pub struct RunningSet {
    ids: Arc<Mutex<HashSet<String>>>,
}

/// Membership of one id; dropping it removes the id from the set
pub type RunGuard = ScopeGuard<(RunningSet, String), fn((RunningSet, String))>;

impl RunningSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic test-and-set: `None` when the id is already running
    pub fn try_acquire(&self, id: &str) -> Option<RunGuard> {
        let inserted = self.lock().insert(id.to_string());
        if !inserted {
            return None;
        }
        let release: fn((RunningSet, String)) = |(set, id)| {
            set.lock().remove(&id);
            debug!("released {}", id);
        };
        Some(scopeguard::guard((self.clone(), id.to_string()), release))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // the set stays consistent even if a holder panicked
        self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Ad-hoc run request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualTrigger {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub mode: SyncMode,
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub recycle_path: Option<PathBuf>,
}

impl ManualTrigger {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        mode: SyncMode,
        name: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            mode,
            name: name.into(),
            id: None,
            recycle_path: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_recycle(mut self, path: impl Into<PathBuf>) -> Self {
        self.recycle_path = Some(path.into());
        self
    }

    fn into_target(self) -> RunTarget {
        let schedule_id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        RunTarget {
            schedule_id,
            name: self.name,
            mode: self.mode,
            source: self.source,
            destination: self.destination,
            recycle_path: self.recycle_path.filter(|_| self.mode == SyncMode::Sync),
        }
    }
}

/// A launched run
pub struct RunHandle {
    pub schedule_id: String,
    join: JoinHandle<SyncResult<RunSummary>>,
}

impl RunHandle {
    /// Wait for the run to end
    pub async fn wait(self) -> SyncResult<RunSummary> {
        self.join
            .await
            .map_err(|e| SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Evaluates schedules every minute and launches due runs
#[derive(Clone)]
pub struct Dispatcher {
    schedules: Arc<dyn ScheduleStore>,
    runner: Runner,
    running: RunningSet,
}

impl Dispatcher {
    pub fn new(schedules: Arc<dyn ScheduleStore>, runner: Runner) -> Self {
        Self {
            schedules,
            runner,
            running: RunningSet::new(),
        }
    }

    pub fn running(&self) -> &RunningSet {
        &self.running
    }

    /// Start a run unless its id is already running. Never waits for the run.
    pub fn launch(&self, target: RunTarget) -> SyncResult<RunHandle> {
        let guard = self
            .running
            .try_acquire(&target.schedule_id)
            .ok_or_else(|| SyncError::AlreadyRunning(target.schedule_id.clone()))?;

        let schedule_id = target.schedule_id.clone();
        let runner = self.runner.clone();
        let join = tokio::spawn(async move {
            let _guard = guard;
            runner.run(target).await
        });

        Ok(RunHandle { schedule_id, join })
    }

    /// Evaluate one tick; returns the runs it started
    pub async fn tick(&self, now: DateTime<Local>) -> Vec<RunHandle> {
        let time_of_day = format!("{:02}:{:02}", now.hour(), now.minute());
        let day_of_week = now.weekday().num_days_from_sunday() as u8;

        let due = match self.schedules.find_active(&time_of_day, day_of_week).await {
            Ok(due) => due,
            Err(e) => {
                warn!("could not load schedules for {}: {}", time_of_day, e);
                return Vec::new();
            }
        };

        let mut launched = Vec::new();
        for schedule in due {
            if let Err(e) = schedule.validate() {
                warn!(schedule_id = %schedule.id, "skipping schedule '{}': {}", schedule.name, e);
                continue;
            }
            if !schedule.is_due(&time_of_day, day_of_week) {
                continue;
            }

            match self.launch(RunTarget::from(&schedule)) {
                Ok(handle) => {
                    info!(schedule_id = %schedule.id, "schedule '{}' is due at {}", schedule.name, time_of_day);
                    launched.push(handle);
                }
                Err(SyncError::AlreadyRunning(id)) => {
                    debug!(schedule_id = %id, "still running, not starting another run");
                }
                Err(e) => warn!(schedule_id = %schedule.id, "could not start run: {}", e),
            }
        }
        launched
    }

    /// Manual entry point; goes through the same path as scheduled runs
    pub fn trigger_manual(&self, trigger: ManualTrigger) -> SyncResult<RunHandle> {
        let target = trigger.into_target();
        info!(schedule_id = %target.schedule_id, "manual {} run '{}'", target.mode, target.name);
        self.launch(target)
    }

    /// Tick on every wall-clock minute until `shutdown` fires.
    /// Missed minutes are skipped, not replayed.
    pub async fn run_loop(&self, shutdown: CancellationToken) {
        let start = tokio::time::Instant::now() + until_next_minute(Local::now());
        let mut ticker = tokio::time::interval_at(start, Duration::from_secs(60));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("dispatcher started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let launched = self.tick(Local::now()).await;
                    if !launched.is_empty() {
                        debug!("{} runs started", launched.len());
                    }
                }
            }
        }

        info!("dispatcher stopped, {} runs still in flight", self.running.len());
    }
}

/// Time left until the next minute boundary
fn until_next_minute(now: DateTime<Local>) -> Duration {
    let into_minute = Duration::new(now.second() as u64, now.nanosecond() % 1_000_000_000);
    Duration::from_secs(60).saturating_sub(into_minute)
}
