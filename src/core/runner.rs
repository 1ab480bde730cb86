//! The single run path shared by scheduled and manual runs.
//!
//! Consumes the executor's event stream and fans every event out to the
//! throughput estimator, the execution log aggregator, the run journal and
//! the event sink.

use super::aggregator::ExecutionLogAggregator;
use super::backend::TransferBackend;
use super::events::{EventSink, SinkEvent, TransferEvent};
use super::executor::{RunOptions, RunRequest, RunSummary, TransferExecutor};
use super::journal::RunJournal;
use super::throughput::{format_rate, ProgressSnapshot, ThroughputEstimator};
use crate::config::{EngineConfig, TelemetryConfig};
use crate::db::{ExecutionLogStore, ExecutionRecord, ScheduleDefinition, ScheduleStore, SyncMode};
use crate::error::{SyncError, SyncResult};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamExt;
use tracing::{info, warn};

const EVENT_BUFFER: usize = 256;

/// Everything needed to run one schedule or manual trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTarget {
    pub schedule_id: String,
    pub name: String,
    pub mode: SyncMode,
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Soft-delete target; only honoured in sync mode
    pub recycle_path: Option<PathBuf>,
}

impl From<&ScheduleDefinition> for RunTarget {
    fn from(schedule: &ScheduleDefinition) -> Self {
        Self {
            schedule_id: schedule.id.clone(),
            name: schedule.name.clone(),
            mode: schedule.mode,
            source: PathBuf::from(&schedule.source_path),
            destination: PathBuf::from(&schedule.destination_path),
            recycle_path: schedule.effective_recycle_path(),
        }
    }
}

/// Settings every run is started with
#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    pub engine: EngineConfig,
    pub telemetry: TelemetryConfig,
    /// Directory for run journals; `None` disables them
    pub journal_dir: Option<PathBuf>,
}

/// Runs targets against the shared stores, backend and sink
#[derive(Clone)]
pub struct Runner {
    schedules: Arc<dyn ScheduleStore>,
    logs: Arc<dyn ExecutionLogStore>,
    sink: Arc<dyn EventSink>,
    backend: Arc<dyn TransferBackend>,
    settings: Arc<RunSettings>,
}

impl Runner {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        logs: Arc<dyn ExecutionLogStore>,
        sink: Arc<dyn EventSink>,
        backend: Arc<dyn TransferBackend>,
        settings: RunSettings,
    ) -> Self {
        Self {
            schedules,
            logs,
            sink,
            backend,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    fn request_for(&self, target: &RunTarget) -> RunRequest {
        let engine = &self.settings.engine;
        let mut options = RunOptions::new(target.mode);
        options.compare = engine.compare;
        options.walk = engine.walk_config();
        options.max_concurrent = engine.max_concurrent_transfers;
        if let (SyncMode::Sync, Some(recycle)) = (target.mode, &target.recycle_path) {
            options = options.with_recycle(recycle.clone());
        }
        RunRequest::new(&target.source, &target.destination, options)
    }

    /// Execute one run to its terminal event.
    ///
    /// The execution log is finalized and a terminal sink event published on
    /// every path, including fatal errors.
    pub async fn run(&self, target: RunTarget) -> SyncResult<RunSummary> {
        let telemetry = &self.settings.telemetry;
        let id = target.schedule_id.clone();
        info!(schedule_id = %id, "starting {} run '{}'", target.mode, target.name);

        let record = ExecutionRecord::start(
            &id,
            target.mode,
            target.source.to_string_lossy(),
            target.destination.to_string_lossy(),
        );
        let started_at = record.start_time;
        let mut aggregator =
            ExecutionLogAggregator::open(self.logs.clone(), record, telemetry.log_batch_size).await;
        let mut journal = self.open_journal(&target, started_at).await;

        let executor = TransferExecutor::new(self.backend.clone());
        let (mut events, handle) = executor.spawn(self.request_for(&target), EVENT_BUFFER);

        let mut estimator = ThroughputEstimator::new(telemetry.ema_alpha, Instant::now());
        let mut heartbeat = tokio::time::interval(Duration::from_millis(telemetry.heartbeat_ms.max(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut transferring = false;
        let mut terminal: Option<TransferEvent> = None;

        loop {
            tokio::select! {
                biased;
                event = events.next() => {
                    let Some(event) = event else { break };
                    match &event {
                        TransferEvent::Start { total_files, total_bytes } => {
                            estimator.start(*total_files, *total_bytes, Instant::now());
                            transferring = true;
                            self.sink.publish(&SinkEvent::Start {
                                schedule_id: id.clone(),
                                name: target.name.clone(),
                                mode: target.mode,
                                total_files: *total_files,
                                total_bytes: *total_bytes,
                                started_at,
                            });
                        }
                        TransferEvent::FileStarted { path } => estimator.set_current_file(path.clone()),
                        TransferEvent::Complete { .. } | TransferEvent::Error { .. } => {
                            transferring = false;
                            terminal = Some(event.clone());
                        }
                        _ => {}
                    }

                    if let Some(outcome) = event.outcome() {
                        let bytes = if outcome.status.counts_bytes() { outcome.size_bytes } else { 0 };
                        let progress = estimator.on_file_complete(bytes, Instant::now());

                        if let Some(j) = journal.as_mut() {
                            if let Err(e) = j.outcome(progress.percent, &outcome).await {
                                warn!(schedule_id = %id, "journal write failed, disabling it: {}", e);
                                journal = None;
                            }
                        }
                        self.sink.publish(&SinkEvent::FileOutcome {
                            schedule_id: id.clone(),
                            outcome: outcome.clone(),
                            recycled: matches!(event, TransferEvent::FileDeleted { recycled: true, .. }),
                        });
                        self.sink.publish(&progress_event(&id, progress));
                        aggregator.record(outcome).await;
                    }
                }
                _ = heartbeat.tick(), if transferring => {
                    self.sink.publish(&progress_event(&id, estimator.heartbeat()));
                }
            }
        }

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))),
        };

        let end_time = Utc::now();
        if let Err(e) = aggregator.finish(end_time).await {
            warn!(schedule_id = %id, "execution log was not finalized cleanly: {}", e);
        }

        match (&result, terminal) {
            (Ok(_), Some(TransferEvent::Complete { total_files, total_bytes })) => {
                let now = Instant::now();
                self.sink.publish(&SinkEvent::Complete {
                    schedule_id: id.clone(),
                    total_files,
                    total_bytes,
                    average_speed_bps: estimator.average_speed(now),
                    duration_seconds: estimator.elapsed(now).as_secs_f64(),
                });
                if let Some(j) = journal {
                    if let Err(e) = j.completed(total_files, total_bytes, end_time).await {
                        warn!(schedule_id = %id, "journal write failed: {}", e);
                    }
                }
                if let Err(e) = self.schedules.update_last_run(&id, target.mode, end_time).await {
                    warn!(schedule_id = %id, "could not record last run: {}", e);
                }
                info!(schedule_id = %id, "run complete: {} files, {} bytes", total_files, total_bytes);
            }
            _ => {
                let message = match &result {
                    Err(e) => e.to_string(),
                    Ok(_) => "run ended without a terminal event".to_string(),
                };
                self.sink.publish(&SinkEvent::Error {
                    schedule_id: id.clone(),
                    message: message.clone(),
                });
                if let Some(j) = journal {
                    if let Err(e) = j.failed(&message, end_time).await {
                        warn!(schedule_id = %id, "journal write failed: {}", e);
                    }
                }
                warn!(schedule_id = %id, "run failed: {}", message);
            }
        }

        result
    }

    async fn open_journal(&self, target: &RunTarget, started_at: chrono::DateTime<Utc>) -> Option<RunJournal> {
        if !self.settings.telemetry.journal {
            return None;
        }
        let dir = self.settings.journal_dir.as_ref()?;
        match RunJournal::create(
            dir,
            target.mode,
            &target.name,
            &target.source.to_string_lossy(),
            &target.destination.to_string_lossy(),
            started_at,
        )
        .await
        {
            Ok(journal) => Some(journal),
            Err(e) => {
                warn!(schedule_id = %target.schedule_id, "could not open run journal: {}", e);
                None
            }
        }
    }
}

fn progress_event(schedule_id: &str, progress: ProgressSnapshot) -> SinkEvent {
    SinkEvent::Progress {
        schedule_id: schedule_id.to_string(),
        current_file: progress.current_file,
        files_done: progress.files_done,
        total_files: progress.total_files,
        bytes_copied: progress.bytes_copied,
        total_bytes: progress.total_bytes,
        percent: progress.percent,
        speed_bps: progress.speed_bps,
        raw_speed_bps: progress.raw_speed_bps,
        speed: format_rate(progress.speed_bps),
        eta_seconds: progress.eta_seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_schedule() {
        let archive = ScheduleDefinition::new("docs", "/src", "/dst", SyncMode::Archive, "01:00", vec![1])
            .with_recycle("/trash");
        let target = RunTarget::from(&archive);
        assert_eq!(target.schedule_id, archive.id);
        assert_eq!(target.recycle_path, None);

        let mut sync = archive.clone();
        sync.mode = SyncMode::Sync;
        assert_eq!(RunTarget::from(&sync).recycle_path, Some(PathBuf::from("/trash")));
    }

    #[test]
    fn test_progress_event_formats_speed() {
        let event = progress_event(
            "s1",
            ProgressSnapshot {
                current_file: "a.bin".into(),
                files_done: 1,
                total_files: 2,
                bytes_copied: 1024,
                total_bytes: 2048,
                percent: 50,
                speed_bps: 2048.0,
                raw_speed_bps: 1024.0,
                eta_seconds: Some(0),
            },
        );
        match event {
            SinkEvent::Progress { speed, percent, .. } => {
                assert_eq!(speed, "2.00 KB/s");
                assert_eq!(percent, 50);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
