mod common;

use archsync_lib::config::TelemetryConfig;
use archsync_lib::core::{Dispatcher, ManualTrigger, RunSettings, SinkEvent, StreamCopyBackend, TransferBackend};
use archsync_lib::db::{
    ExecutionLogStore, OutcomeStatus, ScheduleDefinition, ScheduleStore, SqliteStore, SyncMode,
};
use archsync_lib::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Utc};
use common::*;
use std::sync::Arc;
use tempfile::TempDir;

/// Tuesday 2024-03-05 10:30 local time
fn tuesday_1030() -> DateTime<Local> {
    Local.with_ymd_and_hms(2024, 3, 5, 10, 30, 0).unwrap()
}

fn dispatcher_over(store: &SqliteStore, sink: Arc<CollectingSink>, backend: Arc<dyn TransferBackend>) -> Dispatcher {
    let runner = runner_with(store, sink, backend, RunSettings::default());
    Dispatcher::new(Arc::new(store.clone()), runner)
}

#[tokio::test]
async fn test_manual_run_goes_through_the_full_path() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(src.path(), "a.txt", 100);
    write_file(src.path(), "b.txt", 200);

    let store = memory_store().await;
    let sink = Arc::new(CollectingSink::default());
    let dispatcher = dispatcher_over(&store, sink.clone(), Arc::new(StreamCopyBackend::default()));

    let handle = dispatcher
        .trigger_manual(ManualTrigger::new(src.path(), dst.path(), SyncMode::Archive, "adhoc"))
        .unwrap();
    let id = handle.schedule_id.clone();
    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.files_processed, 2);
    assert!(dispatcher.running().is_empty());

    let events = sink.events();
    assert!(matches!(
        events.first(),
        Some(SinkEvent::Start { total_files: 2, total_bytes: 300, .. })
    ));
    assert!(matches!(
        events.last(),
        Some(SinkEvent::Complete { total_files: 2, total_bytes: 300, .. })
    ));
    assert!(events.iter().all(|e| e.schedule_id() == id));
    let copied = events
        .iter()
        .filter(|e| matches!(e, SinkEvent::FileOutcome { outcome, .. } if outcome.status == OutcomeStatus::Copied))
        .count();
    assert_eq!(copied, 2);
    assert!(events.iter().any(|e| matches!(e, SinkEvent::Progress { percent: 100, .. })));

    let handles = store.recent_records(&id, 10).await.unwrap();
    assert_eq!(handles.len(), 1);
    let record = store.load_record(handles[0]).await.unwrap().unwrap();
    assert!(record.is_terminal());
    assert_eq!(record.total_files, 2);
    assert_eq!(record.total_bytes, 300);
    assert_eq!(record.files.len(), 2);
}

#[tokio::test]
async fn test_manual_trigger_is_deduplicated_by_id() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(src.path(), "a.txt", 10);

    let store = memory_store().await;
    let backend = Arc::new(GatedBackend::new());
    let dispatcher = dispatcher_over(&store, Arc::new(CollectingSink::default()), backend.clone());

    let trigger = ManualTrigger::new(src.path(), dst.path(), SyncMode::Archive, "adhoc").with_id("job-1");
    let first = dispatcher.trigger_manual(trigger.clone()).unwrap();
    assert!(dispatcher.running().contains("job-1"));

    let second = dispatcher.trigger_manual(trigger.clone());
    assert!(matches!(second, Err(SyncError::AlreadyRunning(id)) if id == "job-1"));

    backend.release(1);
    first.wait().await.unwrap();
    assert!(!dispatcher.running().contains("job-1"));

    // free again once the first run ended
    backend.release(1);
    dispatcher.trigger_manual(trigger).unwrap().wait().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_reports_progress_while_a_file_is_in_flight() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(src.path(), "big.bin", 64);

    let store = memory_store().await;
    let sink = Arc::new(CollectingSink::default());
    let backend = Arc::new(GatedBackend::new());
    let settings = RunSettings {
        telemetry: TelemetryConfig {
            heartbeat_ms: 10,
            ..Default::default()
        },
        ..Default::default()
    };
    let runner = runner_with(&store, sink.clone(), backend.clone(), settings);
    let dispatcher = Dispatcher::new(Arc::new(store.clone()), runner);

    let handle = dispatcher
        .trigger_manual(ManualTrigger::new(src.path(), dst.path(), SyncMode::Archive, "slow"))
        .unwrap();

    let in_flight = |events: &[SinkEvent]| {
        events
            .iter()
            .filter(|e| matches!(e, SinkEvent::Progress { current_file, .. } if current_file == "big.bin"))
            .count()
    };
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while in_flight(&sink.events()) < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let held = sink.events();
    assert!(in_flight(&held) >= 2);
    assert!(!held.iter().any(|e| matches!(e, SinkEvent::FileOutcome { .. })));
    assert!(held.iter().all(|e| match e {
        SinkEvent::Progress { files_done, bytes_copied, .. } => *files_done == 0 && *bytes_copied == 0,
        _ => true,
    }));

    backend.release(1);
    handle.wait().await.unwrap();

    let events = sink.events();
    let first_beat = events
        .iter()
        .position(|e| matches!(e, SinkEvent::Progress { current_file, .. } if current_file == "big.bin"))
        .unwrap();
    let first_outcome = events
        .iter()
        .position(|e| matches!(e, SinkEvent::FileOutcome { .. }))
        .unwrap();
    assert!(first_beat < first_outcome);
}

#[tokio::test]
async fn test_two_ticks_in_the_same_minute_start_one_run() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(src.path(), "a.txt", 10);

    let store = memory_store().await;
    let schedule = ScheduleDefinition::new(
        "nightly",
        src.path().to_string_lossy(),
        dst.path().to_string_lossy(),
        SyncMode::Archive,
        "10:30",
        vec![2],
    );
    store.save_schedule(&schedule).await.unwrap();

    let backend = Arc::new(GatedBackend::new());
    let dispatcher = dispatcher_over(&store, Arc::new(CollectingSink::default()), backend.clone());

    let first = dispatcher.tick(tuesday_1030()).await;
    let second = dispatcher.tick(tuesday_1030()).await;
    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
    assert_eq!(dispatcher.running().len(), 1);

    backend.release(1);
    for handle in first {
        handle.wait().await.unwrap();
    }

    let reloaded = store.load_schedule(&schedule.id).await.unwrap().unwrap();
    assert!(reloaded.last_archived_at.is_some());
    assert!(reloaded.last_synced_at.is_none());
}

#[tokio::test]
async fn test_tick_only_fires_due_schedules() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(src.path(), "a.txt", 10);

    let store = memory_store().await;
    let other_day = ScheduleDefinition::new(
        "monday",
        src.path().to_string_lossy(),
        dst.path().to_string_lossy(),
        SyncMode::Archive,
        "10:30",
        vec![1],
    );
    let mut inactive = ScheduleDefinition::new(
        "off",
        src.path().to_string_lossy(),
        dst.path().to_string_lossy(),
        SyncMode::Archive,
        "10:30",
        vec![2],
    );
    inactive.active = false;
    store.save_schedule(&other_day).await.unwrap();
    store.save_schedule(&inactive).await.unwrap();

    let dispatcher = dispatcher_over(
        &store,
        Arc::new(CollectingSink::default()),
        Arc::new(StreamCopyBackend::default()),
    );
    assert!(dispatcher.tick(tuesday_1030()).await.is_empty());
    assert!(dispatcher.tick(tuesday_1030() + chrono::Duration::minutes(1)).await.is_empty());
}

/// Hands out a fixed list, bypassing store-side validation
struct FixedSchedules(Vec<ScheduleDefinition>);

#[async_trait]
impl ScheduleStore for FixedSchedules {
    async fn find_active(&self, _time: &str, _day: u8) -> SyncResult<Vec<ScheduleDefinition>> {
        Ok(self.0.clone())
    }

    async fn update_last_run(&self, _id: &str, _mode: SyncMode, _at: DateTime<Utc>) -> SyncResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_invalid_schedules_are_skipped() {
    let mut broken = ScheduleDefinition::new("broken", "/src", "/dst", SyncMode::Sync, "10:30", vec![2]);
    broken.recycle_enabled = true;

    let store = memory_store().await;
    let runner = runner_with(
        &store,
        null_sink(),
        Arc::new(StreamCopyBackend::default()),
        RunSettings::default(),
    );
    let dispatcher = Dispatcher::new(Arc::new(FixedSchedules(vec![broken])), runner);

    assert!(dispatcher.tick(tuesday_1030()).await.is_empty());
    assert!(dispatcher.running().is_empty());
}

#[tokio::test]
async fn test_fatal_run_still_finalizes_and_reports() {
    let dst = TempDir::new().unwrap();
    let store = memory_store().await;
    let schedule = ScheduleDefinition::new(
        "missing",
        dst.path().join("nope").to_string_lossy(),
        dst.path().join("out").to_string_lossy(),
        SyncMode::Sync,
        "10:30",
        vec![2],
    );
    store.save_schedule(&schedule).await.unwrap();

    let sink = Arc::new(CollectingSink::default());
    let dispatcher = dispatcher_over(&store, sink.clone(), Arc::new(StreamCopyBackend::default()));
    let handles = dispatcher.tick(tuesday_1030()).await;
    assert_eq!(handles.len(), 1);

    let result = handles.into_iter().next().unwrap().wait().await;
    assert!(matches!(result, Err(SyncError::RootUnreadable { .. })));
    assert!(dispatcher.running().is_empty());

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], SinkEvent::Error { schedule_id, .. } if *schedule_id == schedule.id));

    let logs = store.recent_records(&schedule.id, 1).await.unwrap();
    let record = store.load_record(logs[0]).await.unwrap().unwrap();
    assert!(record.is_terminal());
    assert_eq!(record.total_files, 0);

    // failed runs do not count as a last sync
    let reloaded = store.load_schedule(&schedule.id).await.unwrap().unwrap();
    assert!(reloaded.last_synced_at.is_none());
}

#[tokio::test]
async fn test_log_totals_include_errors_but_not_their_bytes() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(src.path(), "a.txt", 100);
    write_file(src.path(), "bad.txt", 50);
    write_file(src.path(), "c.txt", 25);
    write_file(dst.path(), "stale.txt", 7);

    let store = memory_store().await;
    let sink = Arc::new(CollectingSink::default());
    let dispatcher = dispatcher_over(&store, sink.clone(), Arc::new(FailingBackend::new(&["bad.txt"])));

    let handle = dispatcher
        .trigger_manual(ManualTrigger::new(src.path(), dst.path(), SyncMode::Sync, "mixed"))
        .unwrap();
    let id = handle.schedule_id.clone();
    handle.wait().await.unwrap();

    let logs = store.recent_records(&id, 1).await.unwrap();
    let record = store.load_record(logs[0]).await.unwrap().unwrap();
    assert_eq!(record.total_files, 4);
    assert_eq!(record.total_bytes, 125);

    let expected: u64 = record
        .files
        .iter()
        .filter(|f| f.status.counts_bytes())
        .map(|f| f.size_bytes)
        .sum();
    assert_eq!(record.total_bytes, expected);
    assert_eq!(record.files.iter().filter(|f| f.status == OutcomeStatus::Error).count(), 1);
    assert_eq!(record.files.iter().filter(|f| f.status == OutcomeStatus::Deleted).count(), 1);

    assert!(matches!(sink.events().last(), Some(SinkEvent::Complete { total_files: 4, .. })));
}

#[tokio::test]
async fn test_large_run_is_flushed_in_batches_and_journaled() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let logs_dir = TempDir::new().unwrap();
    for i in 0..45 {
        write_file(src.path(), &format!("dir{}/f{}.txt", i % 4, i), 3);
    }

    let store = memory_store().await;
    let settings = RunSettings {
        telemetry: TelemetryConfig {
            log_batch_size: 20,
            ..Default::default()
        },
        journal_dir: Some(logs_dir.path().to_path_buf()),
        ..Default::default()
    };
    let runner = runner_with(&store, null_sink(), Arc::new(StreamCopyBackend::default()), settings);
    let dispatcher = Dispatcher::new(Arc::new(store.clone()), runner);

    let handle = dispatcher
        .trigger_manual(ManualTrigger::new(src.path(), dst.path(), SyncMode::Archive, "bulk"))
        .unwrap();
    let id = handle.schedule_id.clone();
    handle.wait().await.unwrap();

    let logs = store.recent_records(&id, 1).await.unwrap();
    let record = store.load_record(logs[0]).await.unwrap().unwrap();
    assert_eq!(record.files.len(), 45);
    assert_eq!(record.total_files, 45);
    assert_eq!(record.total_bytes, 135);

    let journals: Vec<_> = std::fs::read_dir(logs_dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(journals.len(), 1);
    assert!(journals[0].starts_with("log_archive_bulk_"));
    let text = std::fs::read_to_string(logs_dir.path().join(&journals[0])).unwrap();
    assert_eq!(text.matches("copied: ").count(), 45);
    assert!(text.contains("[100%]"));
}

#[tokio::test]
async fn test_store_rejects_appends_after_finalize() {
    let store = memory_store().await;
    let record = archsync_lib::db::ExecutionRecord::start("s", SyncMode::Archive, "/a", "/b");
    let handle = store.create(&record).await.unwrap();
    store.finalize(handle, Utc::now()).await.unwrap();

    let late = [archsync_lib::db::TransferOutcome::new("x", 1, OutcomeStatus::Copied)];
    assert!(matches!(
        store.append(handle, &late).await,
        Err(SyncError::Persistence(_))
    ));
    assert!(store.finalize(handle, Utc::now()).await.is_err());
}
