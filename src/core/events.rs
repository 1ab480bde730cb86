//! Run lifecycle events: the executor's typed channel and the outward event sink.

use crate::db::{OutcomeStatus, SyncMode, TransferOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Events emitted by one executor run, in the order they happen.
///
/// Exactly one terminal event (`Complete` or `Error`) ends every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransferEvent {
    #[serde(rename_all = "camelCase")]
    Start { total_files: u64, total_bytes: u64 },
    /// A worker picked up a file (drives the "current file" label)
    FileStarted { path: String },
    #[serde(rename_all = "camelCase")]
    FileCopied { path: String, size_bytes: u64 },
    #[serde(rename_all = "camelCase")]
    FileUpdated { path: String, size_bytes: u64 },
    FileDeleted { path: String, recycled: bool },
    #[serde(rename_all = "camelCase")]
    FileError {
        path: String,
        size_bytes: u64,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Complete { total_files: u64, total_bytes: u64 },
    Error { message: String },
}

impl TransferEvent {
    /// The per-file outcome carried by this event, if any.
    /// Deleted files are recorded with size 0.
    pub fn outcome(&self) -> Option<TransferOutcome> {
        match self {
            TransferEvent::FileCopied { path, size_bytes } => {
                Some(TransferOutcome::new(path.clone(), *size_bytes, OutcomeStatus::Copied))
            }
            TransferEvent::FileUpdated { path, size_bytes } => {
                Some(TransferOutcome::new(path.clone(), *size_bytes, OutcomeStatus::Updated))
            }
            TransferEvent::FileDeleted { path, .. } => {
                Some(TransferOutcome::new(path.clone(), 0, OutcomeStatus::Deleted))
            }
            TransferEvent::FileError {
                path,
                size_bytes,
                message,
            } => Some(TransferOutcome::error(path.clone(), *size_bytes, message.clone())),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferEvent::Complete { .. } | TransferEvent::Error { .. })
    }
}

/// Payload published to the event sink
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SinkEvent {
    #[serde(rename_all = "camelCase")]
    Start {
        schedule_id: String,
        name: String,
        mode: SyncMode,
        total_files: u64,
        total_bytes: u64,
        started_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        schedule_id: String,
        current_file: String,
        files_done: u64,
        total_files: u64,
        bytes_copied: u64,
        total_bytes: u64,
        percent: u8,
        /// Smoothed rate, bytes per second
        speed_bps: f64,
        /// Last instantaneous sample, bytes per second
        raw_speed_bps: f64,
        speed: String,
        eta_seconds: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    FileOutcome {
        schedule_id: String,
        #[serde(flatten)]
        outcome: TransferOutcome,
        recycled: bool,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        schedule_id: String,
        total_files: u64,
        total_bytes: u64,
        average_speed_bps: f64,
        duration_seconds: f64,
    },
    #[serde(rename_all = "camelCase")]
    Error { schedule_id: String, message: String },
}

impl SinkEvent {
    pub fn schedule_id(&self) -> &str {
        match self {
            SinkEvent::Start { schedule_id, .. }
            | SinkEvent::Progress { schedule_id, .. }
            | SinkEvent::FileOutcome { schedule_id, .. }
            | SinkEvent::Complete { schedule_id, .. }
            | SinkEvent::Error { schedule_id, .. } => schedule_id,
        }
    }
}

/// Fire-and-forget publish target.
///
/// Implementations must never block the caller or fail the run.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &SinkEvent);
}

/// Drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: &SinkEvent) {}
}

/// Writes events to the application log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: &SinkEvent) {
        match event {
            SinkEvent::Start {
                schedule_id,
                name,
                mode,
                total_files,
                total_bytes,
                ..
            } => info!(
                schedule_id = %schedule_id,
                "{} run '{}' started: {} files, {} bytes",
                mode, name, total_files, total_bytes
            ),
            SinkEvent::Progress {
                schedule_id,
                percent,
                speed,
                ..
            } => debug!(schedule_id = %schedule_id, "{}% at {}", percent, speed),
            SinkEvent::FileOutcome {
                schedule_id,
                outcome,
                ..
            } => match &outcome.error_message {
                Some(message) => warn!(schedule_id = %schedule_id, "{}: {}", outcome.path, message),
                None => debug!(schedule_id = %schedule_id, "{}: {}", outcome.status, outcome.path),
            },
            SinkEvent::Complete {
                schedule_id,
                total_files,
                total_bytes,
                duration_seconds,
                ..
            } => info!(
                schedule_id = %schedule_id,
                "run complete: {} files, {} bytes in {:.1}s",
                total_files, total_bytes, duration_seconds
            ),
            SinkEvent::Error {
                schedule_id,
                message,
            } => warn!(schedule_id = %schedule_id, "run failed: {}", message),
        }
    }
}

/// In-process broadcaster the transport layer subscribes to.
///
/// Slow subscribers lag and lose old events; with no subscriber at all the
/// event is simply dropped.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<SinkEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: &SinkEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Publishes to several sinks in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: std::sync::Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, event: &SinkEvent) {
        for sink in &self.sinks {
            sink.publish(event);
        }
    }
}
