use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;

pub use crate::config::AppConfig;
pub use crate::core::{Dispatcher, ManualTrigger, Runner, SinkEvent, TransferExecutor};
pub use crate::db::{ScheduleDefinition, SqliteStore, SyncMode};
pub use crate::error::{SyncError, SyncResult};

use crate::core::{create_backend, BroadcastSink, EventSink, FanoutSink, RunSettings, TracingSink};

const DB_FILE: &str = "archsync.db";

/// How long `cleanup` waits for in-flight runs
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Process-wide state: database, dispatcher and the event broadcaster
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<db::SqlitePool>,
    pub store: SqliteStore,
    pub dispatcher: Dispatcher,
    pub events: Arc<BroadcastSink>,
    pub config: AppConfig,
    pub config_dir: PathBuf,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_data_dir(&config::resolve_data_dir()).await
    }

    pub async fn with_data_dir(config_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(config_dir)?;
        let config = AppConfig::load(config_dir);

        let db = Arc::new(db::open_pool(&config_dir.join(DB_FILE)).await?);
        let store = SqliteStore::new(db.clone());

        let events = Arc::new(BroadcastSink::default());
        let sink: Arc<dyn EventSink> = Arc::new(FanoutSink::new().with(events.clone()).with(Arc::new(TracingSink)));

        let settings = RunSettings {
            engine: config.engine.clone(),
            telemetry: config.telemetry.clone(),
            journal_dir: Some(logging::get_log_dir(config_dir)),
        };
        let store_arc = Arc::new(store.clone());
        let runner = Runner::new(
            store_arc.clone(),
            store_arc.clone(),
            sink,
            create_backend(config.engine.backend),
            settings,
        );
        let dispatcher = Dispatcher::new(store_arc, runner);

        tracing::info!("data directory: {}", config_dir.display());
        Ok(Self {
            db,
            store,
            dispatcher,
            events,
            config,
            config_dir: config_dir.to_path_buf(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Stop ticking, let in-flight runs finish, then close the pool
    pub async fn cleanup(&self) {
        tracing::info!("shutting down...");
        self.shutdown.cancel();

        let running = self.dispatcher.running();
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while !running.is_empty() {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!("giving up on {} unfinished runs: {:?}", running.len(), running.ids());
        }

        tracing::debug!("closing database pool...");
        self.db.close().await;
        tracing::info!("shutdown complete");
    }
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        }
    }
}
