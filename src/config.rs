//! Application configuration, stored as sections of `config.json` in the data directory

use crate::core::backend::BackendKind;
use crate::core::diff::CompareStrategy;
use crate::core::walker::WalkConfig;
use crate::logging::LogConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";
const APP_DIR_NAME: &str = "archsync";

fn read_document(config_dir: &Path) -> Option<serde_json::Value> {
    let content = fs::read_to_string(config_dir.join(CONFIG_FILE)).ok()?;
    serde_json::from_str(&content).ok()
}

/// Read one section; a missing file, key or malformed value yields the default
pub fn load_section<T: DeserializeOwned + Default>(config_dir: &Path, key: &str) -> T {
    read_document(config_dir)
        .and_then(|doc| doc.get(key).cloned())
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default()
}

/// Write one section, leaving the rest of the document untouched
pub fn save_section<T: Serialize>(config_dir: &Path, key: &str, section: &T) -> io::Result<()> {
    let mut doc = read_document(config_dir)
        .filter(|doc| doc.is_object())
        .unwrap_or_else(|| serde_json::json!({}));
    doc[key] = serde_json::to_value(section)?;

    fs::create_dir_all(config_dir)?;
    fs::write(config_dir.join(CONFIG_FILE), serde_json::to_string_pretty(&doc)?)
}

/// Default location of the data directory
pub fn default_data_dir() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(".archsync"))
}

/// Data directory, honouring a `data_path` override in the default config file
pub fn resolve_data_dir() -> PathBuf {
    let default_dir = default_data_dir();
    read_document(&default_dir)
        .and_then(|doc| doc.get("data_path")?.as_str().map(PathBuf::from))
        .filter(|p| p.is_dir())
        .inspect(|p| tracing::debug!("using custom data path: {:?}", p))
        .unwrap_or(default_dir)
}

/// Transfer engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Files transferred in parallel within one run
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_transfers: usize,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub compare: CompareStrategy,
    /// Glob patterns skipped on both sides
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub follow_links: bool,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: default_max_concurrent(),
            backend: BackendKind::default(),
            compare: CompareStrategy::default(),
            exclude_patterns: Vec::new(),
            follow_links: true,
        }
    }
}

impl EngineConfig {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "engine")
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "engine", self)
    }

    pub fn walk_config(&self) -> WalkConfig {
        WalkConfig {
            exclude_patterns: self.exclude_patterns.clone(),
            follow_links: self.follow_links,
            skip_dirs: Vec::new(),
        }
    }
}

/// Progress and execution-log settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryConfig {
    /// Smoothing factor of the throughput average
    #[serde(default = "default_alpha")]
    pub ema_alpha: f64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Outcomes buffered before the execution log is flushed
    #[serde(default = "default_batch_size")]
    pub log_batch_size: usize,
    /// Write a plain-text journal per run
    #[serde(default = "default_true")]
    pub journal: bool,
}

fn default_alpha() -> f64 {
    crate::core::throughput::DEFAULT_ALPHA
}

fn default_heartbeat_ms() -> u64 {
    500
}

fn default_batch_size() -> usize {
    crate::core::aggregator::DEFAULT_BATCH_SIZE
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            ema_alpha: default_alpha(),
            heartbeat_ms: default_heartbeat_ms(),
            log_batch_size: default_batch_size(),
            journal: true,
        }
    }
}

impl TelemetryConfig {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "telemetry")
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "telemetry", self)
    }
}

/// Every section of `config.json`
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub telemetry: TelemetryConfig,
    pub log: LogConfig,
}

impl AppConfig {
    pub fn load(config_dir: &Path) -> Self {
        Self {
            engine: EngineConfig::load(config_dir),
            telemetry: TelemetryConfig::load(config_dir),
            log: LogConfig::load(config_dir),
        }
    }
}
