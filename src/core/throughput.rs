//! Smoothed transfer rate, percent complete and ETA

use std::time::{Duration, Instant};

/// Floor for the sampling interval, so bursts of completions inside one
/// clock tick do not divide by zero
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(1);

pub const DEFAULT_ALPHA: f64 = 0.15;

/// Point-in-time view of a run's progress
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub current_file: String,
    pub files_done: u64,
    pub total_files: u64,
    pub bytes_copied: u64,
    pub total_bytes: u64,
    pub percent: u8,
    pub speed_bps: f64,
    pub raw_speed_bps: f64,
    pub eta_seconds: Option<u64>,
}

/// Exponential moving average over per-file completion samples
#[derive(Debug, Clone)]
pub struct ThroughputEstimator {
    alpha: f64,
    total_files: u64,
    total_bytes: u64,
    copied_bytes: u64,
    files_done: u64,
    last_sample: Instant,
    ema: Option<f64>,
    raw_rate: f64,
    current_file: String,
    started_at: Instant,
}

impl ThroughputEstimator {
    pub fn new(alpha: f64, now: Instant) -> Self {
        Self {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            total_files: 0,
            total_bytes: 0,
            copied_bytes: 0,
            files_done: 0,
            last_sample: now,
            ema: None,
            raw_rate: 0.0,
            current_file: String::new(),
            started_at: now,
        }
    }

    /// Reset the clock and set the totals announced by the `start` event
    pub fn start(&mut self, total_files: u64, total_bytes: u64, now: Instant) {
        self.total_files = total_files;
        self.total_bytes = total_bytes;
        self.last_sample = now;
        self.started_at = now;
    }

    pub fn set_current_file(&mut self, path: impl Into<String>) {
        self.current_file = path.into();
    }

    /// Feed one completed file. `bytes` is what was copied for it (0 for
    /// deletions and failures); every completion still advances the file count.
    pub fn on_file_complete(&mut self, bytes: u64, now: Instant) -> ProgressSnapshot {
        self.files_done += 1;
        self.copied_bytes += bytes;

        let elapsed = now
            .saturating_duration_since(self.last_sample)
            .max(MIN_SAMPLE_INTERVAL);
        let rate = bytes as f64 / elapsed.as_secs_f64();
        self.last_sample = now;
        self.raw_rate = rate;

        self.ema = Some(match self.ema {
            None => rate,
            Some(prev) => self.alpha * rate + (1.0 - self.alpha) * prev,
        });

        self.snapshot()
    }

    /// Re-emit the current state without taking a new sample
    pub fn heartbeat(&self) -> ProgressSnapshot {
        self.snapshot()
    }

    pub fn speed(&self) -> f64 {
        self.ema.unwrap_or(0.0)
    }

    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        let pct = (self.copied_bytes as f64 / self.total_bytes as f64 * 100.0).floor();
        pct.min(100.0) as u8
    }

    pub fn eta_seconds(&self) -> Option<u64> {
        let ema = self.ema.filter(|e| *e > 0.0)?;
        let remaining = self.total_bytes.saturating_sub(self.copied_bytes);
        Some((remaining as f64 / ema).floor() as u64)
    }

    pub fn copied_bytes(&self) -> u64 {
        self.copied_bytes
    }

    pub fn files_done(&self) -> u64 {
        self.files_done
    }

    /// Wall time since `start`
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    /// Overall average rate since `start`, bytes per second
    pub fn average_speed(&self, now: Instant) -> f64 {
        let secs = self.elapsed(now).max(MIN_SAMPLE_INTERVAL).as_secs_f64();
        self.copied_bytes as f64 / secs
    }

    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            current_file: self.current_file.clone(),
            files_done: self.files_done,
            total_files: self.total_files,
            bytes_copied: self.copied_bytes,
            total_bytes: self.total_bytes,
            percent: self.percent(),
            speed_bps: self.speed(),
            raw_speed_bps: self.raw_rate,
            eta_seconds: self.eta_seconds(),
        }
    }
}

/// Human-readable rate, e.g. `1.50 MB/s`
pub fn format_rate(bytes_per_sec: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    if bytes_per_sec >= GB {
        format!("{:.2} GB/s", bytes_per_sec / GB)
    } else if bytes_per_sec >= MB {
        format!("{:.2} MB/s", bytes_per_sec / MB)
    } else if bytes_per_sec >= KB {
        format!("{:.2} KB/s", bytes_per_sec / KB)
    } else {
        format!("{:.2} B/s", bytes_per_sec.max(0.0))
    }
}
