//! Logging - size-capped log file and its configuration

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Log configuration (`log` section of `config.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Rotation threshold of `app.log`, in MB
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// "error", "warn", "info", "debug" or "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    pub fn load(config_dir: &Path) -> Self {
        crate::config::load_section(config_dir, "log")
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        crate::config::save_section(config_dir, "log", self)
    }

    /// Configured level as a tracing level; unknown values mean `info`
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// `app.log` writer that moves the file to `app.log.old` once it grows past
/// the limit. Meant to sit behind `tracing_appender::non_blocking`, which
/// gives it a single writer thread.
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    written: u64,
    writer: BufWriter<File>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join("app.log");
        let max_size = (max_size_mb.max(1) as u64) * 1024 * 1024;

        if fs::metadata(&file_path).map(|m| m.len() > max_size).unwrap_or(false) {
            Self::rotate_log(&file_path)?;
        }
        let (writer, written) = Self::open_file(&file_path)?;

        Ok(Self {
            file_path,
            max_size,
            written,
            writer,
        })
    }

    fn open_file(file_path: &Path) -> io::Result<(BufWriter<File>, u64)> {
        let file = OpenOptions::new().create(true).append(true).open(file_path)?;
        let len = file.metadata()?.len();
        Ok((BufWriter::new(file), len))
    }

    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(file_path, &backup_path)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        Self::rotate_log(&self.file_path)?;
        let (writer, written) = Self::open_file(&self.file_path)?;
        self.writer = writer;
        self.written = written;
        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.writer.flush()?;
        self.written += n as u64;

        if self.written > self.max_size {
            self.rotate()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Where `app.log` and the run journals live
pub fn get_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_level_parsing() {
        let mut config = LogConfig::default();
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
        config.level = "DEBUG".into();
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
        config.level = "loud".into();
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_rotation() {
        let dir = TempDir::new().unwrap();
        let mut writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();

        let chunk = vec![b'x'; 600 * 1024];
        writer.write_all(&chunk).unwrap();
        assert!(!dir.path().join("app.log.old").exists());

        writer.write_all(&chunk).unwrap();
        assert!(dir.path().join("app.log.old").exists());
        assert_eq!(fs::metadata(dir.path().join("app.log")).unwrap().len(), 0);

        writer.write_all(b"after rotation\n").unwrap();
        let current = fs::read_to_string(dir.path().join("app.log")).unwrap();
        assert_eq!(current, "after rotation\n");
    }

    #[test]
    fn test_config_roundtrip_through_file() {
        let dir = TempDir::new().unwrap();
        let config = LogConfig {
            enabled: false,
            max_size_mb: 10,
            level: "warn".into(),
        };
        config.save(dir.path()).unwrap();
        assert_eq!(LogConfig::load(dir.path()), config);
    }
}
