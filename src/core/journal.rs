//! Plain-text journal written alongside each run

use crate::db::{SyncMode, TransferOutcome};
use chrono::{DateTime, Local, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

/// `logs/log_<mode>_<name>_<timestamp>.txt`, one per run.
/// Runs starting in the same millisecond get a `_<n>` suffix.
pub struct RunJournal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl RunJournal {
    pub async fn create(
        log_dir: &Path,
        mode: SyncMode,
        name: &str,
        source: &str,
        destination: &str,
        started_at: DateTime<Utc>,
    ) -> io::Result<Self> {
        fs::create_dir_all(log_dir).await?;

        let local = started_at.with_timezone(&Local);
        let stem = format!("log_{}_{}_{}", mode, sanitize(name), local.format("%Y%m%d_%H%M%S_%3f"));
        let (path, file) = create_unique(log_dir, &stem).await?;

        let mut journal = Self {
            path,
            writer: BufWriter::new(file),
        };
        journal
            .line(&format!(
                "{} run started {}\nsource: {}\ndestination: {}\n",
                mode,
                local.format("%Y-%m-%d %H:%M:%S"),
                source,
                destination
            ))
            .await?;
        Ok(journal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn outcome(&mut self, percent: u8, outcome: &TransferOutcome) -> io::Result<()> {
        let line = match &outcome.error_message {
            Some(message) => format!("[{:>2}%] {}: {} ({})", percent, outcome.status, outcome.path, message),
            None => format!("[{:>2}%] {}: {}", percent, outcome.status, outcome.path),
        };
        self.line(&line).await
    }

    /// Footer for a run that reached `complete`
    pub async fn completed(mut self, files: u64, bytes: u64, end: DateTime<Utc>) -> io::Result<()> {
        let footer = format!(
            "\ncompleted {}: {} files, {} bytes",
            end.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            files,
            bytes
        );
        self.line(&footer).await?;
        self.writer.flush().await
    }

    /// Footer for an aborted run
    pub async fn failed(mut self, message: &str, end: DateTime<Utc>) -> io::Result<()> {
        let footer = format!(
            "\nfailed {}: {}",
            end.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            message
        );
        self.line(&footer).await?;
        self.writer.flush().await
    }

    async fn line(&mut self, text: &str) -> io::Result<()> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.write_all(b"\n").await
    }
}

/// Open `<stem>.txt`, or the first free `<stem>_<n>.txt`, never reusing a file
async fn create_unique(log_dir: &Path, stem: &str) -> io::Result<(PathBuf, File)> {
    let mut attempt = 0u32;
    loop {
        let file_name = match attempt {
            0 => format!("{}.txt", stem),
            n => format!("{}_{}.txt", stem, n),
        };
        let path = log_dir.join(file_name);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < 1000 => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Keep file names portable
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}
