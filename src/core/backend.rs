//! Bytes-on-wire backends used by the transfer executor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;

/// Which backend performs the copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Portable async stream copy
    #[default]
    Stream,
    /// Delegate to the platform copy tool
    Native,
}

/// File operations behind the transfer executor
#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// Copy `from` to `to`, replacing it. The parent of `to` already exists.
    /// Returns the number of bytes written.
    async fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64>;

    /// Hard-delete a destination file
    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path).await
    }

    /// Move a file, replacing the target. The parent of `to` already exists.
    async fn move_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        match fs::rename(from, to).await {
            Ok(()) => Ok(()),
            Err(e) if is_cross_device(&e) => {
                debug!("rename across devices, falling back to copy: {}", from.display());
                self.copy_file(from, to).await?;
                fs::remove_file(from).await
            }
            Err(e) => Err(e),
        }
    }

    /// Backend name (for logs)
    fn name(&self) -> &str;
}

/// Build the configured backend
pub fn create_backend(kind: BackendKind) -> Arc<dyn TransferBackend> {
    match kind {
        BackendKind::Stream => Arc::new(StreamCopyBackend::default()),
        BackendKind::Native => Arc::new(NativeCopyBackend::default()),
    }
}

fn is_cross_device(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(EXDEV)
    }
    #[cfg(not(unix))]
    {
        e.raw_os_error() == Some(17) // ERROR_NOT_SAME_DEVICE
    }
}

#[cfg(unix)]
const EXDEV: i32 = 18;

/// Suffix of the temporary sibling a copy is written to before the rename
pub const PART_SUFFIX: &str = ".archsync-part";

/// Temporary sibling used for atomic replacement
fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PART_SUFFIX);
    target.with_file_name(name)
}

/// Portable byte-stream copy: write to a temporary sibling, then rename into place
#[derive(Debug, Clone)]
pub struct StreamCopyBackend {
    buffer_size: usize,
}

impl Default for StreamCopyBackend {
    fn default() -> Self {
        Self {
            buffer_size: 256 * 1024,
        }
    }
}

impl StreamCopyBackend {
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self { buffer_size }
    }

    async fn copy_to_temp(&self, from: &Path, temp: &Path) -> io::Result<u64> {
        let reader = fs::File::open(from).await?;
        let writer = fs::File::create(temp).await?;

        let mut reader = BufReader::with_capacity(self.buffer_size, reader);
        let mut writer = BufWriter::with_capacity(self.buffer_size, writer);
        let copied = tokio::io::copy_buf(&mut reader, &mut writer).await?;
        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        Ok(copied)
    }
}

#[async_trait]
impl TransferBackend for StreamCopyBackend {
    async fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64> {
        let temp = temp_path_for(to);
        let result = match self.copy_to_temp(from, &temp).await {
            Ok(copied) => fs::rename(&temp, to).await.map(|_| copied),
            Err(e) => Err(e),
        };

        if result.is_err() {
            let _ = fs::remove_file(&temp).await;
        }
        result
    }

    fn name(&self) -> &str {
        "stream"
    }
}

/// Delegates each copy to the platform tool (`cp` / `robocopy`)
#[derive(Debug, Clone, Default)]
pub struct NativeCopyBackend;

impl NativeCopyBackend {
    #[cfg(not(windows))]
    fn command(from: &Path, to: &Path) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("cp");
        cmd.arg("-p").arg("--").arg(from).arg(to);
        cmd
    }

    #[cfg(windows)]
    fn command(from: &Path, to: &Path) -> tokio::process::Command {
        // robocopy copies by directory + file name; /R and /W keep retries short
        let mut cmd = tokio::process::Command::new("robocopy");
        cmd.arg(from.parent().unwrap_or(Path::new(".")))
            .arg(to.parent().unwrap_or(Path::new(".")))
            .arg(from.file_name().unwrap_or_default())
            .args(["/R:2", "/W:1", "/NJH", "/NJS", "/NP"]);
        cmd
    }

    fn succeeded(status: std::process::ExitStatus) -> bool {
        if cfg!(windows) {
            // robocopy: 0-7 are success codes, 8 and above are failures
            status.code().map_or(false, |code| code <= 7)
        } else {
            status.success()
        }
    }
}

#[async_trait]
impl TransferBackend for NativeCopyBackend {
    async fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64> {
        let output = Self::command(from, to)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !Self::succeeded(output.status) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("copy tool failed ({}): {}", output.status, stderr.trim()),
            ));
        }

        Ok(fs::metadata(to).await?.len())
    }

    fn name(&self) -> &str {
        if cfg!(windows) {
            "robocopy"
        } else {
            "cp"
        }
    }
}
