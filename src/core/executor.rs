//! Transfer executor - walks, diffs and applies one run

use super::backend::{TransferBackend, PART_SUFFIX};
use super::diff::{CompareStrategy, DiffEngine, DiffSummary, Disposition};
use super::events::TransferEvent;
use super::walker::{FileEntry, TreeWalker, WalkConfig};
use crate::db::SyncMode;
use crate::error::{SyncError, SyncResult};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// Lifecycle of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Idle,
    Walking,
    Diffing,
    Transferring,
    Completed,
    Aborted,
}

impl RunPhase {
    /// Strictly sequential; any working phase may abort
    pub fn can_transition_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Idle, Walking)
                | (Walking, Diffing)
                | (Diffing, Transferring)
                | (Transferring, Completed)
                | (Walking, Aborted)
                | (Diffing, Aborted)
                | (Transferring, Aborted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Aborted)
    }
}

/// What happens to extraneous destination files in sync mode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Remove the file
    #[default]
    Hard,
    /// Move it under this directory, keeping its relative path
    Recycle(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: SyncMode,
    pub delete_policy: DeletePolicy,
    pub compare: CompareStrategy,
    /// Applied to both walks, so excluded files are never deleted either
    pub walk: WalkConfig,
    pub max_concurrent: usize,
}

impl RunOptions {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            delete_policy: DeletePolicy::Hard,
            compare: CompareStrategy::default(),
            walk: WalkConfig::default(),
            max_concurrent: 4,
        }
    }

    pub fn with_recycle(mut self, path: impl Into<PathBuf>) -> Self {
        self.delete_policy = DeletePolicy::Recycle(path.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub source_root: PathBuf,
    pub dest_root: PathBuf,
    pub options: RunOptions,
}

impl RunRequest {
    pub fn new(source_root: impl Into<PathBuf>, dest_root: impl Into<PathBuf>, options: RunOptions) -> Self {
        Self {
            source_root: source_root.into(),
            dest_root: dest_root.into(),
            options,
        }
    }
}

/// Result of a run that reached `complete`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub files_processed: u64,
    pub bytes_copied: u64,
    pub files_failed: u64,
    pub diff: DiffSummary,
    pub phases: Vec<RunPhase>,
}

/// One unit of work for the worker pool
#[derive(Debug, Clone)]
enum WorkItem {
    Copy { entry: FileEntry, updated: bool },
    Remove { entry: FileEntry },
}

impl WorkItem {
    fn path(&self) -> &str {
        match self {
            WorkItem::Copy { entry, .. } | WorkItem::Remove { entry } => &entry.relative_path,
        }
    }
}

/// Result of one worker task, for the run summary
struct WorkResult {
    bytes: u64,
    failed: bool,
}

struct PhaseTracker {
    current: RunPhase,
    history: Vec<RunPhase>,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            current: RunPhase::Idle,
            history: vec![RunPhase::Idle],
        }
    }

    fn advance(&mut self, next: RunPhase) {
        debug_assert!(
            self.current.can_transition_to(next),
            "invalid run transition {:?} -> {:?}",
            self.current,
            next
        );
        debug!("run phase {:?} -> {:?}", self.current, next);
        self.current = next;
        self.history.push(next);
    }
}

/// Applies a diff to the destination through a [`TransferBackend`]
#[derive(Clone)]
pub struct TransferExecutor {
    backend: Arc<dyn TransferBackend>,
}

impl TransferExecutor {
    pub fn new(backend: Arc<dyn TransferBackend>) -> Self {
        Self { backend }
    }

    /// Run in the background. Events arrive on the returned stream; the
    /// handle resolves to the terminal result.
    pub fn spawn(
        self,
        request: RunRequest,
        buffer: usize,
    ) -> (ReceiverStream<TransferEvent>, JoinHandle<SyncResult<RunSummary>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(async move { self.execute(request, tx).await });
        (ReceiverStream::new(rx), handle)
    }

    /// Execute one run, emitting events on `tx`.
    ///
    /// Per-file failures become `FileError` events and the run continues.
    /// Root-level failures emit a single `Error` event and return `Err`.
    pub async fn execute(&self, request: RunRequest, tx: mpsc::Sender<TransferEvent>) -> SyncResult<RunSummary> {
        let mut phases = PhaseTracker::new();
        match self.run(&request, &tx, &mut phases).await {
            Ok(mut summary) => {
                phases.advance(RunPhase::Completed);
                summary.phases = phases.history;
                let _ = tx
                    .send(TransferEvent::Complete {
                        total_files: summary.files_processed,
                        total_bytes: summary.bytes_copied,
                    })
                    .await;
                Ok(summary)
            }
            Err(e) => {
                error!("run aborted: {}", e);
                phases.advance(RunPhase::Aborted);
                let _ = tx.send(TransferEvent::Error { message: e.to_string() }).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        request: &RunRequest,
        tx: &mpsc::Sender<TransferEvent>,
        phases: &mut PhaseTracker,
    ) -> SyncResult<RunSummary> {
        let options = &request.options;
        phases.advance(RunPhase::Walking);

        let source = TreeWalker::with_config(&request.source_root, options.walk.clone())
            .snapshot()
            .await?;

        tokio::fs::create_dir_all(&request.dest_root)
            .await
            .map_err(|source| SyncError::DestinationUnwritable {
                path: request.dest_root.clone(),
                source,
            })?;

        let recycle_root = match (&options.mode, &options.delete_policy) {
            (SyncMode::Sync, DeletePolicy::Recycle(path)) => {
                tokio::fs::create_dir_all(path)
                    .await
                    .map_err(|source| SyncError::DestinationUnwritable {
                        path: path.clone(),
                        source,
                    })?;
                Some(path.clone())
            }
            _ => None,
        };

        // links under the destination are never entered, so deletes stay inside it
        let mut dest_walk = options.walk.clone();
        dest_walk.follow_links = false;
        if let Some(recycle) = &recycle_root {
            if let Some(inside) = recycle_inside(&request.dest_root, recycle).await {
                dest_walk.skip_dirs.push(inside);
            }
        }
        let dest = TreeWalker::with_config(&request.dest_root, dest_walk)
            .snapshot_or_empty()
            .await?;

        phases.advance(RunPhase::Diffing);
        let diff = DiffEngine::new(options.compare).compare(&source.entries, &dest.entries);
        debug!(
            "diff: {} new, {} updated, {} unchanged, {} extraneous",
            diff.summary.new_count,
            diff.summary.updated_count,
            diff.summary.unchanged_count,
            diff.summary.extraneous_count
        );

        let mut stale_parts = Vec::new();
        let queue: Vec<WorkItem> = diff
            .entries
            .into_iter()
            .filter_map(|classified| match classified.disposition {
                Disposition::Extraneous if classified.entry.relative_path.ends_with(PART_SUFFIX) => {
                    stale_parts.push(classified.entry);
                    None
                }
                Disposition::New => Some(WorkItem::Copy {
                    entry: classified.entry,
                    updated: false,
                }),
                Disposition::Updated => Some(WorkItem::Copy {
                    entry: classified.entry,
                    updated: true,
                }),
                Disposition::Extraneous if options.mode == SyncMode::Sync => Some(WorkItem::Remove {
                    entry: classified.entry,
                }),
                _ => None,
            })
            .collect();

        for part in stale_parts {
            match self.backend.remove_file(&part.absolute_path).await {
                Ok(()) => debug!("removed interrupted copy {}", part.relative_path),
                Err(e) => warn!("could not remove interrupted copy {}: {}", part.relative_path, e),
            }
        }

        phases.advance(RunPhase::Transferring);
        let total_files = queue.len() as u64;
        let total_bytes = diff.summary.transfer_bytes();
        info!(
            "{} {} -> {}: {} files to process, {} bytes to copy",
            options.mode,
            request.source_root.display(),
            request.dest_root.display(),
            total_files,
            total_bytes
        );
        let _ = tx.send(TransferEvent::Start { total_files, total_bytes }).await;

        let mut summary = self
            .transfer_all(queue, &request.dest_root, recycle_root, options.max_concurrent, tx)
            .await;
        summary.diff = diff.summary;
        Ok(summary)
    }

    async fn transfer_all(
        &self,
        queue: Vec<WorkItem>,
        dest_root: &Path,
        recycle_root: Option<PathBuf>,
        max_concurrent: usize,
        tx: &mpsc::Sender<TransferEvent>,
    ) -> RunSummary {
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let dest_root = Arc::new(dest_root.to_path_buf());
        let recycle_root = Arc::new(recycle_root);
        let mut handles = Vec::with_capacity(queue.len());
        let mut summary = RunSummary::default();

        for item in queue {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let backend = self.backend.clone();
            let dest_root = dest_root.clone();
            let recycle_root = recycle_root.clone();
            let tx = tx.clone();

            let path = item.path().to_string();
            let handle = tokio::spawn(async move {
                let _ = tx.send(TransferEvent::FileStarted { path: item.path().to_string() }).await;
                let event = Self::apply(backend.as_ref(), item, &dest_root, recycle_root.as_deref()).await;
                let result = WorkResult {
                    bytes: match &event {
                        TransferEvent::FileCopied { size_bytes, .. }
                        | TransferEvent::FileUpdated { size_bytes, .. } => *size_bytes,
                        _ => 0,
                    },
                    failed: matches!(event, TransferEvent::FileError { .. }),
                };
                let _ = tx.send(event).await;
                drop(permit);
                result
            });
            handles.push((path, handle));
        }

        for (path, handle) in handles {
            summary.files_processed += 1;
            match handle.await {
                Ok(result) => {
                    summary.bytes_copied += result.bytes;
                    if result.failed {
                        summary.files_failed += 1;
                    }
                }
                Err(e) => {
                    // the worker died before reporting; report on its behalf
                    warn!("transfer task for {} failed: {}", path, e);
                    summary.files_failed += 1;
                    let _ = tx
                        .send(TransferEvent::FileError {
                            path,
                            size_bytes: 0,
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        }

        summary
    }

    /// Perform one work item and turn the result into its outcome event
    async fn apply(
        backend: &dyn TransferBackend,
        item: WorkItem,
        dest_root: &Path,
        recycle_root: Option<&Path>,
    ) -> TransferEvent {
        match item {
            WorkItem::Copy { entry, updated } => {
                let target = join_relative(dest_root, &entry.relative_path);
                match copy_one(backend, &entry.absolute_path, &target).await {
                    Ok(size_bytes) if updated => TransferEvent::FileUpdated {
                        path: entry.relative_path,
                        size_bytes,
                    },
                    Ok(size_bytes) => TransferEvent::FileCopied {
                        path: entry.relative_path,
                        size_bytes,
                    },
                    Err(e) => file_error(entry, e),
                }
            }
            WorkItem::Remove { entry } => {
                let result = match recycle_root {
                    Some(root) => {
                        let target = join_relative(root, &entry.relative_path);
                        move_one(backend, &entry.absolute_path, &target).await
                    }
                    None => backend.remove_file(&entry.absolute_path).await,
                };
                match result {
                    Ok(()) => TransferEvent::FileDeleted {
                        path: entry.relative_path,
                        recycled: recycle_root.is_some(),
                    },
                    Err(e) => file_error(entry, e),
                }
            }
        }
    }
}

async fn copy_one(backend: &dyn TransferBackend, from: &Path, to: &Path) -> std::io::Result<u64> {
    ensure_parent(to).await?;
    backend.copy_file(from, to).await
}

async fn move_one(backend: &dyn TransferBackend, from: &Path, to: &Path) -> std::io::Result<()> {
    ensure_parent(to).await?;
    backend.move_file(from, to).await
}

/// Create the parent directory of `path`; a no-op when it already exists
async fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) => tokio::fs::create_dir_all(parent).await,
        None => Ok(()),
    }
}

fn file_error(entry: FileEntry, source: std::io::Error) -> TransferEvent {
    let err = SyncError::PerFileIo {
        path: entry.relative_path.clone(),
        source,
    };
    warn!("{}", err);
    TransferEvent::FileError {
        path: entry.relative_path,
        size_bytes: entry.size_bytes,
        message: err.to_string(),
    }
}

/// The recycle directory as seen from a walk of `dest_root`, if it lies inside it.
///
/// Both directories exist by now, so they are compared canonically and the
/// remainder is re-joined onto `dest_root` to match the walker's paths.
async fn recycle_inside(dest_root: &Path, recycle: &Path) -> Option<PathBuf> {
    let dest_canon = tokio::fs::canonicalize(dest_root)
        .await
        .unwrap_or_else(|_| dest_root.to_path_buf());
    let recycle_canon = tokio::fs::canonicalize(recycle)
        .await
        .unwrap_or_else(|_| recycle.to_path_buf());
    let rest = recycle_canon.strip_prefix(&dest_canon).ok()?;
    Some(dest_root.join(rest))
}

/// Join a `/`-separated relative path onto a root
pub(crate) fn join_relative(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .fold(root.to_path_buf(), |path, component| path.join(component))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        use RunPhase::*;
        assert!(Idle.can_transition_to(Walking));
        assert!(Walking.can_transition_to(Diffing));
        assert!(Diffing.can_transition_to(Transferring));
        assert!(Transferring.can_transition_to(Completed));
        assert!(Walking.can_transition_to(Aborted));

        assert!(!Idle.can_transition_to(Diffing));
        assert!(!Walking.can_transition_to(Transferring));
        assert!(!Transferring.can_transition_to(Walking));
        assert!(!Completed.can_transition_to(Aborted));
        assert!(!Idle.can_transition_to(Aborted));
        assert!(Completed.is_terminal() && Aborted.is_terminal());
    }

    #[test]
    fn test_join_relative() {
        let root = Path::new("/dst");
        assert_eq!(join_relative(root, "a/b/c.txt"), Path::new("/dst").join("a").join("b").join("c.txt"));
        assert_eq!(join_relative(root, "top.txt"), Path::new("/dst").join("top.txt"));
    }
}
