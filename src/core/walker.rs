//! Tree walker - enumerates the regular files under a root directory

use crate::error::{SyncError, SyncResult};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// One regular file found by a walk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Path relative to the walk root, always `/`-separated
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size_bytes: u64,
}

/// A subtree or file that could not be read; the walk continues past it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkWarning {
    pub path: PathBuf,
    pub message: String,
}

/// Walker configuration
#[derive(Debug, Clone)]
pub struct WalkConfig {
    /// Exclusion rules (glob patterns, matched against the relative path)
    pub exclude_patterns: Vec<String>,
    /// Follow symbolic links; cycles are reported as warnings
    pub follow_links: bool,
    /// Absolute directories never descended into
    pub skip_dirs: Vec<PathBuf>,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: Vec::new(),
            follow_links: true,
            skip_dirs: Vec::new(),
        }
    }
}

/// Result of a complete walk
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub entries: Vec<FileEntry>,
    pub skipped: Vec<WalkWarning>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }
}

/// Recursive directory walker
#[derive(Debug, Clone)]
pub struct TreeWalker {
    root: PathBuf,
    config: WalkConfig,
    excludes: Vec<Regex>,
}

impl TreeWalker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_config(root, WalkConfig::default())
    }

    pub fn with_config(root: impl Into<PathBuf>, config: WalkConfig) -> Self {
        let excludes = config
            .exclude_patterns
            .iter()
            .filter_map(|p| match glob_to_regex(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("ignoring invalid exclude pattern {:?}: {}", p, e);
                    None
                }
            })
            .collect();

        Self {
            root: root.into(),
            config,
            excludes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily enumerate the tree. Every call restarts from the root.
    ///
    /// Fails only when the root itself cannot be read; problems below the
    /// root are yielded as `Err(WalkWarning)` items.
    pub fn entries(&self) -> SyncResult<impl Iterator<Item = Result<FileEntry, WalkWarning>> + '_> {
        std::fs::read_dir(&self.root).map_err(|source| SyncError::RootUnreadable {
            path: self.root.clone(),
            source,
        })?;

        let skip_dirs = &self.config.skip_dirs;
        let iter = WalkDir::new(&self.root)
            .follow_links(self.config.follow_links)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| !(e.file_type().is_dir() && skip_dirs.iter().any(|d| d == e.path())))
            .filter_map(move |item| self.to_entry(item));

        Ok(iter)
    }

    fn to_entry(&self, item: walkdir::Result<walkdir::DirEntry>) -> Option<Result<FileEntry, WalkWarning>> {
        let entry = match item {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.root.clone());
                return Some(Err(WalkWarning {
                    path,
                    message: e.to_string(),
                }));
            }
        };

        if !entry.file_type().is_file() {
            return None;
        }

        let relative = entry.path().strip_prefix(&self.root).ok()?;
        let relative_path = normalize_path(relative);
        if self.is_excluded(&relative_path) {
            debug!("excluded: {}", relative_path);
            return None;
        }

        match entry.metadata() {
            Ok(metadata) => Some(Ok(FileEntry {
                relative_path,
                absolute_path: entry.path().to_path_buf(),
                size_bytes: metadata.len(),
            })),
            Err(e) => Some(Err(WalkWarning {
                path: entry.path().to_path_buf(),
                message: e.to_string(),
            })),
        }
    }

    fn is_excluded(&self, relative_path: &str) -> bool {
        let lowered = relative_path.to_lowercase();
        self.excludes.iter().any(|re| re.is_match(&lowered))
    }

    /// Walk the whole tree on the blocking pool
    pub async fn snapshot(&self) -> SyncResult<Snapshot> {
        let walker = self.clone();
        let snapshot = tokio::task::spawn_blocking(move || walker.snapshot_blocking())
            .await
            .map_err(|e| SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        Ok(snapshot)
    }

    /// Like [`snapshot`](Self::snapshot), but a missing root yields an empty snapshot
    pub async fn snapshot_or_empty(&self) -> SyncResult<Snapshot> {
        match tokio::fs::metadata(&self.root).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} does not exist yet, treating as empty", self.root.display());
                Ok(Snapshot::default())
            }
            _ => self.snapshot().await,
        }
    }

    fn snapshot_blocking(&self) -> SyncResult<Snapshot> {
        let mut snapshot = Snapshot::default();
        for item in self.entries()? {
            match item {
                Ok(entry) => snapshot.entries.push(entry),
                Err(warning) => {
                    warn!("skipped {}: {}", warning.path.display(), warning.message);
                    snapshot.skipped.push(warning);
                }
            }
        }

        info!(
            "walk of {} done: {} files, {} skipped",
            self.root.display(),
            snapshot.entries.len(),
            snapshot.skipped.len()
        );
        Ok(snapshot)
    }
}

/// Join the components of a relative path with `/`.
///
/// Only the platform separator splits components, so a backslash inside a Unix
/// file name stays part of that name.
fn normalize_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Translate a simple glob into an anchored, case-insensitive-ready regex.
///
/// `prefix/**` matches everything below `prefix`, `**/suffix` matches at any
/// depth, `*` matches within one component, and a bare name matches that
/// file anywhere in the tree.
fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let pattern = pattern.to_lowercase();
    let mut out = String::from("^");

    if !pattern.contains('/') {
        out.push_str("(?:.*/)?");
    }

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    out.push('$');
    Regex::new(&out)
}
