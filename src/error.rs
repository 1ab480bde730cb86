//! Error types for the archival / sync engine.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The source root could not be enumerated. Aborts the run.
    #[error("source root is unreadable: {path}: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The destination (or recycle) root could not be created. Aborts the run.
    #[error("destination is not writable: {path}: {source}")]
    DestinationUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single file failed to transfer; recorded as an `error` outcome.
    #[error("{path}: {source}")]
    PerFileIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The execution log store rejected a write.
    #[error("execution log persistence failed: {0}")]
    Persistence(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("schedule {0} is already running")]
    AlreadyRunning(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether this error ends a run instead of being recorded as data.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::RootUnreadable { .. } | SyncError::DestinationUnwritable { .. }
        )
    }
}

impl serde::Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_fatal_classification() {
        let root = SyncError::RootUnreadable {
            path: PathBuf::from("/src"),
            source: Error::new(ErrorKind::NotFound, "gone"),
        };
        assert!(root.is_fatal());

        let dest = SyncError::DestinationUnwritable {
            path: PathBuf::from("/dst"),
            source: Error::new(ErrorKind::PermissionDenied, "denied"),
        };
        assert!(dest.is_fatal());

        let file = SyncError::PerFileIo {
            path: "a.txt".to_string(),
            source: Error::new(ErrorKind::Other, "boom"),
        };
        assert!(!file.is_fatal());
        assert!(!SyncError::Persistence("disk full".into()).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::PerFileIo {
            path: "docs/a.txt".to_string(),
            source: Error::new(ErrorKind::Other, "read failed"),
        };
        assert_eq!(err.to_string(), "docs/a.txt: read failed");

        let err = SyncError::AlreadyRunning("42".to_string());
        assert_eq!(err.to_string(), "schedule 42 is already running");
    }
}
