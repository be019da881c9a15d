//! Error types, one enum per failure domain.

use std::path::PathBuf;

use thiserror::Error;

use crate::sync_state::SyncState;

/// Fatal scan failures. Unreadable subdirectories are logged and skipped
/// by the scanner instead.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("cannot read library root {path}: {source}")]
    Root {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("library root {0} is not a directory")]
    NotADirectory(PathBuf),
}

/// Per-item metadata extraction failure. Never aborts a pass.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("failed to decode {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("{tool} failed for {path}: {message}")]
    Tool {
        tool: &'static str,
        path: PathBuf,
        message: String,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Catalog store failures.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("failed to open catalog at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("catalog query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("corrupt tag list for {path}: {source}")]
    Tags {
        path: String,
        source: serde_json::Error,
    },

    #[error("unknown media type {0:?} in catalog")]
    MediaType(String),

    #[error("no catalog entry for {0}")]
    NotFound(PathBuf),

    #[error("{0} is not a video; bookmarks apply to videos only")]
    NotAVideo(PathBuf),
}

#[derive(Error, Debug)]
pub enum WatcherSetupError {
    #[error("failed to create filesystem watcher: {0}")]
    Create(#[source] notify::Error),

    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        source: notify::Error,
    },

    #[error("failed to spawn watcher thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Refusals from the sync state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("catalog is busy ({0})")]
    Busy(SyncState),

    #[error("catalog is in an error state; an explicit retry is required")]
    RetryRequired,
}

/// Pass-level failure of one reconciliation.
#[derive(Error, Debug)]
pub enum PassError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("library root was switched; pass discarded")]
    Superseded,

    #[error("no library root is open")]
    NoRoot,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}
