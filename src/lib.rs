//! Media catalog reconciliation: keeps a persisted catalog of the media files
//! under a root consistent with the filesystem, across renames, deletions and
//! live changes.

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod jobs;
pub mod library;
pub mod media;
pub mod reconcile;
pub mod scanner;
pub mod sync_state;
pub mod watcher;

pub use catalog::{Bookmark, Catalog, CatalogDiff, MediaEntry, Rename, ScanItem, ScanResult};
pub use config::{Config, IgnorePattern, RenamePolicy};
pub use db::{CatalogStore, Db, MemoryStore};
pub use error::{
    CatalogError, ConfigError, ExtractionError, PassError, ScanError, SyncError, WatcherSetupError,
};
pub use extract::{Extracted, Extractor, ThumbnailExtractor};
pub use jobs::JobStats;
pub use library::{Library, RootSession};
pub use media::{clean_path, is_media, MediaType};
pub use reconcile::{classify, reconcile, Classification, ItemError, Outcome, ReconcileOptions};
pub use scanner::scan;
pub use sync_state::{Origin, PassKind, PassToken, SyncMachine, SyncState};
pub use watcher::{watch, Debouncer, EventFilter, RawEvent, ChangeKind, Trigger, WatchHandle, WatchOptions};
