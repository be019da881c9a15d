//! Catalog data model: entries, scan results and the diff a pass commits.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::media::MediaType;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    pub description: String,
    pub timestamp_seconds: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaEntry {
    pub path: PathBuf,
    pub title: String,
    pub media_type: MediaType,
    /// Only ever set for videos.
    pub duration_seconds: Option<f64>,
    pub thumbnail_ref: Option<String>,
    pub tags: BTreeSet<String>,
    pub bookmarks: Vec<Bookmark>,
}

impl MediaEntry {
    /// Fresh entry for a newly discovered file: no tags, no bookmarks.
    pub fn new(
        item: &ScanItem,
        duration_seconds: Option<f64>,
        thumbnail_ref: Option<String>,
    ) -> Self {
        let duration_seconds = match item.media_type {
            MediaType::Video => duration_seconds,
            MediaType::Image => None,
        };
        Self {
            path: item.path.clone(),
            title: item.title(),
            media_type: item.media_type,
            duration_seconds,
            thumbnail_ref,
            tags: BTreeSet::new(),
            bookmarks: Vec::new(),
        }
    }

    pub fn basename(&self) -> Option<&std::ffi::OsStr> {
        self.path.file_name()
    }
}

/// Mapping `path -> entry`. Keyed by path so one entry per path holds by
/// construction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Catalog {
    entries: BTreeMap<PathBuf, MediaEntry>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = MediaEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.path.clone(), e)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn get(&self, path: &Path) -> Option<&MediaEntry> {
        self.entries.get(path)
    }

    pub fn get_mut(&mut self, path: &Path) -> Option<&mut MediaEntry> {
        self.entries.get_mut(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MediaEntry> {
        self.entries.values()
    }

    pub fn insert(&mut self, entry: MediaEntry) -> Option<MediaEntry> {
        self.entries.insert(entry.path.clone(), entry)
    }

    pub fn remove(&mut self, path: &Path) -> Option<MediaEntry> {
        self.entries.remove(path)
    }

    /// Move the entry at `from` to `to`, carrying tags and bookmarks.
    /// Returns false if there is nothing at `from`.
    pub fn rename(&mut self, from: &Path, to: &Path) -> bool {
        match self.entries.remove(from) {
            Some(mut entry) => {
                entry.path = to.to_path_buf();
                self.entries.insert(entry.path.clone(), entry);
                true
            }
            None => false,
        }
    }

    pub fn into_entries(self) -> Vec<MediaEntry> {
        self.entries.into_values().collect()
    }
}

/// One media file found by a filesystem walk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanItem {
    pub path: PathBuf,
    pub basename: OsString,
    pub media_type: MediaType,
}

impl ScanItem {
    pub fn new(path: PathBuf, media_type: MediaType) -> Self {
        let basename = path.file_name().map(OsString::from).unwrap_or_default();
        Self {
            path,
            basename,
            media_type,
        }
    }

    pub fn title(&self) -> String {
        self.basename.to_string_lossy().into_owned()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ScanResult {
    pub root: PathBuf,
    /// Walk order (sorted by file name within each directory).
    pub items: Vec<ScanItem>,
    /// Subdirectories that could not be read and were left out.
    pub skipped_dirs: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rename {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// Everything a pass wants to change in the store, committed as one unit.
#[derive(Clone, Debug, Default)]
pub struct CatalogDiff {
    pub renamed: Vec<Rename>,
    pub removed: Vec<PathBuf>,
    pub inserted: Vec<MediaEntry>,
}

impl CatalogDiff {
    pub fn is_empty(&self) -> bool {
        self.renamed.is_empty() && self.removed.is_empty() && self.inserted.is_empty()
    }
}
