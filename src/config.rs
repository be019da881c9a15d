//! Runtime configuration. Read from an optional JSON file; never written back.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// How vanished entries are paired with new files that share their basename.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenamePolicy {
    /// Greedy: first unclaimed candidate in scan order wins.
    #[default]
    ScanOrder,
    /// Only pair when exactly one vanished entry and one candidate share the
    /// basename; anything ambiguous becomes delete + add.
    UniqueOnly,
    /// Never pair; every move is a delete + add.
    Disabled,
}

/// Paths the watcher must never react to (the engine's own artifacts).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IgnorePattern {
    /// Any path component equal to this name.
    Component(String),
    /// File name ending with this suffix.
    Suffix(String),
    /// Anything at or below this root-relative path.
    Prefix(PathBuf),
}

impl IgnorePattern {
    /// Match against a path relative to the watched root, so that components
    /// of the root itself never count.
    pub fn matches(&self, rel: &Path) -> bool {
        match self {
            IgnorePattern::Component(name) => rel.components().any(|c| match c {
                Component::Normal(part) => part == name.as_str(),
                _ => false,
            }),
            IgnorePattern::Suffix(suffix) => rel
                .file_name()
                .map(|n| n.to_string_lossy().ends_with(suffix.as_str()))
                .unwrap_or(false),
            IgnorePattern::Prefix(prefix) => rel.starts_with(prefix),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub debounce_ms: u64,
    /// Catalog database file name, created inside the library root.
    pub catalog_file: String,
    /// Thumbnail directory name, created inside the library root.
    pub thumbnail_dir: String,
    pub scan_skip_dirs: Vec<String>,
    pub watch_ignore: Vec<IgnorePattern>,
    pub extract_workers: usize,
    pub rename_policy: RenamePolicy,
}

impl Default for Config {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(4);
        Self {
            debounce_ms: 300,
            catalog_file: "media_cache.db".into(),
            thumbnail_dir: ".thumbnails".into(),
            scan_skip_dirs: [".thumbnails", "thumbnails", "cache", ".git", "node_modules", ".vscode"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            watch_ignore: vec![
                IgnorePattern::Component("media_cache.db".into()),
                IgnorePattern::Component(".thumbnails".into()),
                IgnorePattern::Component("thumbnails".into()),
                IgnorePattern::Component("cache".into()),
                IgnorePattern::Suffix(".db".into()),
                IgnorePattern::Suffix(".db-journal".into()),
                IgnorePattern::Suffix(".db-shm".into()),
                IgnorePattern::Suffix(".db-wal".into()),
            ],
            extract_workers: workers,
            rename_policy: RenamePolicy::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn catalog_path(&self, root: &Path) -> PathBuf {
        root.join(&self.catalog_file)
    }

    pub fn thumbnail_path(&self, root: &Path) -> PathBuf {
        root.join(&self.thumbnail_dir)
    }

    /// A single-component `thumbnail_dir` is a bare name; anything longer
    /// is a path relative to the root.
    fn nested_thumbnail_dir(&self) -> Option<&Path> {
        let dir = Path::new(&self.thumbnail_dir);
        (dir.components().count() > 1).then_some(dir)
    }

    /// `rel` is the directory's path relative to the library root. Skip-list
    /// names match at any depth.
    pub fn is_skipped_dir(&self, rel: &Path) -> bool {
        if let Some(nested) = self.nested_thumbnail_dir() {
            if rel == nested {
                return true;
            }
        }
        let Some(name) = rel.file_name() else {
            return false;
        };
        let name = name.to_string_lossy();
        (self.nested_thumbnail_dir().is_none() && name == self.thumbnail_dir.as_str())
            || self.scan_skip_dirs.iter().any(|d| *d == name)
    }

    /// Watch-ignore patterns, always including the configured catalog file
    /// (plus its journal files) and thumbnail directory even if the user's
    /// list leaves them out.
    pub fn effective_watch_ignore(&self) -> Vec<IgnorePattern> {
        let mut patterns = self.watch_ignore.clone();
        let own = [
            IgnorePattern::Component(self.catalog_file.clone()),
            match self.nested_thumbnail_dir() {
                Some(nested) => IgnorePattern::Prefix(nested.to_path_buf()),
                None => IgnorePattern::Component(self.thumbnail_dir.clone()),
            },
            IgnorePattern::Suffix(format!("{}-journal", self.catalog_file)),
            IgnorePattern::Suffix(format!("{}-wal", self.catalog_file)),
            IgnorePattern::Suffix(format!("{}-shm", self.catalog_file)),
        ];
        for p in own {
            if !patterns.contains(&p) {
                patterns.push(p);
            }
        }
        patterns
    }
}
