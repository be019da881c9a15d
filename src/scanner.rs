//! Directory scanner: one walk of a library root, media files only.

use std::path::Path;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::catalog::{ScanItem, ScanResult};
use crate::config::Config;
use crate::error::ScanError;
use crate::media::{clean_path, MediaType};

/// Walk `root` and collect every media file, skipping ignored directories.
///
/// An unreadable subdirectory is logged and its subtree left out; only an
/// unreadable root fails the scan. Nothing is written.
pub fn scan(root: &Path, config: &Config) -> Result<ScanResult, ScanError> {
    let meta = std::fs::metadata(root).map_err(|source| ScanError::Root {
        path: root.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(ScanError::NotADirectory(root.to_path_buf()));
    }
    let root = root
        .canonicalize()
        .map(|p| clean_path(&p))
        .map_err(|source| ScanError::Root {
            path: root.to_path_buf(),
            source,
        })?;

    let mut result = ScanResult {
        root: root.clone(),
        ..ScanResult::default()
    };

    let walker = WalkDir::new(&root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            // Never prune the root itself, whatever its name.
            e.depth() == 0
                || !e.file_type().is_dir()
                || !config.is_skipped_dir(e.path().strip_prefix(&root).unwrap_or(e.path()))
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                // walkdir reports the failing directory and does not descend
                // into it; the rest of the walk continues.
                if e.depth() == 0 {
                    let path = e.path().unwrap_or(&root).to_path_buf();
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("walk failed at root"));
                    return Err(ScanError::Root { path, source });
                }
                warn!(
                    path = %e.path().map(|p| p.display().to_string()).unwrap_or_default(),
                    error = %e,
                    "scan: skipping unreadable entry"
                );
                result.skipped_dirs += 1;
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let Some(media_type) = MediaType::from_path(entry.path()) else {
            continue;
        };

        result
            .items
            .push(ScanItem::new(entry.path().to_path_buf(), media_type));
    }

    debug!(
        root = %root.display(),
        files = result.items.len(),
        skipped = result.skipped_dirs,
        "scan: done"
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn names(result: &ScanResult) -> Vec<String> {
        result
            .items
            .iter()
            .map(|i| {
                i.path
                    .strip_prefix(&result.root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect()
    }

    #[test]
    fn finds_media_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("a.jpg"), b"img").unwrap();
        fs::write(dir.path().join("sub/clip.MP4"), b"vid").unwrap();
        fs::write(dir.path().join("sub/deeper/b.png"), b"img").unwrap();
        fs::write(dir.path().join("notes.txt"), b"text").unwrap();

        let result = scan(dir.path(), &Config::default()).unwrap();
        assert_eq!(names(&result), vec!["a.jpg", "sub/clip.MP4", "sub/deeper/b.png"]);
        assert_eq!(result.items[1].media_type, MediaType::Video);
        assert_eq!(result.items[1].basename, "clip.MP4");
        assert_eq!(result.skipped_dirs, 0);
    }

    #[test]
    fn skips_own_artifacts_and_ignored_dirs() {
        let dir = tempfile::tempdir().unwrap();
        for sub in [".thumbnails", "cache", "node_modules/pkg", "keep"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        fs::write(dir.path().join(".thumbnails/abc.webp"), b"t").unwrap();
        fs::write(dir.path().join("cache/x.jpg"), b"t").unwrap();
        fs::write(dir.path().join("node_modules/pkg/logo.png"), b"t").unwrap();
        fs::write(dir.path().join("keep/y.jpg"), b"t").unwrap();
        fs::write(dir.path().join("media_cache.db"), b"db").unwrap();

        let result = scan(dir.path(), &Config::default()).unwrap();
        assert_eq!(names(&result), vec!["keep/y.jpg"]);
    }

    #[test]
    fn nested_thumbnail_dir_is_not_scanned() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("meta/thumbs")).unwrap();
        fs::write(dir.path().join("meta/thumbs/0af3.webp"), b"t").unwrap();
        fs::write(dir.path().join("meta/cover.jpg"), b"t").unwrap();
        fs::create_dir_all(dir.path().join("trip/thumbs")).unwrap();
        fs::write(dir.path().join("trip/thumbs/beach.jpg"), b"t").unwrap();

        let config = Config {
            thumbnail_dir: "meta/thumbs".into(),
            ..Config::default()
        };
        let result = scan(dir.path(), &config).unwrap();
        assert_eq!(names(&result), vec!["meta/cover.jpg", "trip/thumbs/beach.jpg"]);
    }

    #[test]
    fn root_named_like_ignored_dir_is_still_scanned() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a.gif"), b"g").unwrap();

        let result = scan(&root, &Config::default()).unwrap();
        assert_eq!(result.items.len(), 1);
    }

    #[test]
    fn missing_root_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = scan(&dir.path().join("gone"), &Config::default()).unwrap_err();
        assert!(matches!(err, ScanError::Root { .. }));
    }

    #[test]
    fn file_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.jpg");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            scan(&file, &Config::default()),
            Err(ScanError::NotADirectory(_))
        ));
    }

    #[test]
    fn empty_dir_no_panic() {
        let dir = tempfile::tempdir().unwrap();
        let result = scan(dir.path(), &Config::default()).unwrap();
        assert!(result.items.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_subdir_is_skipped_not_fatal() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("hidden.jpg"), b"x").unwrap();
        fs::write(dir.path().join("open.jpg"), b"x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Root can read anything; the permission trick only bites as a user.
        let readable = fs::read_dir(&locked).is_ok();
        let result = scan(dir.path(), &Config::default());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let result = result.unwrap();
        if !readable {
            assert_eq!(names(&result), vec!["open.jpg"]);
            assert_eq!(result.skipped_dirs, 1);
        }
    }
}
