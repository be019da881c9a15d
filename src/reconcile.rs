//! Reconciliation: diff a fresh scan against the catalog.
//!
//! [`classify`] is the pure part (add/delete/rename/unchanged); [`reconcile`]
//! runs extraction for the new items and produces the updated catalog plus
//! the [`CatalogDiff`] the store commits.

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use tracing::{debug, warn};

use crate::catalog::{Catalog, CatalogDiff, MediaEntry, Rename, ScanItem, ScanResult};
use crate::config::RenamePolicy;
use crate::error::ExtractionError;
use crate::extract::Extractor;
use crate::jobs::{self, JobStats};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Classification {
    pub renamed: Vec<Rename>,
    pub deleted: Vec<PathBuf>,
    /// Scan items needing extraction, in scan order.
    pub added: Vec<ScanItem>,
    pub unchanged: usize,
}

/// Sort catalog and scan into renamed / deleted / new / unchanged.
pub fn classify(catalog: &Catalog, scan: &ScanResult, policy: RenamePolicy) -> Classification {
    let scanned: HashSet<&Path> = scan.items.iter().map(|i| i.path.as_path()).collect();

    // Rename candidates: scan items at paths the catalog does not know yet,
    // grouped by basename in scan order.
    let mut candidates: HashMap<&OsStr, Vec<usize>> = HashMap::new();
    for (idx, item) in scan.items.iter().enumerate() {
        if !catalog.contains(&item.path) {
            candidates.entry(item.basename.as_os_str()).or_default().push(idx);
        }
    }

    let vanished: Vec<&MediaEntry> = catalog
        .iter()
        .filter(|e| !scanned.contains(e.path.as_path()))
        .collect();

    let mut vanished_per_name: HashMap<&OsStr, usize> = HashMap::new();
    if policy == RenamePolicy::UniqueOnly {
        for e in &vanished {
            if let Some(name) = e.basename() {
                *vanished_per_name.entry(name).or_default() += 1;
            }
        }
    }

    let mut out = Classification::default();
    let mut claimed: HashSet<usize> = HashSet::new();

    for entry in vanished {
        let pick = entry.basename().and_then(|name| {
            let slots = candidates.get(name)?;
            match policy {
                RenamePolicy::Disabled => None,
                RenamePolicy::ScanOrder => slots.iter().copied().find(|i| !claimed.contains(i)),
                RenamePolicy::UniqueOnly => {
                    let unique = slots.len() == 1 && vanished_per_name.get(name) == Some(&1);
                    unique.then(|| slots[0])
                }
            }
        });

        match pick {
            Some(idx) => {
                claimed.insert(idx);
                out.renamed.push(Rename {
                    from: entry.path.clone(),
                    to: scan.items[idx].path.clone(),
                });
            }
            None => out.deleted.push(entry.path.clone()),
        }
    }

    for (idx, item) in scan.items.iter().enumerate() {
        if catalog.contains(&item.path) {
            out.unchanged += 1;
        } else if !claimed.contains(&idx) {
            out.added.push(item.clone());
        }
    }

    out
}

#[derive(Debug)]
pub struct ItemError {
    pub path: PathBuf,
    pub error: ExtractionError,
}

#[derive(Debug, Default)]
pub struct Outcome {
    pub added: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    pub renamed: Vec<Rename>,
    pub unchanged: usize,
    /// Extraction failures; those items are not in `catalog`.
    pub errors: Vec<ItemError>,
    /// New items skipped because the pass was cancelled.
    pub skipped: usize,
    pub catalog: Catalog,
    pub diff: CatalogDiff,
}

impl Outcome {
    pub fn is_noop(&self) -> bool {
        self.diff.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut s = format!(
            "{} added, {} renamed, {} deleted, {} unchanged",
            self.added.len(),
            self.renamed.len(),
            self.deleted.len(),
            self.unchanged
        );
        if !self.errors.is_empty() {
            s.push_str(&format!(", {} failed", self.errors.len()));
        }
        s
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ReconcileOptions<'a> {
    pub policy: RenamePolicy,
    pub workers: usize,
    /// Set to stop dispatching extraction for remaining new items.
    pub cancel: &'a AtomicBool,
}

/// Full classification of one pass. Extraction failures are collected, never
/// raised; the returned catalog and diff only contain successful items.
pub fn reconcile<E: Extractor + ?Sized>(
    mut catalog: Catalog,
    scan: &ScanResult,
    extractor: &E,
    opts: ReconcileOptions<'_>,
    stats: &JobStats,
) -> Outcome {
    let plan = classify(&catalog, scan, opts.policy);

    for r in &plan.renamed {
        catalog.rename(&r.from, &r.to);
        debug!(from = %r.from.display(), to = %r.to.display(), "reconcile: renamed");
    }
    for path in &plan.deleted {
        catalog.remove(path);
        debug!(path = %path.display(), "reconcile: deleted");
    }

    let results = jobs::run_bounded(&plan.added, opts.workers, opts.cancel, stats, |item| {
        extractor.extract(&item.path, item.media_type)
    });

    let mut inserted = Vec::new();
    let mut errors = Vec::new();
    let mut skipped = 0usize;
    for (item, result) in plan.added.iter().zip(results) {
        match result {
            Some(Ok(meta)) => {
                let entry = MediaEntry::new(item, meta.duration_seconds, meta.thumbnail_ref);
                catalog.insert(entry.clone());
                inserted.push(entry);
            }
            Some(Err(error)) => {
                warn!(path = %item.path.display(), error = %error, "reconcile: extraction failed");
                errors.push(ItemError {
                    path: item.path.clone(),
                    error,
                });
            }
            None => skipped += 1,
        }
    }

    Outcome {
        added: inserted.iter().map(|e| e.path.clone()).collect(),
        deleted: plan.deleted.clone(),
        renamed: plan.renamed.clone(),
        unchanged: plan.unchanged,
        errors,
        skipped,
        catalog,
        diff: CatalogDiff {
            renamed: plan.renamed,
            removed: plan.deleted,
            inserted,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Bookmark;
    use crate::extract::Extracted;
    use crate::media::MediaType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Counts calls; fails for any path whose file name is listed.
    #[derive(Default)]
    struct FakeExtractor {
        calls: AtomicUsize,
        seen: Mutex<Vec<PathBuf>>,
        fail: Vec<&'static str>,
    }

    impl FakeExtractor {
        fn failing(names: &[&'static str]) -> Self {
            Self {
                fail: names.to_vec(),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Extractor for FakeExtractor {
        fn extract(&self, path: &Path, media_type: MediaType) -> Result<Extracted, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(path.to_path_buf());
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            if self.fail.contains(&name.as_str()) {
                return Err(ExtractionError::Decode {
                    path: path.to_path_buf(),
                    message: "corrupt".into(),
                });
            }
            Ok(Extracted {
                duration_seconds: (media_type == MediaType::Video).then_some(61.0),
                thumbnail_ref: Some(format!("thumb:{}", name)),
            })
        }
    }

    fn item(path: &str) -> ScanItem {
        let p = PathBuf::from(path);
        let t = MediaType::from_path(&p).unwrap();
        ScanItem::new(p, t)
    }

    fn scan(paths: &[&str]) -> ScanResult {
        ScanResult {
            root: PathBuf::from("/lib"),
            items: paths.iter().map(|p| item(p)).collect(),
            skipped_dirs: 0,
        }
    }

    fn entry(path: &str, tags: &[&str]) -> MediaEntry {
        let mut e = MediaEntry::new(&item(path), Some(10.0), None);
        e.tags = tags.iter().map(|t| t.to_string()).collect();
        e
    }

    fn run(catalog: Catalog, s: &ScanResult, x: &FakeExtractor, policy: RenamePolicy) -> Outcome {
        let cancel = AtomicBool::new(false);
        let opts = ReconcileOptions {
            policy,
            workers: 2,
            cancel: &cancel,
        };
        reconcile(catalog, s, x, opts, &JobStats::new())
    }

    fn paths(catalog: &Catalog) -> Vec<PathBuf> {
        catalog.iter().map(|e| e.path.clone()).collect()
    }

    #[test]
    fn new_video_is_extracted_and_inserted() {
        let x = FakeExtractor::default();
        let out = run(Catalog::new(), &scan(&["/lib/v1.mp4"]), &x, RenamePolicy::ScanOrder);

        assert_eq!(x.calls(), 1);
        let e = out.catalog.get(Path::new("/lib/v1.mp4")).unwrap();
        assert_eq!(e.duration_seconds, Some(61.0));
        assert_eq!(e.thumbnail_ref.as_deref(), Some("thumb:v1.mp4"));
        assert!(e.tags.is_empty() && e.bookmarks.is_empty());
        assert_eq!(out.added, vec![PathBuf::from("/lib/v1.mp4")]);
        assert_eq!(out.diff.inserted.len(), 1);
    }

    #[test]
    fn second_pass_is_idempotent() {
        let x = FakeExtractor::default();
        let s = scan(&["/lib/a.jpg", "/lib/sub/v.mp4"]);
        let first = run(Catalog::new(), &s, &x, RenamePolicy::ScanOrder);
        assert_eq!(x.calls(), 2);

        let second = run(first.catalog.clone(), &s, &x, RenamePolicy::ScanOrder);
        assert_eq!(x.calls(), 2, "no extractor calls on an unchanged tree");
        assert!(second.is_noop());
        assert_eq!(second.unchanged, 2);
        assert_eq!(second.catalog, first.catalog);
    }

    #[test]
    fn move_preserves_tags_without_extraction() {
        let x = FakeExtractor::default();
        let catalog = Catalog::from_entries([entry("/lib/old/a.jpg", &["x"])]);
        let out = run(catalog, &scan(&["/lib/new/a.jpg"]), &x, RenamePolicy::ScanOrder);

        assert_eq!(x.calls(), 0);
        assert_eq!(paths(&out.catalog), vec![PathBuf::from("/lib/new/a.jpg")]);
        let moved = out.catalog.get(Path::new("/lib/new/a.jpg")).unwrap();
        assert!(moved.tags.contains("x"));
        assert_eq!(
            out.renamed,
            vec![Rename {
                from: "/lib/old/a.jpg".into(),
                to: "/lib/new/a.jpg".into()
            }]
        );
        assert!(out.deleted.is_empty() && out.added.is_empty());
    }

    #[test]
    fn rename_keeps_bookmarks() {
        let x = FakeExtractor::default();
        let mut e = entry("/lib/a/clip.mkv", &["fav"]);
        e.bookmarks.push(Bookmark {
            description: "kickoff".into(),
            timestamp_seconds: 12.0,
        });
        let out = run(
            Catalog::from_entries([e.clone()]),
            &scan(&["/lib/b/clip.mkv"]),
            &x,
            RenamePolicy::ScanOrder,
        );
        let moved = out.catalog.get(Path::new("/lib/b/clip.mkv")).unwrap();
        assert_eq!(moved.bookmarks, e.bookmarks);
        assert_eq!(moved.duration_seconds, e.duration_seconds);
    }

    #[test]
    fn vanished_without_match_is_deleted() {
        let x = FakeExtractor::default();
        let catalog = Catalog::from_entries([entry("/lib/gone.jpg", &["x"]), entry("/lib/keep.jpg", &[])]);
        let out = run(catalog, &scan(&["/lib/keep.jpg"]), &x, RenamePolicy::ScanOrder);

        assert_eq!(x.calls(), 0);
        assert_eq!(out.deleted, vec![PathBuf::from("/lib/gone.jpg")]);
        assert_eq!(paths(&out.catalog), vec![PathBuf::from("/lib/keep.jpg")]);
    }

    #[test]
    fn candidate_already_cataloged_is_not_a_rename_target() {
        // Both /lib/a/x.jpg and /lib/b/x.jpg are cataloged; a vanishes.
        // b is unchanged, so a must be deleted, not moved onto b.
        let x = FakeExtractor::default();
        let catalog = Catalog::from_entries([entry("/lib/a/x.jpg", &["t"]), entry("/lib/b/x.jpg", &[])]);
        let out = run(catalog, &scan(&["/lib/b/x.jpg"]), &x, RenamePolicy::ScanOrder);

        assert_eq!(out.deleted, vec![PathBuf::from("/lib/a/x.jpg")]);
        assert!(out.renamed.is_empty());
        assert!(out.catalog.get(Path::new("/lib/b/x.jpg")).unwrap().tags.is_empty());
    }

    #[test]
    fn extraction_failure_is_reported_not_fatal() {
        let x = FakeExtractor::failing(&["v2.mp4"]);
        let out = run(
            Catalog::new(),
            &scan(&["/lib/v1.mp4", "/lib/v2.mp4", "/lib/v3.mp4"]),
            &x,
            RenamePolicy::ScanOrder,
        );

        assert_eq!(x.calls(), 3);
        assert_eq!(
            paths(&out.catalog),
            vec![PathBuf::from("/lib/v1.mp4"), PathBuf::from("/lib/v3.mp4")]
        );
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].path, PathBuf::from("/lib/v2.mp4"));
        assert!(out.diff.inserted.iter().all(|e| e.path != Path::new("/lib/v2.mp4")));
        assert!(out.summary().ends_with("1 failed"));
    }

    #[test]
    fn ambiguous_basenames_resolve_in_scan_order() {
        let x = FakeExtractor::default();
        let catalog = Catalog::from_entries([
            entry("/lib/old1/x.jpg", &["one"]),
            entry("/lib/old2/x.jpg", &["two"]),
        ]);
        let out = run(
            catalog,
            &scan(&["/lib/n1/x.jpg", "/lib/n2/x.jpg", "/lib/n3/x.jpg"]),
            &x,
            RenamePolicy::ScanOrder,
        );

        // Catalog order pairs old1 -> n1, old2 -> n2; n3 is new.
        assert_eq!(
            out.catalog.get(Path::new("/lib/n1/x.jpg")).unwrap().tags,
            ["one".to_string()].into()
        );
        assert_eq!(
            out.catalog.get(Path::new("/lib/n2/x.jpg")).unwrap().tags,
            ["two".to_string()].into()
        );
        assert_eq!(out.added, vec![PathBuf::from("/lib/n3/x.jpg")]);
        assert_eq!(x.calls(), 1);
    }

    #[test]
    fn unique_only_policy_refuses_ambiguity() {
        let x = FakeExtractor::default();
        let catalog = Catalog::from_entries([
            entry("/lib/old1/x.jpg", &["one"]),
            entry("/lib/old2/x.jpg", &["two"]),
            entry("/lib/old/solo.jpg", &["s"]),
        ]);
        let out = run(
            catalog,
            &scan(&["/lib/n1/x.jpg", "/lib/n2/x.jpg", "/lib/new/solo.jpg"]),
            &x,
            RenamePolicy::UniqueOnly,
        );

        assert_eq!(out.renamed.len(), 1);
        assert_eq!(out.renamed[0].to, PathBuf::from("/lib/new/solo.jpg"));
        assert_eq!(out.deleted.len(), 2);
        assert_eq!(out.added.len(), 2);
        assert_eq!(x.calls(), 2);
    }

    #[test]
    fn disabled_policy_deletes_and_adds() {
        let x = FakeExtractor::default();
        let catalog = Catalog::from_entries([entry("/lib/old/a.jpg", &["x"])]);
        let out = run(catalog, &scan(&["/lib/new/a.jpg"]), &x, RenamePolicy::Disabled);

        assert!(out.renamed.is_empty());
        assert_eq!(out.deleted.len(), 1);
        assert_eq!(x.calls(), 1);
        assert!(out.catalog.get(Path::new("/lib/new/a.jpg")).unwrap().tags.is_empty());
    }

    #[test]
    fn classify_is_pure() {
        let catalog = Catalog::from_entries([entry("/lib/a.jpg", &[]), entry("/lib/old/b.jpg", &[])]);
        let s = scan(&["/lib/a.jpg", "/lib/new/b.jpg", "/lib/c.png"]);
        let plan = classify(&catalog, &s, RenamePolicy::ScanOrder);

        assert_eq!(plan.unchanged, 1);
        assert_eq!(plan.renamed.len(), 1);
        assert_eq!(plan.added, vec![item("/lib/c.png")]);
        assert!(plan.deleted.is_empty());
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn cancelled_pass_skips_remaining_extraction() {
        let x = FakeExtractor::default();
        let cancel = AtomicBool::new(true);
        let opts = ReconcileOptions {
            policy: RenamePolicy::ScanOrder,
            workers: 2,
            cancel: &cancel,
        };
        let out = reconcile(Catalog::new(), &scan(&["/lib/a.jpg", "/lib/b.jpg"]), &x, opts, &JobStats::new());
        assert_eq!(x.calls(), 0);
        assert_eq!(out.skipped, 2);
        assert!(out.catalog.is_empty());
    }
}
