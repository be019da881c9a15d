//! Library session: one adopted root with its store, sync state, watcher and
//! reconciliation lane.
//!
//! Manual refreshes run on the caller's thread. Watcher triggers go through a
//! capacity-1 channel to the `reconcile-lane` thread; a trigger that finds the
//! lane full is dropped. Both paths start passes through the root's
//! [`SyncMachine`], so at most one pass runs per root.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::catalog::{Bookmark, Catalog, MediaEntry};
use crate::config::Config;
use crate::db::{CatalogStore, Db};
use crate::error::{CatalogError, PassError, ScanError};
use crate::extract::{Extractor, ThumbnailExtractor};
use crate::jobs::JobStats;
use crate::media::{clean_path, MediaType};
use crate::reconcile::{self, Outcome, ReconcileOptions};
use crate::scanner;
use crate::sync_state::{Origin, PassKind, SyncMachine, SyncState};
use crate::watcher::{self, Trigger, WatchHandle, WatchOptions};

// ── Session ─────────────────────────────────────────────────────────────

/// Everything that belongs to one root. Shared between the caller and the
/// lane thread.
pub struct RootSession {
    root: PathBuf,
    config: Config,
    store: Arc<dyn CatalogStore>,
    extractor: Arc<dyn Extractor>,
    sync: Arc<SyncMachine>,
    stats: Arc<JobStats>,
    /// Set once a pass has succeeded; later passes are updates.
    initialized: AtomicBool,
    cancelled: AtomicBool,
    /// Serializes commits, user edits and cancellation.
    commit_gate: Mutex<()>,
    snapshot: RwLock<Arc<Catalog>>,
}

impl std::fmt::Debug for RootSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootSession")
            .field("root", &self.root)
            .field("state", &self.sync.state())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RootSession {
    pub fn new(
        root: PathBuf,
        config: Config,
        store: Arc<dyn CatalogStore>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        Self {
            root,
            config,
            store,
            extractor,
            sync: SyncMachine::new(),
            stats: Arc::new(JobStats::new()),
            initialized: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            commit_gate: Mutex::new(()),
            snapshot: RwLock::new(Arc::new(Catalog::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sync(&self) -> &Arc<SyncMachine> {
        &self.sync
    }

    pub fn stats(&self) -> &Arc<JobStats> {
        &self.stats
    }

    pub fn snapshot(&self) -> Arc<Catalog> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.commit_gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, catalog: Catalog) {
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(catalog);
    }

    /// Stop this session for good. Once this returns no pass can commit:
    /// a pass past its commit finished before we got the gate, and any other
    /// sees the flag.
    pub fn cancel(&self) {
        let _gate = self.gate();
        self.cancelled.store(true, Ordering::SeqCst);
        debug!(root = %self.root.display(), "library: session cancelled");
    }

    /// One full reconciliation pass: load, scan, reconcile, commit, publish.
    pub fn run_pass(&self, origin: Origin) -> Result<Outcome, PassError> {
        if self.is_cancelled() {
            return Err(PassError::Superseded);
        }
        let kind = if self.initialized.load(Ordering::SeqCst) {
            PassKind::Update
        } else {
            PassKind::Initialize
        };
        let token = self.sync.try_begin(kind, origin)?;

        match self.pass_body() {
            Ok(outcome) => {
                self.initialized.store(true, Ordering::SeqCst);
                info!(
                    root = %self.root.display(),
                    ?kind,
                    added = outcome.added.len(),
                    renamed = outcome.renamed.len(),
                    deleted = outcome.deleted.len(),
                    failed = outcome.errors.len(),
                    "library: pass complete"
                );
                token.complete(outcome.summary());
                Ok(outcome)
            }
            Err(e) => {
                token.fail(e.to_string());
                Err(e)
            }
        }
    }

    fn pass_body(&self) -> Result<Outcome, PassError> {
        let catalog = Catalog::from_entries(self.store.load_all()?);
        let scan = scanner::scan(&self.root, &self.config)?;
        if scan.skipped_dirs > 0 {
            warn!(root = %self.root.display(), skipped = scan.skipped_dirs, "library: directories skipped during scan");
        }

        let opts = ReconcileOptions {
            policy: self.config.rename_policy,
            workers: self.config.extract_workers,
            cancel: &self.cancelled,
        };
        let outcome = reconcile::reconcile(catalog, &scan, self.extractor.as_ref(), opts, &self.stats);

        let _gate = self.gate();
        if self.is_cancelled() {
            return Err(PassError::Superseded);
        }
        if !outcome.is_noop() {
            self.store.commit(&outcome.diff)?;
        }
        // Re-read rather than trust `outcome.catalog`: user edits made while
        // extraction ran are in the store, not in the pass's copy.
        let catalog = match self.store.load_all() {
            Ok(entries) => Catalog::from_entries(entries),
            Err(e) => {
                // The diff is durable; only the read-back failed.
                warn!(root = %self.root.display(), error = %e, "library: reload after commit failed, publishing pass result");
                self.with_user_edits(&outcome)
            }
        };
        self.publish(catalog);
        Ok(outcome)
    }

    /// The pass's catalog with tags and bookmarks taken from the current
    /// snapshot, which already holds any edit made while the pass ran.
    /// Caller holds the commit gate.
    fn with_user_edits(&self, outcome: &Outcome) -> Catalog {
        let current = self.snapshot();
        let mut catalog = outcome.catalog.clone();
        let carry = |catalog: &mut Catalog, from: &Path, to: &Path| {
            if let (Some(edited), Some(entry)) = (current.get(from), catalog.get_mut(to)) {
                entry.tags = edited.tags.clone();
                entry.bookmarks = edited.bookmarks.clone();
            }
        };
        let renamed: BTreeSet<&Path> = outcome.renamed.iter().map(|r| r.to.as_path()).collect();
        let paths: Vec<PathBuf> = catalog
            .iter()
            .map(|e| e.path.clone())
            .filter(|p| !renamed.contains(p.as_path()))
            .collect();
        for path in &paths {
            carry(&mut catalog, path, path);
        }
        for r in &outcome.renamed {
            carry(&mut catalog, &r.from, &r.to);
        }
        catalog
    }

    /// Read-modify-write of one entry under the commit gate.
    fn edit_entry<F>(&self, path: &Path, f: F) -> Result<MediaEntry, CatalogError>
    where
        F: FnOnce(&mut MediaEntry) -> Result<(), CatalogError>,
    {
        let _gate = self.gate();
        let mut entry = self
            .store
            .get(path)?
            .ok_or_else(|| CatalogError::NotFound(path.to_path_buf()))?;
        f(&mut entry)?;
        self.store.upsert(&entry)?;

        let mut snap = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        Arc::make_mut(&mut snap).insert(entry.clone());
        Ok(entry)
    }

    pub fn set_tags(&self, path: &Path, tags: BTreeSet<String>) -> Result<MediaEntry, CatalogError> {
        self.edit_entry(path, |entry| {
            entry.tags = tags;
            Ok(())
        })
    }

    pub fn add_bookmark(
        &self,
        path: &Path,
        description: &str,
        timestamp_seconds: f64,
    ) -> Result<MediaEntry, CatalogError> {
        self.edit_entry(path, |entry| {
            require_video(entry)?;
            entry.bookmarks.push(Bookmark {
                description: description.to_string(),
                timestamp_seconds,
            });
            Ok(())
        })
    }

    /// Drop every bookmark at exactly `timestamp_seconds`.
    pub fn remove_bookmark(&self, path: &Path, timestamp_seconds: f64) -> Result<MediaEntry, CatalogError> {
        self.edit_entry(path, |entry| {
            require_video(entry)?;
            entry
                .bookmarks
                .retain(|b| b.timestamp_seconds != timestamp_seconds);
            Ok(())
        })
    }

    fn on_trigger(&self, trigger: Trigger) {
        debug!(root = %trigger.root.display(), paths = trigger.paths.len(), "library: watcher trigger");
        match self.run_pass(Origin::Watcher) {
            Ok(_) => {}
            Err(PassError::Sync(e)) => debug!(reason = %e, "library: watcher pass refused"),
            Err(PassError::Superseded) => debug!("library: watcher pass superseded"),
            // Already reported through the sync machine.
            Err(_) => {}
        }
    }
}

fn require_video(entry: &MediaEntry) -> Result<(), CatalogError> {
    match entry.media_type {
        MediaType::Video => Ok(()),
        MediaType::Image => Err(CatalogError::NotAVideo(entry.path.clone())),
    }
}

// ── Library ─────────────────────────────────────────────────────────────

type ExtractorFactory = Box<dyn Fn(&Path, &Config) -> Arc<dyn Extractor> + Send + Sync>;

struct Lane {
    tx: Option<Sender<Trigger>>,
    thread: Option<JoinHandle<()>>,
}

struct Active {
    session: Arc<RootSession>,
    watcher: Option<WatchHandle>,
    lane: Option<Lane>,
}

/// At most one open root at a time. Opening another root closes the
/// current one first.
pub struct Library {
    config: Config,
    extractor_for: ExtractorFactory,
    watch: bool,
    active: Option<Active>,
}

impl Library {
    /// Library using [`ThumbnailExtractor`] writing into each root's
    /// thumbnail directory.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            extractor_for: Box::new(|root: &Path, config: &Config| -> Arc<dyn Extractor> {
                Arc::new(ThumbnailExtractor::new(config.thumbnail_path(root)))
            }),
            watch: true,
            active: None,
        }
    }

    /// Library using the same extractor for every root.
    pub fn with_extractor(config: Config, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            config,
            extractor_for: Box::new(move |_: &Path, _: &Config| Arc::clone(&extractor)),
            watch: true,
            active: None,
        }
    }

    /// Skip the watcher and lane; passes only run on [`Library::refresh`].
    pub fn without_watcher(mut self) -> Self {
        self.watch = false;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Adopt `root` with its SQLite catalog, start watching it and run the
    /// initial pass.
    pub fn open(&mut self, root: &Path) -> Result<Outcome, PassError> {
        self.close();
        let root = resolve_root(root)?;
        let store = Db::open(&self.config.catalog_path(&root))?;
        self.adopt(root, Arc::new(store))
    }

    /// Like [`Library::open`] but with a caller-provided store.
    pub fn open_with_store(
        &mut self,
        root: &Path,
        store: Arc<dyn CatalogStore>,
    ) -> Result<Outcome, PassError> {
        self.close();
        let root = resolve_root(root)?;
        self.adopt(root, store)
    }

    fn adopt(&mut self, root: PathBuf, store: Arc<dyn CatalogStore>) -> Result<Outcome, PassError> {
        let extractor = (self.extractor_for)(&root, &self.config);
        let session = Arc::new(RootSession::new(root, self.config.clone(), store, extractor));
        info!(root = %session.root().display(), "library: root adopted");

        let (watcher, lane) = if self.watch {
            self.start_background(&session)
        } else {
            (None, None)
        };
        self.active = Some(Active {
            session: Arc::clone(&session),
            watcher,
            lane,
        });
        session.run_pass(Origin::User)
    }

    fn start_background(&self, session: &Arc<RootSession>) -> (Option<WatchHandle>, Option<Lane>) {
        let (tx, rx) = channel::bounded::<Trigger>(1);
        let lane_session = Arc::clone(session);
        let spawned = thread::Builder::new()
            .name("reconcile-lane".into())
            .spawn(move || {
                for trigger in rx.iter() {
                    lane_session.on_trigger(trigger);
                }
            });
        let thread = match spawned {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "library: no reconcile lane; manual refresh only");
                return (None, None);
            }
        };

        let trigger_tx = tx.clone();
        let on_change = move |trigger: Trigger| match trigger_tx.try_send(trigger) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("library: lane busy, trigger dropped"),
            Err(TrySendError::Disconnected(_)) => {}
        };
        let watcher = match watcher::watch(
            session.root(),
            on_change,
            WatchOptions::from_config(&self.config),
            Arc::clone(session.sync()),
        ) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(root = %session.root().display(), error = %e, "library: watcher unavailable; manual refresh only");
                None
            }
        };

        (
            watcher,
            Some(Lane {
                tx: Some(tx),
                thread: Some(thread),
            }),
        )
    }

    /// Cancel the current session, stop its watcher and wait for the lane.
    pub fn close(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.session.cancel();
        if let Some(mut w) = active.watcher.take() {
            w.stop();
        }
        if let Some(mut lane) = active.lane.take() {
            lane.tx.take();
            if let Some(t) = lane.thread.take() {
                t.join().ok();
            }
        }
        info!(root = %active.session.root().display(), "library: root closed");
    }

    fn session(&self) -> Option<&Arc<RootSession>> {
        self.active.as_ref().map(|a| &a.session)
    }

    /// Manual pass on the caller's thread. From the error state this is the
    /// explicit retry.
    pub fn refresh(&self) -> Result<Outcome, PassError> {
        self.session()
            .ok_or(PassError::NoRoot)?
            .run_pass(Origin::User)
    }

    pub fn retry(&self) -> Result<Outcome, PassError> {
        self.refresh()
    }

    pub fn root(&self) -> Option<&Path> {
        self.session().map(|s| s.root())
    }

    pub fn is_watching(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.watcher.is_some())
    }

    pub fn snapshot(&self) -> Arc<Catalog> {
        self.session()
            .map(|s| s.snapshot())
            .unwrap_or_default()
    }

    pub fn state(&self) -> SyncState {
        self.session()
            .map(|s| s.sync().state())
            .unwrap_or(SyncState::Idle)
    }

    pub fn status_text(&self) -> String {
        match self.session() {
            Some(s) => s.sync().status_text(),
            None => "No library open".into(),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.session().and_then(|s| s.sync().last_error())
    }

    pub fn extraction_stats(&self) -> Option<Arc<JobStats>> {
        self.session().map(|s| Arc::clone(s.stats()))
    }

    pub fn sync(&self) -> Option<Arc<SyncMachine>> {
        self.session().map(|s| Arc::clone(s.sync()))
    }

    fn active_session(&self, path: &Path) -> Result<&Arc<RootSession>, CatalogError> {
        self.session()
            .ok_or_else(|| CatalogError::NotFound(path.to_path_buf()))
    }

    pub fn set_tags<I, S>(&self, path: &Path, tags: I) -> Result<MediaEntry, CatalogError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags = tags.into_iter().map(Into::into).collect();
        self.active_session(path)?.set_tags(path, tags)
    }

    pub fn add_bookmark(
        &self,
        path: &Path,
        description: &str,
        timestamp_seconds: f64,
    ) -> Result<MediaEntry, CatalogError> {
        self.active_session(path)?
            .add_bookmark(path, description, timestamp_seconds)
    }

    pub fn remove_bookmark(&self, path: &Path, timestamp_seconds: f64) -> Result<MediaEntry, CatalogError> {
        self.active_session(path)?
            .remove_bookmark(path, timestamp_seconds)
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        self.close();
    }
}

fn resolve_root(root: &Path) -> Result<PathBuf, ScanError> {
    let meta = std::fs::metadata(root).map_err(|source| ScanError::Root {
        path: root.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(ScanError::NotADirectory(root.to_path_buf()));
    }
    root.canonicalize()
        .map(|p| clean_path(&p))
        .map_err(|source| ScanError::Root {
            path: root.to_path_buf(),
            source,
        })
}
