//! Filesystem watcher: raw events in, debounced reconciliation triggers out.
//!
//! `notify` delivers raw events on its own thread; they are bridged into a
//! channel and consumed by a pump thread (`fs-watcher`) that:
//!
//! 1. drops any batch touching the engine's own artifacts (catalog database,
//!    thumbnails), so our writes never re-trigger a pass,
//! 2. keeps only media files and directories,
//! 3. coalesces bursts through a trailing-edge [`Debouncer`],
//! 4. hands the [`Trigger`] to the callback unless the root's
//!    [`SyncMachine`] says a pass is already running.
//!
//! [`spawn_pump`] runs steps 1-4 over any event channel, which is how the
//! pipeline is tested without touching the filesystem.

use std::collections::BTreeSet;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::config::{Config, IgnorePattern};
use crate::error::WatcherSetupError;
use crate::media::is_media;
use crate::sync_state::SyncMachine;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Modify,
    Remove,
    /// Backend could not tell (e.g. rescan hints).
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl RawEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Flatten a `notify` event into one raw event per path. Access events are
/// dropped: the extractor reading files must not look like a change.
fn raw_events(event: notify::Event) -> Vec<RawEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Create,
        EventKind::Modify(_) => ChangeKind::Modify,
        EventKind::Remove(_) => ChangeKind::Remove,
        EventKind::Any => ChangeKind::Other,
        EventKind::Access(_) | EventKind::Other => return Vec::new(),
    };
    event
        .paths
        .into_iter()
        .map(|path| RawEvent { path, kind })
        .collect()
}

/// One debounced signal: something relevant changed under `root`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trigger {
    pub root: PathBuf,
    pub paths: BTreeSet<PathBuf>,
}

// ── Filtering ───────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct EventFilter {
    root: PathBuf,
    ignore: Vec<IgnorePattern>,
}

impl EventFilter {
    pub fn new(root: impl Into<PathBuf>, ignore: Vec<IgnorePattern>) -> Self {
        Self {
            root: root.into(),
            ignore,
        }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        self.ignore.iter().any(|p| p.matches(rel))
    }

    /// Media file, or something that looks like a directory. Removed
    /// directories can't be stat'ed, so a dot-less name counts as one.
    pub fn is_relevant(path: &Path) -> bool {
        if is_media(path) || path.is_dir() {
            return true;
        }
        path.file_name()
            .map(|n| !n.to_string_lossy().contains('.'))
            .unwrap_or(false)
    }

    /// Relevant paths of a batch, or `None` if the batch should be dropped.
    pub fn admit(&self, batch: &[RawEvent]) -> Option<Vec<PathBuf>> {
        if batch.iter().any(|e| self.is_ignored(&e.path)) {
            return None;
        }
        let relevant: Vec<PathBuf> = batch
            .iter()
            .filter(|e| Self::is_relevant(&e.path))
            .map(|e| e.path.clone())
            .collect();
        (!relevant.is_empty()).then_some(relevant)
    }
}

// ── Debounce ────────────────────────────────────────────────────────────

/// Trailing-edge coalescing: every push moves the deadline to
/// `now + window`; once the deadline passes, everything pushed so far comes
/// out as one set.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: BTreeSet<PathBuf>,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: BTreeSet::new(),
            deadline: None,
        }
    }

    pub fn push(&mut self, paths: impl IntoIterator<Item = PathBuf>, now: Instant) {
        self.pending.extend(paths);
        self.deadline = Some(now + self.window);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn poll(&mut self, now: Instant) -> Option<BTreeSet<PathBuf>> {
        match self.deadline {
            Some(d) if now >= d => {
                self.deadline = None;
                Some(mem::take(&mut self.pending))
            }
            _ => None,
        }
    }

    /// Drop whatever is pending. Returns how many paths were discarded.
    pub fn cancel(&mut self) -> usize {
        self.deadline = None;
        mem::take(&mut self.pending).len()
    }
}

// ── Pump ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct WatchOptions {
    pub debounce: Duration,
    pub ignore: Vec<IgnorePattern>,
}

impl WatchOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            debounce: config.debounce(),
            ignore: config.effective_watch_ignore(),
        }
    }
}

/// Running subscription. Stops on [`WatchHandle::stop`] or drop.
pub struct WatchHandle {
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("root", &self.root)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl WatchHandle {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cancel the OS subscription, discard any pending debounce and wait for
    /// the pump thread. No callback runs after this returns.
    pub fn stop(&mut self) {
        self.watcher.take();
        self.stop_tx.take();
        if let Some(t) = self.thread.take() {
            t.join().ok();
            debug!(root = %self.root.display(), "watcher: stopped");
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Watch `root` recursively and call `on_change` with debounced triggers.
pub fn watch<F>(
    root: &Path,
    on_change: F,
    opts: WatchOptions,
    sync: Arc<SyncMachine>,
) -> Result<WatchHandle, WatcherSetupError>
where
    F: FnMut(Trigger) + Send + 'static,
{
    let (raw_tx, raw_rx) = channel::unbounded::<Vec<RawEvent>>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                let batch = raw_events(event);
                if !batch.is_empty() {
                    raw_tx.send(batch).ok();
                }
            }
            Err(e) => warn!(error = %e, "watcher: backend error"),
        }
    })
    .map_err(WatcherSetupError::Create)?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|source| WatcherSetupError::Watch {
            path: root.to_path_buf(),
            source,
        })?;

    let mut handle = spawn_pump(root, raw_rx, opts, sync, on_change)?;
    handle.watcher = Some(watcher);
    info!(root = %root.display(), "watcher: watching (recursive)");
    Ok(handle)
}

/// Run the filter/debounce/suppression pipeline over an arbitrary source of
/// raw event batches.
pub fn spawn_pump<F>(
    root: &Path,
    events: Receiver<Vec<RawEvent>>,
    opts: WatchOptions,
    sync: Arc<SyncMachine>,
    on_change: F,
) -> Result<WatchHandle, WatcherSetupError>
where
    F: FnMut(Trigger) + Send + 'static,
{
    let (stop_tx, stop_rx) = channel::bounded::<()>(1);
    let filter = EventFilter::new(root, opts.ignore);
    let root_owned = root.to_path_buf();
    let window = opts.debounce;

    let thread = thread::Builder::new()
        .name("fs-watcher".into())
        .spawn(move || run_pump(root_owned, filter, events, stop_rx, window, sync, on_change))
        .map_err(WatcherSetupError::Spawn)?;

    Ok(WatchHandle {
        root: root.to_path_buf(),
        watcher: None,
        stop_tx: Some(stop_tx),
        thread: Some(thread),
    })
}

fn run_pump<F: FnMut(Trigger)>(
    root: PathBuf,
    filter: EventFilter,
    events: Receiver<Vec<RawEvent>>,
    stop_rx: Receiver<()>,
    window: Duration,
    sync: Arc<SyncMachine>,
    mut on_change: F,
) {
    let mut debouncer = Debouncer::new(window);
    let closed: Receiver<Vec<RawEvent>> = channel::never();
    let mut source_open = true;

    loop {
        let source = if source_open { &events } else { &closed };
        let timer = match debouncer.deadline() {
            Some(d) => channel::at(d),
            None => channel::never(),
        };

        crossbeam::select! {
            recv(stop_rx) -> _ => break,
            recv(source) -> batch => match batch {
                Ok(batch) => match filter.admit(&batch) {
                    Some(paths) => debouncer.push(paths, Instant::now()),
                    None => debug!(events = batch.len(), "watcher: batch dropped"),
                },
                // Source gone; keep serving the pending debounce until stopped.
                Err(_) => source_open = false,
            },
            recv(timer) -> _ => {
                if matches!(stop_rx.try_recv(), Err(TryRecvError::Disconnected)) {
                    break;
                }
                if let Some(paths) = debouncer.poll(Instant::now()) {
                    if sync.is_reconciling() {
                        debug!(paths = paths.len(), state = %sync.state(), "watcher: trigger suppressed");
                    } else {
                        on_change(Trigger {
                            root: root.clone(),
                            paths,
                        });
                    }
                }
            }
        }
    }

    let discarded = debouncer.cancel();
    if discarded > 0 {
        debug!(discarded, "watcher: pending changes discarded on stop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_state::{Origin, PassKind};

    fn filter() -> EventFilter {
        EventFilter::new("/lib", Config::default().effective_watch_ignore())
    }

    fn ev(path: &str) -> RawEvent {
        RawEvent::new(path, ChangeKind::Create)
    }

    // ── filter ──────────────────────────────────────────────────────────

    #[test]
    fn media_and_dirs_are_relevant() {
        assert!(EventFilter::is_relevant(Path::new("/lib/a.JPG")));
        assert!(EventFilter::is_relevant(Path::new("/lib/clip.mkv")));
        assert!(EventFilter::is_relevant(Path::new("/lib/some_removed_dir")));
        assert!(!EventFilter::is_relevant(Path::new("/lib/notes.txt")));
        assert!(!EventFilter::is_relevant(Path::new("/lib/.gitignore")));
    }

    #[test]
    fn own_artifacts_are_ignored() {
        let f = filter();
        assert!(f.is_ignored(Path::new("/lib/media_cache.db")));
        assert!(f.is_ignored(Path::new("/lib/media_cache.db-wal")));
        assert!(f.is_ignored(Path::new("/lib/media_cache.db-journal")));
        assert!(f.is_ignored(Path::new("/lib/.thumbnails/0af3.webp")));
        assert!(f.is_ignored(Path::new("/lib/sub/cache/x.jpg")));
        assert!(!f.is_ignored(Path::new("/lib/sub/x.jpg")));
    }

    #[test]
    fn root_components_do_not_count_as_ignored() {
        let f = EventFilter::new("/home/me/cache/lib", Config::default().effective_watch_ignore());
        assert!(!f.is_ignored(Path::new("/home/me/cache/lib/a.jpg")));
    }

    #[test]
    fn batch_with_self_write_dropped_whole() {
        let f = filter();
        let batch = vec![ev("/lib/a.jpg"), ev("/lib/media_cache.db-wal")];
        assert_eq!(f.admit(&batch), None);
    }

    #[test]
    fn irrelevant_only_batch_dropped() {
        assert_eq!(filter().admit(&[ev("/lib/readme.txt")]), None);
        assert_eq!(filter().admit(&[]), None);
    }

    #[test]
    fn batch_filtered_to_relevant_paths() {
        let batch = vec![ev("/lib/a.jpg"), ev("/lib/readme.txt"), ev("/lib/newdir")];
        assert_eq!(
            filter().admit(&batch),
            Some(vec![PathBuf::from("/lib/a.jpg"), PathBuf::from("/lib/newdir")])
        );
    }

    #[test]
    fn access_events_are_not_changes() {
        let event = notify::Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/lib/a.jpg"));
        assert!(raw_events(event).is_empty());

        let event = notify::Event::new(EventKind::Remove(notify::event::RemoveKind::File))
            .add_path(PathBuf::from("/lib/a.jpg"))
            .add_path(PathBuf::from("/lib/b.jpg"));
        let raw = raw_events(event);
        assert_eq!(raw.len(), 2);
        assert!(raw.iter().all(|e| e.kind == ChangeKind::Remove));
    }

    // ── debouncer ───────────────────────────────────────────────────────

    #[test]
    fn burst_within_window_yields_one_set() {
        let t0 = Instant::now();
        let w = Duration::from_millis(300);
        let mut d = Debouncer::new(w);

        for i in 0..10u64 {
            let now = t0 + Duration::from_millis(i * 20);
            d.push([PathBuf::from(format!("/lib/{}.jpg", i % 4))], now);
            assert_eq!(d.poll(now), None);
        }
        // Deadline trails the last push.
        let last = t0 + Duration::from_millis(180);
        assert_eq!(d.poll(last + w - Duration::from_millis(1)), None);
        let fired = d.poll(last + w).unwrap();
        assert_eq!(fired.len(), 4);
        assert_eq!(d.poll(last + w * 2), None);
        assert!(!d.is_pending());
    }

    #[test]
    fn separate_bursts_fire_separately() {
        let t0 = Instant::now();
        let w = Duration::from_millis(100);
        let mut d = Debouncer::new(w);
        d.push([PathBuf::from("/lib/a.jpg")], t0);
        assert!(d.poll(t0 + w).is_some());
        d.push([PathBuf::from("/lib/b.jpg")], t0 + w * 3);
        assert_eq!(
            d.poll(t0 + w * 4).unwrap(),
            BTreeSet::from([PathBuf::from("/lib/b.jpg")])
        );
    }

    #[test]
    fn cancel_discards_pending() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(Duration::from_millis(10));
        d.push([PathBuf::from("/lib/a.jpg"), PathBuf::from("/lib/b.jpg")], t0);
        assert_eq!(d.cancel(), 2);
        assert_eq!(d.poll(t0 + Duration::from_secs(1)), None);
    }

    // ── pump ────────────────────────────────────────────────────────────

    fn opts(ms: u64) -> WatchOptions {
        WatchOptions {
            debounce: Duration::from_millis(ms),
            ignore: Config::default().effective_watch_ignore(),
        }
    }

    fn collect_triggers(
        sync: Arc<SyncMachine>,
        ms: u64,
    ) -> (Sender<Vec<RawEvent>>, Receiver<Trigger>, WatchHandle) {
        let (raw_tx, raw_rx) = channel::unbounded();
        let (out_tx, out_rx) = channel::unbounded();
        let handle = spawn_pump(Path::new("/lib"), raw_rx, opts(ms), sync, move |t| {
            out_tx.send(t).ok();
        })
        .unwrap();
        (raw_tx, out_rx, handle)
    }

    #[test]
    fn pump_coalesces_burst_into_one_trigger() {
        let (tx, rx, _handle) = collect_triggers(SyncMachine::new(), 100);
        for i in 0..25 {
            tx.send(vec![ev(&format!("/lib/img{}.png", i))]).unwrap();
        }
        let trigger = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(trigger.root, PathBuf::from("/lib"));
        assert_eq!(trigger.paths.len(), 25);
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    }

    #[test]
    fn pump_never_triggers_on_self_writes() {
        let (tx, rx, _handle) = collect_triggers(SyncMachine::new(), 30);
        tx.send(vec![ev("/lib/media_cache.db")]).unwrap();
        tx.send(vec![RawEvent::new("/lib/media_cache.db-wal", ChangeKind::Modify)])
            .unwrap();
        tx.send(vec![ev("/lib/.thumbnails/1f2e.webp")]).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn pump_suppresses_while_reconciling() {
        let sync = SyncMachine::new();
        let token = sync.try_begin(PassKind::Update, Origin::User).unwrap();
        let (tx, rx, _handle) = collect_triggers(sync.clone(), 30);

        tx.send(vec![ev("/lib/a.jpg")]).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        // Dropped, not queued: nothing arrives after the pass ends either.
        token.complete("done");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        tx.send(vec![ev("/lib/b.jpg")]).unwrap();
        let t = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(t.paths, BTreeSet::from([PathBuf::from("/lib/b.jpg")]));
    }

    #[test]
    fn stop_discards_pending_trigger() {
        let (tx, rx, mut handle) = collect_triggers(SyncMachine::new(), 300);
        tx.send(vec![ev("/lib/a.jpg")]).unwrap();
        thread::sleep(Duration::from_millis(50));
        handle.stop();
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    }

    #[test]
    fn pending_trigger_survives_source_disconnect() {
        let (tx, rx, _handle) = collect_triggers(SyncMachine::new(), 50);
        tx.send(vec![ev("/lib/a.jpg")]).unwrap();
        drop(tx);
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    // ── real filesystem ─────────────────────────────────────────────────

    #[test]
    fn watch_detects_new_media_but_not_own_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir(root.join(".thumbnails")).unwrap();

        let (out_tx, out_rx) = channel::unbounded();
        let handle = watch(
            &root,
            move |t| {
                out_tx.send(t).ok();
            },
            opts(100),
            SyncMachine::new(),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(300));

        // Own artifacts: no trigger
        std::fs::write(root.join("media_cache.db"), b"sqlite").unwrap();
        std::fs::write(root.join(".thumbnails/abc.webp"), b"thumb").unwrap();
        assert!(out_rx.recv_timeout(Duration::from_millis(600)).is_err());

        // Media file: exactly one trigger for the burst
        std::fs::write(root.join("new_photo.jpg"), b"fake").unwrap();
        std::fs::write(root.join("new_photo.jpg"), b"fake, longer").unwrap();
        let t = out_rx.recv_timeout(Duration::from_secs(3)).unwrap();
        assert!(t.paths.iter().any(|p| p.ends_with("new_photo.jpg")));
        drop(handle);
    }

    #[test]
    fn watch_missing_root_is_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = watch(
            &dir.path().join("nope"),
            |_| {},
            opts(100),
            SyncMachine::new(),
        )
        .unwrap_err();
        assert!(matches!(err, WatcherSetupError::Watch { .. }));
    }
}
