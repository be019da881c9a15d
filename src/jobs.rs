//! Bounded worker pool for the extraction calls of one reconciliation pass.
//!
//! Workers pull item indices from a shared queue, so a slow item only holds
//! its own worker. The pass waits for every dispatched item before returning.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::warn;

// ── Stats (shared with UI via Arc) ──────────────────────────────────────

#[derive(Debug, Default)]
pub struct JobStats {
    pub done: AtomicU64,
    pub failed: AtomicU64,
    pub active: AtomicU32,
    last_error: Mutex<String>,
}

impl JobStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_done(&self) {
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    fn record_fail(&self, err: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut le) = self.last_error.lock() {
            le.clear();
            le.extend(err.chars().take(120));
        }
    }

    pub fn last_error(&self) -> String {
        self.last_error
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

// ── Pool ────────────────────────────────────────────────────────────────

/// Run `f` over `items` on at most `workers` threads.
///
/// Results come back in item order. An item is `None` when `cancel` was set
/// before a worker picked it up; items already running always finish.
pub fn run_bounded<T, V, E, F>(
    items: &[T],
    workers: usize,
    cancel: &AtomicBool,
    stats: &JobStats,
    f: F,
) -> Vec<Option<Result<V, E>>>
where
    T: Sync,
    V: Send,
    E: Send + Display,
    F: Fn(&T) -> Result<V, E> + Sync,
{
    let mut results: Vec<Option<Result<V, E>>> = (0..items.len()).map(|_| None).collect();
    if items.is_empty() {
        return results;
    }

    let (job_tx, job_rx) = channel::unbounded::<usize>();
    for i in 0..items.len() {
        job_tx.send(i).ok();
    }
    drop(job_tx);

    let (res_tx, res_rx) = channel::unbounded::<(usize, Result<V, E>)>();
    let num_workers = workers.clamp(1, items.len());

    thread::scope(|s| {
        let mut spawned = 0usize;
        for worker_id in 0..num_workers {
            let job_rx = job_rx.clone();
            let res_tx = res_tx.clone();
            let f = &f;
            let spawn = thread::Builder::new()
                .name(format!("extract-worker-{}", worker_id))
                .spawn_scoped(s, move || worker_loop(items, &job_rx, &res_tx, cancel, stats, f));
            match spawn {
                Ok(_) => spawned += 1,
                Err(e) => warn!(worker_id, error = %e, "jobs: failed to spawn worker"),
            }
        }
        if spawned == 0 {
            // No threads available: drain the queue on the caller's thread.
            worker_loop(items, &job_rx, &res_tx, cancel, stats, &f);
        }
    });
    drop(res_tx);

    for (i, r) in res_rx.iter() {
        results[i] = Some(r);
    }
    results
}

fn worker_loop<T, V, E, F>(
    items: &[T],
    job_rx: &Receiver<usize>,
    res_tx: &Sender<(usize, Result<V, E>)>,
    cancel: &AtomicBool,
    stats: &JobStats,
    f: &F,
) where
    E: Display,
    F: Fn(&T) -> Result<V, E>,
{
    for i in job_rx.iter() {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        stats.active.fetch_add(1, Ordering::Relaxed);
        let result = f(&items[i]);
        stats.active.fetch_sub(1, Ordering::Relaxed);

        match &result {
            Ok(_) => stats.record_done(),
            Err(e) => stats.record_fail(&e.to_string()),
        }
        if res_tx.send((i, result)).is_err() {
            break;
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
