//! Per-root sync state: which reconciliation (if any) is in flight.
//!
//! A pass starts with [`SyncMachine::try_begin`], which hands out a
//! [`PassToken`]. Holding the token is what makes a pass exclusive; the
//! mutex only guards the state word.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error};

use crate::error::SyncError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Initializing,
    Updating,
    Error,
}

impl SyncState {
    pub fn is_reconciling(&self) -> bool {
        matches!(self, SyncState::Initializing | SyncState::Updating)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncState::Idle => "idle",
            SyncState::Initializing => "initializing",
            SyncState::Updating => "updating",
            SyncState::Error => "error",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassKind {
    /// First pass after a root is adopted.
    Initialize,
    /// Every later pass, manual or watcher-triggered.
    Update,
}

/// Who asked for the pass. Only a user can leave the `Error` state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    User,
    Watcher,
}

#[derive(Debug)]
struct Inner {
    state: SyncState,
    status: String,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct SyncMachine {
    inner: Mutex<Inner>,
}

impl Default for SyncMachine {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SyncState::Idle,
                status: String::new(),
                last_error: None,
            }),
        }
    }
}

impl SyncMachine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SyncState {
        self.lock().state
    }

    pub fn is_reconciling(&self) -> bool {
        self.state().is_reconciling()
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Human-readable line for display.
    pub fn status_text(&self) -> String {
        let inner = self.lock();
        match inner.state {
            SyncState::Initializing => "Initializing catalog...".into(),
            SyncState::Updating => "Updating catalog...".into(),
            SyncState::Error => format!(
                "Catalog error: {}",
                inner.last_error.as_deref().unwrap_or("unknown")
            ),
            SyncState::Idle => inner.status.clone(),
        }
    }

    /// Enter `Initializing`/`Updating`, or refuse.
    pub fn try_begin(self: &Arc<Self>, kind: PassKind, origin: Origin) -> Result<PassToken, SyncError> {
        let mut inner = self.lock();
        match inner.state {
            s if s.is_reconciling() => return Err(SyncError::Busy(s)),
            SyncState::Error if origin == Origin::Watcher => return Err(SyncError::RetryRequired),
            _ => {}
        }
        inner.state = match kind {
            PassKind::Initialize => SyncState::Initializing,
            PassKind::Update => SyncState::Updating,
        };
        debug!(state = %inner.state, ?origin, "sync: pass started");
        Ok(PassToken {
            machine: Arc::clone(self),
            finished: false,
        })
    }

    fn finish(&self, outcome: Result<String, String>) {
        let mut inner = self.lock();
        match outcome {
            Ok(summary) => {
                inner.state = SyncState::Idle;
                inner.status = summary;
                inner.last_error = None;
            }
            Err(message) => {
                error!(error = %message, "sync: pass failed");
                inner.state = SyncState::Error;
                inner.last_error = Some(message);
            }
        }
    }
}

/// Proof that a pass is running. Finish it with [`PassToken::complete`] or
/// [`PassToken::fail`]; dropping it unfinished counts as a failure.
#[derive(Debug)]
pub struct PassToken {
    machine: Arc<SyncMachine>,
    finished: bool,
}

impl PassToken {
    pub fn complete(mut self, summary: impl Into<String>) {
        self.finished = true;
        self.machine.finish(Ok(summary.into()));
    }

    pub fn fail(mut self, message: impl Into<String>) {
        self.finished = true;
        self.machine.finish(Err(message.into()));
    }
}

impl Drop for PassToken {
    fn drop(&mut self) {
        if !self.finished {
            self.machine
                .finish(Err("reconciliation pass aborted".into()));
        }
    }
}
