//! Cooperative shutdown state shared by producers and the scheduler loop

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tracing::{debug, info};

/// How pending work is treated once shutdown is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownMode {
    /// Run every pending task at its due time, then exit
    DrainAll,
    /// Run only tasks already due when shutdown was requested
    DrainDue,
    /// Start no further task
    Abort,
}

impl ShutdownMode {
    /// `true` drains everything, `false` aborts
    pub fn from_drain(drain: bool) -> Self {
        if drain { ShutdownMode::DrainAll } else { ShutdownMode::Abort }
    }
}

/// Lifecycle of a scheduler
///
/// Transitions only move forward: `Running -> Draining -> Stopped`, or
/// `Running -> Stopped` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownState {
    /// Accepting submissions and executing tasks
    Running,

    /// Rejecting submissions; queued tasks still run, limited to those due
    /// at or before `cutoff` when one is set
    Draining { cutoff: Option<Duration> },

    /// No further task will start
    Stopped,
}

impl ShutdownState {
    fn rank(&self) -> u8 {
        match self {
            ShutdownState::Running => 0,
            ShutdownState::Draining { .. } => 1,
            ShutdownState::Stopped => 2,
        }
    }
}

/// Shared shutdown flag plus the "loop has exited" signal
#[derive(Debug)]
pub struct ShutdownController {
    state: watch::Sender<ShutdownState>,
    exited: watch::Sender<bool>,
    wakeup: Arc<Notify>,
}

impl ShutdownController {
    /// Create a controller that wakes `wakeup` on every state change
    pub fn new(wakeup: Arc<Notify>) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        let (exited, _) = watch::channel(false);
        Self { state, exited, wakeup }
    }

    /// Request shutdown; `now` becomes the cutoff for [`ShutdownMode::DrainDue`]
    ///
    /// Idempotent. An abort escalates an in-progress drain; a second drain
    /// request keeps the first one's cutoff. Returns true if the state changed.
    pub fn request_shutdown(&self, mode: ShutdownMode, now: Duration) -> bool {
        debug!(?mode, ?now, "ShutdownController::request_shutdown: called");
        let target = match mode {
            ShutdownMode::DrainAll => ShutdownState::Draining { cutoff: None },
            ShutdownMode::DrainDue => ShutdownState::Draining { cutoff: Some(now) },
            ShutdownMode::Abort => ShutdownState::Stopped,
        };

        let changed = self.state.send_if_modified(|state| {
            if target.rank() > state.rank() {
                *state = target;
                true
            } else {
                false
            }
        });

        if changed {
            info!(state = ?target, "Shutdown requested");
            self.wakeup.notify_one();
        }
        changed
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn is_accepting_submissions(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Called by the loop as its last act
    pub(crate) fn mark_exited(&self) {
        debug!("ShutdownController::mark_exited: called");
        self.state.send_replace(ShutdownState::Stopped);
        self.exited.send_replace(true);
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Wait until the loop has exited
    ///
    /// Once this returns no task is executing and none will start.
    pub async fn await_stopped(&self) {
        let mut rx = self.exited.subscribe();
        // The sender is owned by self, so the channel cannot close while we wait
        let _ = rx.wait_for(|exited| *exited).await;
    }
}
