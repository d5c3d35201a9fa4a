//! Monotonic clock sources
//!
//! All scheduler times are `Duration` offsets from the clock's origin, so a
//! test clock can stand in for the runtime clock without touching the loop.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

/// A monotonic time source the scheduler reads and sleeps against
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time as an offset from the clock's origin
    fn now(&self) -> Duration;

    /// Suspend until `now() >= deadline`
    async fn sleep_until(&self, deadline: Duration);
}

/// Clock backed by the tokio runtime timer
///
/// Honors `tokio::time::pause()` so paused-time tests work with it too.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep_until(&self, deadline: Duration) {
        match self.origin.checked_add(deadline) {
            Some(at) => tokio::time::sleep_until(at).await,
            // Past the platform's representable instants: never fires
            None => std::future::pending::<()>().await,
        }
    }
}

/// Clock that only moves when told to
///
/// Sleepers wake as soon as `advance` or `set` moves time past their deadline.
/// `set` may move time backwards to simulate a misbehaving clock source.
pub struct ManualClock {
    tx: watch::Sender<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Duration::ZERO)
    }

    pub fn starting_at(start: Duration) -> Self {
        let (tx, _rx) = watch::channel(start);
        Self { tx }
    }

    /// Move time forward by `by`
    pub fn advance(&self, by: Duration) {
        debug!(?by, "ManualClock::advance: called");
        self.tx.send_modify(|now| *now = now.saturating_add(by));
    }

    /// Jump to an absolute time, forwards or backwards
    pub fn set(&self, to: Duration) {
        debug!(?to, "ManualClock::set: called");
        self.tx.send_replace(to);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock").field("now", &*self.tx.borrow()).finish()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.tx.borrow()
    }

    async fn sleep_until(&self, deadline: Duration) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as self, so wait_for cannot observe a close
        let _ = rx.wait_for(|now| *now >= deadline).await;
    }
}
