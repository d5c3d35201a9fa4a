//! Time-ordered task queue and snapshot types for the scheduler

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::task::{BoxedTask, TaskId};

/// A task waiting in the queue
pub struct QueuedTask {
    pub id: TaskId,
    pub execute_at: Duration,
    pub seq: u64,
    pub task: BoxedTask,
}

impl fmt::Debug for QueuedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedTask")
            .field("id", &self.id)
            .field("execute_at", &self.execute_at)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl Eq for QueuedTask {}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: earliest time, then lowest sequence, is "greatest"
        other
            .execute_at
            .cmp(&self.execute_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Outcome of asking the queue for the next runnable task
#[derive(Debug)]
pub enum Dequeue {
    /// Nothing queued
    Empty,

    /// Head exists but is not due yet
    NotDue { execute_at: Duration },

    /// Head is due but admission was denied; retry no earlier than `retry_at`
    Denied { retry_at: Duration },

    /// Head was due and admitted; it has been removed
    Ready(QueuedTask),
}

/// The queue no longer accepts insertions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

struct QueueInner {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
    closed: bool,
    peak_depth: usize,
}

/// Thread-safe min-heap of pending tasks keyed by `(execute_at, submission order)`
///
/// Every operation runs inside a single critical section, so no caller ever
/// observes a half-applied insert or removal.
pub struct TimeOrderedTaskQueue {
    inner: Mutex<QueueInner>,
}

impl TimeOrderedTaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
                peak_depth: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a task; fails only once the queue has been closed
    pub fn insert(&self, task: BoxedTask, execute_at: Duration) -> Result<TaskId, QueueClosed> {
        let mut inner = self.lock();
        if inner.closed {
            debug!(?execute_at, "TimeOrderedTaskQueue::insert: closed, rejecting");
            return Err(QueueClosed);
        }

        let id = TaskId::new();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueuedTask {
            id,
            execute_at,
            seq,
            task,
        });
        inner.peak_depth = inner.peak_depth.max(inner.heap.len());

        debug!(%id, seq, ?execute_at, depth = inner.heap.len(), "TimeOrderedTaskQueue::insert: queued");
        Ok(id)
    }

    /// Id and time of the earliest entry, without removing it
    pub fn peek_earliest(&self) -> Option<(TaskId, Duration)> {
        self.lock().heap.peek().map(|t| (t.id, t.execute_at))
    }

    /// Remove and return the earliest entry
    pub fn remove_earliest(&self) -> Option<QueuedTask> {
        self.lock().heap.pop()
    }

    /// Inspect the head and, if it is due, run `admit` before removing it
    ///
    /// `admit` is called with the queue lock held, so the head it approves is
    /// the head that gets removed. On `Err(retry_at)` the head stays queued.
    pub fn take_due<F>(&self, now: Duration, admit: F) -> Dequeue
    where
        F: FnOnce() -> Result<(), Duration>,
    {
        let mut inner = self.lock();
        let Some(execute_at) = inner.heap.peek().map(|t| t.execute_at) else {
            return Dequeue::Empty;
        };

        if execute_at > now {
            return Dequeue::NotDue { execute_at };
        }

        match admit() {
            Ok(()) => match inner.heap.pop() {
                Some(task) => Dequeue::Ready(task),
                None => Dequeue::Empty,
            },
            Err(retry_at) => Dequeue::Denied { retry_at },
        }
    }

    /// Remove a still-pending task by id
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut inner = self.lock();
        let before = inner.heap.len();
        inner.heap.retain(|t| t.id != id);
        let removed = inner.heap.len() != before;
        debug!(%id, removed, "TimeOrderedTaskQueue::cancel: called");
        removed
    }

    /// Reject all further insertions
    pub fn close(&self) {
        debug!("TimeOrderedTaskQueue::close: called");
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Remove every pending task, earliest first
    pub fn drain_all(&self) -> Vec<QueuedTask> {
        let mut inner = self.lock();
        let mut drained = Vec::with_capacity(inner.heap.len());
        while let Some(task) = inner.heap.pop() {
            drained.push(task);
        }
        drained
    }

    /// Pending entries in execution order
    pub fn entries(&self) -> Vec<QueueEntry> {
        let inner = self.lock();
        let mut refs: Vec<&QueuedTask> = inner.heap.iter().collect();
        refs.sort_by(|a, b| b.cmp(a));
        refs.into_iter()
            .map(|t| QueueEntry {
                id: t.id,
                execute_at: t.execute_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    pub fn peak_depth(&self) -> usize {
        self.lock().peak_depth
    }
}

impl Default for TimeOrderedTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics for the scheduler
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_scheduled: u64,
    pub total_executed: u64,
    pub total_failed: u64,
    pub total_rate_limited: u64,
    pub total_cancelled: u64,
    pub total_rejected: u64,
    pub total_abandoned: u64,
    pub peak_queue_depth: usize,
}

/// A pending queue entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: TaskId,
    pub execute_at: Duration,
}

/// Queue state snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueState {
    pub pending: usize,
    pub next_due: Option<Duration>,
    pub tokens_available: u32,
    pub accepting: bool,
    pub stats: SchedulerStats,
}
