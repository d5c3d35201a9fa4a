//! Scheduler implementation

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::bucket::{BucketStats, RateLimiter, TokenBucket};
use super::clock::{Clock, TokioClock};
use super::config::SchedulerConfig;
use super::error::{SchedulerError, TaskExecutionError};
use super::queue::{Dequeue, QueueEntry, QueueState, QueuedTask, SchedulerStats, TimeOrderedTaskQueue};
use super::shutdown::{ShutdownController, ShutdownMode, ShutdownState};
use super::task::{Task, TaskId};

/// Receives task failures from the scheduler loop
pub trait ErrorSink: Send + Sync {
    fn on_task_error(&self, error: TaskExecutionError);
}

impl<F> ErrorSink for F
where
    F: Fn(TaskExecutionError) + Send + Sync,
{
    fn on_task_error(&self, error: TaskExecutionError) {
        self(error)
    }
}

/// Default sink: log and move on
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn on_task_error(&self, error: TaskExecutionError) {
        error!(task_id = %error.task_id(), %error, "Task failed");
    }
}

/// Where the scheduler loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    /// Queue empty, waiting for work or shutdown
    Idle,
    /// Waiting for the head's due time, a token, an earlier submission or shutdown
    ArmedWait,
    /// Head is due, asking the bucket for a token
    Admitting,
    /// A task body is running
    Executing,
    /// Finishing queued tasks after a draining shutdown
    Draining,
    /// Loop has exited
    Stopped,
}

/// State shared by the scheduler, its handles and the loop
struct Inner {
    queue: TimeOrderedTaskQueue,
    limiter: RateLimiter,
    shutdown: ShutdownController,
    wakeup: Arc<Notify>,
    clock: Arc<dyn Clock>,
    error_sink: Arc<dyn ErrorSink>,
    stats: Mutex<SchedulerStats>,
    loop_state: Mutex<LoopState>,
}

impl Inner {
    fn stats(&self) -> MutexGuard<'_, SchedulerStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_loop_state(&self, state: LoopState) {
        *self.loop_state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn loop_state(&self) -> LoopState {
        *self.loop_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self, id: TaskId) -> bool {
        let removed = self.queue.cancel(id);
        if removed {
            self.stats().total_cancelled += 1;
            self.wakeup.notify_one();
        }
        removed
    }
}

/// Handle to a submitted task
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    execute_at: Duration,
    inner: Weak<Inner>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Clock time the task is due
    pub fn execute_at(&self) -> Duration {
        self.execute_at
    }

    /// Remove the task if it has not started yet
    pub fn cancel(&self) -> bool {
        debug!(id = %self.id, "TaskHandle::cancel: called");
        match self.inner.upgrade() {
            Some(inner) => inner.cancel(self.id),
            None => false,
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("execute_at", &self.execute_at)
            .finish()
    }
}

/// Builder for a [`Scheduler`] with a custom clock or error sink
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    clock: Option<Arc<dyn Clock>>,
    error_sink: Option<Arc<dyn ErrorSink>>,
}

impl SchedulerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn error_sink(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.error_sink = Some(Arc::new(sink));
        self
    }

    /// Validate the config and spawn the loop on the current tokio runtime
    pub fn spawn(self) -> Result<Scheduler, SchedulerError> {
        debug!(config = ?self.config, "SchedulerBuilder::spawn: called");
        self.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(TokioClock::new()),
        };
        let error_sink: Arc<dyn ErrorSink> = match self.error_sink {
            Some(sink) => sink,
            None => Arc::new(LogErrorSink),
        };
        let now = clock.now();
        let bucket = if self.config.start_full {
            TokenBucket::new(self.config.max_tokens, self.config.refill_rate_per_sec, now)
        } else {
            TokenBucket::new_empty(self.config.max_tokens, self.config.refill_rate_per_sec, now)
        };

        let wakeup = Arc::new(Notify::new());
        let inner = Arc::new(Inner {
            queue: TimeOrderedTaskQueue::new(),
            limiter: RateLimiter::new(bucket, clock.clone()),
            shutdown: ShutdownController::new(wakeup.clone()),
            wakeup,
            clock,
            error_sink,
            stats: Mutex::new(SchedulerStats::default()),
            loop_state: Mutex::new(LoopState::Idle),
        });

        let worker = runtime.spawn(run_loop(inner.clone()));
        info!(
            max_tokens = self.config.max_tokens,
            refill_rate_per_sec = self.config.refill_rate_per_sec,
            "Scheduler started"
        );

        Ok(Scheduler {
            config: self.config,
            inner,
            worker: Some(worker),
        })
    }
}

/// Delayed task scheduler with token-bucket admission
///
/// Tasks run one at a time on a single worker owned by the scheduler, each no
/// earlier than its due time and never faster than the bucket allows.
///
/// Dropping the scheduler requests an abort but does not wait for the worker:
/// a task already executing runs to completion on the runtime after the drop,
/// and pending tasks are abandoned. Call [`stop`](Self::stop) to join it.
pub struct Scheduler {
    config: SchedulerConfig,
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Create a scheduler with the runtime clock and the logging error sink
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::builder(config).spawn()
    }

    /// Create a scheduler allowing bursts of `max_tokens`, refilled at `refill_rate_per_sec`
    pub fn with_rate(max_tokens: u32, refill_rate_per_sec: f64) -> Result<Self, SchedulerError> {
        Self::new(SchedulerConfig::with_rate(max_tokens, refill_rate_per_sec))
    }

    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            clock: None,
            error_sink: None,
        }
    }

    /// Schedule a task to run at clock time `execute_at`
    pub fn schedule_at<T: Task>(&self, task: T, execute_at: Duration) -> Result<TaskHandle, SchedulerError> {
        debug!(?execute_at, "Scheduler::schedule_at: called");
        match self.inner.queue.insert(Box::new(task), execute_at) {
            Ok(id) => {
                self.inner.stats().total_scheduled += 1;
                self.inner.wakeup.notify_one();
                Ok(TaskHandle {
                    id,
                    execute_at,
                    inner: Arc::downgrade(&self.inner),
                })
            }
            Err(_) => {
                self.inner.stats().total_rejected += 1;
                warn!(?execute_at, "Rejected submission: scheduler closed");
                Err(SchedulerError::Closed)
            }
        }
    }

    /// Schedule a task to run `delay` from now
    pub fn schedule_after<T: Task>(&self, task: T, delay: Duration) -> Result<TaskHandle, SchedulerError> {
        debug!(?delay, "Scheduler::schedule_after: called");
        self.schedule_at(task, self.inner.clock.now().saturating_add(delay))
    }

    /// Schedule a task to run as soon as a token allows
    pub fn schedule_now<T: Task>(&self, task: T) -> Result<TaskHandle, SchedulerError> {
        self.schedule_after(task, Duration::ZERO)
    }

    /// Cancel a pending task
    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        debug!(id = %handle.id, "Scheduler::cancel: called");
        self.inner.cancel(handle.id)
    }

    /// Stop accepting submissions and signal the loop
    ///
    /// With `drain`, every queued task still runs at its due time before the
    /// loop exits; without it, no further task starts. Idempotent.
    pub fn shutdown(&self, drain: bool) {
        self.shutdown_with(ShutdownMode::from_drain(drain));
    }

    /// Stop accepting submissions, treating pending work according to `mode`
    pub fn shutdown_with(&self, mode: ShutdownMode) {
        debug!(?mode, "Scheduler::shutdown_with: called");
        self.inner.queue.close();
        self.inner.shutdown.request_shutdown(mode, self.inner.clock.now());
    }

    /// Wait until the loop has exited
    pub async fn await_stopped(&self) {
        debug!("Scheduler::await_stopped: called");
        self.inner.shutdown.await_stopped().await;
    }

    /// Shut down, wait for the worker to finish, and return final stats
    pub async fn stop(self, drain: bool) -> Result<SchedulerStats, SchedulerError> {
        self.stop_with(ShutdownMode::from_drain(drain)).await
    }

    /// [`stop`](Self::stop) with an explicit [`ShutdownMode`]
    pub async fn stop_with(mut self, mode: ShutdownMode) -> Result<SchedulerStats, SchedulerError> {
        debug!(?mode, "Scheduler::stop_with: called");
        self.shutdown_with(mode);
        if let Some(worker) = self.worker.take() {
            worker.await.map_err(|e| {
                error!(error = %e, "Scheduler loop did not finish cleanly");
                SchedulerError::WorkerPanicked
            })?;
        }
        Ok(self.stats())
    }

    pub fn state(&self) -> ShutdownState {
        self.inner.shutdown.state()
    }

    pub fn loop_state(&self) -> LoopState {
        self.inner.loop_state()
    }

    pub fn is_accepting_submissions(&self) -> bool {
        self.inner.shutdown.is_accepting_submissions()
    }

    /// Current time on the scheduler's clock
    pub fn now(&self) -> Duration {
        self.inner.clock.now()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = self.inner.stats().clone();
        stats.peak_queue_depth = self.inner.queue.peak_depth();
        stats
    }

    pub fn bucket_stats(&self) -> BucketStats {
        self.inner.limiter.stats()
    }

    pub fn queue_state(&self) -> QueueState {
        QueueState {
            pending: self.inner.queue.len(),
            next_due: self.inner.queue.peek_earliest().map(|(_, at)| at),
            tokens_available: self.inner.limiter.available(),
            accepting: self.is_accepting_submissions(),
            stats: self.stats(),
        }
    }

    /// Pending tasks in execution order
    pub fn queue_details(&self) -> Vec<QueueEntry> {
        self.inner.queue.entries()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.worker.is_some() && !self.inner.shutdown.has_exited() {
            debug!("Scheduler::drop: stopping loop without drain");
            self.inner.queue.close();
            self.inner.shutdown.request_shutdown(ShutdownMode::Abort, self.inner.clock.now());
        }
    }
}

/// Block on the shared wakeup channel, optionally bounded by a deadline
async fn wait(inner: &Inner, deadline: Option<Duration>) {
    match deadline {
        Some(deadline) => {
            tokio::select! {
                _ = inner.wakeup.notified() => {}
                _ = inner.clock.sleep_until(deadline) => {}
            }
        }
        None => inner.wakeup.notified().await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

async fn execute(inner: &Inner, queued: QueuedTask) {
    let QueuedTask { id, execute_at, task, .. } = queued;
    let started = inner.clock.now();
    debug!(%id, ?execute_at, lateness = ?started.saturating_sub(execute_at), "Executing task");

    let failure = match AssertUnwindSafe(task.run()).catch_unwind().await {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(TaskExecutionError::Failed { task_id: id, error }),
        Err(panic) => Some(TaskExecutionError::Panicked {
            task_id: id,
            message: panic_message(panic.as_ref()),
        }),
    };

    {
        let mut stats = inner.stats();
        stats.total_executed += 1;
        if failure.is_some() {
            stats.total_failed += 1;
        }
    }

    if let Some(failure) = failure {
        warn!(%id, error = %failure, "Task failed, reporting to error sink");
        let sink = inner.error_sink.clone();
        if std::panic::catch_unwind(AssertUnwindSafe(move || sink.on_task_error(failure))).is_err() {
            error!(%id, "Error sink panicked");
        }
    }
}

/// Closes the queue and signals exit when the loop ends, including by panic
struct LoopExit<'a> {
    inner: &'a Inner,
}

impl Drop for LoopExit<'_> {
    fn drop(&mut self) {
        let inner = self.inner;
        inner.queue.close();
        let abandoned = inner.queue.drain_all();
        if !abandoned.is_empty() {
            info!(count = abandoned.len(), "Abandoning pending tasks");
            inner.stats().total_abandoned += abandoned.len() as u64;
        }
        drop(abandoned);

        if std::thread::panicking() {
            error!("Scheduler loop panicked");
        }
        inner.set_loop_state(LoopState::Stopped);
        inner.shutdown.mark_exited();
        info!("Scheduler loop stopped");
    }
}

/// The single executor
async fn run_loop(inner: Arc<Inner>) {
    info!("Scheduler loop started");
    let _exit = LoopExit { inner: &inner };

    loop {
        let state = inner.shutdown.state();
        let now = inner.clock.now();
        let (horizon, cutoff) = match state {
            ShutdownState::Running => (now, None),
            ShutdownState::Draining { cutoff: None } => (now, None),
            ShutdownState::Draining { cutoff: Some(cutoff) } => (cutoff.min(now), Some(cutoff)),
            ShutdownState::Stopped => break,
        };
        let draining = matches!(state, ShutdownState::Draining { .. });
        let waiting = |armed: LoopState| if draining { LoopState::Draining } else { armed };

        match inner.queue.take_due(horizon, || {
            inner.set_loop_state(LoopState::Admitting);
            inner.limiter.admit()
        }) {
            Dequeue::Empty => {
                if draining {
                    debug!("run_loop: drain complete, queue empty");
                    break;
                }
                inner.set_loop_state(LoopState::Idle);
                wait(&inner, None).await;
            }
            Dequeue::NotDue { execute_at } => {
                if let Some(cutoff) = cutoff {
                    debug!(?execute_at, ?cutoff, "run_loop: drain complete, remaining tasks are past the cutoff");
                    break;
                }
                inner.set_loop_state(waiting(LoopState::ArmedWait));
                wait(&inner, Some(execute_at)).await;
            }
            Dequeue::Denied { retry_at } => {
                inner.stats().total_rate_limited += 1;
                debug!(?retry_at, "run_loop: rate limited, re-arming for next token");
                inner.set_loop_state(waiting(LoopState::ArmedWait));
                wait(&inner, Some(retry_at)).await;
            }
            Dequeue::Ready(task) => {
                if inner.shutdown.state() == ShutdownState::Stopped {
                    debug!(id = %task.id, "run_loop: stop requested after dequeue, abandoning task");
                    inner.stats().total_abandoned += 1;
                    break;
                }
                inner.set_loop_state(LoopState::Executing);
                execute(&inner, task).await;
            }
        }
    }
}
