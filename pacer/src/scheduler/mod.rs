//! Delayed task scheduler
//!
//! Tasks are queued by due time and executed one at a time by a single
//! worker, gated by a token bucket. Shutdown either drains tasks that are
//! already due or abandons everything still queued.

mod bucket;
mod clock;
mod config;
mod core;
mod error;
mod queue;
mod shutdown;
pub mod task;

pub use bucket::{BucketStats, RateLimiter, TokenBucket};
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::SchedulerConfig;
pub use self::core::{ErrorSink, LogErrorSink, LoopState, Scheduler, SchedulerBuilder, TaskHandle};
pub use error::{SchedulerError, TaskExecutionError};
pub use queue::{Dequeue, QueueClosed, QueueEntry, QueueState, QueuedTask, SchedulerStats, TimeOrderedTaskQueue};
pub use shutdown::{ShutdownController, ShutdownMode, ShutdownState};
pub use task::{BoxedTask, FnTask, FutureTask, Task, TaskId, from_fn, from_future};
