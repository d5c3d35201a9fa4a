//! Pacer - delayed task scheduler with rate-limited, atomic execution
//!
//! Producers submit tasks with a due time; a single worker runs each task no
//! earlier than that time, one at a time, while a token bucket caps the
//! sustained execution rate.
//!
//! # Core Concepts
//!
//! - **Time-ordered queue**: earliest due time first, submission order breaks ties
//! - **Token bucket admission**: bursts up to capacity, continuous refill, no fixed polling
//! - **Atomic execution**: exactly one task body runs at a time, outside every lock
//! - **Deterministic shutdown**: drain due work or abandon it, then join the worker
//!
//! # Modules
//!
//! - [`scheduler`] - Queue, token bucket, shutdown state and the scheduler loop
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod scheduler;

// Re-export commonly used types
pub use config::{Config, LoggingConfig};
pub use scheduler::{
    Clock, ErrorSink, LogErrorSink, LoopState, ManualClock, QueueEntry, QueueState, RateLimiter, Scheduler,
    SchedulerBuilder, SchedulerConfig, SchedulerError, SchedulerStats, ShutdownController, ShutdownMode, ShutdownState, Task,
    TaskExecutionError, TaskHandle, TaskId, TimeOrderedTaskQueue, TokenBucket, TokioClock,
};
