//! Task types: the runnable capability the loop executes

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique id assigned to every submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work the scheduler runs exactly once
///
/// Consumed on execution. Returning `Err` (or panicking) reports a
/// [`TaskExecutionError`](super::TaskExecutionError) to the error sink.
#[async_trait]
pub trait Task: Send + 'static {
    async fn run(self: Box<Self>) -> Result<()>;
}

/// Task wrapping a synchronous closure
pub struct FnTask<F>(F);

#[async_trait]
impl<F> Task for FnTask<F>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    async fn run(self: Box<Self>) -> Result<()> {
        (self.0)()
    }
}

/// Task wrapping a future
pub struct FutureTask<Fut>(Fut);

#[async_trait]
impl<Fut> Task for FutureTask<Fut>
where
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(self: Box<Self>) -> Result<()> {
        self.0.await
    }
}

/// Build a task from a synchronous closure
///
/// The closure runs on the scheduler's worker, so long blocking work here
/// delays every later task; prefer [`from_future`] for I/O.
pub fn from_fn<F>(f: F) -> FnTask<F>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    FnTask(f)
}

/// Build a task from a future
pub fn from_future<Fut>(fut: Fut) -> FutureTask<Fut>
where
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FutureTask(fut)
}

pub type BoxedTask = Box<dyn Task>;
