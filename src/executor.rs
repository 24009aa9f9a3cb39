//! # Execution Service & Failure Sink
//!
//! The [`Treadmill`](crate::Treadmill) never runs steps on the caller's thread. Every step
//! and every resumption is submitted as a task to an [`Executor`]; the default
//! [`TokioExecutor`] spawns onto a tokio runtime.
//!
//! Failures of a run (handler errors, panics, resolution failures, abandoned or expired
//! deferrals) are forwarded to one [`UncaughtHandler`], shared by every run of a treadmill and
//! therefore called concurrently from many executor threads.

use crate::error::{ChainError, ConfigError};
use crate::treadmill::RunId;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tracing::error;

/// A unit of work submitted to an executor.
pub type Task = BoxFuture<'static, ()>;

/// Anything that can run submitted tasks to completion.
pub trait Executor: Send + Sync {
    fn submit(&self, task: Task);
}

/// Spawns tasks onto a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running in.
    pub fn current() -> Result<Self, ConfigError> {
        Ok(Self::new(Handle::try_current()?))
    }
}

impl Executor for TokioExecutor {
    fn submit(&self, task: Task) {
        // Detached; the run reports its own completion.
        drop(self.handle.spawn(task));
    }
}

/// Process-wide sink for failures no handler dealt with.
pub trait UncaughtHandler: Send + Sync {
    fn uncaught(&self, run_id: RunId, error: &ChainError);
}

impl<F> UncaughtHandler for F
where
    F: Fn(RunId, &ChainError) + Send + Sync,
{
    fn uncaught(&self, run_id: RunId, error: &ChainError) {
        self(run_id, error)
    }
}

/// Default sink: logs the failure at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogUncaught;

impl UncaughtHandler for LogUncaught {
    fn uncaught(&self, run_id: RunId, error: &ChainError) {
        error!(%run_id, %error, "Uncaught failure in run");
    }
}
