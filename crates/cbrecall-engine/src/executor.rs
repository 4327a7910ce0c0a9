//! Delayed task execution.
//!
//! Every follow-up step of a recall (retry, liveness re-check, waiting for a
//! callback reply) is handed to a [`TaskExecutor`] as an owned future and the
//! current step returns. Nothing in the engine blocks a worker waiting for a
//! client.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use tracing::debug;

/// A unit of deferred work.
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Why a task could not be queued.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// The executor no longer accepts work
    #[error("executor is shut down")]
    ShutDown,
}

/// Runs each task once, no earlier than `delay` from now.
///
/// No ordering is promised between independently scheduled tasks.
pub trait TaskExecutor: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, task: Task) -> Result<(), ScheduleError>;
}

/// Boxes a future into a [`Task`].
pub fn task<F>(fut: F) -> Task
where
    F: Future<Output = ()> + Send + 'static,
{
    Box::pin(fut)
}

/// [`TaskExecutor`] spawning onto a tokio runtime.
pub struct TokioExecutor {
    handle: Handle,
    shut_down: AtomicBool,
    scheduled: AtomicU64,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            shut_down: AtomicBool::new(false),
            scheduled: AtomicU64::new(0),
        }
    }

    /// Executor on the runtime the caller is running in.
    ///
    /// Panics outside a tokio runtime, like `Handle::current`.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Refuse all further tasks. Already queued tasks still run.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Number of tasks accepted so far.
    pub fn scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }
}

impl TaskExecutor for TokioExecutor {
    fn schedule(&self, delay: Duration, task: Task) -> Result<(), ScheduleError> {
        if self.is_shut_down() {
            debug!(?delay, "rejecting task, executor shut down");
            return Err(ScheduleError::ShutDown);
        }
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task.await;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_after_delay() {
        let exec = TokioExecutor::current();
        let start = Instant::now();
        let fired = Arc::new(Mutex::new(None));
        let slot = fired.clone();

        exec.schedule(
            Duration::from_millis(250),
            task(async move {
                *slot.lock().unwrap() = Some(Instant::now());
            }),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let at = fired.lock().unwrap().expect("task did not run");
        assert_eq!(at - start, Duration::from_millis(250));
        assert_eq!(exec.scheduled(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_runs_without_time_passing() {
        let exec = TokioExecutor::current();
        let start = Instant::now();
        let (tx, rx) = tokio::sync::oneshot::channel();
        exec.schedule(
            Duration::ZERO,
            task(async move {
                let _ = tx.send(Instant::now());
            }),
        )
        .unwrap();
        let at = rx.await.unwrap();
        assert_eq!(at, start);
    }

    #[tokio::test]
    async fn test_shutdown_rejects() {
        let exec = TokioExecutor::current();
        exec.shutdown();
        assert!(exec.is_shut_down());
        let result = exec.schedule(Duration::ZERO, task(async {}));
        assert_eq!(result, Err(ScheduleError::ShutDown));
        assert_eq!(exec.scheduled(), 0);
    }
}
