//! Shared fixture for the recall integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cbrecall_engine::executor::{ScheduleError, Task};
use cbrecall_engine::state::FileObject;
use cbrecall_engine::types::{ExportId, FileHandle};
use cbrecall_engine::{
    Clock, Collaborators, MemoryBackend, ObjectStore, RecallConfig, RecallEngine,
    ScriptedTransport, TaskExecutor, TokioClock, TokioExecutor,
};
use tokio::time::Instant;

pub const EXPORT: ExportId = ExportId(1);

/// Executor refusing the schedule calls at the given zero-based positions.
pub struct FailingExecutor {
    inner: Arc<TokioExecutor>,
    fail_at: Vec<u64>,
    calls: AtomicU64,
}

impl TaskExecutor for FailingExecutor {
    fn schedule(&self, delay: Duration, task: Task) -> Result<(), ScheduleError> {
        let n = self.calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_at.contains(&n) {
            return Err(ScheduleError::ShutDown);
        }
        self.inner.schedule(delay, task)
    }
}

/// Engine wired to an in-memory back-end and a scripted transport.
///
/// Must be built inside a (paused) tokio runtime.
pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub transport: Arc<ScriptedTransport>,
    pub executor: Arc<TokioExecutor>,
    pub engine: Arc<RecallEngine>,
    pub start: Instant,
}

impl Harness {
    pub fn new(lease_secs: u32) -> Self {
        Self::with_config(RecallConfig::with_lease(lease_secs))
    }

    pub fn with_config(config: RecallConfig) -> Self {
        Self::build(config, &[], |backend| backend as Arc<dyn ObjectStore>)
    }

    /// Engine whose executor refuses the schedule calls at `fail_at`.
    pub fn failing_schedules(lease_secs: u32, fail_at: &[u64]) -> Self {
        Self::build(RecallConfig::with_lease(lease_secs), fail_at, |backend| {
            backend as Arc<dyn ObjectStore>
        })
    }

    /// Engine revoking and returning through the store `wrap` builds.
    pub fn with_store<F>(lease_secs: u32, wrap: F) -> Self
    where
        F: FnOnce(Arc<MemoryBackend>) -> Arc<dyn ObjectStore>,
    {
        Self::build(RecallConfig::with_lease(lease_secs), &[], wrap)
    }

    fn build<F>(config: RecallConfig, fail_at: &[u64], wrap: F) -> Self
    where
        F: FnOnce(Arc<MemoryBackend>) -> Arc<dyn ObjectStore>,
    {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let backend = Arc::new(MemoryBackend::new(clock.clone(), config.callback_ident));
        backend.add_export(EXPORT, "/export");
        let transport = Arc::new(ScriptedTransport::new(clock.clone()));
        let executor = Arc::new(TokioExecutor::current());
        let engine_executor: Arc<dyn TaskExecutor> = if fail_at.is_empty() {
            executor.clone()
        } else {
            Arc::new(FailingExecutor {
                inner: executor.clone(),
                fail_at: fail_at.to_vec(),
                calls: AtomicU64::new(0),
            })
        };
        let engine = RecallEngine::new(
            config,
            Collaborators {
                store: wrap(backend.clone()),
                states: backend.clone(),
                exports: backend.clone(),
                clients: backend.clone(),
                transport: transport.clone(),
                executor: engine_executor,
                clock,
            },
        )
        .expect("valid config");
        Self {
            backend,
            transport,
            executor,
            engine,
            start: Instant::now(),
        }
    }

    /// Adds a file with the given handle bytes.
    pub fn file(&self, name: &[u8]) -> (Arc<FileObject>, FileHandle) {
        let handle = FileHandle::new(name.to_vec());
        let file = self.backend.add_file(EXPORT, handle.clone());
        (file, handle)
    }

    /// Time since the harness was built.
    pub fn since_start(&self, at: Instant) -> Duration {
        at.saturating_duration_since(self.start)
    }
}

/// Lets paused time run forward, firing every timer due on the way.
pub async fn run_for(d: Duration) {
    tokio::time::sleep(d).await;
}

/// Lets already-runnable tasks run without moving time.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
