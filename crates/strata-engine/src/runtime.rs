//! Explicitly constructed runtime: one event pool plus one scheduler

use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, TaskError};
use crate::ev::EventThreadPool;
use crate::scheduler::{Scheduler, SchedulerHandle, TaskOptions, TaskWithResult};
use std::future::Future;
use std::sync::Arc;

/// Event-loop pool and task scheduler bundled together.
///
/// Nothing here is process-global: several runtimes can coexist, which is
/// what tests rely on.
pub struct Runtime {
    scheduler: Scheduler,
    ev_pool: Arc<EventThreadPool>,
}

impl Runtime {
    /// Build and start a runtime
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let ev_pool = Arc::new(EventThreadPool::new(&config.event_pool)?);
        let scheduler = Scheduler::new(&config.scheduler, ev_pool.clone())?;
        scheduler.start()?;
        Ok(Self { scheduler, ev_pool })
    }

    /// Cloneable submitter for this runtime's scheduler
    pub fn handle(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    /// The scheduler
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The event-loop pool
    pub fn event_pool(&self) -> &Arc<EventThreadPool> {
        &self.ev_pool
    }

    /// Submit with default options
    pub fn spawn<F, T>(&self, future: F) -> TaskWithResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.scheduler.spawn(future)
    }

    /// Submit with explicit options
    pub fn submit<F, T>(&self, options: TaskOptions, future: F) -> TaskWithResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.scheduler.submit(options, future)
    }

    /// Run `future` as a task and block the calling thread until it finishes.
    ///
    /// Meant for plain OS threads. Called from inside a task it blocks that
    /// task's worker for the whole wait; await [`TaskWithResult::get`] there
    /// instead.
    pub fn block_on<F, T>(&self, future: F) -> Result<T, TaskError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.scheduler.spawn(future).blocking_get()
    }

    /// Shut the scheduler down, then the event pool. Idempotent.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.ev_pool.shutdown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("scheduler", &self.scheduler.handle())
            .field("event_pool", &self.ev_pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::current_task;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::with_workers(2).with_event_threads(1)).unwrap()
    }

    #[test]
    fn test_block_on_returns_value() {
        let rt = runtime();
        assert_eq!(rt.block_on(async { "done" }), Ok("done"));
    }

    #[test]
    fn test_block_on_runs_inside_task() {
        let rt = runtime();
        let inside = rt.block_on(async { current_task::id().is_some() }).unwrap();
        assert!(inside);
    }

    #[test]
    fn test_two_runtimes_coexist() {
        let a = runtime();
        let b = runtime();
        let from_b = b.handle();
        let value = a
            .block_on(async move { from_b.spawn(async { 7 }).get().await })
            .unwrap();
        assert_eq!(value, Ok(7));
    }

    #[test]
    fn test_shutdown_twice() {
        let rt = runtime();
        rt.shutdown();
        rt.shutdown();
        assert!(rt.event_pool().is_stopped());
    }
}
