//! Task scheduler coordinating worker threads
//!
//! Every unpinned task goes through one shared injector, so any idle worker
//! can pick it up. Each worker also owns a FIFO inbox that only receives
//! tasks pinned to it. Workers never steal from each other's inboxes.

use super::current_task as current;
use super::handle::{ResultSlot, TaskWithResult};
use super::task::{BoxFuture, Outcome, TaskContext, TaskId, TaskOptions, TaskState};
use super::worker::Worker;
use crate::config::SchedulerConfig;
use crate::error::{invariant_violation, CancellationReason, RuntimeError};
use crate::ev::EventThreadPool;
use crossbeam::queue::SegQueue;
use crossbeam::sync::{Parker, Unparker};
use crossbeam_deque::{Injector, Steal};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Total tasks submitted, including refused ones
    pub tasks_spawned: u64,

    /// Tasks that finished `Completed`
    pub tasks_completed: u64,

    /// Tasks whose body panicked
    pub tasks_failed: u64,

    /// Tasks that finished `Cancelled`
    pub tasks_cancelled: u64,

    /// Tasks submitted and not yet finished
    pub active_tasks: usize,

    /// Tasks currently sitting in a run queue
    pub queued_tasks: usize,
}

#[derive(Default)]
struct Counters {
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// State shared by the scheduler, its workers, its handles and its tasks
pub(crate) struct SchedulerShared {
    id: u64,
    name: String,
    park_timeout: Duration,

    started: AtomicBool,
    accepting: AtomicBool,
    shutdown: AtomicBool,

    injector: Injector<Arc<TaskContext>>,
    inboxes: Vec<SegQueue<Arc<TaskContext>>>,
    unparkers: Vec<Unparker>,
    idle: Mutex<Vec<usize>>,

    registry: DashMap<TaskId, Arc<TaskContext>>,
    ev_pool: Arc<EventThreadPool>,

    counters: Counters,
    live: Mutex<usize>,
    all_done: Condvar,
}

impl SchedulerShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn park_timeout(&self) -> Duration {
        self.park_timeout
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn worker_count(&self) -> usize {
        self.inboxes.len()
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Put a runnable task at the back of its queue and make sure some worker
    /// will see it: the pinned worker's inbox, or the shared injector
    pub(crate) fn schedule(&self, task: Arc<TaskContext>) {
        if let Some(worker) = task.options().affinity {
            self.inboxes[worker].push(task);
            self.unparkers[worker].unpark();
            return;
        }

        self.injector.push(task);
        if let Some(worker) = self.idle.lock().pop() {
            self.unparkers[worker].unpark();
        }
    }

    pub(crate) fn pop_local(&self, worker: usize) -> Option<Arc<TaskContext>> {
        self.inboxes[worker].pop()
    }

    pub(crate) fn steal_global(&self) -> Option<Arc<TaskContext>> {
        loop {
            match self.injector.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    pub(crate) fn has_work(&self, worker: usize) -> bool {
        !self.inboxes[worker].is_empty() || !self.injector.is_empty()
    }

    pub(crate) fn register_idle(&self, worker: usize) {
        self.idle.lock().push(worker);
    }

    pub(crate) fn unregister_idle(&self, worker: usize) {
        self.idle.lock().retain(|&w| w != worker);
    }

    fn unpark_all(&self) {
        for unparker in &self.unparkers {
            unparker.unpark();
        }
    }

    /// Create, register and queue a task
    pub(crate) fn submit_raw(
        self: &Arc<Self>,
        options: TaskOptions,
        body: BoxFuture,
    ) -> Arc<TaskContext> {
        if let Some(worker) = options.affinity {
            if worker >= self.worker_count() {
                invariant_violation(&format!(
                    "task affinity {worker} is out of range for {} workers",
                    self.worker_count()
                ));
            }
        }

        let ev_thread = self.ev_pool.next_thread().clone();
        let task = Arc::new(TaskContext::new(options, self.clone(), ev_thread, body));
        self.counters.spawned.fetch_add(1, Ordering::Relaxed);

        let accepted = {
            let mut live = self.live.lock();
            *live += 1;
            self.accepting.load(Ordering::SeqCst)
        };
        self.registry.insert(task.id(), task.clone());

        if !accepted {
            tracing::warn!(
                scheduler = %self.name,
                task_id = task.id().as_u64(),
                "submission refused: scheduler is shutting down"
            );
            task.request_cancel(CancellationReason::Shutdown);
            task.finish(Outcome::Cancelled);
            return task;
        }

        self.arm_deadline(&task);

        task.set_state(TaskState::Queued);
        tracing::trace!(task_id = task.id().as_u64(), "task queued");
        self.schedule(task.clone());

        // Shutdown may have swept the registry before this task was inserted
        self.refuse_if_closed(&task);
        task
    }

    /// Cancel a task that was queued after shutdown began. Without running
    /// workers nobody would ever pop it, so it is finished here.
    fn refuse_if_closed(&self, task: &Arc<TaskContext>) {
        if self.accepting.load(Ordering::SeqCst) {
            return;
        }
        task.request_cancel(CancellationReason::Shutdown);
        if !self.is_started() && task.transition(TaskState::Queued, TaskState::Running) {
            task.finish(Outcome::Cancelled);
        }
    }

    /// Typed variant of `submit_raw`
    pub(crate) fn submit<F, T>(self: &Arc<Self>, options: TaskOptions, future: F) -> TaskWithResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::new(ResultSlot::new());
        let writer = slot.clone();
        let task = self.submit_raw(
            options,
            Box::pin(async move {
                let value = future.await;
                writer.set(value);
            }),
        );
        TaskWithResult::new(task, slot)
    }

    fn arm_deadline(&self, task: &Arc<TaskContext>) {
        let deadline = task.options().deadline;
        let Some(at) = deadline.instant() else {
            return;
        };
        if deadline.is_reached() {
            task.request_cancel(CancellationReason::Deadline);
            return;
        }

        let weak = Arc::downgrade(task);
        let armed = task.ev_thread().add_timer(at, move || {
            if let Some(task) = weak.upgrade() {
                task.request_cancel(CancellationReason::Deadline);
            }
        });
        match armed {
            Ok(timer) => task.set_deadline_timer(timer),
            Err(err) => {
                tracing::warn!(task_id = task.id().as_u64(), %err, "cannot arm task deadline");
                task.request_cancel(CancellationReason::Shutdown);
            }
        }
    }

    pub(crate) fn on_task_finished(&self, task: &TaskContext, state: TaskState) {
        self.registry.remove(&task.id());
        match state {
            TaskState::Completed => self.counters.completed.fetch_add(1, Ordering::Relaxed),
            TaskState::Failed => self.counters.failed.fetch_add(1, Ordering::Relaxed),
            _ => self.counters.cancelled.fetch_add(1, Ordering::Relaxed),
        };

        let mut live = self.live.lock();
        *live -= 1;
        if *live == 0 {
            self.all_done.notify_all();
        }
    }

    fn stats(&self) -> SchedulerStats {
        let queued = self.injector.len() + self.inboxes.iter().map(SegQueue::len).sum::<usize>();
        SchedulerStats {
            tasks_spawned: self.counters.spawned.load(Ordering::Relaxed),
            tasks_completed: self.counters.completed.load(Ordering::Relaxed),
            tasks_failed: self.counters.failed.load(Ordering::Relaxed),
            tasks_cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            active_tasks: *self.live.lock(),
            queued_tasks: queued,
        }
    }

    /// Finish every queued task of a scheduler whose workers never ran
    fn drain_unstarted(&self) {
        let mut drained = Vec::new();
        for inbox in &self.inboxes {
            while let Some(task) = inbox.pop() {
                drained.push(task);
            }
        }
        while let Some(task) = self.steal_global() {
            drained.push(task);
        }
        for task in drained {
            task.request_cancel(CancellationReason::Shutdown);
            if task.transition(TaskState::Queued, TaskState::Running) {
                task.finish(Outcome::Cancelled);
            }
        }
    }
}

/// Cloneable submitter for a [`Scheduler`].
///
/// Handles stay valid after the scheduler shut down; submissions through them
/// then come back already cancelled.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<SchedulerShared>,
}

impl SchedulerHandle {
    pub(crate) fn from_shared(shared: Arc<SchedulerShared>) -> Self {
        Self { shared }
    }

    /// Submit `future` with `options`
    pub fn submit<F, T>(&self, options: TaskOptions, future: F) -> TaskWithResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.shared.submit(options, future)
    }

    /// Submit with default options
    pub fn spawn<F, T>(&self, future: F) -> TaskWithResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.shared.submit(TaskOptions::default(), future)
    }

    /// Submit a task that starts even if cancelled before it runs
    pub fn spawn_critical<F, T>(&self, future: F) -> TaskWithResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.shared.submit(TaskOptions::new().critical(), future)
    }

    /// Submit a plain closure
    pub fn submit_fn<F, T>(&self, options: TaskOptions, f: F) -> TaskWithResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.shared.submit(options, async move { f() })
    }

    /// Scheduler name
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.shared.worker_count()
    }

    /// Snapshot of the scheduler counters
    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats()
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("name", &self.shared.name)
            .finish()
    }
}

/// Owner of a set of worker threads running tasks cooperatively
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    workers: Mutex<Vec<Worker>>,
    stopped: Mutex<bool>,
}

impl Scheduler {
    /// Create a scheduler; no thread runs until [`Scheduler::start`]
    pub fn new(config: &SchedulerConfig, ev_pool: Arc<EventThreadPool>) -> Result<Self, RuntimeError> {
        if ev_pool.is_stopped() {
            return Err(RuntimeError::InvalidConfig(
                "scheduler needs a running event pool".to_string(),
            ));
        }

        let worker_count = config.resolved_worker_threads();
        let mut parkers = Vec::with_capacity(worker_count);
        let mut unparkers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let parker = Parker::new();
            unparkers.push(parker.unparker().clone());
            parkers.push(parker);
        }

        let shared = Arc::new(SchedulerShared {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            name: config.name.clone(),
            park_timeout: config.idle_park_timeout(),
            started: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            injector: Injector::new(),
            inboxes: (0..worker_count).map(|_| SegQueue::new()).collect(),
            unparkers,
            idle: Mutex::new(Vec::with_capacity(worker_count)),
            registry: DashMap::new(),
            ev_pool,
            counters: Counters::default(),
            live: Mutex::new(0),
            all_done: Condvar::new(),
        });

        let workers = parkers
            .into_iter()
            .enumerate()
            .map(|(id, parker)| Worker::new(id, parker, shared.clone()))
            .collect();

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            stopped: Mutex::new(false),
        })
    }

    /// Start all worker threads. Calling it again does nothing.
    pub fn start(&self) -> Result<(), RuntimeError> {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for worker in self.workers.lock().iter_mut() {
            worker.start()?;
        }
        tracing::info!(
            scheduler = %self.shared.name,
            workers = self.shared.worker_count(),
            "scheduler started"
        );
        Ok(())
    }

    /// Check if the scheduler has been started
    pub fn is_started(&self) -> bool {
        self.shared.is_started()
    }

    /// Cloneable submitter
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::from_shared(self.shared.clone())
    }

    /// Submit `future` with `options`
    pub fn submit<F, T>(&self, options: TaskOptions, future: F) -> TaskWithResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.shared.submit(options, future)
    }

    /// Submit with default options
    pub fn spawn<F, T>(&self, future: F) -> TaskWithResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.shared.submit(TaskOptions::default(), future)
    }

    /// Submit a critical task
    pub fn spawn_critical<F, T>(&self, future: F) -> TaskWithResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.shared.submit(TaskOptions::new().critical(), future)
    }

    /// Submit a plain closure
    pub fn submit_fn<F, T>(&self, options: TaskOptions, f: F) -> TaskWithResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.shared.submit(options, async move { f() })
    }

    /// Number of workers
    pub fn worker_count(&self) -> usize {
        self.shared.worker_count()
    }

    /// Snapshot of the scheduler counters
    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats()
    }

    /// Stop accepting tasks, cancel the live ones, wait for all of them to
    /// finish, then stop the workers.
    ///
    /// Tasks that never reach a suspension point keep their worker until they
    /// return. Must not be called from one of this scheduler's own tasks.
    pub fn shutdown(&self) {
        if current::runs_on(self.shared.id) {
            invariant_violation("scheduler shut down from one of its own tasks");
        }

        let mut stopped = self.stopped.lock();
        if *stopped {
            return;
        }
        tracing::info!(scheduler = %self.shared.name, "scheduler shutting down");

        {
            let _live = self.shared.live.lock();
            self.shared.accepting.store(false, Ordering::SeqCst);
        }

        let live: Vec<_> = self
            .shared
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for task in live {
            task.request_cancel(CancellationReason::Shutdown);
        }

        if !self.is_started() {
            self.shared.drain_unstarted();
        }

        {
            let mut live = self.shared.live.lock();
            while *live > 0 {
                self.shared.all_done.wait(&mut live);
            }
        }

        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.unpark_all();
        for worker in self.workers.lock().iter_mut() {
            worker.stop();
        }

        *stopped = true;
        tracing::info!(scheduler = %self.shared.name, "scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventPoolConfig;
    use crate::deadline::Deadline;
    use crate::error::TaskError;
    use std::time::Duration;

    fn pool() -> Arc<EventThreadPool> {
        Arc::new(EventThreadPool::new(&EventPoolConfig::default().with_threads(1)).unwrap())
    }

    fn config(workers: usize) -> SchedulerConfig {
        SchedulerConfig::default().with_worker_threads(workers)
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = Scheduler::new(&config(2), pool()).unwrap();
        assert_eq!(scheduler.worker_count(), 2);
        assert!(!scheduler.is_started());
        assert_eq!(scheduler.stats(), SchedulerStats::default());
    }

    #[test]
    fn test_rejects_stopped_pool() {
        let pool = pool();
        pool.shutdown();
        assert!(matches!(
            Scheduler::new(&config(1), pool),
            Err(RuntimeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_spawn_and_get() {
        let scheduler = Scheduler::new(&config(2), pool()).unwrap();
        scheduler.start().unwrap();
        let task = scheduler.spawn(async { 40 + 2 });
        assert_eq!(task.blocking_get(), Ok(42));

        let stats = scheduler.stats();
        assert_eq!(stats.tasks_spawned, 1);
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.active_tasks, 0);
    }

    #[test]
    fn test_panicking_body_fails_task() {
        let scheduler = Scheduler::new(&config(1), pool()).unwrap();
        scheduler.start().unwrap();
        let task = scheduler.submit_fn(TaskOptions::new(), || -> u32 { panic!("boom") });
        assert_eq!(task.blocking_get(), Err(TaskError::Body("boom".to_string())));

        // The worker survived
        assert_eq!(scheduler.spawn(async { 1 }).blocking_get(), Ok(1));
        assert_eq!(scheduler.stats().tasks_failed, 1);
    }

    #[test]
    fn test_unstarted_scheduler_cancels_queued_on_shutdown() {
        let scheduler = Scheduler::new(&config(1), pool()).unwrap();
        let task = scheduler.spawn(async { 1 });
        assert_eq!(scheduler.stats().queued_tasks, 1);
        scheduler.shutdown();
        assert_eq!(task.state(), TaskState::Cancelled);
        assert_eq!(
            task.blocking_get(),
            Err(TaskError::Cancelled(CancellationReason::Shutdown))
        );
    }

    #[test]
    fn test_submission_racing_unstarted_shutdown_is_finished() {
        let scheduler = Scheduler::new(&config(1), pool()).unwrap();
        let task = scheduler.spawn(async { 1 });
        let context = scheduler.shared.registry.get(&task.id()).unwrap().clone();

        // Shutdown closed the scheduler and drained the queues between the
        // first `accepting` check and the push
        scheduler.shared.accepting.store(false, Ordering::SeqCst);
        scheduler.shared.refuse_if_closed(&context);

        assert_eq!(task.state(), TaskState::Cancelled);
        assert_eq!(scheduler.stats().active_tasks, 0);
        scheduler.shutdown();
        assert_eq!(
            task.blocking_get(),
            Err(TaskError::Cancelled(CancellationReason::Shutdown))
        );
    }

    #[test]
    fn test_submit_after_shutdown_is_cancelled() {
        let scheduler = Scheduler::new(&config(1), pool()).unwrap();
        scheduler.start().unwrap();
        let handle = scheduler.handle();
        scheduler.shutdown();
        scheduler.shutdown();

        let task = handle.spawn(async { 5 });
        assert!(task.is_finished());
        assert_eq!(
            task.blocking_get(),
            Err(TaskError::Cancelled(CancellationReason::Shutdown))
        );
    }

    #[test]
    fn test_passed_deadline_skips_body() {
        let scheduler = Scheduler::new(&config(1), pool()).unwrap();
        scheduler.start().unwrap();
        let task = scheduler.submit(TaskOptions::new().with_deadline(Deadline::passed()), async { 1 });
        assert_eq!(task.blocking_get(), Err(TaskError::DeadlineExceeded));
    }

    #[test]
    fn test_blocking_wait_times_out() {
        let scheduler = Scheduler::new(&config(1), pool()).unwrap();
        scheduler.start().unwrap();
        let task = scheduler.spawn(async {
            current::sleep_for(Duration::from_millis(200)).await
        });
        assert!(!task.blocking_wait(Deadline::from_duration(Duration::from_millis(10))));
        assert!(task.blocking_wait(Deadline::unreachable()));
    }
}
