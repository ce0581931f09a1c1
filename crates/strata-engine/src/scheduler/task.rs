//! Task identity, options and the per-task context the scheduler drives

use super::scheduler::SchedulerShared;
use crate::deadline::Deadline;
use crate::error::CancellationReason;
use crate::ev::{ThreadHandle, TimerHandle};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

/// Type-erased task body. The typed result travels through a separate slot.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Unique identifier for a task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    pub(crate) fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle state of a task
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Created, not yet queued
    New = 0,
    /// Waiting in a run queue
    Queued = 1,
    /// Being polled by a worker
    Running = 2,
    /// Parked at a suspension point, waiting for a wake-up
    Suspended = 3,
    /// Body returned normally
    Completed = 4,
    /// Body panicked
    Failed = 5,
    /// Finished after cancellation was requested
    Cancelled = 6,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::New,
            1 => Self::Queued,
            2 => Self::Running,
            3 => Self::Suspended,
            4 => Self::Completed,
            5 => Self::Failed,
            _ => Self::Cancelled,
        }
    }

    /// Whether the task reached a final state
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Scheduling priority
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum TaskPriority {
    /// Ordinary task: skipped if cancelled before it first runs
    #[default]
    Normal,
    /// Always started, even if cancellation was requested before it ran
    Critical,
}

/// Options accepted by `submit`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskOptions {
    /// Scheduling priority
    pub priority: TaskPriority,
    /// Cancel the task with `DeadlineExceeded` once this elapses
    pub deadline: Deadline,
    /// Pin the task to one worker
    pub affinity: Option<usize>,
}

impl TaskOptions {
    /// Normal priority, no deadline, no affinity
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the task critical
    pub fn critical(mut self) -> Self {
        self.priority = TaskPriority::Critical;
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the deadline
    pub fn with_deadline(mut self, deadline: impl Into<Deadline>) -> Self {
        self.deadline = deadline.into();
        self
    }

    /// Pin the task to worker `worker`
    pub fn with_affinity(mut self, worker: usize) -> Self {
        self.affinity = Some(worker);
        self
    }
}

/// What a suspended task is waiting on
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SuspendReason {
    /// Gave up its worker voluntarily
    Yield = 1,
    /// Sleeping until a deadline
    Sleep = 2,
    /// Queued on a semaphore
    Semaphore = 3,
    /// Waiting for another task to finish
    AwaitTask = 4,
    /// Waiting on a future this crate does not know about
    External = 5,
}

impl SuspendReason {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Yield),
            2 => Some(Self::Sleep),
            3 => Some(Self::Semaphore),
            4 => Some(Self::AwaitTask),
            5 => Some(Self::External),
            _ => None,
        }
    }
}

/// How a task body ended, before cancellation is folded in
pub(crate) enum Outcome {
    Completed,
    Failed(String),
    Cancelled,
}

#[derive(Default)]
struct Completion {
    done: bool,
    wakers: Vec<Waker>,
}

/// Scheduler-side record of one task.
///
/// The context is its own waker. Waking a suspended task moves it back to a
/// run queue; waking it while it is being polled leaves a notification that
/// the worker picks up when the poll returns.
pub(crate) struct TaskContext {
    id: TaskId,
    state: AtomicU8,
    notified: AtomicBool,
    cancel_reason: AtomicU8,
    started: AtomicBool,
    suspend_reason: AtomicU8,
    options: TaskOptions,
    shared: Arc<SchedulerShared>,
    ev_thread: ThreadHandle,
    future: Mutex<Option<BoxFuture>>,
    failure: Mutex<Option<String>>,
    completion: Mutex<Completion>,
    finished_cv: Condvar,
    deadline_timer: Mutex<Option<TimerHandle>>,
}

impl TaskContext {
    pub(crate) fn new(
        options: TaskOptions,
        shared: Arc<SchedulerShared>,
        ev_thread: ThreadHandle,
        future: BoxFuture,
    ) -> Self {
        Self {
            id: TaskId::next(),
            state: AtomicU8::new(TaskState::New as u8),
            notified: AtomicBool::new(false),
            cancel_reason: AtomicU8::new(0),
            started: AtomicBool::new(false),
            suspend_reason: AtomicU8::new(0),
            options,
            shared,
            ev_thread,
            future: Mutex::new(Some(future)),
            failure: Mutex::new(None),
            completion: Mutex::new(Completion::default()),
            finished_cv: Condvar::new(),
            deadline_timer: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn options(&self) -> &TaskOptions {
        &self.options
    }

    pub(crate) fn shared(&self) -> &Arc<SchedulerShared> {
        &self.shared
    }

    pub(crate) fn ev_thread(&self) -> &ThreadHandle {
        &self.ev_thread
    }

    pub(crate) fn future(&self) -> &Mutex<Option<BoxFuture>> {
        &self.future
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Marks the first run; returns true only once
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_notified(&self) {
        self.notified.store(false, Ordering::SeqCst);
    }

    pub(crate) fn cancellation_reason(&self) -> Option<CancellationReason> {
        CancellationReason::from_u8(self.cancel_reason.load(Ordering::Acquire))
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancellation_reason().is_some()
    }

    /// Record a cancellation request and wake the task so that its current
    /// suspension point observes it. The first reason wins.
    pub(crate) fn request_cancel(self: &Arc<Self>, reason: CancellationReason) {
        let first = self
            .cancel_reason
            .compare_exchange(0, reason as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            tracing::trace!(task_id = self.id.0, %reason, "cancellation requested");
            self.wake_by_ref();
        }
    }

    pub(crate) fn suspend_reason(&self) -> Option<SuspendReason> {
        SuspendReason::from_u8(self.suspend_reason.load(Ordering::Acquire))
    }

    pub(crate) fn set_suspend_reason(&self, reason: Option<SuspendReason>) {
        let value = reason.map_or(0, |r| r as u8);
        self.suspend_reason.store(value, Ordering::Release);
    }

    pub(crate) fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    pub(crate) fn set_deadline_timer(&self, timer: TimerHandle) {
        *self.deadline_timer.lock() = Some(timer);
    }

    /// Called by the worker after a poll returned `Pending`
    pub(crate) fn park_after_poll(self: &Arc<Self>) {
        if self.suspend_reason().is_none() {
            self.set_suspend_reason(Some(SuspendReason::External));
        }
        self.transition(TaskState::Running, TaskState::Suspended);
        if self.notified.swap(false, Ordering::SeqCst)
            && self.transition(TaskState::Suspended, TaskState::Queued)
        {
            self.shared.schedule(self.clone());
        }
    }

    /// Move the task to its final state and release everyone waiting on it
    pub(crate) fn finish(self: &Arc<Self>, outcome: Outcome) {
        let state = match outcome {
            Outcome::Failed(message) => {
                *self.failure.lock() = Some(message);
                TaskState::Failed
            }
            Outcome::Cancelled => TaskState::Cancelled,
            Outcome::Completed if self.is_cancel_requested() => TaskState::Cancelled,
            Outcome::Completed => TaskState::Completed,
        };

        // Drop the body outside any lock; its destructors may wake other tasks
        let body = self.future.lock().take();
        drop(body);

        self.set_suspend_reason(None);
        self.set_state(state);
        if let Some(timer) = self.deadline_timer.lock().take() {
            timer.cancel();
        }

        tracing::trace!(task_id = self.id.0, ?state, "task finished");
        self.shared.on_task_finished(self, state);

        let wakers = {
            let mut completion = self.completion.lock();
            completion.done = true;
            std::mem::take(&mut completion.wakers)
        };
        self.finished_cv.notify_all();
        for waker in wakers {
            waker.wake();
        }
    }

    /// Register `cx` to be woken on completion
    pub(crate) fn poll_finished(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut completion = self.completion.lock();
        if completion.done {
            return Poll::Ready(());
        }
        if !completion.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            completion.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }

    /// Block the calling OS thread until the task finishes or `deadline`
    /// passes. Returns whether the task finished.
    pub(crate) fn block_until_finished(&self, deadline: Deadline) -> bool {
        let mut completion = self.completion.lock();
        while !completion.done {
            match deadline.time_left() {
                None => self.finished_cv.wait(&mut completion),
                Some(left) if left.is_zero() => return false,
                Some(left) => {
                    self.finished_cv.wait_for(&mut completion, left);
                }
            }
        }
        true
    }
}

impl Wake for TaskContext {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        loop {
            match self.state() {
                TaskState::Suspended => {
                    if self.transition(TaskState::Suspended, TaskState::Queued) {
                        self.shared.schedule(self.clone());
                        return;
                    }
                }
                TaskState::Running => {
                    self.notified.store(true, Ordering::SeqCst);
                    if self.state() != TaskState::Suspended {
                        return;
                    }
                    // The worker parked between our two loads. Whoever takes
                    // the notification back must requeue the task.
                    if !self.notified.swap(false, Ordering::SeqCst) {
                        return;
                    }
                }
                TaskState::New | TaskState::Queued => return,
                TaskState::Completed | TaskState::Failed | TaskState::Cancelled => return,
            }
        }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("cancel", &self.cancellation_reason())
            .finish()
    }
}
