//! Typed handle to a submitted task

use super::current_task as current;
use super::task::{SuspendReason, TaskContext, TaskId, TaskState};
use super::wait::{check_cancelled, DeadlineTimer};
use crate::deadline::Deadline;
use crate::error::{CancellationReason, TaskError, WaitError};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Typed result slot shared between the task body and its handle.
pub(crate) struct ResultSlot<T> {
    inner: Mutex<Option<T>>,
}

impl<T> ResultSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub(crate) fn set(&self, value: T) {
        *self.inner.lock() = Some(value);
    }

    fn take(&self) -> Option<T> {
        self.inner.lock().take()
    }
}

/// Handle to a task producing a `T`.
///
/// Dropping the handle while the task is still running requests its
/// cancellation (reason `Abandoned`); call [`TaskWithResult::detach`] to let it
/// run on unobserved.
pub struct TaskWithResult<T> {
    task: Arc<TaskContext>,
    slot: Arc<ResultSlot<T>>,
    detached: bool,
}

impl<T> TaskWithResult<T> {
    pub(crate) fn new(task: Arc<TaskContext>, slot: Arc<ResultSlot<T>>) -> Self {
        Self {
            task,
            slot,
            detached: false,
        }
    }

    /// Task ID
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    /// Whether the task reached a final state
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// What the task is waiting on while suspended
    pub fn suspend_reason(&self) -> Option<SuspendReason> {
        if self.task.state() == TaskState::Suspended {
            self.task.suspend_reason()
        } else {
            None
        }
    }

    /// Ask the task to stop. The task observes the request at its next
    /// suspension point or explicit cancellation check.
    pub fn request_cancel(&self) {
        self.task.request_cancel(CancellationReason::UserRequest);
    }

    /// Suspend the current task until this one finishes or `deadline` passes.
    ///
    /// Returns an error if the deadline passes first or the *awaiting* task is
    /// cancelled; the awaited task is unaffected either way.
    pub fn wait(&self, deadline: Deadline) -> WaitFinished<'_> {
        WaitFinished {
            task: &self.task,
            deadline,
            timer: DeadlineTimer::new(),
        }
    }

    /// Wait for the task and take its result
    pub async fn get(self) -> Result<T, TaskError> {
        self.wait(Deadline::unreachable()).await?;
        self.take_result()
    }

    /// Block the calling OS thread until the task finishes or `deadline`
    /// passes. Returns whether it finished.
    ///
    /// Blocking a worker thread this way stalls every task queued on it.
    pub fn blocking_wait(&self, deadline: Deadline) -> bool {
        self.task.block_until_finished(deadline)
    }

    /// Block the calling OS thread until the task finishes and take its result
    pub fn blocking_get(self) -> Result<T, TaskError> {
        self.task.block_until_finished(Deadline::unreachable());
        self.take_result()
    }

    /// Let the task run to completion without this handle
    pub fn detach(mut self) {
        self.detached = true;
    }

    fn take_result(&self) -> Result<T, TaskError> {
        match self.task.state() {
            TaskState::Completed => self
                .slot
                .take()
                .ok_or_else(|| TaskError::Body("task result already taken".to_string())),
            TaskState::Failed => Err(TaskError::Body(
                self.task.failure().unwrap_or_else(|| "task panicked".to_string()),
            )),
            _ => Err(TaskError::cancelled(
                self.task
                    .cancellation_reason()
                    .unwrap_or(CancellationReason::Shutdown),
            )),
        }
    }
}

impl<T> Drop for TaskWithResult<T> {
    fn drop(&mut self) {
        if !self.detached && !self.task.is_finished() {
            self.task.request_cancel(CancellationReason::Abandoned);
        }
    }
}

impl<T> fmt::Debug for TaskWithResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskWithResult")
            .field("id", &self.task.id())
            .field("state", &self.task.state())
            .field("detached", &self.detached)
            .finish()
    }
}

/// Future returned by [`TaskWithResult::wait`]
#[must_use = "futures do nothing unless awaited"]
pub struct WaitFinished<'a> {
    task: &'a Arc<TaskContext>,
    deadline: Deadline,
    timer: DeadlineTimer,
}

impl Future for WaitFinished<'_> {
    type Output = Result<(), WaitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.task.is_finished() {
            return Poll::Ready(Ok(()));
        }
        if let Err(err) = check_cancelled() {
            return Poll::Ready(Err(err));
        }
        if self.deadline.is_reached() {
            return Poll::Ready(Err(WaitError::DeadlineExceeded));
        }

        if self.task.poll_finished(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }
        let deadline = self.deadline;
        if let Err(err) = self.timer.arm(deadline, cx.waker()) {
            return Poll::Ready(Err(err));
        }
        current::set_suspend_reason(SuspendReason::AwaitTask);
        Poll::Pending
    }
}
