//! Access to the task running on the calling thread
//!
//! Every function here works outside a task as well and then reports "no
//! task": `id()` is `None`, `should_cancel()` is false, and so on.

use super::scheduler::SchedulerHandle;
use super::task::{SuspendReason, TaskContext, TaskId};
use super::wait::{Sleep, YieldNow};
use crate::deadline::Deadline;
use crate::error::{CancellationReason, TaskError};
use crate::ev::ThreadHandle;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

thread_local! {
    static CURRENT: RefCell<Option<Arc<TaskContext>>> = const { RefCell::new(None) };
}

/// Restores the previously current task on drop
pub(crate) struct EnterGuard {
    previous: Option<Arc<TaskContext>>,
}

pub(crate) fn enter(task: Arc<TaskContext>) -> EnterGuard {
    let previous = CURRENT.with(|c| c.borrow_mut().replace(task));
    EnterGuard { previous }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}

pub(crate) fn with<R>(f: impl FnOnce(&Arc<TaskContext>) -> R) -> Option<R> {
    CURRENT.with(|c| c.borrow().as_ref().map(f))
}

pub(crate) fn in_task() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

/// Whether the calling code runs inside a task of scheduler `scheduler_id`
pub(crate) fn runs_on(scheduler_id: u64) -> bool {
    with(|task| task.shared().id() == scheduler_id).unwrap_or(false)
}

pub(crate) fn set_suspend_reason(reason: SuspendReason) {
    with(|task| task.set_suspend_reason(Some(reason)));
}

/// ID of the current task
pub fn id() -> Option<TaskId> {
    with(|task| task.id())
}

/// Whether cancellation of the current task was requested
pub fn should_cancel() -> bool {
    cancellation_reason().is_some()
}

/// Why the current task was cancelled, if it was
pub fn cancellation_reason() -> Option<CancellationReason> {
    with(|task| task.cancellation_reason()).flatten()
}

/// Explicit cancellation check for long-running bodies.
///
/// ```ignore
/// for chunk in chunks {
///     current_task::cancellation_point()?;
///     process(chunk);
/// }
/// ```
pub fn cancellation_point() -> Result<(), TaskError> {
    match cancellation_reason() {
        Some(reason) => Err(TaskError::cancelled(reason)),
        None => Ok(()),
    }
}

/// Scheduler running the current task
pub fn scheduler() -> Option<SchedulerHandle> {
    with(|task| SchedulerHandle::from_shared(task.shared().clone()))
}

/// Event-loop thread the current task's timers run on
pub fn event_thread() -> Option<ThreadHandle> {
    with(|task| task.ev_thread().clone())
}

/// Give the worker to the next queued task and resume afterwards
pub fn yield_now() -> YieldNow {
    YieldNow::new()
}

/// Suspend the current task for `duration`.
///
/// Resolves early with an error if the task is cancelled (or its own deadline
/// fires) in the meantime. Must be awaited inside a task.
pub fn sleep_for(duration: Duration) -> Sleep {
    Sleep::new(Deadline::from_duration(duration))
}

/// Suspend the current task until `deadline`. See [`sleep_for`].
pub fn sleep_until(deadline: Deadline) -> Sleep {
    Sleep::new(deadline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outside_task() {
        assert_eq!(id(), None);
        assert!(!should_cancel());
        assert_eq!(cancellation_reason(), None);
        assert!(cancellation_point().is_ok());
        assert!(scheduler().is_none());
        assert!(event_thread().is_none());
        assert!(!in_task());
    }
}
