//! Worker thread that executes tasks
//!
//! Workers pop their own inbox of pinned tasks first, then the shared injector. When both are
//! empty they register as idle and park until a push unparks them or the park
//! timeout elapses.

use super::current_task as current;
use super::scheduler::SchedulerShared;
use super::task::{Outcome, TaskContext, TaskPriority, TaskState};
use crate::error::RuntimeError;
use crossbeam::sync::Parker;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;

/// Every this many picks the injector is checked before the inbox, so a
/// worker whose inbox never drains still serves the shared queue.
const GLOBAL_QUEUE_INTERVAL: u32 = 31;

/// Worker thread that executes tasks
pub(crate) struct Worker {
    /// Worker ID
    id: usize,

    /// Parker, moved into the thread on start
    parker: Option<Parker>,

    /// Shared scheduler state
    shared: Arc<SchedulerShared>,

    /// Worker thread handle
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn new(id: usize, parker: Parker, shared: Arc<SchedulerShared>) -> Self {
        Self {
            id,
            parker: Some(parker),
            shared,
            handle: None,
        }
    }

    /// Start the worker thread
    pub(crate) fn start(&mut self) -> Result<(), RuntimeError> {
        let Some(parker) = self.parker.take() else {
            return Ok(());
        };
        let id = self.id;
        let shared = self.shared.clone();

        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.shared.name(), id))
            .spawn(move || Worker::run_loop(id, parker, shared))?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Wait for the worker thread to exit. The shutdown flag must already be set.
    pub(crate) fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(worker = self.id, "worker thread panicked");
            }
        }
    }

    /// Worker thread main loop
    fn run_loop(id: usize, parker: Parker, shared: Arc<SchedulerShared>) {
        tracing::debug!(scheduler = %shared.name(), worker = id, "worker started");

        let mut tick: u32 = 0;
        loop {
            tick = tick.wrapping_add(1);
            if let Some(task) = Self::find_work(id, &shared, tick) {
                Self::run_task(id, &task);
                continue;
            }

            if shared.is_shut_down() {
                break;
            }

            shared.register_idle(id);
            // A push that raced with registration either unparked us already
            // or is visible now
            if !shared.has_work(id) && !shared.is_shut_down() {
                parker.park_timeout(shared.park_timeout());
            }
            shared.unregister_idle(id);
        }

        tracing::debug!(scheduler = %shared.name(), worker = id, "worker stopped");
    }

    /// Find work: local inbox, then the shared injector
    fn find_work(id: usize, shared: &SchedulerShared, tick: u32) -> Option<Arc<TaskContext>> {
        if tick % GLOBAL_QUEUE_INTERVAL == 0 {
            if let Some(task) = shared.steal_global() {
                return Some(task);
            }
        }
        shared.pop_local(id).or_else(|| shared.steal_global())
    }

    /// Poll a task once and record the result
    fn run_task(worker: usize, task: &Arc<TaskContext>) {
        if !task.transition(TaskState::Queued, TaskState::Running) {
            return;
        }
        task.clear_notified();
        task.set_suspend_reason(None);

        let first_run = task.mark_started();
        if first_run
            && task.is_cancel_requested()
            && task.options().priority != TaskPriority::Critical
        {
            tracing::trace!(task_id = task.id().as_u64(), "cancelled before first run");
            task.finish(Outcome::Cancelled);
            return;
        }
        if first_run {
            tracing::trace!(task_id = task.id().as_u64(), worker, "task started");
        }

        let _current = current::enter(task.clone());
        let waker = Waker::from(task.clone());
        let mut cx = Context::from_waker(&waker);

        let result = {
            let mut body = task.future().lock();
            match body.as_mut() {
                Some(future) => panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))),
                None => Ok(Poll::Ready(())),
            }
        };

        match result {
            Ok(Poll::Ready(())) => task.finish(Outcome::Completed),
            Ok(Poll::Pending) => task.park_after_poll(),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!(task_id = task.id().as_u64(), worker, %message, "task body panicked");
                task.finish(Outcome::Failed(message));
            }
        }
    }
}

/// Extract a readable message from a panic payload
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_variants() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");

        let payload: Box<dyn std::any::Any + Send> = Box::new(format!("owned {}", 1));
        assert_eq!(panic_message(payload.as_ref()), "owned 1");

        let payload: Box<dyn std::any::Any + Send> = Box::new(17u32);
        assert_eq!(panic_message(payload.as_ref()), "task panicked");
    }
}
