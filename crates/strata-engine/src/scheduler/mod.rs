//! Cooperative task scheduler
//!
//! Tasks are futures polled by a fixed set of worker threads. A task that
//! suspends gives its worker back; waking it puts it on a run queue again.

pub mod current_task;
mod handle;
#[allow(clippy::module_inception)]
mod scheduler;
mod task;
pub(crate) mod wait;
mod worker;

pub use handle::{TaskWithResult, WaitFinished};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerStats};
pub use task::{SuspendReason, TaskId, TaskOptions, TaskPriority, TaskState};
pub use wait::{Sleep, YieldNow};
