//! Strata engine: the concurrency substrate of the service framework
//!
//! This crate provides:
//! - Event-loop thread pool (timers, loop-bound callbacks, sticky thread handles)
//! - Task scheduler (M:N cooperative tasks on a fixed pool of worker threads)
//! - Cooperative cancellation and deadlines
//! - RCU snapshot variables with hazard-protected reads
//! - Task-aware counting semaphore with FIFO waiters
//!
//! Everything hangs off an explicitly constructed [`Runtime`]; there is no
//! process-global scheduler, so several runtimes can live in one process.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::new_without_default)]

pub mod config;
pub mod deadline;
pub mod defaults;
pub mod error;
pub mod ev;
pub mod rcu;
pub mod runtime;
pub mod scheduler;
pub mod sync;

pub use config::{EventPoolConfig, RuntimeConfig, SchedulerConfig};
pub use deadline::Deadline;
pub use error::{CancellationReason, RuntimeError, TaskError, WaitError};
pub use ev::{EventThreadPool, ThreadHandle, TimerHandle};
pub use rcu::{DestructionType, ReadablePtr, SharedReadablePtr, Variable, WritablePtr};
pub use runtime::Runtime;
pub use scheduler::{
    current_task, Scheduler, SchedulerHandle, SchedulerStats, SuspendReason, TaskId, TaskOptions,
    TaskPriority, TaskState, TaskWithResult,
};
pub use sync::{Semaphore, SemaphorePermit};
