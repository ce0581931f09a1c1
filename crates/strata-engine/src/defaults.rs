//! Default constants for runtime configuration.
//!
//! Centralizes the numbers shared by the config layer, the scheduler and the
//! event-loop pool.

/// Default scheduler name (used as the worker thread name prefix).
pub const DEFAULT_SCHEDULER_NAME: &str = "main-task-processor";

/// Default event-loop pool name (used as the loop thread name prefix).
pub const DEFAULT_EVENT_POOL_NAME: &str = "event-worker";

/// Default number of worker threads. 0 means one per CPU.
pub const DEFAULT_WORKER_THREADS: usize = 0;

/// Default number of event-loop threads.
pub const DEFAULT_EVENT_THREADS: usize = 2;

/// Default upper bound an idle worker parks for before re-checking its queues.
pub const DEFAULT_IDLE_PARK_TIMEOUT_MS: u64 = 10;
