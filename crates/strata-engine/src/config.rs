//! Runtime configuration
//!
//! Plain structs with serde support so that a component-config document can
//! provide any subset of the fields; everything missing falls back to
//! [`crate::defaults`].

use crate::defaults::{
    DEFAULT_EVENT_POOL_NAME, DEFAULT_EVENT_THREADS, DEFAULT_IDLE_PARK_TIMEOUT_MS,
    DEFAULT_SCHEDULER_NAME, DEFAULT_WORKER_THREADS,
};
use crate::error::RuntimeError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Task scheduler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Scheduler name, used as the worker thread name prefix
    pub name: String,

    /// Number of worker threads (0 = one per CPU)
    pub worker_threads: usize,

    /// How long an idle worker parks before re-checking its queues
    pub idle_park_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SCHEDULER_NAME.to_string(),
            worker_threads: DEFAULT_WORKER_THREADS,
            idle_park_timeout_ms: DEFAULT_IDLE_PARK_TIMEOUT_MS,
        }
    }
}

impl SchedulerConfig {
    /// Set the number of worker threads
    pub fn with_worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count;
        self
    }

    /// Set the scheduler name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Worker thread count with 0 resolved to the CPU count
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }

    /// Idle park timeout as a `Duration`
    pub fn idle_park_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_park_timeout_ms.max(1))
    }
}

/// Event-loop thread pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventPoolConfig {
    /// Pool name, used as the loop thread name prefix
    pub name: String,

    /// Number of event-loop threads (must be at least 1)
    pub threads: usize,
}

impl Default for EventPoolConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_EVENT_POOL_NAME.to_string(),
            threads: DEFAULT_EVENT_THREADS,
        }
    }
}

impl EventPoolConfig {
    /// Set the number of event-loop threads
    pub fn with_threads(mut self, count: usize) -> Self {
        self.threads = count;
        self
    }

    /// Reject configurations the pool cannot run with
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.threads == 0 {
            return Err(RuntimeError::InvalidConfig(
                "event pool needs at least one thread".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings for a whole [`crate::Runtime`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Task scheduler settings
    pub scheduler: SchedulerConfig,

    /// Event-loop pool settings
    pub event_pool: EventPoolConfig,
}

impl RuntimeConfig {
    /// Config with `workers` scheduler threads and default everything else
    pub fn with_workers(workers: usize) -> Self {
        Self {
            scheduler: SchedulerConfig::default().with_worker_threads(workers),
            event_pool: EventPoolConfig::default(),
        }
    }

    /// Set the number of event-loop threads
    pub fn with_event_threads(mut self, count: usize) -> Self {
        self.event_pool.threads = count;
        self
    }
}
