//! Shared helpers for integration tests

#![allow(dead_code)]

use std::time::{Duration, Instant};
use strata_engine::{Runtime, RuntimeConfig};

/// Install a fmt subscriber once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

/// Runtime with `workers` scheduler threads and one event loop
pub fn runtime(workers: usize) -> Runtime {
    init_tracing();
    Runtime::new(RuntimeConfig::with_workers(workers).with_event_threads(1))
        .expect("runtime should start")
}

/// Spin until `condition` holds or five seconds pass
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let give_up = Instant::now() + Duration::from_secs(5);
    while Instant::now() < give_up {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
