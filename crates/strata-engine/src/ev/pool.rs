//! Fixed-size pool of event-loop threads

use super::thread::{Command, EventLoop, ThreadHandle};
use crate::config::EventPoolConfig;
use crate::error::RuntimeError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Split `total` evenly across `parts`.
///
/// Integer division with the remainder dropped: `distribute_evenly(10, 4)` is
/// 2, not 3, and `distribute_evenly(3, 4)` is 0. Returns 0 for zero parts.
pub fn distribute_evenly(total: usize, parts: usize) -> usize {
    if parts == 0 {
        0
    } else {
        total / parts
    }
}

/// Owns N OS threads, each driving one event loop.
pub struct EventThreadPool {
    name: String,
    threads: Vec<ThreadHandle>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
    stopped: AtomicBool,
}

impl EventThreadPool {
    /// Spawn the loop threads described by `config`
    pub fn new(config: &EventPoolConfig) -> Result<Self, RuntimeError> {
        config.validate()?;

        let pool_id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let mut pool = Self {
            name: config.name.clone(),
            threads: Vec::with_capacity(config.threads),
            joins: Mutex::new(Vec::with_capacity(config.threads)),
            next: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        };

        for index in 0..config.threads {
            let thread_name = format!("{}-{}", config.name, index);
            let (event_loop, handle) = EventLoop::new(pool_id, index, thread_name.clone());
            // On error `pool` is dropped here, which stops the loops spawned so far
            let join = thread::Builder::new()
                .name(thread_name)
                .spawn(move || event_loop.run())?;
            pool.threads.push(handle);
            pool.joins.get_mut().push(join);
        }

        tracing::debug!(pool = %pool.name, threads = pool.threads.len(), "event pool started");
        Ok(pool)
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of loop threads
    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Next loop in round-robin order
    pub fn next_thread(&self) -> &ThreadHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        &self.threads[index]
    }

    /// `count` loops in round-robin order, wrapping around when `count`
    /// exceeds the pool size.
    pub fn next_threads(&self, count: usize) -> Vec<ThreadHandle> {
        let start = self.next.fetch_add(count, Ordering::Relaxed);
        (0..count)
            .map(|i| self.threads[(start + i) % self.threads.len()].clone())
            .collect()
    }

    /// Loop at a fixed position
    pub fn thread(&self, index: usize) -> Option<&ThreadHandle> {
        self.threads.get(index)
    }

    /// Each loop's share of a pool-wide limit (see [`distribute_evenly`])
    pub fn per_thread_share(&self, total: usize) -> usize {
        distribute_evenly(total, self.threads.len())
    }

    /// Whether `shutdown` has been called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop every loop and join its thread. Timers that have not fired yet are
    /// dropped. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        for handle in &self.threads {
            let _ = handle.send(Command::Stop);
        }

        let joins: Vec<_> = self.joins.lock().drain(..).collect();
        let current = thread::current().id();
        for join in joins {
            // A loop callback that drops the last pool reference ends up here
            if join.thread().id() == current {
                continue;
            }
            let _ = join.join();
        }

        tracing::debug!(pool = %self.name, "event pool stopped");
    }
}

impl Drop for EventThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for EventThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventThreadPool")
            .field("name", &self.name)
            .field("size", &self.threads.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use std::time::{Duration, Instant};

    fn pool(threads: usize) -> EventThreadPool {
        EventThreadPool::new(&EventPoolConfig::default().with_threads(threads)).unwrap()
    }

    #[test]
    fn test_distribute_evenly_drops_remainder() {
        assert_eq!(distribute_evenly(10, 4), 2);
        assert_eq!(distribute_evenly(8, 4), 2);
        assert_eq!(distribute_evenly(3, 4), 0);
        assert_eq!(distribute_evenly(5, 0), 0);
    }

    #[test]
    fn test_zero_threads_rejected() {
        let err = EventThreadPool::new(&EventPoolConfig::default().with_threads(0)).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig(_)));
    }

    #[test]
    fn test_next_threads_round_robin_wraps() {
        let pool = pool(3);
        let indices: Vec<usize> = pool.next_threads(7).iter().map(|t| t.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(pool.next_thread().index(), 1);
        assert_eq!(pool.per_thread_share(10), 3);
    }

    #[test]
    fn test_threads_are_named_and_distinct() {
        let pool = pool(2);
        let (tx, rx) = channel::unbounded();
        for index in 0..2 {
            let tx = tx.clone();
            pool.thread(index)
                .unwrap()
                .run_in_loop(move || {
                    let name = thread::current().name().map(str::to_string);
                    tx.send(name).unwrap();
                })
                .unwrap();
        }
        let mut names: Vec<_> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["event-worker-0", "event-worker-1"]);
        assert!(pool.thread(2).is_none());
    }

    #[test]
    fn test_timer_on_pool_thread() {
        let pool = pool(1);
        let (tx, rx) = channel::bounded(1);
        let started = Instant::now();
        pool.next_thread()
            .add_timer(started + Duration::from_millis(20), move || {
                tx.send(Instant::now()).unwrap()
            })
            .unwrap();
        let fired_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired_at >= started + Duration::from_millis(20));
    }

    #[test]
    fn test_shutdown_idempotent_and_rejects_work() {
        let pool = pool(2);
        let handle = pool.next_thread().clone();
        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_stopped());
        assert!(matches!(
            handle.run_in_loop(|| {}),
            Err(RuntimeError::EventLoopStopped)
        ));
    }
}
