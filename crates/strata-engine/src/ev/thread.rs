//! One event-loop thread and the handle used to post work to it

use super::timer::{TimerHandle, TimerId, TimerQueue};
use crate::error::RuntimeError;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// Loop-bound callback
pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Message sent from a `ThreadHandle` to its loop
pub(crate) enum Command {
    /// Run a callback on the loop thread
    Run(Callback),
    /// Register a timer
    AddTimer {
        id: TimerId,
        at: Instant,
        callback: Callback,
    },
    /// Drop a timer before it fires
    CancelTimer(TimerId),
    /// Leave the loop
    Stop,
}

thread_local! {
    /// (pool id, loop index) of the loop running on this thread
    static CURRENT_LOOP: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

/// Sticky handle to one event-loop thread.
///
/// Cheap to clone and safe to share; every clone posts to the same loop.
#[derive(Clone)]
pub struct ThreadHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    pool_id: u64,
    index: usize,
    name: String,
    tx: Sender<Command>,
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("name", &self.inner.name)
            .field("index", &self.inner.index)
            .finish()
    }
}

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.pool_id == other.inner.pool_id && self.inner.index == other.inner.index
    }
}

impl Eq for ThreadHandle {}

impl ThreadHandle {
    /// Position of this loop inside its pool
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// Thread name of this loop
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the calling code is running on this loop's thread
    pub fn is_current(&self) -> bool {
        CURRENT_LOOP.with(|c| c.get()) == Some((self.inner.pool_id, self.inner.index))
    }

    /// Run `f` on the loop thread
    pub fn run_in_loop<F>(&self, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(Command::Run(Box::new(f)))
    }

    /// Run `f` on the loop thread once `at` is reached
    pub fn add_timer<F>(&self, at: Instant, f: F) -> Result<TimerHandle, RuntimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = TimerId::next();
        self.send(Command::AddTimer {
            id,
            at,
            callback: Box::new(f),
        })?;
        Ok(TimerHandle::new(id, self.clone()))
    }

    pub(crate) fn send(&self, command: Command) -> Result<(), RuntimeError> {
        self.inner
            .tx
            .send(command)
            .map_err(|_| RuntimeError::EventLoopStopped)
    }
}

/// State owned by a loop thread
pub(crate) struct EventLoop {
    pool_id: u64,
    index: usize,
    rx: Receiver<Command>,
    timers: TimerQueue,
}

impl EventLoop {
    /// Create the loop and the handle that feeds it
    pub(crate) fn new(pool_id: u64, index: usize, name: String) -> (Self, ThreadHandle) {
        let (tx, rx) = channel::unbounded();
        let handle = ThreadHandle {
            inner: Arc::new(HandleInner {
                pool_id,
                index,
                name,
                tx,
            }),
        };
        let event_loop = Self {
            pool_id,
            index,
            rx,
            timers: TimerQueue::new(),
        };
        (event_loop, handle)
    }

    /// Loop main body: wait for the next command or the next timer
    pub(crate) fn run(mut self) {
        CURRENT_LOOP.with(|c| c.set(Some((self.pool_id, self.index))));
        tracing::debug!(index = self.index, "event loop started");

        loop {
            let command = match self.timers.next_wakeup() {
                Some(at) => {
                    let now = Instant::now();
                    if at <= now {
                        None
                    } else {
                        match self.rx.recv_timeout(at - now) {
                            Ok(command) => Some(command),
                            Err(RecvTimeoutError::Timeout) => None,
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                }
                None => match self.rx.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };

            if let Some(command) = command {
                if !self.handle(command) {
                    break;
                }
            }

            for callback in self.timers.take_due(Instant::now()) {
                self.invoke(callback);
            }
        }

        CURRENT_LOOP.with(|c| c.set(None));
        tracing::debug!(
            index = self.index,
            dropped_timers = self.timers.len(),
            "event loop stopped"
        );
    }

    /// Returns false when the loop should exit
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Run(callback) => self.invoke(callback),
            Command::AddTimer { id, at, callback } => self.timers.add(id, at, callback),
            Command::CancelTimer(id) => {
                self.timers.cancel(id);
            }
            Command::Stop => return false,
        }
        true
    }

    fn invoke(&self, callback: Callback) {
        if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
            tracing::error!(index = self.index, "event loop callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn spawn_loop() -> (ThreadHandle, std::thread::JoinHandle<()>) {
        let (event_loop, handle) = EventLoop::new(u64::MAX, 0, "test-loop".to_string());
        let join = std::thread::Builder::new()
            .name("test-loop".to_string())
            .spawn(move || event_loop.run())
            .unwrap();
        (handle, join)
    }

    #[test]
    fn test_run_in_loop_runs_on_loop_thread() {
        let (handle, join) = spawn_loop();
        let (tx, rx) = channel::bounded(1);
        let probe = handle.clone();
        handle
            .run_in_loop(move || {
                tx.send(probe.is_current()).unwrap();
            })
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(!handle.is_current());

        handle.send(Command::Stop).unwrap();
        join.join().unwrap();
    }

    #[test]
    fn test_timer_fires_and_cancel_prevents_firing() {
        let (handle, join) = spawn_loop();
        let fired = Arc::new(AtomicBool::new(false));
        let cancelled_fired = Arc::new(AtomicBool::new(false));

        let flag = cancelled_fired.clone();
        let timer = handle
            .add_timer(Instant::now() + Duration::from_millis(30), move || {
                flag.store(true, Ordering::SeqCst)
            })
            .unwrap();
        timer.cancel();

        let (tx, rx) = channel::bounded(1);
        let flag = fired.clone();
        handle
            .add_timer(Instant::now() + Duration::from_millis(50), move || {
                flag.store(true, Ordering::SeqCst);
                tx.send(()).unwrap();
            })
            .unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired.load(Ordering::SeqCst));
        assert!(!cancelled_fired.load(Ordering::SeqCst));

        handle.send(Command::Stop).unwrap();
        join.join().unwrap();
    }

    #[test]
    fn test_loop_survives_panicking_callback() {
        let (handle, join) = spawn_loop();
        handle.run_in_loop(|| panic!("callback failure")).unwrap();

        let (tx, rx) = channel::bounded(1);
        handle.run_in_loop(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);

        handle.send(Command::Stop).unwrap();
        join.join().unwrap();
    }

    #[test]
    fn test_post_after_stop_fails() {
        let (handle, join) = spawn_loop();
        handle.send(Command::Stop).unwrap();
        join.join().unwrap();

        assert!(matches!(
            handle.run_in_loop(|| {}),
            Err(RuntimeError::EventLoopStopped)
        ));
    }
}
