//! Task-aware counting semaphore
//!
//! Unlike an OS-level semaphore, waiting here suspends the task and leaves
//! the worker thread free for other tasks. Waiters are served strictly in
//! arrival order: a release hands the freed unit straight to the oldest
//! waiter, so the woken task never competes for it again.

use super::permit::SemaphorePermit;
use crate::deadline::Deadline;
use crate::error::{invariant_violation, WaitError};
use crate::scheduler::current_task;
use crate::scheduler::wait::{check_cancelled, DeadlineTimer};
use crate::scheduler::SuspendReason;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// One queued acquirer
struct Waiter {
    granted: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl Waiter {
    fn new(waker: &Waker) -> Self {
        Self {
            granted: AtomicBool::new(false),
            waker: Mutex::new(Some(waker.clone())),
        }
    }

    fn is_granted(&self) -> bool {
        self.granted.load(Ordering::Acquire)
    }

    fn update_waker(&self, waker: &Waker) {
        let mut slot = self.waker.lock();
        match slot.as_ref() {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    fn grant(&self) {
        self.granted.store(true, Ordering::Release);
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

/// Counting semaphore shared between tasks through an `Arc`.
///
/// `0 <= used() <= capacity()` holds except right after a shrinking
/// [`Semaphore::set_capacity`], where `used()` may exceed the new capacity
/// until enough holders release.
pub struct Semaphore {
    capacity: AtomicUsize,
    acquired: AtomicUsize,
    queued: AtomicUsize,
    waiters: Mutex<VecDeque<Arc<Waiter>>>,
}

impl Semaphore {
    /// Create a semaphore with `capacity` units
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: AtomicUsize::new(capacity),
            acquired: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Maximum number of concurrent holders
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Units currently held
    pub fn used(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Units that can be acquired right now
    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.used())
    }

    /// Number of queued acquirers
    pub fn waiters(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Change the ceiling. Holders are never evicted: after a shrink new
    /// acquires fail until usage drops under the new capacity. A grow hands
    /// the new units to queued waiters.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::SeqCst);
        if self.waiters() > 0 {
            let mut queue = self.waiters.lock();
            self.grant_waiters_locked(&mut queue);
        }
    }

    /// Take a unit without suspending. Fails if none is free or someone is
    /// already queued.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SemaphorePermit> {
        if self.waiters() == 0 && self.try_take_unit() {
            Some(SemaphorePermit::new(self.clone()))
        } else {
            None
        }
    }

    /// Take a unit, suspending the current task until one is handed over,
    /// `deadline` passes or the task is cancelled.
    pub fn acquire(self: &Arc<Self>, deadline: Deadline) -> Acquire<'_> {
        Acquire {
            sem: self,
            deadline,
            waiter: None,
            timer: DeadlineTimer::new(),
        }
    }

    /// [`Semaphore::acquire`] without a deadline
    pub fn acquire_unbounded(self: &Arc<Self>) -> Acquire<'_> {
        self.acquire(Deadline::unreachable())
    }

    /// Give a permit back. Same as dropping it.
    pub fn release(&self, mut permit: SemaphorePermit) {
        if permit.owns_permit() && !permit.belongs_to(self) {
            invariant_violation("permit released to a semaphore that did not issue it");
        }
        permit.unlock();
    }

    fn try_take_unit(&self) -> bool {
        let capacity = self.capacity.load(Ordering::SeqCst);
        self.acquired
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < capacity).then_some(used + 1)
            })
            .is_ok()
    }

    pub(crate) fn release_unit(&self) {
        let released = self
            .acquired
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| used.checked_sub(1));
        if released.is_err() {
            invariant_violation("semaphore released more units than were acquired");
        }
        if self.waiters() > 0 {
            let mut queue = self.waiters.lock();
            self.grant_waiters_locked(&mut queue);
        }
    }

    /// Hand free units to waiters, oldest first
    fn grant_waiters_locked(&self, queue: &mut VecDeque<Arc<Waiter>>) {
        while !queue.is_empty() && self.try_take_unit() {
            if let Some(waiter) = queue.pop_front() {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                waiter.grant();
            }
        }
    }

    fn enqueue(&self, waiter: Arc<Waiter>) {
        let mut queue = self.waiters.lock();
        self.queued.fetch_add(1, Ordering::SeqCst);
        queue.push_back(waiter);
        // A release between the failed fast path and the push left a unit
        self.grant_waiters_locked(&mut queue);
    }

    /// Returns false if the waiter was already granted
    fn remove_waiter(&self, waiter: &Arc<Waiter>) -> bool {
        let mut queue = self.waiters.lock();
        match queue.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            Some(index) => {
                queue.remove(index);
                self.queued.fetch_sub(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("waiters", &self.waiters())
            .finish()
    }
}

/// Future returned by [`Semaphore::acquire`]
#[must_use = "futures do nothing unless awaited"]
pub struct Acquire<'a> {
    sem: &'a Arc<Semaphore>,
    deadline: Deadline,
    waiter: Option<Arc<Waiter>>,
    timer: DeadlineTimer,
}

impl Acquire<'_> {
    fn granted(&mut self) -> Poll<Result<SemaphorePermit, WaitError>> {
        self.waiter = None;
        self.timer.disarm();
        Poll::Ready(Ok(SemaphorePermit::new(self.sem.clone())))
    }

    fn expired(&self) -> Result<(), WaitError> {
        check_cancelled()?;
        if self.deadline.is_reached() {
            return Err(WaitError::DeadlineExceeded);
        }
        Ok(())
    }
}

impl Future for Acquire<'_> {
    type Output = Result<SemaphorePermit, WaitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        match this.waiter.clone() {
            None => {
                if this.sem.waiters() == 0 && this.sem.try_take_unit() {
                    return this.granted();
                }
                if let Err(err) = this.expired() {
                    return Poll::Ready(Err(err));
                }
                let waiter = Arc::new(Waiter::new(cx.waker()));
                this.waiter = Some(waiter.clone());
                this.sem.enqueue(waiter.clone());
                if waiter.is_granted() {
                    return this.granted();
                }
            }
            Some(waiter) => {
                if waiter.is_granted() {
                    return this.granted();
                }
                if let Err(err) = this.expired() {
                    if this.sem.remove_waiter(&waiter) {
                        this.waiter = None;
                        return Poll::Ready(Err(err));
                    }
                    // Granted while the cancellation raced in: keep the unit
                    return this.granted();
                }
                waiter.update_waker(cx.waker());
                if waiter.is_granted() {
                    return this.granted();
                }
            }
        }

        let deadline = this.deadline;
        if let Err(err) = this.timer.arm(deadline, cx.waker()) {
            if let Some(waiter) = this.waiter.take() {
                if !this.sem.remove_waiter(&waiter) {
                    this.sem.release_unit();
                }
            }
            return Poll::Ready(Err(err));
        }
        current_task::set_suspend_reason(SuspendReason::Semaphore);
        Poll::Pending
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            if !self.sem.remove_waiter(&waiter) {
                // Granted but never observed
                self.sem.release_unit();
            }
        }
    }
}
