//! Suspension futures built on top of the event-loop timers

use super::current_task as current;
use super::task::SuspendReason;
use crate::deadline::Deadline;
use crate::error::{invariant_violation, CancellationReason, WaitError};
use crate::ev::TimerHandle;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

/// One-shot timer that wakes a waiting future at its deadline.
///
/// Lives inside the future that suspends; dropping it cancels the timer.
#[derive(Debug, Default)]
pub(crate) struct DeadlineTimer {
    timer: Option<TimerHandle>,
}

impl DeadlineTimer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make sure `waker` is woken once `deadline` is reached.
    ///
    /// Returns `Ok(false)` when no timer could be armed because the caller is
    /// not inside a task; such waits only notice the deadline when polled.
    pub(crate) fn arm(&mut self, deadline: Deadline, waker: &Waker) -> Result<bool, WaitError> {
        let Some(at) = deadline.instant() else {
            return Ok(true);
        };
        if self.timer.is_some() {
            return Ok(true);
        }
        let Some(thread) = current::event_thread() else {
            return Ok(false);
        };

        let waker = waker.clone();
        match thread.add_timer(at, move || waker.wake()) {
            Ok(timer) => {
                self.timer = Some(timer);
                Ok(true)
            }
            Err(err) => {
                tracing::warn!(%err, "cannot arm wait deadline");
                Err(WaitError::Cancelled(CancellationReason::Shutdown))
            }
        }
    }

    pub(crate) fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Cancellation of the current task as a wait error
pub(crate) fn check_cancelled() -> Result<(), WaitError> {
    match current::cancellation_reason() {
        Some(reason) => Err(WaitError::cancelled(reason)),
        None => Ok(()),
    }
}

/// Future returned by [`current::yield_now`]
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl YieldNow {
    pub(crate) fn new() -> Self {
        Self { yielded: false }
    }
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        current::set_suspend_reason(SuspendReason::Yield);
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Future returned by [`current::sleep_for`] and [`current::sleep_until`]
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct Sleep {
    deadline: Deadline,
    timer: DeadlineTimer,
}

impl Sleep {
    pub(crate) fn new(deadline: Deadline) -> Self {
        Self {
            deadline,
            timer: DeadlineTimer::new(),
        }
    }

    /// When the sleep ends
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = Result<(), WaitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Err(err) = check_cancelled() {
            return Poll::Ready(Err(err));
        }
        if self.deadline.is_reached() {
            return Poll::Ready(Ok(()));
        }
        if !current::in_task() {
            invariant_violation("sleep awaited outside of a task");
        }

        let deadline = self.deadline;
        if let Err(err) = self.timer.arm(deadline, cx.waker()) {
            return Poll::Ready(Err(err));
        }
        current::set_suspend_reason(SuspendReason::Sleep);
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::task::Wake;

    struct Noop;

    impl Wake for Noop {
        fn wake(self: Arc<Self>) {}
    }

    #[test]
    fn test_yield_now_pending_once() {
        let waker = Waker::from(Arc::new(Noop));
        let mut cx = Context::from_waker(&waker);
        let mut fut = YieldNow::new();
        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut fut).poll(&mut cx).is_ready());
    }

    #[test]
    fn test_elapsed_sleep_ready_outside_task() {
        let waker = Waker::from(Arc::new(Noop));
        let mut cx = Context::from_waker(&waker);
        let mut fut = Sleep::new(Deadline::passed());
        assert_eq!(Pin::new(&mut fut).poll(&mut cx), Poll::Ready(Ok(())));
    }

    #[test]
    fn test_timer_not_armed_outside_task() {
        let waker = Waker::from(Arc::new(Noop));
        let mut timer = DeadlineTimer::new();
        let armed = timer.arm(Deadline::from_duration(std::time::Duration::from_secs(1)), &waker);
        assert_eq!(armed, Ok(false));
        assert_eq!(timer.arm(Deadline::unreachable(), &waker), Ok(true));
    }
}
