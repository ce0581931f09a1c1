//! Per-loop timer queue
//!
//! Each event loop keeps its own min-heap of wake instants. Cancellation only
//! removes the callback; the heap entry is discarded lazily when it surfaces.

use super::thread::{Callback, Command, ThreadHandle};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Instant;

/// Unique identifier of a registered timer
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

impl TimerId {
    pub(crate) fn next() -> Self {
        TimerId(NEXT_TIMER_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Entry in the timer heap
struct TimerEntry {
    at: Instant,
    id: TimerId,
}

// Reverse ordering for min-heap (earliest wake time first)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.id == other.id
    }
}

impl Eq for TimerEntry {}

/// Timers owned by one event loop
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    callbacks: FxHashMap<TimerId, Callback>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, id: TimerId, at: Instant, callback: Callback) {
        self.callbacks.insert(id, callback);
        self.heap.push(TimerEntry { at, id });
    }

    /// Returns false if the timer already fired or was never registered.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        self.callbacks.remove(&id).is_some()
    }

    /// Earliest pending wake instant, discarding cancelled entries on the way.
    pub(crate) fn next_wakeup(&mut self) -> Option<Instant> {
        while let Some(entry) = self.heap.peek() {
            if self.callbacks.contains_key(&entry.id) {
                return Some(entry.at);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove every timer due at `now` and hand back the callbacks in order.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<Callback> {
        let mut due = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.at > now {
                break;
            }
            let id = entry.id;
            self.heap.pop();
            if let Some(callback) = self.callbacks.remove(&id) {
                due.push(callback);
            }
        }
        due
    }

    /// Number of live (not cancelled, not fired) timers
    pub(crate) fn len(&self) -> usize {
        self.callbacks.len()
    }
}

/// Handle to a timer registered on an event loop
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: TimerId,
    thread: ThreadHandle,
}

impl TimerHandle {
    pub(crate) fn new(id: TimerId, thread: ThreadHandle) -> Self {
        Self { id, thread }
    }

    /// Timer ID
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Cancel the timer. A cancelled timer never fires; cancelling after it
    /// fired (or after the loop stopped) does nothing.
    pub fn cancel(&self) {
        let _ = self.thread.send(Command::CancelTimer(self.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counting(counter: &Arc<AtomicUsize>, tag: usize) -> Callback {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(tag, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_timer_ids_unique() {
        let a = TimerId::next();
        let b = TimerId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_take_due_in_order() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for (offset, tag) in [(30u64, 3usize), (10, 1), (20, 2)] {
            let order = order.clone();
            queue.add(
                TimerId::next(),
                now + Duration::from_millis(offset),
                Box::new(move || order.lock().push(tag)),
            );
        }

        assert_eq!(queue.next_wakeup(), Some(now + Duration::from_millis(10)));
        for callback in queue.take_due(now + Duration::from_millis(25)) {
            callback();
        }
        assert_eq!(*order.lock(), vec![1, 2]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_wakeup(), Some(now + Duration::from_millis(30)));
    }

    #[test]
    fn test_cancelled_timer_never_due() {
        let mut queue = TimerQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        let id = TimerId::next();
        queue.add(id, now, counting(&counter, 1));
        queue.add(TimerId::next(), now + Duration::from_secs(60), counting(&counter, 10));

        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));

        // Cancelled head is skipped
        assert_eq!(queue.next_wakeup(), Some(now + Duration::from_secs(60)));
        assert!(queue.take_due(now).is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
