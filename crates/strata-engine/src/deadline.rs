//! Deadlines for suspension points and tasks
//!
//! A `Deadline` is either an instant or "unreachable" (never expires). Waits
//! take a `Deadline` rather than a `Duration` so that a chain of calls can
//! share one budget.

use std::time::{Duration, Instant};

/// Point in time after which a wait gives up.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never expires
    pub const fn unreachable() -> Self {
        Deadline(None)
    }

    /// A deadline that has already expired
    pub fn passed() -> Self {
        Deadline(Some(Instant::now()))
    }

    /// Deadline `duration` from now. Saturates to unreachable on overflow.
    pub fn from_duration(duration: Duration) -> Self {
        Deadline(Instant::now().checked_add(duration))
    }

    /// Deadline at a fixed instant
    pub fn from_instant(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    /// Whether this deadline can ever expire
    pub fn is_reachable(&self) -> bool {
        self.0.is_some()
    }

    /// Whether this deadline has expired
    pub fn is_reached(&self) -> bool {
        match self.0 {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// Time left until expiry (zero once reached, `None` when unreachable)
    pub fn time_left(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// The expiry instant, if any
    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// The earlier of two deadlines
    pub fn earliest(self, other: Deadline) -> Deadline {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Deadline(Some(a.min(b))),
            (Some(a), None) | (None, Some(a)) => Deadline(Some(a)),
            (None, None) => Deadline(None),
        }
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Deadline::from_instant(instant)
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Self {
        Deadline::from_duration(duration)
    }
}
