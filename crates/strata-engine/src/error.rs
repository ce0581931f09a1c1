//! Error types for the scheduler, its suspension points and runtime setup.

use std::fmt;

/// Why a task was asked to stop.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CancellationReason {
    /// Someone called `request_cancel` on the task handle
    UserRequest = 1,
    /// The task's deadline elapsed
    Deadline = 2,
    /// The owning scheduler is shutting down
    Shutdown = 3,
    /// The task handle was dropped without being detached
    Abandoned = 4,
}

impl CancellationReason {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::UserRequest),
            2 => Some(Self::Deadline),
            3 => Some(Self::Shutdown),
            4 => Some(Self::Abandoned),
            _ => None,
        }
    }
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::UserRequest => "user request",
            Self::Deadline => "deadline",
            Self::Shutdown => "shutdown",
            Self::Abandoned => "handle abandoned",
        };
        f.write_str(text)
    }
}

/// Outcome of a task that did not complete normally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Cancellation was requested before the task finished
    #[error("task cancelled: {0}")]
    Cancelled(CancellationReason),

    /// The task's deadline elapsed before it finished
    #[error("task deadline exceeded")]
    DeadlineExceeded,

    /// The task body panicked
    #[error("task body failed: {0}")]
    Body(String),
}

impl TaskError {
    /// Build the error for a cancellation, folding deadline expiry into its own variant.
    pub fn cancelled(reason: CancellationReason) -> Self {
        match reason {
            CancellationReason::Deadline => Self::DeadlineExceeded,
            other => Self::Cancelled(other),
        }
    }

    /// True for both flavours of cancellation (requested or expired).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::DeadlineExceeded)
    }
}

/// Outcome of a suspension point that returned without its normal result.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The wait deadline (or the task deadline) elapsed
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The waiting task was cancelled
    #[error("wait interrupted: task cancelled ({0})")]
    Cancelled(CancellationReason),
}

impl WaitError {
    /// Build the error for a cancellation, folding deadline expiry into its own variant.
    pub fn cancelled(reason: CancellationReason) -> Self {
        match reason {
            CancellationReason::Deadline => Self::DeadlineExceeded,
            other => Self::Cancelled(other),
        }
    }
}

impl From<WaitError> for TaskError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::DeadlineExceeded => TaskError::DeadlineExceeded,
            WaitError::Cancelled(reason) => TaskError::Cancelled(reason),
        }
    }
}

/// Errors raised while building or driving the runtime itself.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// An OS thread could not be spawned
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    /// The configuration is unusable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Work was posted to an event loop that has already stopped
    #[error("event loop is stopped")]
    EventLoopStopped,
}

/// Report a broken invariant in caller code. Never returns.
#[cold]
#[track_caller]
pub(crate) fn invariant_violation(message: &str) -> ! {
    tracing::error!(%message, "invariant violation");
    panic!("invariant violation: {message}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_reason_maps_to_deadline_exceeded() {
        assert_eq!(
            TaskError::cancelled(CancellationReason::Deadline),
            TaskError::DeadlineExceeded
        );
        assert_eq!(
            WaitError::cancelled(CancellationReason::Deadline),
            WaitError::DeadlineExceeded
        );
        assert_eq!(
            TaskError::cancelled(CancellationReason::Shutdown),
            TaskError::Cancelled(CancellationReason::Shutdown)
        );
    }

    #[test]
    fn test_wait_error_into_task_error() {
        let err: TaskError = WaitError::Cancelled(CancellationReason::UserRequest).into();
        assert_eq!(err, TaskError::Cancelled(CancellationReason::UserRequest));
        assert!(err.is_cancellation());

        let err: TaskError = WaitError::DeadlineExceeded.into();
        assert_eq!(err, TaskError::DeadlineExceeded);
        assert!(!TaskError::Body("boom".into()).is_cancellation());
    }

    #[test]
    fn test_reason_round_trip_through_u8() {
        for reason in [
            CancellationReason::UserRequest,
            CancellationReason::Deadline,
            CancellationReason::Shutdown,
            CancellationReason::Abandoned,
        ] {
            assert_eq!(CancellationReason::from_u8(reason as u8), Some(reason));
        }
        assert_eq!(CancellationReason::from_u8(0), None);
    }
}
