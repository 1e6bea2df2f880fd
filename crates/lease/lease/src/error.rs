use std::time::Duration;

use thiserror::Error;

/// Errors reported by a [`LeaseStore`](crate::LeaseStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from lease lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock key must not be empty")]
    InvalidKey,

    #[error("lease duration must be at least 1ms, got {0:?}")]
    InvalidLease(Duration),

    /// Another holder owns the key. Callers pick their own retry policy.
    #[error("lock unavailable: {0} is held by another owner")]
    Unavailable(String),

    /// The lease expired or was taken over while the critical section ran.
    #[error("lock lost: lease on {0} expired or was taken over")]
    Lost(String),

    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl LockError {
    /// Whether this error is plain contention rather than a failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Whether exclusivity may have been violated for work already done.
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Lost(_))
    }
}

/// Outcome of a failed [`LeaseLock::with_lock`](crate::LeaseLock::with_lock)
/// call: either the lock itself failed, or the guarded function did.
#[derive(Debug, Error)]
pub enum GuardedError<E> {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("critical section failed: {0}")]
    Task(E),
}

impl<E> GuardedError<E> {
    /// The lock-level error, if the failure did not come from the guarded function.
    pub fn lock_error(&self) -> Option<&LockError> {
        match self {
            Self::Lock(e) => Some(e),
            Self::Task(_) => None,
        }
    }

    /// The guarded function's own error, if that is what failed.
    pub fn into_task(self) -> Option<E> {
        match self {
            Self::Task(e) => Some(e),
            Self::Lock(_) => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.lock_error().is_some_and(LockError::is_unavailable)
    }

    pub fn is_lost(&self) -> bool {
        self.lock_error().is_some_and(LockError::is_lost)
    }
}
