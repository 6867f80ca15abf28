/// Reasons a lock operation can be refused.
///
/// Every failure is local and recoverable: a call that returns an error has not changed the state of the lock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// The mode lies outside of the range configured by the lock's compatibility matrix.
    #[error("lock mode {mode} is out of range (the matrix has {mode_count} modes)")]
    InvalidMode { mode: usize, mode_count: usize },
    /// The state the caller claims to hold (a mode, a reader or the writer) is not held.
    #[error("the lock is not held in the required state")]
    NotHeld,
    /// A non-blocking request could not be granted immediately.
    #[error("the lock could not be acquired without blocking")]
    WouldBlock,
    /// A bounded wait reached its deadline before the request could be granted.
    #[error("timed out while waiting for the lock")]
    TimedOut,
    /// Another reader is already waiting to upgrade.
    #[error("an upgrade is already in flight")]
    Contention,
    /// The per-mode grant counters could not be allocated.
    #[error("failed to allocate the grant counters")]
    AllocationFailure,
}

/// Errors produced while building a [`CompatibilityMatrix`](crate::matrix::CompatibilityMatrix).
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatrixError {
    /// A matrix was requested for zero modes.
    #[error("a compatibility matrix needs at least one mode")]
    NoModes,
    /// The lower triangle doesn't have `mode_count * (mode_count + 1) / 2` entries.
    #[error("expected {expected} lower-triangle entries, found {found}")]
    TableSize { expected: usize, found: usize },
    /// A compatible pair names a mode outside of `0..mode_count`.
    #[error("mode {mode} is out of range (the matrix has {mode_count} modes)")]
    ModeOutOfRange { mode: usize, mode_count: usize },
}

pub type LockResult<T = ()> = Result<T, LockError>;
