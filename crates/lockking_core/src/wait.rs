//! The mutex and condition-variable plumbing shared by [`GLock`](crate::GLock) and [`RwLock`](crate::RwLock).
//!
//! Both lock types keep their counters next to a protecting mutex.
//! That mutex is either owned by the lock, or borrowed from the caller so that several locks can be driven and inspected under a single mutex.

use core::{cell::Cell, fmt, ptr};
use parking_lot::{Condvar, Mutex, MutexGuard};
use static_assertions::assert_not_impl_any;

use crate::timeout::{Deadline, Timeout};

/// Mutex that can be shared between several locks.
pub type SharedMutex = Mutex<()>;

/// Guard of a [`SharedMutex`], used as proof that the protecting mutex is held.
pub type SharedMutexGuard<'a> = MutexGuard<'a, ()>;

// A `&mut SharedMutexGuard` proves the calling thread holds the mutex, the lock types' `Sync` impls rely on it.
assert_not_impl_any!(SharedMutexGuard<'static>: Send);

/// The mutex protecting the counters of a lock.
pub(crate) enum ProtectingMutex<'a> {
    /// Mutex owned by the lock.
    Internal(SharedMutex),
    /// Mutex owned by the caller, never freed by the lock.
    External(&'a SharedMutex),
}

impl<'a> ProtectingMutex<'a> {
    #[inline]
    pub(crate) fn new(external: Option<&'a SharedMutex>) -> Self {
        match external {
            Some(mutex) => Self::External(mutex),
            None => Self::Internal(SharedMutex::new(())),
        }
    }

    #[inline]
    pub(crate) fn get(&self) -> &SharedMutex {
        match self {
            Self::Internal(mutex) => mutex,
            Self::External(mutex) => mutex,
        }
    }

    #[inline]
    pub(crate) fn is_external(&self) -> bool {
        matches!(self, Self::External(_))
    }

    /// Acquire the protecting mutex.
    #[inline]
    pub(crate) fn lock(&self) -> SharedMutexGuard<'_> {
        self.get().lock()
    }

    /// Check that `guard` holds this mutex.
    ///
    /// # Panics
    ///
    /// Panics if the guard belongs to a different mutex.
    /// Touching the counters under the wrong mutex would be a data race.
    #[inline]
    pub(crate) fn assert_held(&self, guard: &SharedMutexGuard<'_>) {
        if !ptr::eq(MutexGuard::mutex(guard), self.get()) {
            panic!("attempted to use a lock with a guard of a different mutex");
        }
    }
}

impl fmt::Debug for ProtectingMutex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal(_) => f.pad("Internal"),
            Self::External(_) => f.pad("External"),
        }
    }
}

/// Suspend on `cond` until notified or until `deadline` passes.
///
/// The mutex behind `guard` is released while suspended and held again when this returns.
/// Returns `false` when the wait ended because the deadline passed.
#[inline]
pub(crate) fn wait_on(cond: &Condvar, guard: &mut SharedMutexGuard<'_>, deadline: Deadline) -> bool {
    match deadline {
        Deadline::Never => {
            cond.wait(guard);
            true
        },
        Deadline::At(at) => !cond.wait_until(guard, at).timed_out(),
    }
}

/// Increment a waiting counter for the duration of a single wait.
///
/// The counter lives in a `Cell` that is only touched with the protecting mutex held.
/// Both increment and decrement happen while that mutex is held, the wait itself reacquires it before returning.
#[inline]
pub(crate) fn wait_counted(
    cond: &Condvar,
    guard: &mut SharedMutexGuard<'_>,
    deadline: Deadline,
    counter: &Cell<u64>
) -> bool {
    counter.set(counter.get() + 1);
    let _waiting = scopeguard::guard(counter, |counter| counter.set(counter.get() - 1));
    wait_on(cond, guard, deadline)
}

/// Block on `cond` until `ready` holds or `timeout` runs out, then report whether `ready` holds.
///
/// The deadline is computed once, so spurious and unrelated wakeups don't extend the wait.
/// `waiting` counts this thread as a waiter for as long as it is suspended.
pub(crate) fn wait_until<F>(
    cond: &Condvar,
    guard: &mut SharedMutexGuard<'_>,
    timeout: Timeout,
    waiting: &Cell<u64>,
    ready: F
) -> bool
where
    F : Fn() -> bool
{
    if let Some(deadline) = timeout.deadline() {
        while !ready() {
            if !wait_counted(cond, guard, deadline, waiting) {
                break;
            }
        }
    }
    ready()
}
