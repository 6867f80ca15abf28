//! Generalized multi-mode lock.
//!
//! A [`GLock`] guards a single resource in any number of application defined modes.
//! Which modes can be held at the same time is decided by a [`CompatibilityMatrix`].
//!
//! # Example
//!
//! ```
//! use lockking_core::{GLock, Timeout, LockError};
//! use lockking_core::matrix::{HIERARCHICAL_MATRIX, hierarchical_modes::*};
//!
//! let lock = GLock::new(&HIERARCHICAL_MATRIX).unwrap();
//! lock.acquire(S, Timeout::Infinite).unwrap();
//! lock.acquire(IS, Timeout::Infinite).unwrap();
//! assert_eq!(lock.acquire(IX, Timeout::Immediate), Err(LockError::WouldBlock));
//!
//! lock.release(S).unwrap();
//! lock.transition(IS, IX, Timeout::Immediate).unwrap();
//! lock.release(IX).unwrap();
//! assert!(!lock.is_locked());
//! ```

use core::{cell::Cell, fmt};
use log::{debug, trace, warn};
use parking_lot::Condvar;
use static_assertions::assert_impl_all;

use crate::{
    error::{LockError, LockResult},
    guard::GLockGuard,
    matrix::CompatibilityMatrix,
    timeout::Timeout,
    wait::{wait_until, ProtectingMutex, SharedMutex, SharedMutexGuard},
};

const LOG_CAT : &str = "lockking::glock";

/// Instantaneous copy of the counters of a [`GLock`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GLockState {
    /// Number of grants currently held per mode.
    pub grants  : Vec<u64>,
    /// Number of threads blocked on the lock.
    pub waiters : u64,
}

impl GLockState {
    /// Whether any mode is held.
    pub fn is_locked(&self) -> bool {
        self.grants.iter().any(|&count| count > 0)
    }

    /// Whether the lock is held or waited on.
    pub fn is_referenced(&self) -> bool {
        self.is_locked() || self.waiters > 0
    }
}

// Only ever accessed with the protecting mutex held, or through `&mut GLock`.
struct GrantState {
    grants  : Box<[Cell<u64>]>,
    waiters : Cell<u64>,
}

impl GrantState {
    fn is_locked(&self) -> bool {
        self.grants.iter().any(|count| count.get() > 0)
    }

    fn has_waiters(&self) -> bool {
        self.waiters.get() > 0
    }

    fn is_referenced(&self) -> bool {
        self.is_locked() || self.has_waiters()
    }

    fn snapshot(&self) -> GLockState {
        GLockState {
            grants: self.grants.iter().map(Cell::get).collect(),
            waiters: self.waiters.get(),
        }
    }
}

/// A generalized lock, driven by a compatibility matrix.
///
/// Any number of threads can hold the lock at the same time, as long as every pair of held modes is compatible according to the matrix.
/// A mode can only be held by multiple threads at once if it is compatible with itself.
///
/// Grants are not tied to threads: the lock only counts how often each mode is held, it's up to the caller to release what it acquired.
///
/// # Fairness
///
/// The lock is intentionally unfair.
/// Every change of the held modes wakes all waiters, and whichever waiter finds its mode compatible first gets the lock, there is no FIFO ordering.
///
/// # Protecting mutex
///
/// The counters are guarded by a mutex that is either owned by the lock ([`GLock::new`]), or borrowed from the caller ([`GLock::with_mutex`]).
/// Sharing one mutex between several locks allows them to be inspected and modified atomically by holding that mutex and using the `*_in` methods.
///
/// The plain methods always lock the protecting mutex themselves.
/// Calling them while already holding the external mutex will deadlock.
pub struct GLock<'a> {
    mutex  : ProtectingMutex<'a>,
    wait   : Condvar,
    matrix : &'a CompatibilityMatrix,
    state  : GrantState,
}

// SAFETY: `state` is only written while the protecting mutex is held by the writing thread, either locked internally or proven by a
// caller supplied `&mut SharedMutexGuard` (checked via `ProtectingMutex::assert_held`). The guard is `!Send`, so a `&mut` to it can't leave
// the thread holding the mutex. Shared `&SharedMutexGuard` only grants reads, and nothing can write while such a borrow is alive.
unsafe impl Sync for GLock<'_> {}

assert_impl_all!(GLock<'static>: Send, Sync);

impl<'a> GLock<'a> {
    /// Create an unlocked lock with its own protecting mutex.
    ///
    /// Fails with [`LockError::AllocationFailure`] if the grant counters can't be allocated.
    pub fn new(matrix: &'a CompatibilityMatrix) -> LockResult<Self> {
        Self::init(matrix, None)
    }

    /// Create an unlocked lock protected by the caller's `mutex`.
    pub fn with_mutex(matrix: &'a CompatibilityMatrix, mutex: &'a SharedMutex) -> LockResult<Self> {
        Self::init(matrix, Some(mutex))
    }

    fn init(matrix: &'a CompatibilityMatrix, external: Option<&'a SharedMutex>) -> LockResult<Self> {
        let mode_count = matrix.mode_count();

        let mut grants = Vec::new();
        grants.try_reserve_exact(mode_count).map_err(|_| LockError::AllocationFailure)?;
        grants.resize_with(mode_count, || Cell::new(0));

        let mutex = ProtectingMutex::new(external);
        debug!(target: LOG_CAT, "created glock with {mode_count} modes ({mutex:?} mutex)");

        Ok(Self {
            mutex,
            wait: Condvar::new(),
            matrix,
            state: GrantState { grants: grants.into_boxed_slice(), waiters: Cell::new(0) },
        })
    }

    /// Destroy the lock, or hand it back if it is still held or waited on.
    pub fn deinit(self) -> Result<(), Self> {
        if self.state.is_referenced() {
            Err(self)
        } else {
            Ok(())
        }
    }

    /// The matrix driving this lock.
    #[inline]
    pub fn matrix(&self) -> &'a CompatibilityMatrix {
        self.matrix
    }

    /// Number of modes the lock can be held in.
    #[inline]
    pub fn mode_count(&self) -> usize {
        self.matrix.mode_count()
    }

    /// Whether the lock is protected by a mutex supplied by the caller.
    #[inline]
    pub fn has_external_mutex(&self) -> bool {
        self.mutex.is_external()
    }

    //------------------------------------------------------------------------------------------------------------------------------

    /// Acquire the lock in `mode`.
    ///
    /// The lock is granted if `mode` is compatible with every mode that is currently held.
    /// Otherwise the call blocks according to `timeout`, re-checking whenever the held modes change.
    ///
    /// # Errors
    ///
    /// - [`LockError::InvalidMode`] if `mode` is out of range.
    /// - [`LockError::WouldBlock`] if `timeout` is [`Timeout::Immediate`] and the lock can't be granted right away.
    /// - [`LockError::TimedOut`] if a bounded wait expired.
    pub fn acquire(&self, mode: usize, timeout: Timeout) -> LockResult {
        self.check_mode(mode)?;
        let mut guard = self.mutex.lock();
        self.acquire_locked(&mut guard, mode, timeout)
    }

    /// Same as [`GLock::acquire`], with the protecting mutex already held by the caller.
    ///
    /// # Panics
    ///
    /// Panics if `guard` doesn't belong to this lock's protecting mutex.
    pub fn acquire_in(&self, guard: &mut SharedMutexGuard<'_>, mode: usize, timeout: Timeout) -> LockResult {
        self.check_mode(mode)?;
        self.mutex.assert_held(guard);
        self.acquire_locked(guard, mode, timeout)
    }

    /// Atomically change a held grant of `old_mode` into a grant of `new_mode`.
    ///
    /// The grant being given up is not taken into account when checking compatibility, so a caller is never blocked by its own grant.
    /// On success all waiters are woken, since giving up `old_mode` may unblock any of them.
    ///
    /// # Errors
    ///
    /// - [`LockError::InvalidMode`] if either mode is out of range.
    /// - [`LockError::NotHeld`] if `old_mode` is not held.
    /// - [`LockError::WouldBlock`] or [`LockError::TimedOut`] as for [`GLock::acquire`].
    pub fn transition(&self, old_mode: usize, new_mode: usize, timeout: Timeout) -> LockResult {
        self.check_mode(old_mode)?;
        self.check_mode(new_mode)?;
        let mut guard = self.mutex.lock();
        self.transition_locked(&mut guard, old_mode, new_mode, timeout)
    }

    /// Same as [`GLock::transition`], with the protecting mutex already held by the caller.
    ///
    /// # Panics
    ///
    /// Panics if `guard` doesn't belong to this lock's protecting mutex.
    pub fn transition_in(&self, guard: &mut SharedMutexGuard<'_>, old_mode: usize, new_mode: usize, timeout: Timeout) -> LockResult {
        self.check_mode(old_mode)?;
        self.check_mode(new_mode)?;
        self.mutex.assert_held(guard);
        self.transition_locked(guard, old_mode, new_mode, timeout)
    }

    /// Release a grant of `mode`, waking all waiters.
    ///
    /// # Errors
    ///
    /// - [`LockError::InvalidMode`] if `mode` is out of range.
    /// - [`LockError::NotHeld`] if `mode` is not held.
    pub fn release(&self, mode: usize) -> LockResult {
        self.check_mode(mode)?;
        let _guard = self.mutex.lock();
        self.release_locked(mode)
    }

    /// Same as [`GLock::release`], with the protecting mutex already held by the caller.
    ///
    /// Like every `*_in` method that changes the lock, this needs exclusive access to the guard.
    /// A guard shared between threads can't be used to release:
    ///
    /// ```compile_fail
    /// use lockking_core::{GLock, SharedMutex, Timeout, READER_WRITER_MATRIX};
    ///
    /// let mutex = SharedMutex::new(());
    /// let lock = GLock::with_mutex(&READER_WRITER_MATRIX, &mutex).unwrap();
    /// let guard = mutex.lock();
    /// let shared = &guard;
    /// std::thread::scope(|s| {
    ///     s.spawn(|| lock.release_in(shared, 0));
    ///     s.spawn(|| lock.release_in(shared, 0));
    /// });
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if `guard` doesn't belong to this lock's protecting mutex.
    pub fn release_in(&self, guard: &mut SharedMutexGuard<'_>, mode: usize) -> LockResult {
        self.check_mode(mode)?;
        self.mutex.assert_held(guard);
        self.release_locked(mode)
    }

    /// Acquire the lock in `mode` and return a guard releasing it when dropped.
    ///
    /// See [`GLock::acquire`] for the possible errors.
    pub fn lock(&self, mode: usize, timeout: Timeout) -> LockResult<GLockGuard<'_, 'a>> {
        self.acquire(mode, timeout)?;
        Ok(GLockGuard::new(self, mode))
    }

    //------------------------------------------------------------------------------------------------------------------------------

    /// Whether any mode is currently held.
    ///
    /// The result is only a snapshot, it may be stale by the time it is used unless the caller holds the protecting mutex (see [`GLock::is_locked_in`]).
    pub fn is_locked(&self) -> bool {
        let _guard = self.mutex.lock();
        self.state.is_locked()
    }

    /// Same as [`GLock::is_locked`], stable for as long as `guard` is held.
    pub fn is_locked_in(&self, guard: &SharedMutexGuard<'_>) -> bool {
        self.mutex.assert_held(guard);
        self.state.is_locked()
    }

    /// Whether any thread is blocked on the lock.
    pub fn has_waiters(&self) -> bool {
        let _guard = self.mutex.lock();
        self.state.has_waiters()
    }

    /// Same as [`GLock::has_waiters`], stable for as long as `guard` is held.
    pub fn has_waiters_in(&self, guard: &SharedMutexGuard<'_>) -> bool {
        self.mutex.assert_held(guard);
        self.state.has_waiters()
    }

    /// Whether the lock is held or waited on.
    pub fn is_referenced(&self) -> bool {
        let _guard = self.mutex.lock();
        self.state.is_referenced()
    }

    /// Same as [`GLock::is_referenced`], stable for as long as `guard` is held.
    pub fn is_referenced_in(&self, guard: &SharedMutexGuard<'_>) -> bool {
        self.mutex.assert_held(guard);
        self.state.is_referenced()
    }

    /// Number of grants currently held in `mode`.
    pub fn grants(&self, mode: usize) -> LockResult<u64> {
        self.check_mode(mode)?;
        let _guard = self.mutex.lock();
        Ok(self.state.grants[mode].get())
    }

    /// Copy all counters.
    pub fn snapshot(&self) -> GLockState {
        let _guard = self.mutex.lock();
        self.state.snapshot()
    }

    /// Same as [`GLock::snapshot`], stable for as long as `guard` is held.
    pub fn snapshot_in(&self, guard: &SharedMutexGuard<'_>) -> GLockState {
        self.mutex.assert_held(guard);
        self.state.snapshot()
    }

    //------------------------------------------------------------------------------------------------------------------------------

    #[inline]
    fn check_mode(&self, mode: usize) -> LockResult {
        let mode_count = self.matrix.mode_count();
        if mode < mode_count {
            Ok(())
        } else {
            Err(LockError::InvalidMode { mode, mode_count })
        }
    }

    /// Check whether `mode` is compatible with every held grant, ignoring one grant of `released`.
    fn can_grab(&self, mode: usize, released: Option<usize>) -> bool {
        self.state.grants.iter().enumerate().all(|(held, count)| {
            let count = if released == Some(held) { count.get().saturating_sub(1) } else { count.get() };
            count == 0 || self.matrix.compatible_unchecked(held, mode)
        })
    }

    /// Block until `ready` holds or `timeout` runs out, then report whether it holds.
    #[inline]
    fn wait_until_ready<F>(&self, guard: &mut SharedMutexGuard<'_>, timeout: Timeout, ready: F) -> bool
    where
        F : Fn(&Self) -> bool
    {
        wait_until(&self.wait, guard, timeout, &self.state.waiters, || ready(self))
    }

    fn notify_waiters(&self) {
        if self.state.has_waiters() {
            self.wait.notify_all();
        }
    }

    fn acquire_locked(&self, guard: &mut SharedMutexGuard<'_>, mode: usize, timeout: Timeout) -> LockResult {
        if !self.wait_until_ready(guard, timeout, |lock| lock.can_grab(mode, None)) {
            trace!(target: LOG_CAT, "refused mode {mode} ({timeout:?})");
            return Err(timeout.failure());
        }

        let count = &self.state.grants[mode];
        count.set(count.get() + 1);
        Ok(())
    }

    fn transition_locked(&self, guard: &mut SharedMutexGuard<'_>, old_mode: usize, new_mode: usize, timeout: Timeout) -> LockResult {
        let held = |lock: &Self| lock.state.grants[old_mode].get() > 0;
        if !held(self) {
            return Err(LockError::NotHeld);
        }

        // Stop waiting as soon as the grant is gone, there is nothing left to transition.
        let ready = self.wait_until_ready(guard, timeout, |lock| !held(lock) || lock.can_grab(new_mode, Some(old_mode)));
        if !held(self) {
            return Err(LockError::NotHeld);
        }
        if !ready {
            trace!(target: LOG_CAT, "refused transition {old_mode} -> {new_mode} ({timeout:?})");
            return Err(timeout.failure());
        }

        let old = &self.state.grants[old_mode];
        old.set(old.get() - 1);
        let new = &self.state.grants[new_mode];
        new.set(new.get() + 1);

        self.notify_waiters();
        Ok(())
    }

    fn release_locked(&self, mode: usize) -> LockResult {
        let count = &self.state.grants[mode];
        if count.get() == 0 {
            return Err(LockError::NotHeld);
        }
        count.set(count.get() - 1);

        self.notify_waiters();
        Ok(())
    }
}

impl Drop for GLock<'_> {
    fn drop(&mut self) {
        if self.state.is_referenced() {
            warn!(target: LOG_CAT, "glock dropped while still referenced: {:?}", self.state.snapshot());
        }
    }
}

impl fmt::Debug for GLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("GLock");
        d.field("mutex", &self.mutex);
        match self.mutex.get().try_lock() {
            Some(_guard) => d.field("state", &self.state.snapshot()),
            None => {
                struct LockedPlaceholder;
                impl fmt::Debug for LockedPlaceholder {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str("<locked>")
                    }
                }
                d.field("state", &LockedPlaceholder)
            }
        };
        d.finish()
    }
}

#[cfg(test)]
mod tests;
