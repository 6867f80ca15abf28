//! Reader-writer lock with in-place upgrade and downgrade.
//!
//! # Example
//!
//! ```
//! use lockking_core::{RwLock, Preference, Timeout, LockError};
//!
//! let lock = RwLock::new();
//! lock.read_acquire(Preference::ReadPreferring, Timeout::Infinite).unwrap();
//! assert_eq!(lock.write_acquire(Timeout::Immediate), Err(LockError::WouldBlock));
//!
//! // The only reader can become the writer without unlocking in between
//! lock.upgrade(Timeout::Immediate).unwrap();
//! assert!(lock.is_write_locked());
//!
//! lock.downgrade().unwrap();
//! lock.read_release().unwrap();
//! assert!(!lock.is_referenced());
//! ```

use core::{cell::Cell, fmt};
use log::{debug, trace, warn};
use parking_lot::Condvar;
use static_assertions::assert_impl_all;

use crate::{
    error::{LockError, LockResult},
    guard::{RwLockReadGuard, RwLockWriteGuard},
    timeout::Timeout,
    wait::{wait_on, wait_until, ProtectingMutex, SharedMutex, SharedMutexGuard},
};

const LOG_CAT : &str = "lockking::rwlock";

/// Admission policy for new readers.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Preference {
    /// A reader is admitted whenever no writer holds the lock, even if writers are waiting.
    ///
    /// Writers can starve under a steady stream of readers.
    #[default]
    ReadPreferring,
    /// A reader is only admitted when no writer holds the lock and no writer or upgrader is waiting for it.
    ///
    /// Readers can starve under a steady stream of writers.
    WritePreferring,
}

/// Instantaneous copy of the counters of a [`RwLock`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct RwLockState {
    pub readers          : u64,
    pub readers_waiting  : u64,
    pub writers_waiting  : u64,
    pub writer_active    : bool,
    pub upgrader_waiting : bool,
}

impl RwLockState {
    pub fn is_read_locked(&self) -> bool {
        self.readers > 0
    }

    pub fn is_write_locked(&self) -> bool {
        self.writer_active
    }

    pub fn has_waiters(&self) -> bool {
        self.readers_waiting > 0 || self.writers_waiting > 0 || self.upgrader_waiting
    }

    pub fn is_referenced(&self) -> bool {
        self.is_read_locked() || self.is_write_locked() || self.has_waiters()
    }
}

// Only ever accessed with the protecting mutex held, or through `&mut RwLock`.
#[derive(Default)]
struct Counters {
    readers          : Cell<u64>,
    readers_waiting  : Cell<u64>,
    writers_waiting  : Cell<u64>,
    writer_active    : Cell<bool>,
    upgrader_waiting : Cell<bool>,
}

impl Counters {
    fn snapshot(&self) -> RwLockState {
        RwLockState {
            readers: self.readers.get(),
            readers_waiting: self.readers_waiting.get(),
            writers_waiting: self.writers_waiting.get(),
            writer_active: self.writer_active.get(),
            upgrader_waiting: self.upgrader_waiting.get(),
        }
    }

    fn can_read(&self, preference: Preference) -> bool {
        if self.writer_active.get() {
            return false;
        }
        match preference {
            Preference::ReadPreferring => true,
            Preference::WritePreferring => self.writers_waiting.get() == 0 && !self.upgrader_waiting.get(),
        }
    }

    fn can_write(&self) -> bool {
        self.readers.get() == 0 && !self.writer_active.get()
    }

    fn add_reader(&self) {
        self.readers.set(self.readers.get() + 1);
    }

    fn remove_reader(&self) {
        self.readers.set(self.readers.get() - 1);
    }
}

/// A reader-writer lock.
///
/// Any number of readers, or a single writer, can hold the lock at the same time.
/// A reader can be upgraded to the writer, and the writer downgraded to a reader, without unlocking in between.
///
/// Like [`GLock`](crate::GLock), the lock only counts its holders, releasing what was acquired is up to the caller.
///
/// # Fairness
///
/// Readers are admitted according to the [`Preference`] passed to each read request.
/// When the writer unlocks, a waiting writer is always woken in favour of waiting readers.
/// Beyond that there is no ordering between waiters.
///
/// # Upgrading
///
/// Only one reader can wait for an upgrade at any time, a second reader requesting one fails with [`LockError::Contention`] instead of queueing.
/// Two waiting upgraders would each wait for the other to release its read lock.
///
/// # Protecting mutex
///
/// As for [`GLock`](crate::GLock), the counters are guarded by an owned or a borrowed mutex.
/// The `*_in` methods run under a guard of that mutex which the caller already holds, the plain methods lock it themselves.
pub struct RwLock<'a> {
    mutex        : ProtectingMutex<'a>,
    read_wait    : Condvar,
    write_wait   : Condvar,
    upgrade_wait : Condvar,
    state        : Counters,
}

// SAFETY: `state` is only written while the protecting mutex is held by the writing thread, either locked internally or proven by a
// caller supplied `&mut SharedMutexGuard` (checked via `ProtectingMutex::assert_held`). The guard is `!Send`, so a `&mut` to it can't leave
// the thread holding the mutex. Shared `&SharedMutexGuard` only grants reads, and nothing can write while such a borrow is alive.
unsafe impl Sync for RwLock<'_> {}

assert_impl_all!(RwLock<'static>: Send, Sync);

impl<'a> RwLock<'a> {
    /// Create an unlocked lock with its own protecting mutex.
    pub fn new() -> Self {
        Self::init(None)
    }

    /// Create an unlocked lock protected by the caller's `mutex`.
    pub fn with_mutex(mutex: &'a SharedMutex) -> Self {
        Self::init(Some(mutex))
    }

    fn init(external: Option<&'a SharedMutex>) -> Self {
        let mutex = ProtectingMutex::new(external);
        debug!(target: LOG_CAT, "created rwlock ({mutex:?} mutex)");
        Self {
            mutex,
            read_wait: Condvar::new(),
            write_wait: Condvar::new(),
            upgrade_wait: Condvar::new(),
            state: Counters::default(),
        }
    }

    /// Destroy the lock, or hand it back if it is still held or waited on.
    pub fn deinit(self) -> Result<(), Self> {
        if self.state.snapshot().is_referenced() {
            Err(self)
        } else {
            Ok(())
        }
    }

    /// Whether the lock is protected by a mutex supplied by the caller.
    #[inline]
    pub fn has_external_mutex(&self) -> bool {
        self.mutex.is_external()
    }

    //------------------------------------------------------------------------------------------------------------------------------

    /// Acquire a read lock.
    ///
    /// # Errors
    ///
    /// - [`LockError::WouldBlock`] if `timeout` is [`Timeout::Immediate`] and the reader can't be admitted right away.
    /// - [`LockError::TimedOut`] if a bounded wait expired.
    pub fn read_acquire(&self, preference: Preference, timeout: Timeout) -> LockResult {
        let mut guard = self.mutex.lock();
        self.read_acquire_locked(&mut guard, preference, timeout)
    }

    /// Same as [`RwLock::read_acquire`], with the protecting mutex already held by the caller.
    ///
    /// # Panics
    ///
    /// Panics if `guard` doesn't belong to this lock's protecting mutex.
    pub fn read_acquire_in(&self, guard: &mut SharedMutexGuard<'_>, preference: Preference, timeout: Timeout) -> LockResult {
        self.mutex.assert_held(guard);
        self.read_acquire_locked(guard, preference, timeout)
    }

    /// Acquire the write lock.
    ///
    /// # Errors
    ///
    /// - [`LockError::WouldBlock`] if `timeout` is [`Timeout::Immediate`] and the lock is held.
    /// - [`LockError::TimedOut`] if a bounded wait expired.
    pub fn write_acquire(&self, timeout: Timeout) -> LockResult {
        let mut guard = self.mutex.lock();
        self.write_acquire_locked(&mut guard, timeout)
    }

    /// Same as [`RwLock::write_acquire`], with the protecting mutex already held by the caller.
    ///
    /// # Panics
    ///
    /// Panics if `guard` doesn't belong to this lock's protecting mutex.
    pub fn write_acquire_in(&self, guard: &mut SharedMutexGuard<'_>, timeout: Timeout) -> LockResult {
        self.mutex.assert_held(guard);
        self.write_acquire_locked(guard, timeout)
    }

    /// Turn the write lock into a read lock, waking waiting readers.
    ///
    /// # Errors
    ///
    /// - [`LockError::NotHeld`] if the lock isn't write locked.
    pub fn downgrade(&self) -> LockResult {
        let _guard = self.mutex.lock();
        self.downgrade_locked()
    }

    /// Same as [`RwLock::downgrade`], with the protecting mutex already held by the caller.
    ///
    /// # Panics
    ///
    /// Panics if `guard` doesn't belong to this lock's protecting mutex.
    pub fn downgrade_in(&self, guard: &mut SharedMutexGuard<'_>) -> LockResult {
        self.mutex.assert_held(guard);
        self.downgrade_locked()
    }

    /// Turn a held read lock into the write lock.
    ///
    /// The upgrade succeeds once the caller's read lock is the only one left.
    ///
    /// # Errors
    ///
    /// - [`LockError::NotHeld`] if the lock is write locked, or not read locked at all.
    /// - [`LockError::Contention`] if another reader is already waiting to upgrade.
    /// - [`LockError::WouldBlock`] if `timeout` is [`Timeout::Immediate`] and other readers hold the lock.
    /// - [`LockError::TimedOut`] if a bounded wait expired.
    pub fn upgrade(&self, timeout: Timeout) -> LockResult {
        let mut guard = self.mutex.lock();
        self.upgrade_locked(&mut guard, timeout)
    }

    /// Same as [`RwLock::upgrade`], with the protecting mutex already held by the caller.
    ///
    /// # Panics
    ///
    /// Panics if `guard` doesn't belong to this lock's protecting mutex.
    pub fn upgrade_in(&self, guard: &mut SharedMutexGuard<'_>, timeout: Timeout) -> LockResult {
        self.mutex.assert_held(guard);
        self.upgrade_locked(guard, timeout)
    }

    /// Release a read lock.
    ///
    /// # Errors
    ///
    /// - [`LockError::NotHeld`] if no read lock can be released.
    ///   A read lock belonging to a reader waiting for an upgrade can't be released.
    pub fn read_release(&self) -> LockResult {
        let _guard = self.mutex.lock();
        self.read_release_locked()
    }

    /// Same as [`RwLock::read_release`], with the protecting mutex already held by the caller.
    ///
    /// # Panics
    ///
    /// Panics if `guard` doesn't belong to this lock's protecting mutex.
    pub fn read_release_in(&self, guard: &mut SharedMutexGuard<'_>) -> LockResult {
        self.mutex.assert_held(guard);
        self.read_release_locked()
    }

    /// Release the write lock.
    ///
    /// # Errors
    ///
    /// - [`LockError::NotHeld`] if the lock isn't write locked.
    pub fn write_release(&self) -> LockResult {
        let _guard = self.mutex.lock();
        self.write_release_locked()
    }

    /// Same as [`RwLock::write_release`], with the protecting mutex already held by the caller.
    ///
    /// # Panics
    ///
    /// Panics if `guard` doesn't belong to this lock's protecting mutex.
    pub fn write_release_in(&self, guard: &mut SharedMutexGuard<'_>) -> LockResult {
        self.mutex.assert_held(guard);
        self.write_release_locked()
    }

    /// Alias of [`RwLock::read_acquire`].
    #[inline]
    pub fn shared_acquire(&self, preference: Preference, timeout: Timeout) -> LockResult {
        self.read_acquire(preference, timeout)
    }

    /// Alias of [`RwLock::read_release`].
    #[inline]
    pub fn shared_release(&self) -> LockResult {
        self.read_release()
    }

    /// Alias of [`RwLock::write_acquire`].
    #[inline]
    pub fn exclusive_acquire(&self, timeout: Timeout) -> LockResult {
        self.write_acquire(timeout)
    }

    /// Alias of [`RwLock::write_release`].
    #[inline]
    pub fn exclusive_release(&self) -> LockResult {
        self.write_release()
    }

    /// Acquire a read lock and return a guard releasing it when dropped.
    pub fn read(&self, preference: Preference, timeout: Timeout) -> LockResult<RwLockReadGuard<'_, 'a>> {
        self.read_acquire(preference, timeout)?;
        Ok(RwLockReadGuard::new(self))
    }

    /// Acquire the write lock and return a guard releasing it when dropped.
    pub fn write(&self, timeout: Timeout) -> LockResult<RwLockWriteGuard<'_, 'a>> {
        self.write_acquire(timeout)?;
        Ok(RwLockWriteGuard::new(self))
    }

    //------------------------------------------------------------------------------------------------------------------------------

    /// Whether any reader holds the lock.
    ///
    /// The result is only a snapshot, it may be stale by the time it is used unless the caller holds the protecting mutex (see [`RwLock::is_read_locked_in`]).
    pub fn is_read_locked(&self) -> bool {
        self.snapshot().is_read_locked()
    }

    /// Same as [`RwLock::is_read_locked`], stable for as long as `guard` is held.
    pub fn is_read_locked_in(&self, guard: &SharedMutexGuard<'_>) -> bool {
        self.snapshot_in(guard).is_read_locked()
    }

    /// Whether the writer holds the lock.
    pub fn is_write_locked(&self) -> bool {
        self.snapshot().is_write_locked()
    }

    /// Same as [`RwLock::is_write_locked`], stable for as long as `guard` is held.
    pub fn is_write_locked_in(&self, guard: &SharedMutexGuard<'_>) -> bool {
        self.snapshot_in(guard).is_write_locked()
    }

    /// Alias of [`RwLock::is_read_locked`].
    #[inline]
    pub fn is_shared_locked(&self) -> bool {
        self.is_read_locked()
    }

    /// Alias of [`RwLock::is_write_locked`].
    #[inline]
    pub fn is_exclusive_locked(&self) -> bool {
        self.is_write_locked()
    }

    /// Whether any reader, writer or upgrader is waiting.
    pub fn has_waiters(&self) -> bool {
        self.snapshot().has_waiters()
    }

    /// Same as [`RwLock::has_waiters`], stable for as long as `guard` is held.
    pub fn has_waiters_in(&self, guard: &SharedMutexGuard<'_>) -> bool {
        self.snapshot_in(guard).has_waiters()
    }

    /// Whether the lock is held or waited on.
    pub fn is_referenced(&self) -> bool {
        self.snapshot().is_referenced()
    }

    /// Same as [`RwLock::is_referenced`], stable for as long as `guard` is held.
    pub fn is_referenced_in(&self, guard: &SharedMutexGuard<'_>) -> bool {
        self.snapshot_in(guard).is_referenced()
    }

    /// Copy all counters.
    pub fn snapshot(&self) -> RwLockState {
        let _guard = self.mutex.lock();
        self.state.snapshot()
    }

    /// Same as [`RwLock::snapshot`], stable for as long as `guard` is held.
    pub fn snapshot_in(&self, guard: &SharedMutexGuard<'_>) -> RwLockState {
        self.mutex.assert_held(guard);
        self.state.snapshot()
    }

    //------------------------------------------------------------------------------------------------------------------------------

    /// A writer or upgrader that stops waiting may be all that kept write-preferring readers out.
    fn wake_deferred_readers(&self) {
        let state = &self.state;
        if state.readers_waiting.get() > 0 && state.can_read(Preference::WritePreferring) {
            self.read_wait.notify_all();
        }
    }

    fn read_acquire_locked(&self, guard: &mut SharedMutexGuard<'_>, preference: Preference, timeout: Timeout) -> LockResult {
        let state = &self.state;
        if !wait_until(&self.read_wait, guard, timeout, &state.readers_waiting, || state.can_read(preference)) {
            trace!(target: LOG_CAT, "refused reader ({preference:?}, {timeout:?})");
            return Err(timeout.failure());
        }

        state.add_reader();
        Ok(())
    }

    fn write_acquire_locked(&self, guard: &mut SharedMutexGuard<'_>, timeout: Timeout) -> LockResult {
        let state = &self.state;
        if !wait_until(&self.write_wait, guard, timeout, &state.writers_waiting, || state.can_write()) {
            trace!(target: LOG_CAT, "refused writer ({timeout:?})");
            if timeout.may_block() {
                self.wake_deferred_readers();
            }
            return Err(timeout.failure());
        }

        state.writer_active.set(true);
        Ok(())
    }

    fn downgrade_locked(&self) -> LockResult {
        let state = &self.state;
        if !state.writer_active.get() {
            return Err(LockError::NotHeld);
        }

        state.writer_active.set(false);
        state.add_reader();

        // The writer excluded every reader, so nobody can be waiting to upgrade, only readers can benefit.
        if state.readers_waiting.get() > 0 {
            self.read_wait.notify_all();
        }
        Ok(())
    }

    fn upgrade_locked(&self, guard: &mut SharedMutexGuard<'_>, timeout: Timeout) -> LockResult {
        let state = &self.state;
        if state.writer_active.get() || state.readers.get() == 0 {
            return Err(LockError::NotHeld);
        }
        if state.upgrader_waiting.get() {
            return Err(LockError::Contention);
        }

        if state.readers.get() > 1 {
            let Some(deadline) = timeout.deadline() else {
                return Err(LockError::WouldBlock);
            };

            {
                state.upgrader_waiting.set(true);
                let _waiting = scopeguard::guard(&state.upgrader_waiting, |flag| flag.set(false));
                while state.readers.get() > 1 {
                    if !wait_on(&self.upgrade_wait, guard, deadline) {
                        break;
                    }
                }
            }

            if state.readers.get() > 1 {
                trace!(target: LOG_CAT, "refused upgrade ({timeout:?})");
                self.wake_deferred_readers();
                return Err(timeout.failure());
            }
        }

        state.remove_reader();
        state.writer_active.set(true);
        Ok(())
    }

    fn read_release_locked(&self) -> LockResult {
        let state = &self.state;
        // The read lock of a waiting upgrader is not up for release
        if state.readers.get() <= state.upgrader_waiting.get() as u64 {
            return Err(LockError::NotHeld);
        }

        state.remove_reader();

        let readers = state.readers.get();
        if readers == 1 && state.upgrader_waiting.get() {
            self.upgrade_wait.notify_one();
        } else if readers == 0 && state.writers_waiting.get() > 0 {
            self.write_wait.notify_one();
        } else if readers == 0 && state.readers_waiting.get() > 0 {
            self.read_wait.notify_all();
        }
        Ok(())
    }

    fn write_release_locked(&self) -> LockResult {
        let state = &self.state;
        if !state.writer_active.get() {
            return Err(LockError::NotHeld);
        }

        state.writer_active.set(false);

        // Hand over to the next writer first, whatever preference the readers asked for
        if state.writers_waiting.get() > 0 {
            self.write_wait.notify_one();
        } else if state.readers_waiting.get() > 0 {
            self.read_wait.notify_all();
        }
        Ok(())
    }
}

impl Default for RwLock<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RwLock<'_> {
    fn drop(&mut self) {
        let state = self.state.snapshot();
        if state.is_referenced() {
            warn!(target: LOG_CAT, "rwlock dropped while still referenced: {state:?}");
        }
    }
}

impl fmt::Debug for RwLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("RwLock");
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
