//! RAII guards for [`GLock`] and [`RwLock`].
//!
//! Guards release what they hold when dropped, by calling the plain release methods.
//! These take the protecting mutex, so a guard must not be dropped while the caller is holding the lock's external mutex.

use core::{fmt, mem::ManuallyDrop};
use log::error;

use crate::{
    error::{LockError, LockResult},
    glock::GLock,
    rwlock::RwLock,
    timeout::Timeout,
};

const LOG_CAT : &str = "lockking::guard";

/// Scoped grant of a [`GLock`] in a single mode.
///
/// Returned by [`GLock::lock`].
#[must_use = "if unused the grant is released immediately"]
pub struct GLockGuard<'l, 'a> {
    lock : &'l GLock<'a>,
    mode : usize,
}

impl<'l, 'a> GLockGuard<'l, 'a> {
    /// `mode` must be held on behalf of the new guard.
    pub(crate) fn new(lock: &'l GLock<'a>, mode: usize) -> Self {
        Self { lock, mode }
    }

    /// The lock this guard holds.
    #[inline]
    pub fn lock(&self) -> &'l GLock<'a> {
        self.lock
    }

    /// The mode currently held by this guard.
    #[inline]
    pub fn mode(&self) -> usize {
        self.mode
    }

    /// Move the grant to `new_mode`, see [`GLock::transition`].
    ///
    /// On failure the guard keeps holding its current mode.
    pub fn transition(&mut self, new_mode: usize, timeout: Timeout) -> LockResult {
        self.lock.transition(self.mode, new_mode, timeout)?;
        self.mode = new_mode;
        Ok(())
    }

    /// Give up the guard without releasing the grant.
    ///
    /// Returns the held mode, which now has to be released manually.
    pub fn leak(self) -> usize {
        ManuallyDrop::new(self).mode
    }
}

impl Drop for GLockGuard<'_, '_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release(self.mode) {
            error!(target: LOG_CAT, "failed to release glock mode {}: {err}", self.mode);
        }
    }
}

impl fmt::Debug for GLockGuard<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GLockGuard").field("mode", &self.mode).finish()
    }
}

/// Scoped shared access to a [`RwLock`].
///
/// Returned by [`RwLock::read`].
#[must_use = "if unused the read lock is released immediately"]
pub struct RwLockReadGuard<'l, 'a> {
    lock : &'l RwLock<'a>,
}

impl<'l, 'a> RwLockReadGuard<'l, 'a> {
    /// A reader must be held on behalf of the new guard.
    pub(crate) fn new(lock: &'l RwLock<'a>) -> Self {
        Self { lock }
    }

    /// The lock this guard holds.
    #[inline]
    pub fn lock(&self) -> &'l RwLock<'a> {
        self.lock
    }

    /// Upgrade to exclusive access, see [`RwLock::upgrade`].
    ///
    /// On failure the read guard is handed back together with the reason.
    pub fn upgrade(self, timeout: Timeout) -> Result<RwLockWriteGuard<'l, 'a>, (Self, LockError)> {
        match self.lock.upgrade(timeout) {
            Ok(()) => {
                let lock = ManuallyDrop::new(self).lock;
                Ok(RwLockWriteGuard::new(lock))
            },
            Err(err) => Err((self, err)),
        }
    }
}

impl Drop for RwLockReadGuard<'_, '_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.read_release() {
            error!(target: LOG_CAT, "failed to release read lock: {err}");
        }
    }
}

impl fmt::Debug for RwLockReadGuard<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("RwLockReadGuard { .. }")
    }
}

/// Scoped exclusive access to a [`RwLock`].
///
/// Returned by [`RwLock::write`] and [`RwLockReadGuard::upgrade`].
#[must_use = "if unused the write lock is released immediately"]
pub struct RwLockWriteGuard<'l, 'a> {
    lock : &'l RwLock<'a>,
}

impl<'l, 'a> RwLockWriteGuard<'l, 'a> {
    /// The writer must be held on behalf of the new guard.
    pub(crate) fn new(lock: &'l RwLock<'a>) -> Self {
        Self { lock }
    }

    /// The lock this guard holds.
    #[inline]
    pub fn lock(&self) -> &'l RwLock<'a> {
        self.lock
    }

    /// Atomically turn the exclusive access into shared access, see [`RwLock::downgrade`].
    ///
    /// Fails with [`LockError::NotHeld`] if the writer was released behind the guard's back, the guard is handed back in that case.
    pub fn downgrade(self) -> Result<RwLockReadGuard<'l, 'a>, (Self, LockError)> {
        match self.lock.downgrade() {
            Ok(()) => {
                let lock = ManuallyDrop::new(self).lock;
                Ok(RwLockReadGuard::new(lock))
            },
            Err(err) => Err((self, err)),
        }
    }
}

impl Drop for RwLockWriteGuard<'_, '_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.write_release() {
            error!(target: LOG_CAT, "failed to release write lock: {err}");
        }
    }
}

impl fmt::Debug for RwLockWriteGuard<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("RwLockWriteGuard { .. }")
    }
}
