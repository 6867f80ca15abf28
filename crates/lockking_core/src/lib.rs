//! Blocking locks with caller-defined compatibility.
//!
//! - [`GLock`] grants any number of modes at once, as long as every pair of granted modes is compatible according to a [`CompatibilityMatrix`].
//! - [`RwLock`] is a reader-writer lock with selectable reader preference, in-place upgrade and downgrade.
//!
//! Both keep their state behind a protecting mutex, which can be shared between several locks by constructing them with an external [`SharedMutex`].
//! The `*_in` variants of every operation then run under a guard of that mutex held by the caller.

mod error;
mod guard;
mod wait;

pub mod matrix;
pub mod timeout;
pub mod glock;
pub mod rwlock;

pub use error::*;
pub use guard::{GLockGuard, RwLockReadGuard, RwLockWriteGuard};
pub use matrix::{CompatibilityMatrix, EXCLUSIVE_MATRIX, READER_WRITER_MATRIX, HIERARCHICAL_MATRIX};
pub use timeout::Timeout;
pub use glock::{GLock, GLockState};
pub use rwlock::{RwLock, RwLockState, Preference};
pub use wait::{SharedMutex, SharedMutexGuard};

pub mod prelude;
