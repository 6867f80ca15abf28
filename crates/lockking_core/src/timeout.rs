use std::time::{Duration, Instant};

use crate::error::LockError;

/// How long a lock request is allowed to block.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Timeout {
    /// Try once and fail with [`LockError::WouldBlock`] if the request can't be granted right away.
    Immediate,
    /// Block until the request can be granted.
    #[default]
    Infinite,
    /// Block until the request can be granted, or fail with [`LockError::TimedOut`] once the duration has elapsed.
    ///
    /// A zero duration is still a bounded wait that has already expired, so it fails with [`LockError::TimedOut`] rather than [`LockError::WouldBlock`].
    /// Use [`Timeout::Immediate`], or `Timeout::from(Duration::ZERO)`, for a non-blocking request.
    Bounded(Duration),
}

impl Timeout {
    /// Microsecond value requesting a non-blocking call.
    pub const NON_BLOCKING_MICROS : u64 = 0;
    /// Microsecond value requesting a call that blocks without a deadline.
    pub const BLOCKING_MICROS : u64 = u64::MAX;

    /// Interpret a raw microsecond timeout, with `0` and `u64::MAX` as the non-blocking and blocking sentinels.
    pub const fn from_micros(micros: u64) -> Self {
        match micros {
            Self::NON_BLOCKING_MICROS => Self::Immediate,
            Self::BLOCKING_MICROS => Self::Infinite,
            _ => Self::Bounded(Duration::from_micros(micros)),
        }
    }

    /// Convert back to the raw microsecond representation.
    ///
    /// Bounded durations that don't fit are saturated to the largest bounded value.
    pub fn as_micros(self) -> u64 {
        match self {
            Self::Immediate => Self::NON_BLOCKING_MICROS,
            Self::Infinite => Self::BLOCKING_MICROS,
            Self::Bounded(dur) => u64::try_from(dur.as_micros())
                .unwrap_or(u64::MAX)
                .clamp(1, Self::BLOCKING_MICROS - 1),
        }
    }

    /// Whether a request with this timeout may suspend the calling thread.
    #[inline]
    pub const fn may_block(self) -> bool {
        !matches!(self, Self::Immediate)
    }

    /// Deadline for the blocking loop, computed once per call.
    ///
    /// Returns `None` for non-blocking requests.
    pub(crate) fn deadline(self) -> Option<Deadline> {
        match self {
            Self::Immediate => None,
            Self::Infinite => Some(Deadline::Never),
            // A deadline that can't be represented is as good as no deadline
            Self::Bounded(dur) => Some(Instant::now().checked_add(dur).map_or(Deadline::Never, Deadline::At)),
        }
    }

    /// Error reported when a request with this timeout could not be granted.
    #[inline]
    pub(crate) const fn failure(self) -> LockError {
        match self {
            Self::Immediate => LockError::WouldBlock,
            _ => LockError::TimedOut,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(dur: Duration) -> Self {
        if dur.is_zero() {
            Self::Immediate
        } else {
            Self::Bounded(dur)
        }
    }
}

impl From<Option<Duration>> for Timeout {
    /// `None` blocks forever.
    fn from(dur: Option<Duration>) -> Self {
        dur.map_or(Self::Infinite, Self::from)
    }
}

/// Absolute end of a blocking wait.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Deadline {
    Never,
    At(Instant),
}
