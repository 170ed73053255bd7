/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Monotonic time.

use core::{ops::Add, time::Duration};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// A point on the monotonic clock, in nanoseconds since boot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant(u64);

/// Time seam interfaces.
pub mod interface {
    use super::Instant;

    /// The boot-calibrated monotonic counter.
    pub trait MonotonicClock: Send + Sync {
        /// Current instant. Never decreases.
        fn now(&self) -> Instant;
    }
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl Instant {
    /// Construct from raw nanoseconds since boot.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Nanoseconds since boot.
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_add(rhs.as_nanos() as u64))
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_arithmetic() {
        let t0 = Instant::from_nanos(100);
        let t1 = t0 + Duration::from_nanos(50);
        assert_eq!(t1.as_nanos(), 150);
        assert_eq!(t1.saturating_duration_since(t0), Duration::from_nanos(50));
        assert_eq!(t0.saturating_duration_since(t1), Duration::ZERO);
    }
}
