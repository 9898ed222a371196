use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// A point in time, with millisecond resolution.
///
/// Stored as milliseconds since the POSIX epoch, which is also its wire
/// representation (a big-endian `i64`).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TimePoint(i64);

/// Difference between two [`TimePoint`]s, in milliseconds.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TimePointDelta(i64);

impl TimePoint {
    pub const fn from_millis(millis: i64) -> Self {
        TimePoint(millis)
    }

    pub const fn millis_since_epoch(self) -> i64 {
        self.0
    }
}

impl TimePointDelta {
    pub const fn from_millis(millis: i64) -> Self {
        TimePointDelta(millis)
    }

    pub const fn millis(self) -> i64 {
        self.0
    }
}

impl Add<TimePointDelta> for TimePoint {
    type Output = TimePoint;

    fn add(self, rhs: TimePointDelta) -> TimePoint {
        TimePoint(self.0 + rhs.0)
    }
}

impl AddAssign<TimePointDelta> for TimePoint {
    fn add_assign(&mut self, rhs: TimePointDelta) {
        self.0 += rhs.0;
    }
}

impl Sub for TimePoint {
    type Output = TimePointDelta;

    fn sub(self, rhs: TimePoint) -> TimePointDelta {
        TimePointDelta(self.0 - rhs.0)
    }
}

impl fmt::Display for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}ms", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_arithmetic() {
        let a = TimePoint::from_millis(1000);
        let b = TimePoint::from_millis(1750);
        assert_eq!(b - a, TimePointDelta::from_millis(750));
        assert_eq!(a + (b - a), b);
    }

    #[test]
    fn ordering_is_chronological() {
        assert!(TimePoint::from_millis(-5) < TimePoint::from_millis(0));
        assert!(TimePoint::from_millis(0) < TimePoint::from_millis(17));
    }
}
