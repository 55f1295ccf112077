//! Source of "current time" for age-based maintenance.

use crate::types::Time;
use parking_lot::Mutex;
use std::fmt::Debug;

/// Provides the current time to the maintenance engine.
pub trait Clock: Send + Sync + Debug {
    /// Returns the current UTC time at second precision.
    fn now(&self) -> Time;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Time {
        use chrono::Timelike;
        let now = chrono::Utc::now().naive_utc();
        now.with_nanosecond(0).unwrap_or(now)
    }
}

/// A clock frozen at a settable instant.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<Time>,
}

impl FixedClock {
    /// Creates a clock that always reports `now`.
    #[must_use]
    pub fn new(now: Time) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Moves the clock to `now`.
    pub fn set(&self, now: Time) {
        *self.now.lock() = now;
    }

    /// Advances the clock by whole days.
    pub fn advance_days(&self, days: i64) {
        let mut now = self.now.lock();
        *now += chrono::Duration::days(days);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Time {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_time;

    #[test]
    fn fixed_clock_can_be_moved() {
        let clock = FixedClock::new(parse_time("2008-01-01 00:00:00").unwrap());
        clock.advance_days(31);
        assert_eq!(clock.now(), parse_time("2008-02-01 00:00:00").unwrap());
    }

    #[test]
    fn system_clock_has_second_precision() {
        use chrono::Timelike;
        assert_eq!(SystemClock.now().nanosecond(), 0);
    }
}
