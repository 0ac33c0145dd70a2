//! Injectable time source.
//!
//! Components that measure or compare wall-clock time (token buckets, fail
//! rate meters, the weight-adjustment state machine, TTL maps) never call
//! `Utc::now()` directly; they hold a [`SharedClock`] so that tests can move
//! time by hand.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

/// Source of the current UTC time.
pub trait TimeProvider: Send + Sync + fmt::Debug {
    fn utc_now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn TimeProvider>;

/// System clock.
#[derive(Debug, Default)]
pub struct RealTime;

impl TimeProvider for RealTime {
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Returns the default system clock.
pub fn real_clock() -> SharedClock {
    Arc::new(RealTime)
}

/// A clock that only moves when told to. Used by tests that exercise
/// refill, bucket rotation and probing timers deterministically.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap();
        *now = to;
    }
}

impl TimeProvider for ManualClock {
    fn utc_now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.utc_now(), start);

        clock.advance(Duration::seconds(5));
        assert_eq!(clock.utc_now(), start + Duration::seconds(5));
    }
}
