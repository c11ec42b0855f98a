//! Wall-clock abstraction and timeslot alignment.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::sync::lock;

/// Source of the current instant.
///
/// Nodes never call `Utc::now()` directly so that the whole tree can run on
/// simulated time.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Real time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// # Examples
///
/// ```
/// use chrono::{Duration, TimeZone, Utc};
/// use dr_tree::clock::{Clock, ManualClock};
///
/// let start = Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap();
/// let clock = ManualClock::new(start);
/// clock.advance(Duration::minutes(5));
/// assert_eq!(clock.now(), start + Duration::minutes(5));
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock stopped at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Jumps to `t`. Moving backwards is allowed.
    pub fn set(&self, t: DateTime<Utc>) {
        *lock(&self.now) = t;
    }

    /// Moves forward by `by` and returns the new instant.
    pub fn advance(&self, by: Duration) -> DateTime<Utc> {
        let mut now = lock(&self.now);
        *now += by;
        *now
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

/// First slot boundary strictly after `now`.
///
/// Boundaries are multiples of `slot` since the Unix epoch, so 15-minute
/// slots fall on :00, :15, :30 and :45. The window `[boundary - slot,
/// boundary)` always contains `now`.
pub fn next_slot_boundary(now: DateTime<Utc>, slot: Duration) -> DateTime<Utc> {
    let len = slot.num_milliseconds();
    if len <= 0 {
        return now;
    }
    let ms = now.timestamp_millis();
    let boundary = ms.div_euclid(len) * len + len;
    now + Duration::milliseconds(boundary - ms)
}
