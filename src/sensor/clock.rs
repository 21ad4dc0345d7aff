//! Microsecond timestamps on the device's monotonic sensor clock.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// A point on the sensor clock, in microseconds.
///
/// Zero is reserved as "never" for bookkeeping that has not seen a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_micros(us: u64) -> Self {
        Self(us)
    }

    pub fn from_secs_f64(seconds: f64) -> Self {
        Self((seconds * 1e6).round().max(0.0) as u64)
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Signed difference `self - earlier` in seconds.
    pub fn seconds_since(&self, earlier: Timestamp) -> f64 {
        (self.0 as i64 - earlier.0 as i64) as f64 * 1e-6
    }

    /// Signed difference `self - earlier` in microseconds.
    pub fn micros_since(&self, earlier: Timestamp) -> i64 {
        self.0 as i64 - earlier.0 as i64
    }

    pub fn saturating_add_micros(&self, us: i64) -> Timestamp {
        Timestamp((self.0 as i64).saturating_add(us).max(0) as u64)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Maps wall-clock instants onto the sensor clock.
///
/// Owned by the fusion facade; used to measure how late a sample is when it
/// reaches the filter.
#[derive(Debug, Clone, Copy)]
pub struct SensorClock {
    epoch: Instant,
    offset: Timestamp,
}

impl SensorClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset: Timestamp::ZERO,
        }
    }

    /// A clock that reads `now` at the moment of construction.
    pub fn starting_at(now: Timestamp) -> Self {
        Self {
            epoch: Instant::now(),
            offset: now,
        }
    }

    pub fn now(&self) -> Timestamp {
        let elapsed: Duration = self.epoch.elapsed();
        Timestamp(self.offset.0 + elapsed.as_micros() as u64)
    }
}

impl Default for SensorClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_timestamp_ordering_and_difference() {
        let a = Timestamp::from_micros(1_000_000);
        let b = Timestamp::from_micros(1_250_000);
        assert!(a < b);
        assert_relative_eq!(b.seconds_since(a), 0.25);
        assert_relative_eq!(a.seconds_since(b), -0.25);
    }

    #[test]
    fn test_timestamp_display() {
        assert_eq!(format!("{}", Timestamp(42)), "42us");
    }

    #[test]
    fn test_clock_is_monotonic() {
        let clock = SensorClock::starting_at(Timestamp(500));
        let first = clock.now();
        let second = clock.now();
        assert!(first >= Timestamp(500));
        assert!(second >= first);
    }
}
