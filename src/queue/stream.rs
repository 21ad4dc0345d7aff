//! Bounded per-sensor ring buffer with arrival statistics.

use std::collections::VecDeque;
use std::fmt;

use crate::numerics::RunningStats;
use crate::sensor::{SensorSample, Timestamp};

/// Smoothing factor for the exponential moving average of the arrival period.
const PERIOD_ALPHA: f64 = 0.1;

/// Arrival and drop counters for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamStats {
    /// Smoothed inter-arrival period in microseconds.
    pub period_us: f64,
    pub last_in: Timestamp,
    pub last_out: Timestamp,
    pub drop_full: u64,
    pub drop_late: u64,
    pub total_in: u64,
    pub total_out: u64,
    /// Raw inter-arrival intervals in microseconds.
    pub interval: RunningStats,
}

impl fmt::Display for StreamStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "period {:.1}us (mean {:.1}, stdev {:.1}), total in {}, total out {}, drop full {}, drop late {}",
            self.period_us,
            self.interval.mean,
            self.interval.stdev(),
            self.total_in,
            self.total_out,
            self.drop_full,
            self.drop_late
        )
    }
}

pub(crate) struct SensorStream<T> {
    storage: VecDeque<T>,
    capacity: usize,
    pub(crate) stats: StreamStats,
}

impl<T: SensorSample> SensorStream<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            storage: VecDeque::with_capacity(capacity),
            capacity,
            stats: StreamStats::default(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.storage.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.storage.len() == self.capacity
    }

    /// Appends a sample, evicting the oldest one when full.
    pub(crate) fn push(&mut self, sample: T) {
        let time = sample.timestamp();
        if !self.stats.last_in.is_zero() {
            let delta = time.micros_since(self.stats.last_in) as f64;
            self.stats.interval.data(delta);
            self.stats.period_us = if self.stats.period_us == 0.0 {
                delta
            } else {
                PERIOD_ALPHA * delta + (1.0 - PERIOD_ALPHA) * self.stats.period_us
            };
        }
        self.stats.last_in = time;
        self.stats.total_in += 1;

        if self.is_full() {
            self.storage.pop_front();
            self.stats.drop_full += 1;
        }
        self.storage.push_back(sample);
    }

    /// Timestamp of the next deliverable sample.
    ///
    /// Samples that could no longer be delivered in order are discarded here
    /// and counted as late.
    pub(crate) fn next_time(&mut self, last_dispatched: Timestamp) -> Option<Timestamp> {
        while let Some(front) = self.storage.front() {
            let t = front.timestamp();
            if t < last_dispatched || (!self.stats.last_out.is_zero() && t <= self.stats.last_out) {
                self.storage.pop_front();
                self.stats.drop_late += 1;
            } else {
                return Some(t);
            }
        }
        None
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        let sample = self.storage.pop_front()?;
        self.stats.last_out = sample.timestamp();
        self.stats.total_out += 1;
        Some(sample)
    }

    /// True when a sample is due at `time` given the stream's period.
    pub(crate) fn expected(&self, time: Timestamp) -> bool {
        self.stats.last_out.is_zero()
            || time.0 as f64 > self.stats.last_out.0 as f64 + self.stats.period_us - 1000.0
    }

    /// True when other streams have advanced far enough past this stream's
    /// next due time that waiting any longer is pointless.
    pub(crate) fn late(&self, latest_received: Timestamp, jitter_us: u64) -> bool {
        !self.stats.last_out.is_zero()
            && latest_received.0 as f64
                >= self.stats.last_out.0 as f64 + self.stats.period_us + jitter_us as f64
    }

    pub(crate) fn reset(&mut self) {
        self.storage.clear();
        self.stats = StreamStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::GyroSample;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn gyro(t: u64) -> GyroSample {
        GyroSample::new(Timestamp(t), Vector3::zeros())
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut stream = SensorStream::new(4);
        for i in 1..=10 {
            stream.push(gyro(i * 1000));
        }
        assert_eq!(stream.len(), 4);
        assert_eq!(stream.stats.drop_full, 6);
        assert_eq!(stream.stats.total_in, 10);
        assert_eq!(stream.next_time(Timestamp::ZERO), Some(Timestamp(7000)));
    }

    #[test]
    fn test_period_tracks_arrivals() {
        let mut stream = SensorStream::new(8);
        for i in 1..=5 {
            stream.push(gyro(i * 5000));
        }
        assert_relative_eq!(stream.stats.period_us, 5000.0, epsilon = 1e-9);
        assert_relative_eq!(stream.stats.interval.mean, 5000.0, epsilon = 1e-9);
    }

    #[test]
    fn test_late_samples_discarded_lazily() {
        let mut stream = SensorStream::new(8);
        stream.push(gyro(1000));
        stream.push(gyro(2000));
        stream.push(gyro(3000));
        assert_eq!(stream.next_time(Timestamp(2500)), Some(Timestamp(3000)));
        assert_eq!(stream.stats.drop_late, 2);
    }

    #[test]
    fn test_pop_records_last_out() {
        let mut stream = SensorStream::new(8);
        stream.push(gyro(1000));
        stream.push(gyro(1000));
        assert!(stream.pop().is_some());
        assert_eq!(stream.stats.last_out, Timestamp(1000));
        // duplicate timestamp cannot be delivered twice
        assert_eq!(stream.next_time(Timestamp(1000)), None);
        assert_eq!(stream.stats.drop_late, 1);
    }

    #[test]
    fn test_expected_and_late() {
        let mut stream = SensorStream::new(8);
        assert!(stream.expected(Timestamp(1)));
        assert!(!stream.late(Timestamp(1_000_000), 10_000));

        stream.push(gyro(10_000));
        stream.push(gyro(20_000));
        stream.pop();
        // period 10ms, last out at 10ms
        assert!(!stream.expected(Timestamp(15_000)));
        assert!(stream.expected(Timestamp(19_500)));
        assert!(!stream.late(Timestamp(25_000), 10_000));
        assert!(stream.late(Timestamp(30_000), 10_000));
    }
}
