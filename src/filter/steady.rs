//! Detection of spans during which the device is held still.

use nalgebra::Vector3;

use crate::numerics::StdevVector;
use crate::sensor::Timestamp;

/// Fraction of the allowed deviation used until a span reaches the minimum
/// steady time. Entering a steady span is harder than staying in one.
const ENTRY_TOLERANCE: f64 = 0.5;

/// Cosine of the largest tilt from the requested orientation that may start
/// a span.
const MIN_ORIENTATION_COSINE: f64 = 0.71;

/// Per-axis deviation allowed from the running mean: `variance · sigma²`.
#[derive(Debug, Clone, Copy)]
pub struct Tolerance {
    pub variance: f64,
    pub sigma: f64,
}

/// Which body axis must point up for a span to begin.
#[derive(Debug, Clone, Copy)]
pub struct Facing {
    pub axis: Vector3<f64>,
    /// World up in the body frame, or `None` before the filter is leveled.
    pub local_up: Option<Vector3<f64>>,
}

#[derive(Debug, Clone, Default)]
pub struct SteadyDetector {
    pub accel: StdevVector,
    pub gyro: StdevVector,
    /// Start of the current steady span, zero when none.
    pub stable_start: Timestamp,
}

impl SteadyDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feeds one accelerometer reading and returns how long, in
    /// microseconds, the device has been steady.
    ///
    /// A reading outside the tolerance restarts the span at `time`. A new
    /// span only begins while the device faces the requested way.
    pub fn steady_time(
        &mut self,
        meas: &Vector3<f64>,
        tolerance: Tolerance,
        time: Timestamp,
        min_steady_us: u64,
        facing: Option<Facing>,
    ) -> i64 {
        let mut steady = false;
        if self.accel.count > 0 {
            let mut sigma2 = tolerance.sigma * tolerance.sigma;
            if time.micros_since(self.stable_start) < min_steady_us as i64 {
                sigma2 *= ENTRY_TOLERANCE * ENTRY_TOLERANCE;
            }
            let bound = tolerance.variance * sigma2;
            steady = (meas - self.accel.mean).iter().all(|delta| delta * delta <= bound);
        }
        if !steady {
            self.reset();
            self.stable_start = time;
        }

        if self.accel.count == 0 {
            if let Some(facing) = facing {
                let Some(up) = facing.local_up else {
                    return 0;
                };
                if facing.axis.dot(&up).abs() < MIN_ORIENTATION_COSINE {
                    return 0;
                }
            }
        }

        self.accel.data(meas);
        time.micros_since(self.stable_start)
    }

    /// Microseconds since the span started, zero when there is none.
    pub fn elapsed(&self, now: Timestamp) -> i64 {
        if self.stable_start.is_zero() {
            0
        } else {
            now.micros_since(self.stable_start)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const TOLERANCE: Tolerance = Tolerance {
        variance: 1e-3,
        sigma: 6.0,
    };

    fn gravity(rng: &mut StdRng) -> Vector3<f64> {
        Vector3::new(0.0, 0.0, 9.81) + Vector3::from_fn(|_, _| rng.gen_range(-0.01..0.01))
    }

    #[test]
    fn test_span_grows_while_still() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut detector = SteadyDetector::new();
        let mut last = 0;
        for k in 0..50u64 {
            let time = Timestamp(1_000_000 + k * 10_000);
            last = detector.steady_time(&gravity(&mut rng), TOLERANCE, time, 100_000, None);
        }
        assert_eq!(last, 490_000);
        assert_eq!(detector.accel.count, 50);
        assert_eq!(detector.stable_start, Timestamp(1_000_000));
    }

    #[test]
    fn test_bump_restarts_span() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut detector = SteadyDetector::new();
        for k in 0..20u64 {
            detector.steady_time(&gravity(&mut rng), TOLERANCE, Timestamp(1_000_000 + k * 10_000), 100_000, None);
        }
        let bump = Vector3::new(1.0, 0.0, 9.81);
        let elapsed = detector.steady_time(&bump, TOLERANCE, Timestamp(1_200_000), 100_000, None);
        assert_eq!(elapsed, 0);
        assert_eq!(detector.stable_start, Timestamp(1_200_000));
        assert_eq!(detector.accel.count, 1);
        assert_eq!(detector.elapsed(Timestamp(1_300_000)), 100_000);
    }

    #[test]
    fn test_wrong_orientation_never_starts() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut detector = SteadyDetector::new();
        let facing = Facing {
            axis: Vector3::x(),
            local_up: Some(Vector3::z()),
        };
        for k in 0..20u64 {
            let elapsed = detector.steady_time(
                &gravity(&mut rng),
                TOLERANCE,
                Timestamp(1_000_000 + k * 10_000),
                100_000,
                Some(facing),
            );
            assert_eq!(elapsed, 0);
        }
        assert_eq!(detector.accel.count, 0);

        let unleveled = Facing {
            axis: Vector3::z(),
            local_up: None,
        };
        assert_eq!(
            detector.steady_time(&gravity(&mut rng), TOLERANCE, Timestamp(2_000_000), 100_000, Some(unleveled)),
            0
        );
        assert_eq!(detector.accel.count, 0);
    }
}
