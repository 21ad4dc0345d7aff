//! Observation pipeline: predict, measure, and one batched Kalman update per
//! dispatch tick.
//!
//! Observations are built by the filter for one sample, processed, and
//! discarded. The queue and its scratch buffers are reused across ticks.

pub mod feature;
pub mod inertial;

use nalgebra::SMatrix;
use tracing::debug;

use crate::config::FeatureConfig;
use crate::error::Result;
use crate::numerics::{KalmanScratch, MAX_OBSERVATION_SIZE};
use crate::sensor::{ImageView, Timestamp};
use crate::state::{FilterState, LeafMeta};
use crate::tracking::FeatureTracker;

pub use feature::FeatureObservation;
pub use inertial::{AccelerometerObservation, GyroscopeObservation};

/// Most features measured in one camera tick; their rows fill the update.
pub const MAX_FEATURE_OBSERVATIONS: usize = MAX_OBSERVATION_SIZE / FeatureObservation::SIZE;

/// Tracker and image for the tick being processed.
pub struct TrackingContext<'a> {
    pub tracker: &'a mut dyn FeatureTracker,
    pub image: ImageView<'a>,
}

#[derive(Debug, Clone)]
pub enum Observation {
    Accelerometer(AccelerometerObservation),
    Gyroscope(GyroscopeObservation),
    Feature(FeatureObservation),
}

impl Observation {
    /// Number of scalar measurements.
    pub fn size(&self) -> usize {
        match self {
            Observation::Accelerometer(_) => AccelerometerObservation::SIZE,
            Observation::Gyroscope(_) => GyroscopeObservation::SIZE,
            Observation::Feature(_) => FeatureObservation::SIZE,
        }
    }

    pub fn time(&self) -> Timestamp {
        match self {
            Observation::Accelerometer(o) => o.time,
            Observation::Gyroscope(o) => o.time,
            Observation::Feature(o) => o.time,
        }
    }

    pub fn predict(&mut self, state: &mut FilterState) {
        match self {
            Observation::Accelerometer(o) => o.predict(state),
            Observation::Gyroscope(o) => o.predict(state),
            Observation::Feature(o) => o.predict(state),
        }
    }

    /// Returns false if the observation produced no usable measurement.
    pub fn measure(&mut self, state: &mut FilterState, tracking: Option<&mut TrackingContext<'_>>, config: &FeatureConfig) -> bool {
        match self {
            Observation::Accelerometer(o) => o.measure(state),
            Observation::Gyroscope(_) => true,
            Observation::Feature(o) => o.measure(state, tracking, config),
        }
    }

    pub fn innovation(&self, i: usize) -> f64 {
        match self {
            Observation::Accelerometer(o) => o.innovation(i),
            Observation::Gyroscope(o) => o.innovation(i),
            Observation::Feature(o) => o.innovation(i),
        }
    }

    /// Variance shared by every row of this observation.
    pub fn measurement_variance(&mut self, state: &mut FilterState, config: &FeatureConfig) -> f64 {
        match self {
            Observation::Accelerometer(o) => o.measurement_variance(state),
            Observation::Gyroscope(o) => o.measurement_variance(state),
            Observation::Feature(o) => o.measurement_variance(state, config),
        }
    }

    pub fn fill_jacobian(&self, state: &FilterState, scratch: &mut KalmanScratch, row: usize) {
        match self {
            Observation::Accelerometer(o) => o.fill_jacobian(state, scratch, row),
            Observation::Gyroscope(o) => o.fill_jacobian(state, scratch, row),
            Observation::Feature(o) => o.fill_jacobian(state, scratch, row),
        }
    }
}

/// Adds `block` to the Jacobian rows starting at `row`, in the columns of
/// `meta`. Unindexed leaves contribute nothing.
pub(crate) fn add_block<const R: usize, const C: usize>(scratch: &mut KalmanScratch, row: usize, meta: &LeafMeta, block: &SMatrix<f64, R, C>) {
    let Some(col) = meta.index else {
        return;
    };
    for i in 0..R {
        for k in 0..C {
            scratch.add_jacobian(row + i, Some(col + k), block[(i, k)]);
        }
    }
}

pub struct ObservationQueue {
    observations: Vec<Observation>,
    scratch: KalmanScratch,
}

impl ObservationQueue {
    pub fn new() -> Self {
        let scratch = KalmanScratch::new();
        Self {
            observations: Vec::with_capacity(scratch.max_rows() / FeatureObservation::SIZE),
            scratch,
        }
    }

    pub fn push(&mut self, observation: Observation) {
        self.observations.push(observation);
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn clear(&mut self) {
        self.observations.clear();
    }

    /// Runs one tick: time update to `time`, prediction, measurement with
    /// pruning, robust measurement variances, and the Kalman update.
    ///
    /// A numeric failure leaves the covariance untouched and is returned to
    /// the caller, which must treat the state as invalid.
    pub fn process(
        &mut self,
        state: &mut FilterState,
        time: Timestamp,
        mut tracking: Option<TrackingContext<'_>>,
        config: &FeatureConfig,
    ) -> Result<()> {
        state.time_update(time);
        self.observations.sort_unstable_by_key(Observation::time);

        for observation in self.observations.iter_mut() {
            observation.predict(state);
        }
        let predicted_rows: usize = self.observations.iter().map(Observation::size).sum();

        self.observations
            .retain_mut(|observation| observation.measure(state, tracking.as_mut(), config));
        let rows: usize = self.observations.iter().map(Observation::size).sum();

        let result = if rows > 0 {
            self.update(state, rows, config)
        } else {
            // a lone accelerometer sample leveling the filter is expected
            if predicted_rows != AccelerometerObservation::SIZE {
                debug!("{} measurement rows predicted, none survived measurement", predicted_rows);
            }
            Ok(())
        };

        self.observations.clear();
        state.update_total_distance();
        result
    }

    fn update(&mut self, state: &mut FilterState, rows: usize, config: &FeatureConfig) -> Result<()> {
        self.scratch.begin(rows, state.size())?;

        let mut row = 0;
        for observation in self.observations.iter_mut() {
            let size = observation.size();
            let variance = observation.measurement_variance(state, config);
            for i in 0..size {
                self.scratch.set_innovation(row + i, observation.innovation(i));
                self.scratch.set_measurement_variance(row + i, variance);
            }
            observation.fill_jacobian(state, &mut self.scratch, row);
            row += size;
        }

        self.scratch.update(state.cov.matrix_mut())?;
        state.apply_correction(self.scratch.correction());
        Ok(())
    }
}

impl Default for ObservationQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CameraState, DistortionModel, FeatureStatus};
    use approx::assert_relative_eq;
    use nalgebra::{Vector2, Vector3};

    fn state() -> FilterState {
        let mut state = FilterState::new(CameraState::new(640, 480, DistortionModel::Undistorted, false));
        state.reset().unwrap();
        state.imu.accel_measurement_variance = 1e-3;
        state.imu.gyro_measurement_variance = 1e-4;
        state
    }

    fn assert_symmetric(state: &FilterState) {
        let cov = &state.cov;
        for i in 0..cov.size() {
            assert!(cov.get(i, i) >= 0.0);
            for j in 0..i {
                assert_relative_eq!(cov.get(i, j), cov.get(j, i), epsilon = 1e-12);
            }
        }
    }

    /// Reports a fixed position for every feature.
    struct FixedTracker(Option<Vector2<f64>>);

    impl FeatureTracker for FixedTracker {
        fn detect(&mut self, _: &ImageView<'_>, _: &[Vector2<f64>], _: usize) -> Vec<Vector2<f64>> {
            Vec::new()
        }
        fn add_track(&mut self, _: &ImageView<'_>, _: u64, _: &Vector2<f64>) -> bool {
            true
        }
        fn track(&mut self, _: &ImageView<'_>, _: &crate::tracking::TrackRequest) -> Option<Vector2<f64>> {
            self.0
        }
        fn drop_track(&mut self, _: u64) {}
        fn reset(&mut self) {}
    }

    fn image(data: &[u8]) -> ImageView<'_> {
        ImageView {
            width: 4,
            height: 4,
            stride: 4,
            data,
        }
    }

    #[test]
    fn test_gyro_update_pulls_rate_towards_measurement() {
        let mut state = state();
        let mut queue = ObservationQueue::new();
        let meas = Vector3::new(0.1, -0.2, 0.05);
        for k in 0..5 {
            let time = Timestamp(1_000_000 + k * 1_000);
            queue.push(Observation::Gyroscope(GyroscopeObservation::new(time, meas)));
            queue.process(&mut state, time, None, &FeatureConfig::default()).unwrap();
        }
        assert_relative_eq!(state.motion.w.v + state.imu.w_bias.v, meas, epsilon = 1e-3);
        assert!(queue.is_empty());
        assert_symmetric(&state);
    }

    #[test]
    fn test_arrival_order_does_not_change_update() {
        let early = GyroscopeObservation::new(Timestamp(1_000), Vector3::new(0.1, 0.0, 0.0));
        let late = GyroscopeObservation::new(Timestamp(2_000), Vector3::new(0.0, -0.2, 0.05));

        let mut in_order = state();
        let mut queue = ObservationQueue::new();
        queue.push(Observation::Gyroscope(early.clone()));
        queue.push(Observation::Gyroscope(late.clone()));
        queue.process(&mut in_order, Timestamp(2_000), None, &FeatureConfig::default()).unwrap();

        let mut reversed = state();
        queue.push(Observation::Gyroscope(late));
        queue.push(Observation::Gyroscope(early));
        queue.process(&mut reversed, Timestamp(2_000), None, &FeatureConfig::default()).unwrap();

        assert_relative_eq!(in_order.motion.w.v, reversed.motion.w.v, epsilon = 1e-12);
        assert_relative_eq!(in_order.cov.matrix(), reversed.cov.matrix(), epsilon = 1e-12);
    }

    #[test]
    fn test_first_accelerometer_sample_levels_filter() {
        let mut state = state();
        let mut queue = ObservationQueue::new();
        let before = state.cov.matrix().clone();
        let reading = Vector3::new(0.0, 9.80665, 0.0);
        queue.push(Observation::Accelerometer(AccelerometerObservation::new(Timestamp(10), reading)));
        queue.process(&mut state, Timestamp(10), None, &FeatureConfig::default()).unwrap();

        assert!(state.motion.orientation_initialized);
        assert_relative_eq!(state.motion.q.v * reading.normalize(), Vector3::z(), epsilon = 1e-12);
        assert_eq!(state.cov.matrix(), &before);
    }

    #[test]
    fn test_accelerometer_update_is_consistent_when_level() {
        let mut state = state();
        state.motion.orientation_initialized = true;
        let mut queue = ObservationQueue::new();
        let reading = Vector3::new(0.0, 0.0, state.motion.gravity);
        queue.push(Observation::Accelerometer(AccelerometerObservation::new(Timestamp(10), reading)));
        queue.process(&mut state, Timestamp(10), None, &FeatureConfig::default()).unwrap();

        let q = state.motion.q.meta.index.unwrap();
        // tilt became observable, yaw did not
        assert!(state.cov.get(q, q) < 1.0);
        assert!(state.cov.get(q + 1, q + 1) < 1.0);
        assert_relative_eq!(state.cov.get(q + 2, q + 2), 1e-7, epsilon = 1e-12);
        assert_relative_eq!(state.motion.q.v.angle(), 0.0, epsilon = 1e-9);
        assert_symmetric(&state);
    }

    #[test]
    fn test_triangulation_recovers_depth() {
        let mut state = state();
        let config = FeatureConfig::default();
        let point = Vector3::new(0.2, 0.1, 2.0);
        let first = state.camera.project(&point).unwrap();

        state.current_time = Timestamp(1_000);
        let group = state.add_group().unwrap();
        let id = state.add_feature(group, first, &config).unwrap();

        state.motion.t.v = Vector3::new(0.5, 0.0, 0.0);
        let seen = state.camera.project(&(point - state.motion.t.v)).unwrap();

        let data = [0u8; 16];
        let mut tracker = FixedTracker(Some(seen));
        let mut queue = ObservationQueue::new();
        queue.push(Observation::Feature(FeatureObservation::new(id, Timestamp(2_000))));
        let tracking = TrackingContext {
            tracker: &mut tracker,
            image: image(&data),
        };
        queue.process(&mut state, Timestamp(2_000), Some(tracking), &config).unwrap();

        let feature = &state.vision.features[&id];
        assert_eq!(feature.status, FeatureStatus::Normal);
        assert_relative_eq!(feature.reference_depth(), 2.0, epsilon = 0.1);
        assert_relative_eq!(feature.current, seen);
        assert_symmetric(&state);
    }

    #[test]
    fn test_lost_feature_is_dropped_and_pruned() {
        let mut state = state();
        let config = FeatureConfig::default();
        state.current_time = Timestamp(1_000);
        let group = state.add_group().unwrap();
        let id = state.add_feature(group, Vector2::new(320.0, 240.0), &config).unwrap();

        let data = [0u8; 16];
        let mut tracker = FixedTracker(None);
        let mut queue = ObservationQueue::new();
        queue.push(Observation::Feature(FeatureObservation::new(id, Timestamp(2_000))));
        let tracking = TrackingContext {
            tracker: &mut tracker,
            image: image(&data),
        };
        queue.process(&mut state, Timestamp(2_000), Some(tracking), &config).unwrap();
        assert_eq!(state.vision.features[&id].status, FeatureStatus::Dropped);
    }

    #[test]
    fn test_large_residual_inflates_variance() {
        let mut state = state();
        let config = FeatureConfig::default();
        state.current_time = Timestamp(1_000);
        let group = state.add_group().unwrap();
        let pixel = Vector2::new(320.0, 240.0);
        let id = state.add_feature(group, pixel, &config).unwrap();
        state.vision.features.get_mut(&id).unwrap().promote();
        state.remap().unwrap();

        let mut observation = FeatureObservation::new(id, Timestamp(1_000));
        observation.predict(&mut state);
        assert_relative_eq!(*observation.prediction(), pixel, epsilon = 1e-9);

        let data = [0u8; 16];
        let mut tracker = FixedTracker(Some(pixel + Vector2::new(40.0, 0.0)));
        let mut tracking = TrackingContext {
            tracker: &mut tracker,
            image: image(&data),
        };
        assert!(observation.measure(&mut state, Some(&mut tracking), &config));
        let variance = observation.measurement_variance(&mut state, &config);

        // 40 px against a 4 px² variance and a 2 sigma threshold
        let ratio = 40.0 / (4.0f64 * 4.0).sqrt();
        assert_relative_eq!(variance, ratio * config.measurement_var, epsilon = 1e-9);
        assert_relative_eq!(state.vision.features[&id].outlier, ratio, epsilon = 1e-9);
    }
}
