//! The filter: one entry point per sensor, the run-state machine, and the
//! bookkeeping that turns filter state into pose and status.
//!
//! Every entry point runs on the queue's dispatch context, one sample at a
//! time. Nothing here locks.

pub mod admission;
pub mod run_state;
pub mod status;
pub mod steady;

use std::fmt;

use nalgebra::{Vector2, Vector3};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::calibration::{Calibration, Distortion};
use crate::config::FilterConfig;
use crate::error::Result;
use crate::geometry::{rotation_between, SE3};
use crate::observation::{
    AccelerometerObservation, FeatureObservation, GyroscopeObservation, Observation, ObservationQueue, TrackingContext,
    MAX_FEATURE_OBSERVATIONS,
};
use crate::sensor::{AccelerometerSample, GyroSample, ImageFrame, SensorClock, Timestamp};
use crate::state::{CameraState, FeatureId, FeatureStatus, FilterState};
use crate::tracking::FeatureTracker;

pub use admission::AdmissionControl;
pub use status::{Confidence, ErrorCode, FailureFlags, RunState, Status};
pub use steady::{Facing, SteadyDetector, Tolerance};

/// Velocity (m/s) and angular velocity (rad/s) below which the device
/// counts as steady.
const STEADY_VELOCITY: f64 = 0.1;
const STEADY_ANGULAR_VELOCITY: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Camera,
    Accelerometer,
    Gyroscope,
}

impl fmt::Display for SampleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleKind::Camera => "camera",
            SampleKind::Accelerometer => "accelerometer",
            SampleKind::Gyroscope => "gyroscope",
        };
        f.write_str(name)
    }
}

/// A tracked feature as reported to the host, in output coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeaturePoint {
    pub id: FeatureId,
    pub image: Vector2<f64>,
    pub world: Vector3<f64>,
    /// Depth uncertainty, meters.
    pub depth_stdev_m: f64,
    pub initialized: bool,
}

pub struct Filter {
    config: FilterConfig,
    calibration: Calibration,
    state: FilterState,
    observations: ObservationQueue,
    tracker: Box<dyn FeatureTracker>,
    clock: SensorClock,
    ignore_lateness: bool,

    run_state: RunState,
    flags: FailureFlags,
    steady: SteadyDetector,
    admission: AdmissionControl,
    /// Set when a calibration stage reached full progress; it finishes on
    /// the next steady sample.
    stage_complete: bool,

    last_time: Timestamp,
    last_packet_time: Timestamp,
    last_packet_kind: Option<SampleKind>,
    last_accel_meas: Vector3<f64>,
    last_gyro_meas: Vector3<f64>,
    got_accelerometer: bool,
    got_gyroscope: bool,
    got_image: bool,
    gravity_init: bool,
    want_start: Timestamp,
    active_time: Timestamp,

    a_variance: f64,
    w_variance: f64,
    a_bias_start: Vector3<f64>,
    w_bias_start: Vector3<f64>,

    origin: SE3,
    origin_gravity_aligned: bool,

    has_converged: bool,
    max_velocity: f64,
    median_depth_variance: f64,
}

impl Filter {
    pub fn new(config: FilterConfig, calibration: Calibration, tracker: Box<dyn FeatureTracker>) -> Result<Self> {
        let intrinsics = calibration.camera()?.intrinsics;
        calibration.imu()?;
        let camera = CameraState::new(
            intrinsics.width_px as usize,
            intrinsics.height_px as usize,
            intrinsics.distortion.model(),
            config.estimate_camera_intrinsics,
        );
        let admission = AdmissionControl::new(&config);
        let mut filter = Self {
            config,
            calibration,
            state: FilterState::new(camera),
            observations: ObservationQueue::new(),
            tracker,
            clock: SensorClock::new(),
            ignore_lateness: false,
            run_state: RunState::Inactive,
            flags: FailureFlags::default(),
            steady: SteadyDetector::new(),
            admission,
            stage_complete: false,
            last_time: Timestamp::ZERO,
            last_packet_time: Timestamp::ZERO,
            last_packet_kind: None,
            last_accel_meas: Vector3::zeros(),
            last_gyro_meas: Vector3::zeros(),
            got_accelerometer: false,
            got_gyroscope: false,
            got_image: false,
            gravity_init: false,
            want_start: Timestamp::ZERO,
            active_time: Timestamp::ZERO,
            a_variance: 0.0,
            w_variance: 0.0,
            a_bias_start: Vector3::zeros(),
            w_bias_start: Vector3::zeros(),
            origin: SE3::identity(),
            origin_gravity_aligned: true,
            has_converged: false,
            max_velocity: 0.0,
            median_depth_variance: 1.0,
        };
        filter.initialize()?;
        Ok(filter)
    }

    /// Returns the filter to `Inactive` with the state rebuilt from the
    /// calibration. Clears every failure flag.
    pub fn initialize(&mut self) -> Result<()> {
        let camera = *self.calibration.camera()?;
        let imu = *self.calibration.imu()?;

        self.run_state = RunState::Inactive;
        self.flags.clear();
        self.steady.reset();
        self.admission.reset();
        self.observations.clear();
        self.tracker.reset();
        self.stage_complete = false;

        self.last_time = Timestamp::ZERO;
        self.last_packet_time = Timestamp::ZERO;
        self.last_packet_kind = None;
        self.last_accel_meas = Vector3::zeros();
        self.last_gyro_meas = Vector3::zeros();
        self.got_accelerometer = false;
        self.got_gyroscope = false;
        self.got_image = false;
        self.gravity_init = false;
        self.want_start = Timestamp::ZERO;
        self.active_time = Timestamp::ZERO;

        self.a_variance = imu.accelerometer.measurement_variance;
        self.w_variance = imu.gyroscope.measurement_variance;
        self.origin = SE3::identity();
        self.origin_gravity_aligned = true;
        self.has_converged = false;
        self.max_velocity = 0.0;
        self.median_depth_variance = 1.0;

        let min_a = self.config.min_a_bias_var;
        let min_w = self.config.min_w_bias_var;
        let state = &mut self.state;
        let a_var = imu.accelerometer.bias_variance;
        let w_var = imu.gyroscope.bias_variance;
        state.imu.a_bias.v = imu.accelerometer.bias;
        state.imu.a_bias.set_initial_variance([a_var.x.max(min_a), a_var.y.max(min_a), a_var.z.max(min_a)]);
        state.imu.w_bias.v = imu.gyroscope.bias;
        state.imu.w_bias.set_initial_variance([w_var.x.max(min_w), w_var.y.max(min_w), w_var.z.max(min_w)]);
        state.imu.accel_scale = imu.accelerometer.alignment_or_identity();
        state.imu.gyro_scale = imu.gyroscope.alignment_or_identity();
        state.imu.extrinsic_rotation = imu.extrinsics.to_se3().rotation;

        let intrinsics = camera.intrinsics;
        let [k1, k2, k3] = intrinsics.distortion.coefficients();
        let cam = &mut state.camera;
        cam.focal_length.v = 0.5 * (intrinsics.f_x_px + intrinsics.f_y_px);
        cam.center_x.v = intrinsics.c_x_px;
        cam.center_y.v = intrinsics.c_y_px;
        cam.k1.v = k1;
        cam.k2.v = k2;
        cam.k3.v = k3;
        cam.model = intrinsics.distortion.model();
        cam.width = intrinsics.width_px as usize;
        cam.height = intrinsics.height_px as usize;
        cam.extrinsics = camera.extrinsics.to_se3();
        cam.reset_noise();

        state.reset()?;
        self.a_bias_start = state.imu.a_bias.variance(&state.cov);
        self.w_bias_start = state.imu.w_bias.variance(&state.cov);
        state.enable_orientation_only()
    }

    /// Reinitializes and places the output origin at `initial_pose`.
    ///
    /// With `origin_gravity_aligned` unset the pose describes the device
    /// itself, so the tilt found by leveling is taken out of the origin once
    /// the first accelerometer sample arrives.
    pub fn reset_to(&mut self, time: Timestamp, initial_pose: SE3, origin_gravity_aligned: bool) -> Result<()> {
        self.initialize()?;
        self.last_time = time;
        self.state.time_update(time);
        self.origin_gravity_aligned = origin_gravity_aligned;
        self.set_origin(initial_pose, false);
        Ok(())
    }

    pub fn set_clock(&mut self, clock: SensorClock) {
        self.clock = clock;
    }

    /// Disables the arrival-delay checks, for replaying recorded data.
    pub fn set_ignore_lateness(&mut self, ignore: bool) {
        self.ignore_lateness = ignore;
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn flags(&self) -> &FailureFlags {
        &self.flags
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    pub fn last_time(&self) -> Timestamp {
        self.last_time
    }

    pub fn got_image(&self) -> bool {
        self.got_image
    }

    pub fn gravity_initialized(&self) -> bool {
        self.gravity_init
    }

    /// When tracking started, zero before.
    pub fn active_time(&self) -> Timestamp {
        self.active_time
    }

    pub fn max_state_size(&self) -> usize {
        self.admission.max_state_size()
    }

    /// Meters travelled since the last position reset.
    pub fn path_length(&self) -> f64 {
        self.state.total_distance
    }

    fn set_run_state(&mut self, next: RunState) {
        if next != self.run_state {
            info!("run state {} -> {}", self.run_state, next);
            self.run_state = next;
        }
    }

    /// Records a failed state operation. The state is unusable until the
    /// host reinitializes.
    fn check(&mut self, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                error!("numeric failure in {}: {}", self.run_state, err);
                self.flags.numeric_failed = true;
                self.flags.calibration_bad = true;
                false
            }
        }
    }

    fn set_bias_estimation(&mut self, enable: bool) {
        let result = if enable {
            self.state.enable_bias_estimation()
        } else {
            self.state.disable_bias_estimation()
        };
        self.check(result);
    }

    fn check_packet_time(&mut self, time: Timestamp, kind: SampleKind) -> bool {
        if time < self.last_packet_time {
            warn!(
                "packets out of order: {} at {} came first, then {} at {}",
                self.last_packet_kind.map_or("nothing".to_string(), |k| k.to_string()),
                self.last_packet_time,
                kind,
                time
            );
            return false;
        }
        self.last_packet_time = time;
        self.last_packet_kind = Some(kind);
        true
    }

    fn too_late(&self, time: Timestamp, kind: SampleKind) -> bool {
        if self.ignore_lateness {
            return false;
        }
        let now = self.clock.now();
        if now.micros_since(time) > self.config.max_inertial_delay_us as i64 {
            warn!("dropped an old {} sample: timestamp {}, now {}", kind, time, now);
            return true;
        }
        false
    }

    fn process_inertial(&mut self, observation: Observation, time: Timestamp) -> bool {
        self.observations.push(observation);
        self.last_time = time;
        let result = self
            .observations
            .process(&mut self.state, time, None, &self.config.feature);
        self.check(result)
    }

    pub fn accelerometer_measurement(&mut self, sample: &AccelerometerSample) -> bool {
        let time = sample.timestamp;
        let meas = sample.accel_m_s2;
        let delta = meas - self.last_accel_meas;
        // the anchor moves even for rejected samples so one outlier cannot
        // block every sample after it
        self.last_accel_meas = meas;

        if self.run_state == RunState::Inactive {
            return false;
        }
        if !self.check_packet_time(time, SampleKind::Accelerometer) || self.too_late(time, SampleKind::Accelerometer) {
            return false;
        }
        if !self.got_accelerometer {
            self.got_accelerometer = true;
            return false;
        }
        if !self.got_gyroscope {
            return false;
        }
        if delta.amax() > self.config.max_accel_delta {
            warn!("rejecting accelerometer sample with extreme jump {:?}", delta.as_slice());
            return false;
        }

        self.state.imu.accel_measurement_variance = self.accelerometer_variance(&meas, time);
        let processed = self.process_inertial(Observation::Accelerometer(AccelerometerObservation::new(time, meas)), time);

        if !self.gravity_init && self.state.motion.orientation_initialized {
            self.gravity_init = true;
            if !self.origin_gravity_aligned {
                self.origin.rotation *= self.state.motion.q.v.inverse();
            }
        }
        processed
    }

    pub fn gyroscope_measurement(&mut self, sample: &GyroSample) -> bool {
        let time = sample.timestamp;
        let meas = sample.angvel_rad_s;
        let delta = meas - self.last_gyro_meas;
        self.last_gyro_meas = meas;

        if self.run_state == RunState::Inactive {
            return false;
        }
        if !self.check_packet_time(time, SampleKind::Gyroscope) || self.too_late(time, SampleKind::Gyroscope) {
            return false;
        }
        if !self.got_gyroscope {
            self.got_gyroscope = true;
            return false;
        }
        if !self.gravity_init {
            return false;
        }
        if delta.amax() > self.config.max_gyro_delta {
            warn!("rejecting gyro sample with extreme jump {:?}", delta.as_slice());
            return false;
        }

        self.state.imu.gyro_measurement_variance = self.w_variance;
        if self.run_state == RunState::StaticCalibration {
            self.steady.gyro.data(&meas);
        }
        self.process_inertial(Observation::Gyroscope(GyroscopeObservation::new(time, meas)), time)
    }

    /// Runs one camera frame. Returns false if the frame was dropped; a
    /// frame that arrives while vision is not in use still counts as
    /// processed.
    pub fn image_measurement(&mut self, frame: &ImageFrame) -> bool {
        let time = frame.timestamp;
        if self.run_state == RunState::Inactive {
            return false;
        }
        if !self.check_packet_time(time, SampleKind::Camera) {
            return false;
        }
        if !self.got_accelerometer || !self.got_gyroscope {
            return false;
        }
        if !frame.is_well_formed() {
            warn!("dropping malformed {}x{} frame at {}", frame.width, frame.height, time);
            return false;
        }
        self.got_image = true;

        match self.run_state {
            RunState::DynamicInitialization => {
                if self.want_start.is_zero() {
                    self.want_start = time;
                }
                let tilt = self.state.motion.q.variance(&self.state.cov);
                let threshold = self.config.dynamic_w_thresh_variance;
                if tilt.x >= threshold || tilt.y >= threshold {
                    return true;
                }
                debug!("inertial converged after {}us", time.micros_since(self.want_start));
            }
            RunState::SteadyInitialization => {
                if self.steady.stable_start.is_zero()
                    || time.micros_since(self.steady.stable_start) < self.config.steady_converge_time_us as i64
                {
                    return true;
                }
            }
            RunState::Running => {}
            _ => return true,
        }

        if !self.ignore_lateness && !self.admission.admit(time, self.clock.now(), self.state.size()) {
            return false;
        }

        let had_features = !self.state.vision.features.is_empty();
        let tracked = self.state.vision.features.len();
        if tracked > MAX_FEATURE_OBSERVATIONS {
            warn!("{} features tracked, measuring the oldest {}", tracked, MAX_FEATURE_OBSERVATIONS);
        }
        for &id in self.state.vision.features.keys().take(MAX_FEATURE_OBSERVATIONS) {
            self.observations.push(Observation::Feature(FeatureObservation::new(id, time)));
        }
        self.last_time = time;
        let tracking = TrackingContext {
            tracker: &mut *self.tracker,
            image: frame.view(),
        };
        let result = self
            .observations
            .process(&mut self.state, time, Some(tracking), &self.config.feature);
        if !self.check(result) {
            return true;
        }

        let summary = match self.state.process_features(&self.config.feature) {
            Ok(summary) => summary,
            Err(err) => {
                self.check(Err(err));
                return true;
            }
        };
        for id in &summary.dropped {
            self.tracker.drop_track(*id);
        }
        if summary.used == 0 {
            if had_features && self.run_state == RunState::Running {
                self.flags.tracker_failed = true;
            }
            self.has_converged = false;
            self.max_velocity = 0.0;
            self.median_depth_variance = 1.0;
        }

        let space = self.admission.space(self.state.committed_size(), self.config.max_group_add);
        if space >= self.config.min_group_add {
            let initializing = self.run_state.is_initializing();
            if initializing {
                let result = self.state.disable_orientation_only();
                if !self.check(result) {
                    return true;
                }
            }
            if let Err(err) = self.add_features(frame, space) {
                self.check(Err(err));
                return true;
            }
            if self.state.vision.features.len() < self.config.feature.min_group_features {
                warn!("detector failure: no features found at {}", time);
                self.flags.detector_failed = true;
                self.flags.calibration_bad = true;
                if initializing {
                    let result = self.state.enable_orientation_only();
                    self.check(result);
                }
            } else {
                if initializing {
                    self.set_run_state(RunState::Running);
                    self.active_time = time;
                }
                self.flags.detector_failed = false;
                self.flags.tracker_failed = false;
            }
        }

        self.median_depth_variance = self.state.median_depth_variance();
        self.max_velocity = self.max_velocity.max(self.state.motion.v.v.norm());
        if self.max_velocity > self.config.convergence_minimum_velocity
            && self.median_depth_variance < self.config.convergence_maximum_depth_variance
        {
            self.has_converged = true;
        }
        self.update_outputs(time);
        true
    }

    /// Detects up to `count` new features away from the tracked ones and
    /// puts them in a new group.
    fn add_features(&mut self, frame: &ImageFrame, count: usize) -> Result<()> {
        let image = frame.view();
        let existing: Vec<Vector2<f64>> = self.state.vision.features.values().map(|f| f.current).collect();
        let found = self.tracker.detect(&image, &existing, count);
        if found.len() < self.config.feature.min_group_features {
            return Ok(());
        }

        let group = self.state.add_group()?;
        let mut added = 0;
        for pixel in found.into_iter().take(count) {
            let Some(id) = self.state.add_feature(group, pixel, &self.config.feature) else {
                break;
            };
            if self.tracker.add_track(&image, id, &pixel) {
                added += 1;
            } else if let Some(feature) = self.state.vision.features.get_mut(&id) {
                feature.status = FeatureStatus::Dropped;
            }
        }
        debug!("group {} started with {} features, state size {}", group, added, self.state.size());
        Ok(())
    }

    /// Plausibility checks on the motion estimate while running.
    fn update_outputs(&mut self, time: Timestamp) {
        if self.run_state != RunState::Running {
            return;
        }
        let limits = &self.config.speed;
        let motion = &self.state.motion;
        let checks = [
            ("velocity", motion.v.v.norm(), limits.velocity_fail, limits.velocity_warn),
            ("acceleration", motion.a.v.norm(), limits.acceleration_fail, limits.acceleration_warn),
            ("angular velocity", motion.w.v.norm(), limits.angular_velocity_fail, limits.angular_velocity_warn),
        ];
        let already_failed = self.flags.speed_failed;
        for (what, value, fail, warning) in checks {
            if value > fail {
                if !already_failed {
                    warn!("{} {:.2} exceeds the bound {}", what, value, fail);
                }
                self.flags.speed_failed = true;
                self.flags.calibration_bad = true;
            } else if value > warning {
                if !self.flags.speed_warning {
                    warn!("high {} ({:.2})", what, value);
                }
                self.flags.speed_warning = true;
                self.flags.speed_warning_time = time;
            }
        }
        if time.micros_since(self.flags.speed_warning_time) > limits.warning_hold_us as i64 {
            self.flags.speed_warning = false;
        }
    }

    pub fn start_static_calibration(&mut self) {
        self.steady.reset();
        self.stage_complete = false;
        self.a_bias_start = self.state.imu.a_bias.variance(&self.state.cov);
        self.w_bias_start = self.state.imu.w_bias.variance(&self.state.cov);
        self.set_run_state(RunState::StaticCalibration);
    }

    pub fn start_hold_steady(&mut self) {
        self.steady.reset();
        self.set_run_state(RunState::SteadyInitialization);
    }

    pub fn start_dynamic(&mut self) {
        self.want_start = self.last_time;
        self.set_run_state(RunState::DynamicInitialization);
    }

    /// Drops translation and vision, keeping orientation.
    pub fn start_inertial_only(&mut self) {
        self.set_run_state(RunState::InertialOnly);
        let result = self.state.enable_orientation_only();
        self.check(result);
    }

    /// Places the output frame. A gravity-aligned origin keeps only the
    /// heading of `origin`.
    pub fn set_origin(&mut self, origin: SE3, gravity_aligned: bool) {
        let rotation = if gravity_aligned {
            let up = origin.rotation * Vector3::z();
            rotation_between(&up, &Vector3::z()) * origin.rotation
        } else {
            origin.rotation
        };
        self.origin = SE3::new(rotation, origin.translation);
    }

    /// Makes the current pose, with its tilt removed, the output origin.
    pub fn set_reference(&mut self) {
        let current = SE3::new(self.state.motion.q.v, self.state.motion.t.v);
        self.set_origin(current, true);
        self.origin = self.origin.inverse();
    }

    pub fn origin(&self) -> SE3 {
        self.origin
    }

    pub fn compute_gravity(&mut self, latitude_deg: f64, altitude_m: f64) {
        self.state.compute_gravity(latitude_deg, altitude_m);
        debug!("gravity set to {:.5} m/s²", self.state.motion.gravity);
    }

    /// Body to output frame.
    pub fn pose(&self) -> SE3 {
        self.origin
            .compose(&SE3::new(self.state.motion.q.v, self.state.motion.t.v))
    }

    pub fn status(&self) -> Status {
        Status::new(self.run_state, self.flags.error(), self.has_converged, self.calibration_progress())
    }

    pub fn is_steady(&self) -> bool {
        self.state.motion.v.v.norm() < STEADY_VELOCITY && self.state.motion.w.v.norm() < STEADY_ANGULAR_VELOCITY
    }

    pub fn features(&self) -> Vec<FeaturePoint> {
        self.state
            .vision
            .features
            .values()
            .filter(|feature| feature.is_valid())
            .map(|feature| FeaturePoint {
                id: feature.id,
                image: feature.current,
                world: self.origin.transform_point(&feature.world),
                depth_stdev_m: feature.reference_depth() * feature.v.variance(&self.state.cov).sqrt(),
                initialized: feature.is_initialized(),
            })
            .collect()
    }

    /// The calibration record updated with everything the filter has
    /// estimated.
    pub fn device_calibration(&self) -> Calibration {
        let mut calibration = self.calibration.clone();
        let state = &self.state;
        if let Some(camera) = calibration.cameras.first_mut() {
            let cam = &state.camera;
            let intrinsics = &mut camera.intrinsics;
            intrinsics.f_x_px = cam.focal_length.v;
            intrinsics.f_y_px = cam.focal_length.v;
            intrinsics.c_x_px = cam.center_x.v;
            intrinsics.c_y_px = cam.center_y.v;
            intrinsics.distortion = Distortion::from_model(cam.model, [cam.k1.v, cam.k2.v, cam.k3.v]);
            camera.extrinsics.t = cam.extrinsics.translation;
            camera.extrinsics.w = cam.extrinsics.rotation.scaled_axis();
        }
        if let Some(imu) = calibration.imus.first_mut() {
            imu.accelerometer.bias = state.imu.a_bias.v;
            imu.accelerometer.bias_variance = state.imu.a_bias.variance(&state.cov);
            imu.accelerometer.measurement_variance = self.a_variance;
            imu.accelerometer.scale_and_alignment = state.imu.accel_scale;
            imu.gyroscope.bias = state.imu.w_bias.v;
            imu.gyroscope.bias_variance = state.imu.w_bias.variance(&state.cov);
            imu.gyroscope.measurement_variance = self.w_variance;
            imu.gyroscope.scale_and_alignment = state.imu.gyro_scale;
        }
        calibration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::ImageView;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Finds nothing and loses everything.
    struct BlindTracker;

    impl FeatureTracker for BlindTracker {
        fn detect(&mut self, _: &ImageView<'_>, _: &[Vector2<f64>], _: usize) -> Vec<Vector2<f64>> {
            Vec::new()
        }
        fn add_track(&mut self, _: &ImageView<'_>, _: FeatureId, _: &Vector2<f64>) -> bool {
            false
        }
        fn track(&mut self, _: &ImageView<'_>, _: &crate::tracking::TrackRequest) -> Option<Vector2<f64>> {
            None
        }
        fn drop_track(&mut self, _: FeatureId) {}
        fn reset(&mut self) {}
    }

    /// A rigid, motionless scene: every detection is new and every track
    /// stays where it was found.
    struct StillSceneTracker {
        detections: usize,
        next: usize,
    }

    impl FeatureTracker for StillSceneTracker {
        fn detect(&mut self, _: &ImageView<'_>, _: &[Vector2<f64>], max: usize) -> Vec<Vector2<f64>> {
            (0..self.detections.min(max))
                .map(|_| {
                    let n = self.next;
                    self.next += 1;
                    Vector2::new(20.0 + (n % 30) as f64 * 20.0, 20.0 + (n / 30 % 22) as f64 * 20.0)
                })
                .collect()
        }
        fn add_track(&mut self, _: &ImageView<'_>, _: FeatureId, _: &Vector2<f64>) -> bool {
            true
        }
        fn track(&mut self, _: &ImageView<'_>, request: &crate::tracking::TrackRequest) -> Option<Vector2<f64>> {
            Some(request.current)
        }
        fn drop_track(&mut self, _: FeatureId) {}
        fn reset(&mut self) {}
    }

    fn filter_with(tracker: Box<dyn FeatureTracker>) -> Filter {
        let calibration = Calibration::default_for_device(640, 480);
        let mut filter = Filter::new(FilterConfig::default(), calibration, tracker).unwrap();
        filter.set_ignore_lateness(true);
        filter
    }

    fn filter() -> Filter {
        filter_with(Box::new(BlindTracker))
    }

    fn accel(time: u64, v: Vector3<f64>) -> AccelerometerSample {
        AccelerometerSample::new(Timestamp(time), v)
    }

    fn gyro(time: u64, v: Vector3<f64>) -> GyroSample {
        GyroSample::new(Timestamp(time), v)
    }

    fn frame(time: u64) -> ImageFrame {
        ImageFrame::new(Timestamp(time), 640, 480, 640, vec![0u8; 640 * 480].into())
    }

    /// Feeds interleaved gyro and accelerometer samples at 200 Hz.
    fn feed<F>(filter: &mut Filter, start: u64, count: u64, mut sample: F, mut observe: impl FnMut(&Filter))
    where
        F: FnMut(u64) -> (Vector3<f64>, Vector3<f64>),
    {
        for k in 0..count {
            let time = start + k * 5_000;
            let (a, w) = sample(k);
            filter.gyroscope_measurement(&gyro(time, w));
            filter.accelerometer_measurement(&accel(time, a));
            observe(filter);
        }
    }

    #[test]
    fn test_new_filter_is_inactive_and_orientation_only() {
        let filter = filter();
        assert_eq!(filter.run_state(), RunState::Inactive);
        assert!(filter.state().motion.orientation_only);
        assert_eq!(filter.state().size(), 9);
        assert_eq!(filter.status(), Status::default());
        assert_relative_eq!(filter.state().camera.focal_length.v, 1.32 * 480.0);
    }

    #[test]
    fn test_inactive_filter_ignores_samples() {
        let mut filter = filter();
        assert!(!filter.accelerometer_measurement(&accel(1_000, Vector3::new(0.0, 0.0, 9.8))));
        assert!(!filter.gyroscope_measurement(&gyro(1_000, Vector3::zeros())));
        assert!(!filter.image_measurement(&frame(1_000)));
        assert!(!filter.gravity_initialized());
    }

    #[test]
    fn test_static_calibration_converges() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut filter = filter();
        filter.start_static_calibration();

        let mut best_progress: f64 = 0.0;
        let mut finished_static = None;
        feed(
            &mut filter,
            1_000_000,
            400,
            |_| {
                let a = Vector3::new(0.0, 0.0, 9.81) + Vector3::from_fn(|_, _| rng.gen_range(-0.02..0.02));
                let w = Vector3::from_fn(|_, _| rng.gen_range(-1e-5..1e-5));
                (a, w)
            },
            |filter| {
                let status = filter.status();
                if status.run_state == RunState::StaticCalibration {
                    best_progress = best_progress.max(status.progress);
                } else if finished_static.is_none() {
                    finished_static = Some((
                        status.run_state,
                        filter.state().imu.w_bias.variance(&filter.state().cov),
                        filter.device_calibration(),
                    ));
                }
            },
        );

        assert_relative_eq!(best_progress, 1.0);
        let (next, w_bias_var, calibration) = finished_static.expect("static calibration never finished");
        assert_eq!(next, RunState::PortraitCalibration);
        let floor = FilterConfig::default().min_w_bias_var;
        for k in 0..3 {
            assert!(w_bias_var[k] <= floor * (1.0 + 1e-9));
        }
        let imu = calibration.imu().unwrap();
        assert_relative_eq!(imu.accelerometer.measurement_variance, 5e-3);
        assert_relative_eq!(imu.gyroscope.measurement_variance, 2e-5);
        assert!(imu.gyroscope.bias.norm() < 1e-5);
        // face up makes the vertical accelerometer bias observable
        assert!(imu.accelerometer.bias_variance.z < 0.01 * 0.0096);
        assert!(!filter.flags().numeric_failed);
    }

    #[test]
    fn test_portrait_stage_waits_for_orientation() {
        let mut filter = filter();
        filter.start_static_calibration();
        feed(&mut filter, 1_000_000, 400, |_| (Vector3::new(0.0, 0.0, 9.81), Vector3::zeros()), |_| {});
        assert_eq!(filter.run_state(), RunState::PortraitCalibration);

        // still face up: portrait never starts its steady span
        feed(&mut filter, 3_000_000, 100, |_| (Vector3::new(0.0, 0.0, 9.81), Vector3::zeros()), |_| {});
        assert_eq!(filter.run_state(), RunState::PortraitCalibration);
        assert_eq!(filter.steady.accel.count, 0);
    }

    #[test]
    fn test_out_of_order_sample_rejected() {
        let mut filter = filter();
        filter.start_dynamic();
        feed(&mut filter, 1_000_000, 10, |_| (Vector3::new(0.0, 0.0, 9.81), Vector3::zeros()), |_| {});
        let last = filter.last_time();
        assert!(!filter.accelerometer_measurement(&accel(last.as_micros() - 1, Vector3::new(0.0, 0.0, 9.81))));
        assert!(!filter.gyroscope_measurement(&gyro(last.as_micros() - 1, Vector3::zeros())));
        assert_eq!(filter.last_time(), last);
        assert!(filter.accelerometer_measurement(&accel(last.as_micros() + 5_000, Vector3::new(0.0, 0.0, 9.81))));
    }

    #[test]
    fn test_jump_rejected_and_anchor_moves() {
        let mut filter = filter();
        filter.start_dynamic();
        feed(&mut filter, 1_000_000, 10, |_| (Vector3::new(0.0, 0.0, 9.81), Vector3::zeros()), |_| {});
        let t = filter.last_time().as_micros();
        let spike = Vector3::new(30.0, 0.0, 9.81);
        assert!(!filter.accelerometer_measurement(&accel(t + 5_000, spike)));
        // the spike became the anchor, so the return to normal also jumps
        assert!(!filter.accelerometer_measurement(&accel(t + 10_000, Vector3::new(0.0, 0.0, 9.81))));
        assert!(filter.accelerometer_measurement(&accel(t + 15_000, Vector3::new(0.0, 0.0, 9.81))));

        assert!(!filter.gyroscope_measurement(&gyro(t + 20_000, Vector3::new(6.0, 0.0, 0.0))));
    }

    #[test]
    fn test_first_samples_level_before_gyro_counts() {
        let mut filter = filter();
        filter.start_dynamic();
        // first gyro is skipped, first accelerometer is skipped
        assert!(!filter.gyroscope_measurement(&gyro(1_000, Vector3::zeros())));
        assert!(!filter.accelerometer_measurement(&accel(1_000, Vector3::new(0.0, 9.81, 0.0))));
        // gyro before gravity is known is ignored
        assert!(!filter.gyroscope_measurement(&gyro(2_000, Vector3::zeros())));
        assert!(filter.accelerometer_measurement(&accel(2_000, Vector3::new(0.0, 9.81, 0.0))));
        assert!(filter.gravity_initialized());
        assert_relative_eq!(
            filter.state().motion.q.v * Vector3::y(),
            Vector3::z(),
            epsilon = 1e-9
        );
        assert!(filter.gyroscope_measurement(&gyro(3_000, Vector3::zeros())));
    }

    #[test]
    fn test_detector_failure_reported_as_vision_error() {
        let mut filter = filter();
        filter.start_dynamic();
        feed(&mut filter, 1_000_000, 400, |_| (Vector3::new(0.0, 0.0, 9.81), Vector3::zeros()), |_| {});
        assert!(filter.image_measurement(&frame(3_000_000)));
        assert!(filter.flags().detector_failed);
        assert_eq!(filter.status().error, ErrorCode::Vision);
        assert_eq!(filter.run_state(), RunState::DynamicInitialization);
        assert!(filter.state().motion.orientation_only);
        assert!(filter.got_image());
    }

    #[test]
    fn test_feature_rich_scene_stays_within_budget() {
        use crate::numerics::MAX_OBSERVATION_SIZE;
        use crate::state::GroupStatus;

        let mut filter = filter_with(Box::new(StillSceneTracker { detections: 40, next: 0 }));
        filter.start_dynamic();
        feed(&mut filter, 1_000_000, 400, |_| (Vector3::new(0.0, 0.0, 9.81), Vector3::zeros()), |_| {});

        let max_state_size = FilterConfig::default().max_state_size;
        let mut start = 3_000_000;
        for _ in 0..30 {
            feed(&mut filter, start, 6, |_| (Vector3::new(0.0, 0.0, 9.81), Vector3::zeros()), |_| {});
            assert!(filter.image_measurement(&frame(start + 27_000)));
            start += 33_000;

            let state = filter.state();
            assert!(!filter.flags().numeric_failed);
            assert!(state.committed_size() <= max_state_size);
            assert!(FeatureObservation::SIZE * state.vision.feature_count() <= MAX_OBSERVATION_SIZE);
        }

        assert_eq!(filter.run_state(), RunState::Running);
        let vision = &filter.state().vision;
        assert_eq!(vision.feature_count(), 80);
        assert_eq!(vision.group_count(), 2);
        assert!(vision.groups.values().all(|g| g.status != GroupStatus::Initializing));
        assert!(!filter.flags().tracker_failed);
    }

    #[test]
    fn test_inertial_only_and_back() {
        let mut filter = filter();
        filter.start_dynamic();
        filter.start_inertial_only();
        assert_eq!(filter.run_state(), RunState::InertialOnly);
        assert!(filter.state().motion.orientation_only);
        assert_eq!(filter.status().progress, 0.0);
        filter.start_dynamic();
        assert_eq!(filter.status().progress, 1.0);
    }

    #[test]
    fn test_gravity_aligned_origin_keeps_heading() {
        let mut filter = filter();
        let tilted = UnitQuaternion::from_euler_angles(0.3, -0.2, 1.0);
        filter.set_origin(SE3::new(tilted, Vector3::new(1.0, 2.0, 3.0)), true);
        let origin = filter.origin();
        assert_relative_eq!(origin.rotation * Vector3::z(), Vector3::z(), epsilon = 1e-12);
        assert_relative_eq!(origin.translation, Vector3::new(1.0, 2.0, 3.0));
        assert_relative_eq!(filter.pose().translation, Vector3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_set_reference_zeroes_position() {
        let mut filter = filter();
        filter.state.motion.orientation_only = false;
        filter.state.motion.t.v = Vector3::new(4.0, -1.0, 0.5);
        filter.state.motion.q.v = UnitQuaternion::from_euler_angles(0.1, 0.0, 0.7);
        filter.set_reference();
        let pose = filter.pose();
        assert_relative_eq!(pose.translation, Vector3::zeros(), epsilon = 1e-12);
        // only the tilt remains
        let (_, _, yaw) = pose.rotation.euler_angles();
        assert!(yaw.abs() < 0.05);
    }

    /// Replays the same samples twice, once from a displaced origin. The
    /// shape of the trajectory must not change.
    #[test]
    fn test_trajectory_shape_independent_of_origin() {
        let run = |origin: SE3| {
            let mut filter = filter();
            filter.reset_to(Timestamp(999_000), origin, false).unwrap();
            filter.start_dynamic();
            feed(&mut filter, 1_000_000, 20, |_| (Vector3::new(0.0, 0.0, 9.81), Vector3::zeros()), |_| {});
            filter.state.disable_orientation_only().unwrap();

            let mut poses = Vec::new();
            feed(
                &mut filter,
                1_100_000,
                200,
                |k| {
                    let phase = k as f64 * 0.05;
                    (
                        Vector3::new(1.5 * phase.sin(), 0.8 * phase.cos(), 9.81),
                        Vector3::new(0.0, 0.0, 0.3 * phase.cos()),
                    )
                },
                |filter| poses.push(filter.pose()),
            );
            poses
        };

        let plain = run(SE3::identity());
        let origin = SE3::new(UnitQuaternion::from_euler_angles(0.4, -1.1, 2.0), Vector3::new(10.0, -3.0, 7.5));
        let moved = run(origin);
        assert_eq!(plain.len(), moved.len());

        let mut travelled = 0.0;
        for k in 1..plain.len() {
            let a = (plain[k].translation - plain[k - 1].translation).norm();
            let b = (moved[k].translation - moved[k - 1].translation).norm();
            assert_relative_eq!(a, b, epsilon = 1e-9);
            let ra = plain[k].rotation.angle_to(&plain[k - 1].rotation);
            let rb = moved[k].rotation.angle_to(&moved[k - 1].rotation);
            assert_relative_eq!(ra, rb, epsilon = 1e-9);
            travelled += a;
        }
        assert!(travelled > 0.0);
    }
}
