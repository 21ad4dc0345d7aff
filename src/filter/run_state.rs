//! Accelerometer handling per run state: steady detection, bias
//! estimation toggling, calibration stages and their progress.

use nalgebra::Vector3;
use tracing::{debug, info};

use crate::sensor::Timestamp;

use super::steady::{Facing, Tolerance};
use super::{Filter, RunState};

/// Accelerometer variance inflation while calibrating face up.
const STATIC_VARIANCE_SCALE: f64 = 9.0;

/// Steady initialization never reports completion by itself.
const MAX_STEADY_PROGRESS: f64 = 0.99;

impl Filter {
    /// Measurement variance for one accelerometer sample. Advances the
    /// calibration stages as a side effect.
    ///
    /// A stage that reaches full progress finishes on the following steady
    /// sample, so the completed progress is visible to the host once.
    pub(super) fn accelerometer_variance(&mut self, meas: &Vector3<f64>, time: Timestamp) -> f64 {
        let inertial_var = self.config.accelerometer_inertial_var;
        let steady_var = self.config.accelerometer_steady_var;
        let min_steady = self.config.min_steady_time_us as i64;

        // the first reading only levels the filter
        if !self.state.motion.orientation_initialized {
            return inertial_var;
        }
        match self.run_state {
            RunState::Running | RunState::Inactive => self.a_variance,
            RunState::DynamicInitialization | RunState::InertialOnly => inertial_var,
            RunState::StaticCalibration => {
                let tolerance = Tolerance {
                    variance: self.a_variance,
                    sigma: self.config.static_sigma,
                };
                if self.steady_span(meas, tolerance, time, Some(Vector3::z())) > min_steady {
                    self.set_bias_estimation(true);
                    if self.stage_complete {
                        self.update_static_calibration();
                        self.finish_stage(RunState::PortraitCalibration);
                    } else if self.steady.accel.count >= self.config.calibration_converge_samples
                        && self.bias_convergence(2) >= 1.0
                    {
                        self.stage_complete = true;
                    }
                    self.a_variance * STATIC_VARIANCE_SCALE
                } else {
                    self.stage_complete = false;
                    self.set_bias_estimation(false);
                    inertial_var
                }
            }
            RunState::PortraitCalibration => {
                self.orientation_stage(meas, time, Vector3::x(), 1, RunState::LandscapeCalibration)
            }
            RunState::LandscapeCalibration => self.orientation_stage(meas, time, Vector3::y(), 0, RunState::Inactive),
            RunState::SteadyInitialization => {
                let tolerance = Tolerance {
                    variance: steady_var,
                    sigma: self.config.steady_sigma,
                };
                let steady = self.steady_span(meas, tolerance, time, None);
                if steady > min_steady {
                    self.set_bias_estimation(true);
                    if steady > self.config.steady_converge_time_us as i64 {
                        // takes effect when translation joins the state
                        let motion = &mut self.state.motion;
                        motion.v.set_initial_variance_uniform(self.config.velocity_steady_var);
                        motion.a.set_initial_variance_uniform(steady_var);
                    }
                    steady_var
                } else {
                    self.set_bias_estimation(false);
                    inertial_var
                }
            }
        }
    }

    /// Portrait and landscape stages: hold the device with `axis` up until
    /// the accelerometer bias along `bias_axis` converges.
    fn orientation_stage(
        &mut self,
        meas: &Vector3<f64>,
        time: Timestamp,
        axis: Vector3<f64>,
        bias_axis: usize,
        next: RunState,
    ) -> f64 {
        let tolerance = Tolerance {
            variance: self.config.accelerometer_steady_var,
            sigma: self.config.steady_sigma,
        };
        if self.steady_span(meas, tolerance, time, Some(axis)) > self.config.min_steady_time_us as i64 {
            self.set_bias_estimation(true);
            if self.stage_complete {
                self.finish_stage(next);
            } else if self.bias_convergence(bias_axis) >= 1.0 {
                self.stage_complete = true;
            }
            self.config.accelerometer_steady_var
        } else {
            self.stage_complete = false;
            self.set_bias_estimation(false);
            self.config.accelerometer_inertial_var
        }
    }

    fn steady_span(&mut self, meas: &Vector3<f64>, tolerance: Tolerance, time: Timestamp, axis: Option<Vector3<f64>>) -> i64 {
        let motion = &self.state.motion;
        let local_up = motion
            .orientation_initialized
            .then(|| motion.q.v.inverse() * Vector3::z());
        let facing = axis.map(|axis| Facing { axis, local_up });
        self.steady
            .steady_time(meas, tolerance, time, self.config.min_steady_time_us, facing)
    }

    fn finish_stage(&mut self, next: RunState) {
        self.a_bias_start = self.state.imu.a_bias.variance(&self.state.cov);
        self.w_bias_start = self.state.imu.w_bias.variance(&self.state.cov);
        self.steady.reset();
        self.stage_complete = false;
        self.set_bias_estimation(false);
        debug!(
            "accelerometer bias {:?} variance {:?}, gyro bias {:?} variance {:?}",
            self.state.imu.a_bias.v.as_slice(),
            self.a_bias_start.as_slice(),
            self.state.imu.w_bias.v.as_slice(),
            self.w_bias_start.as_slice()
        );
        self.set_run_state(next);
    }

    /// Writes the noise measured while static into the filter: sensor
    /// noise variances (floored) and the gyro bias, whose mean over the
    /// span is a better estimate than the filter's.
    pub(super) fn update_static_calibration(&mut self) {
        if self.steady.accel.count < self.config.calibration_converge_samples {
            return;
        }
        let accel_var = self.steady.accel.variance();
        let gyro_var = self.steady.gyro.variance();
        self.a_variance = accel_var.mean().max(self.config.static_accelerometer_noise_floor);
        self.w_variance = gyro_var.mean().max(self.config.static_gyroscope_noise_floor);

        let floor = self.config.min_w_bias_var;
        let w_bias = &mut self.state.imu.w_bias;
        w_bias.v = self.steady.gyro.mean;
        w_bias.set_initial_variance([gyro_var.x.max(floor), gyro_var.y.max(floor), gyro_var.z.max(floor)]);
        w_bias.reset_covariance(&mut self.state.cov);
        info!(
            "static calibration: accelerometer noise {:.3e}, gyro noise {:.3e}, gyro bias {:?}",
            self.a_variance,
            self.w_variance,
            self.state.imu.w_bias.v.as_slice()
        );
    }

    /// Progress of accelerometer bias convergence along one axis, measured
    /// in log variance from the stage start to the floor, or by sample
    /// count once the span is long enough, whichever is further.
    fn bias_convergence(&self, axis: usize) -> f64 {
        let current = self.state.imu.a_bias.variance(&self.state.cov)[axis];
        let begin = self.a_bias_start[axis];
        let end = self.config.min_a_bias_var;
        let by_variance = if current < end || begin <= end {
            1.0
        } else {
            (begin.ln() - current.ln()) / (begin.ln() - end.ln())
        };

        let mut by_count = self.steady.accel.count as f64 / self.config.calibration_converge_samples as f64;
        if self.last_time.micros_since(self.steady.stable_start) < self.config.min_steady_time_us as i64 {
            by_count = 0.0;
        }
        by_variance.max(by_count).clamp(0.0, 1.0)
    }

    /// Fraction in `[0, 1]` of the current calibration or initialization
    /// stage.
    pub fn calibration_progress(&self) -> f64 {
        match self.run_state {
            RunState::SteadyInitialization => {
                if self.steady.stable_start.is_zero() {
                    return 0.0;
                }
                let elapsed = self.steady.elapsed(self.last_time) as f64;
                (elapsed / self.config.steady_converge_time_us as f64).clamp(0.0, MAX_STEADY_PROGRESS)
            }
            RunState::PortraitCalibration => self.bias_convergence(1),
            RunState::LandscapeCalibration => self.bias_convergence(0),
            RunState::StaticCalibration => {
                let by_count = self.steady.accel.count as f64 / self.config.calibration_converge_samples as f64;
                by_count.min(self.bias_convergence(2))
            }
            RunState::Running | RunState::DynamicInitialization => 1.0,
            RunState::Inactive | RunState::InertialOnly => 0.0,
        }
    }
}
