//! Accelerometer and gyroscope measurement models.

use nalgebra::{Matrix3, Vector3};

use crate::geometry::skew;
use crate::numerics::KalmanScratch;
use crate::sensor::Timestamp;
use crate::state::FilterState;

use super::add_block;

/// Specific force in the accelerometer frame:
/// `h = S·Riᵀ·Rᵀ·(a + g·ẑ) + a_bias`.
#[derive(Debug, Clone)]
pub struct AccelerometerObservation {
    pub time: Timestamp,
    pub meas: Vector3<f64>,
    pred: Vector3<f64>,
    /// World to accelerometer frame, scale included.
    rotation: Matrix3<f64>,
    /// World-frame specific force.
    force: Vector3<f64>,
}

impl AccelerometerObservation {
    pub const SIZE: usize = 3;

    pub fn new(time: Timestamp, meas: Vector3<f64>) -> Self {
        Self {
            time,
            meas,
            pred: Vector3::zeros(),
            rotation: Matrix3::identity(),
            force: Vector3::zeros(),
        }
    }

    pub fn prediction(&self) -> &Vector3<f64> {
        &self.pred
    }

    pub fn predict(&mut self, state: &FilterState) {
        let world_to_body = state.motion.q.v.inverse().to_rotation_matrix().into_inner();
        self.force = Vector3::new(0.0, 0.0, state.motion.gravity);
        if !state.motion.orientation_only {
            self.force += state.motion.a.v;
        }
        self.rotation = state.imu.accel_rotation(&world_to_body);
        self.pred = self.rotation * self.force + state.imu.a_bias.v;
    }

    /// The very first reading levels the filter instead of updating it.
    pub fn measure(&mut self, state: &mut FilterState) -> bool {
        if state.motion.orientation_initialized {
            return true;
        }
        let body = state.imu.extrinsic_rotation * self.meas;
        state.motion.initialize_from_gravity(&body);
        false
    }

    pub fn innovation(&self, i: usize) -> f64 {
        self.meas[i] - self.pred[i]
    }

    pub fn measurement_variance(&self, state: &FilterState) -> f64 {
        state.imu.accel_measurement_variance
    }

    pub fn fill_jacobian(&self, state: &FilterState, scratch: &mut KalmanScratch, row: usize) {
        let d_q = self.rotation * skew(&self.force);
        add_block(scratch, row, &state.motion.q.meta, &d_q);
        if !state.motion.orientation_only {
            add_block(scratch, row, &state.motion.a.meta, &self.rotation);
        }
        add_block(scratch, row, &state.imu.a_bias.meta, &Matrix3::identity());
    }
}

/// Angular rate in the gyroscope frame: `h = S·Riᵀ·w + w_bias`.
#[derive(Debug, Clone)]
pub struct GyroscopeObservation {
    pub time: Timestamp,
    pub meas: Vector3<f64>,
    pred: Vector3<f64>,
    rotation: Matrix3<f64>,
}

impl GyroscopeObservation {
    pub const SIZE: usize = 3;

    pub fn new(time: Timestamp, meas: Vector3<f64>) -> Self {
        Self {
            time,
            meas,
            pred: Vector3::zeros(),
            rotation: Matrix3::identity(),
        }
    }

    pub fn prediction(&self) -> &Vector3<f64> {
        &self.pred
    }

    pub fn predict(&mut self, state: &FilterState) {
        self.rotation = state.imu.gyro_rotation();
        self.pred = self.rotation * state.motion.w.v + state.imu.w_bias.v;
    }

    pub fn innovation(&self, i: usize) -> f64 {
        self.meas[i] - self.pred[i]
    }

    pub fn measurement_variance(&self, state: &FilterState) -> f64 {
        state.imu.gyro_measurement_variance
    }

    pub fn fill_jacobian(&self, state: &FilterState, scratch: &mut KalmanScratch, row: usize) {
        add_block(scratch, row, &state.motion.w.meta, &self.rotation);
        add_block(scratch, row, &state.imu.w_bias.meta, &Matrix3::identity());
    }
}
