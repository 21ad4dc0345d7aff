//! Device motion and IMU intrinsics.
//!
//! Motion is a constant-angular-acceleration, constant-linear-acceleration
//! model: orientation `Q` integrates body rate `w` and its derivative `dw`,
//! position `T` integrates velocity `V` and world acceleration `a`. Gravity
//! points along world +z.

use nalgebra::{DMatrix, Matrix3, UnitQuaternion, Vector3};

use crate::geometry::{exp_so3, right_jacobian_so3, rotation_between};

use super::covariance::Covariance;
use super::node::{Node, StateBranch, StateRotation, StateVector};

pub const DEFAULT_GRAVITY: f64 = 9.80665;

/// Standard gravity at a latitude (degrees) and altitude (meters), free-air
/// corrected.
pub fn gravity_at(latitude_deg: f64, altitude_m: f64) -> f64 {
    let sin_lat = latitude_deg.to_radians().sin();
    let sin_2lat = (2.0 * latitude_deg).to_radians().sin();
    9.780327 * (1.0 + 0.0053024 * sin_lat * sin_lat - 0.0000058 * sin_2lat * sin_2lat) - 3.086e-6 * altitude_m
}

pub struct MotionState {
    /// Body to world.
    pub q: StateRotation,
    /// Body angular velocity.
    pub w: StateVector,
    /// Body angular acceleration.
    pub dw: StateVector,
    /// World position.
    pub t: StateVector,
    /// World velocity.
    pub v: StateVector,
    /// World linear acceleration, gravity excluded.
    pub a: StateVector,
    pub gravity: f64,
    pub orientation_only: bool,
    /// Set once the first accelerometer sample has leveled `q`.
    pub orientation_initialized: bool,
}

impl MotionState {
    pub fn new() -> Self {
        let mut state = Self {
            q: StateRotation::new(UnitQuaternion::identity(), true, true),
            w: StateVector::new(Vector3::zeros(), true, true),
            dw: StateVector::new(Vector3::zeros(), true, true),
            t: StateVector::new(Vector3::zeros(), true, true),
            v: StateVector::new(Vector3::zeros(), true, true),
            a: StateVector::new(Vector3::zeros(), true, true),
            gravity: DEFAULT_GRAVITY,
            orientation_only: false,
            orientation_initialized: false,
        };
        state.reset_noise();
        state
    }

    /// Restores the default initial variances and process noise.
    pub fn reset_noise(&mut self) {
        self.q.set_initial_variance([10.0, 10.0, 1e-7]);
        self.w.set_initial_variance_uniform(10.0);
        self.dw.set_initial_variance_uniform(10.0);
        self.t.set_initial_variance_uniform(1e-7);
        self.v.set_initial_variance_uniform(1.0);
        self.a.set_initial_variance_uniform(10.0);

        self.q.set_process_noise(0.0);
        self.w.set_process_noise(0.0);
        self.dw.set_process_noise(35.0 * 35.0);
        self.t.set_process_noise(0.0);
        self.v.set_process_noise(0.0);
        self.a.set_process_noise(0.6 * 0.6);
    }

    pub fn reset(&mut self) {
        self.q.v = UnitQuaternion::identity();
        self.w.v = Vector3::zeros();
        self.dw.v = Vector3::zeros();
        self.reset_translation();
        self.orientation_only = false;
        self.orientation_initialized = false;
        self.reset_noise();
    }

    fn reset_translation(&mut self) {
        self.t.v = Vector3::zeros();
        self.v.v = Vector3::zeros();
        self.a.v = Vector3::zeros();
    }

    /// Aligns the orientation so that a body-frame specific force reading
    /// points along world +z. Yaw is left arbitrary.
    pub fn initialize_from_gravity(&mut self, specific_force: &Vector3<f64>) {
        self.q.v = rotation_between(specific_force, &Vector3::z());
        self.orientation_initialized = true;
    }

    /// Drops translation from the estimate. Returns false if already
    /// orientation-only.
    pub fn enable_orientation_only(&mut self) -> bool {
        if self.orientation_only {
            return false;
        }
        self.orientation_only = true;
        self.reset_translation();
        true
    }

    pub fn disable_orientation_only(&mut self) -> bool {
        if !self.orientation_only {
            return false;
        }
        self.orientation_only = false;
        true
    }

    /// Rotation increment over `dt` in the body frame.
    pub fn rotation_increment(&self, dt: f64) -> Vector3<f64> {
        (self.w.v + 0.5 * dt * self.dw.v) * dt
    }

    /// Propagates the covariance through the linearized transition
    /// `F = I + E` as `F·P·Fᵀ`, touching only the rows and columns of the
    /// motion leaves.
    pub fn project_covariance(&self, cov: &mut Covariance, dt: f64) {
        let n = cov.size();
        let m = cov.matrix_mut();
        let rotation_coupling = self.rotation_coupling(dt);
        self.for_each_transition_term(dt, &rotation_coupling, &mut |dst, src, c| add_row(m, n, dst, src, c));
        self.for_each_transition_term(dt, &rotation_coupling, &mut |dst, src, c| add_col(m, n, dst, src, c));
    }

    /// Advances the motion state by `dt` seconds.
    pub fn evolve(&mut self, dt: f64) {
        let d_w = self.rotation_increment(dt);
        self.q.v = self.q.v * exp_so3(&d_w);
        self.w.v += self.dw.v * dt;
        if self.orientation_only {
            return;
        }
        self.t.v += dt * (self.v.v + 0.5 * dt * self.a.v);
        self.v.v += dt * self.a.v;
    }

    /// Sensitivity of the world-frame orientation error to the body
    /// rotation increment, evaluated at the propagated orientation.
    fn rotation_coupling(&self, dt: f64) -> Matrix3<f64> {
        let d_w = self.rotation_increment(dt);
        let next = self.q.v * exp_so3(&d_w);
        next.to_rotation_matrix().into_inner() * right_jacobian_so3(&d_w)
    }

    /// Emits the off-identity entries of the transition matrix as
    /// `(row, col, value)`.
    ///
    /// Ordered so that every row is updated before any row that reads it,
    /// which lets the projection run in place.
    fn for_each_transition_term(&self, dt: f64, coupling: &Matrix3<f64>, emit: &mut dyn FnMut(usize, usize, f64)) {
        let dt2 = 0.5 * dt * dt;

        if let Some(q) = self.q.meta.index {
            for i in 0..3 {
                for k in 0..3 {
                    let b = coupling[(i, k)];
                    if let Some(w) = self.w.meta.row(k) {
                        emit(q + i, w, b * dt);
                    }
                    if let Some(dw) = self.dw.meta.row(k) {
                        emit(q + i, dw, b * dt2);
                    }
                }
            }
        }
        if let (Some(w), Some(dw)) = (self.w.meta.index, self.dw.meta.index) {
            for k in 0..3 {
                emit(w + k, dw + k, dt);
            }
        }
        if self.orientation_only {
            return;
        }
        if let Some(t) = self.t.meta.index {
            for k in 0..3 {
                if let Some(v) = self.v.meta.row(k) {
                    emit(t + k, v, dt);
                }
                if let Some(a) = self.a.meta.row(k) {
                    emit(t + k, a, dt2);
                }
            }
        }
        if let (Some(v), Some(a)) = (self.v.meta.index, self.a.meta.index) {
            for k in 0..3 {
                emit(v + k, a + k, dt);
            }
        }
    }
}

impl Default for MotionState {
    fn default() -> Self {
        Self::new()
    }
}

impl StateBranch for MotionState {
    fn children(&mut self, visit: &mut dyn FnMut(Node<'_>)) {
        visit(Node::Rotation(&mut self.q));
        visit(Node::Vector(&mut self.w));
        visit(Node::Vector(&mut self.dw));
        if !self.orientation_only {
            visit(Node::Vector(&mut self.t));
            visit(Node::Vector(&mut self.v));
            visit(Node::Vector(&mut self.a));
        }
    }

    fn all_children(&mut self, visit: &mut dyn FnMut(Node<'_>)) {
        visit(Node::Rotation(&mut self.q));
        visit(Node::Vector(&mut self.w));
        visit(Node::Vector(&mut self.dw));
        visit(Node::Vector(&mut self.t));
        visit(Node::Vector(&mut self.v));
        visit(Node::Vector(&mut self.a));
    }
}

fn add_row(m: &mut DMatrix<f64>, n: usize, dst: usize, src: usize, c: f64) {
    for j in 0..n {
        m[(dst, j)] += c * m[(src, j)];
    }
}

fn add_col(m: &mut DMatrix<f64>, n: usize, dst: usize, src: usize, c: f64) {
    for i in 0..n {
        m[(i, dst)] += c * m[(i, src)];
    }
}

/// Accelerometer and gyroscope intrinsics.
pub struct ImuState {
    pub a_bias: StateVector,
    pub w_bias: StateVector,
    /// Accelerometer scale and misalignment.
    pub accel_scale: Matrix3<f64>,
    /// Gyroscope scale and misalignment.
    pub gyro_scale: Matrix3<f64>,
    /// IMU to body rotation.
    pub extrinsic_rotation: UnitQuaternion<f64>,
    pub accel_measurement_variance: f64,
    pub gyro_measurement_variance: f64,
    pub estimate_bias: bool,
}

impl ImuState {
    pub fn new() -> Self {
        let mut a_bias = StateVector::new(Vector3::zeros(), true, false);
        let mut w_bias = StateVector::new(Vector3::zeros(), true, false);
        a_bias.set_process_noise(1e-10);
        w_bias.set_process_noise(1e-12);
        Self {
            a_bias,
            w_bias,
            accel_scale: Matrix3::identity(),
            gyro_scale: Matrix3::identity(),
            extrinsic_rotation: UnitQuaternion::identity(),
            accel_measurement_variance: 0.0,
            gyro_measurement_variance: 0.0,
            estimate_bias: true,
        }
    }

    /// Stops estimating both biases, remembering their current variance for
    /// when estimation resumes. The caller remaps.
    pub fn disable_bias_estimation(&mut self, cov: &Covariance) -> bool {
        if !self.estimate_bias {
            return false;
        }
        self.estimate_bias = false;
        let a_var = self.a_bias.variance(cov);
        let w_var = self.w_bias.variance(cov);
        self.a_bias.set_initial_variance([a_var.x, a_var.y, a_var.z]);
        self.w_bias.set_initial_variance([w_var.x, w_var.y, w_var.z]);
        true
    }

    pub fn enable_bias_estimation(&mut self) -> bool {
        if self.estimate_bias {
            return false;
        }
        self.estimate_bias = true;
        true
    }

    /// Combined rotation from world-frame vectors to the accelerometer's
    /// measurement frame, including scale.
    pub fn accel_rotation(&self, world_to_body: &Matrix3<f64>) -> Matrix3<f64> {
        self.accel_scale * self.extrinsic_rotation.inverse().to_rotation_matrix().into_inner() * world_to_body
    }

    /// Body-rate to gyroscope-frame map, including scale.
    pub fn gyro_rotation(&self) -> Matrix3<f64> {
        self.gyro_scale * self.extrinsic_rotation.inverse().to_rotation_matrix().into_inner()
    }
}

impl Default for ImuState {
    fn default() -> Self {
        Self::new()
    }
}

impl StateBranch for ImuState {
    fn children(&mut self, visit: &mut dyn FnMut(Node<'_>)) {
        if self.estimate_bias {
            visit(Node::Vector(&mut self.a_bias));
            visit(Node::Vector(&mut self.w_bias));
        }
    }

    fn all_children(&mut self, visit: &mut dyn FnMut(Node<'_>)) {
        visit(Node::Vector(&mut self.a_bias));
        visit(Node::Vector(&mut self.w_bias));
    }
}
