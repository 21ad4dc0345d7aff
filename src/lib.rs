//! Visual-inertial sensor fusion.
//!
//! A multi-sensor queue orders camera, accelerometer and gyroscope samples
//! and feeds them one at a time to an extended Kalman filter that estimates
//! device motion, IMU biases, camera intrinsics and a sparse set of
//! inverse-depth features.

pub mod calibration;
pub mod config;
pub mod error;
pub mod filter;
pub mod geometry;
pub mod io;
pub mod numerics;
pub mod observation;
pub mod queue;
pub mod sensor;
pub mod state;
pub mod system;
pub mod tracking;

pub use error::{FusionError, Result};
