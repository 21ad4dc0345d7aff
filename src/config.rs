//! Tunable parameters for the queue and the filter.
//!
//! Every value here is an empirically tuned default. A YAML file may override
//! any subset; missing keys keep their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::queue::LatencyStrategy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub queue: QueueConfig,
    pub filter: FilterConfig,
}

impl FusionConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }
}

/// Sensor queue parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub strategy: LatencyStrategy,
    /// Tolerance added to a stream's period before its next sample counts as late.
    pub jitter_us: u64,
    pub camera_capacity: usize,
    pub accelerometer_capacity: usize,
    pub gyroscope_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            strategy: LatencyStrategy::MinimizeDrops,
            jitter_us: 10_000,
            camera_capacity: 8,
            accelerometer_capacity: 32,
            gyroscope_capacity: 32,
        }
    }
}

/// Vision feature parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub initial_depth_m: f64,
    /// Variance of the log inverse depth of a freshly added feature.
    pub initial_var: f64,
    /// Pixel measurement variance (px²).
    pub measurement_var: f64,
    /// Residual multiplier (in sigmas) beyond which measurement noise is inflated.
    pub outlier_thresh: f64,
    /// Accumulated outlier score at which a feature is dropped.
    pub outlier_reject: f64,
    /// Depth variance below which a feature counts as well localized.
    pub max_variance: f64,
    /// Fewest detections worth a new group, and the tracked features a
    /// group must keep through its first frame to be used.
    pub min_group_features: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            initial_depth_m: std::f64::consts::E,
            initial_var: 0.75,
            measurement_var: 4.0,
            outlier_thresh: 2.0,
            outlier_reject: 30.0,
            max_variance: 0.01,
            min_group_features: 4,
        }
    }
}

/// Plausibility limits on device motion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedLimits {
    pub velocity_fail: f64,
    pub velocity_warn: f64,
    pub acceleration_fail: f64,
    pub acceleration_warn: f64,
    pub angular_velocity_fail: f64,
    pub angular_velocity_warn: f64,
    pub warning_hold_us: u64,
}

impl Default for SpeedLimits {
    fn default() -> Self {
        Self {
            velocity_fail: 3.0,
            velocity_warn: 2.0,
            acceleration_fail: 9.8,
            acceleration_warn: 5.0,
            angular_velocity_fail: 5.0,
            angular_velocity_warn: 2.0,
            warning_hold_us: 1_000_000,
        }
    }
}

/// Filter parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub max_camera_delay_us: u64,
    pub max_inertial_delay_us: u64,
    pub min_steady_time_us: u64,
    pub steady_converge_time_us: u64,
    pub calibration_converge_samples: u32,
    pub accelerometer_steady_var: f64,
    pub velocity_steady_var: f64,
    pub accelerometer_inertial_var: f64,
    pub static_sigma: f64,
    pub steady_sigma: f64,
    pub dynamic_w_thresh_variance: f64,
    pub min_a_bias_var: f64,
    pub min_w_bias_var: f64,
    /// Largest plausible change between consecutive accelerometer samples (m/s²).
    pub max_accel_delta: f64,
    /// Largest plausible change between consecutive gyro samples (rad/s).
    pub max_gyro_delta: f64,
    pub convergence_minimum_velocity: f64,
    pub convergence_maximum_depth_variance: f64,
    pub min_group_add: usize,
    pub max_group_add: usize,
    pub max_state_size: usize,
    pub min_state_size: usize,
    pub static_accelerometer_noise_floor: f64,
    pub static_gyroscope_noise_floor: f64,
    pub estimate_camera_intrinsics: bool,
    pub feature: FeatureConfig,
    pub speed: SpeedLimits,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_camera_delay_us: 200_000,
            max_inertial_delay_us: 100_000,
            min_steady_time_us: 100_000,
            steady_converge_time_us: 200_000,
            calibration_converge_samples: 200,
            accelerometer_steady_var: 0.15 * 0.15,
            velocity_steady_var: 0.1 * 0.1,
            accelerometer_inertial_var: 2.33 * 2.33,
            static_sigma: 6.0,
            steady_sigma: 3.0,
            dynamic_w_thresh_variance: 5e-2,
            min_a_bias_var: 1e-6,
            min_w_bias_var: 1e-8,
            max_accel_delta: 20.0,
            max_gyro_delta: 5.0,
            convergence_minimum_velocity: 0.3,
            convergence_maximum_depth_variance: 1e-3,
            min_group_add: 16,
            max_group_add: 40,
            max_state_size: crate::numerics::MAX_STATE_SIZE,
            min_state_size: 60,
            static_accelerometer_noise_floor: 5e-3,
            static_gyroscope_noise_floor: 2e-5,
            estimate_camera_intrinsics: false,
            feature: FeatureConfig::default(),
            speed: SpeedLimits::default(),
        }
    }
}
