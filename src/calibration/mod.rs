//! Device calibration record.
//!
//! The on-disk form is versioned JSON. Version 10 is the current schema;
//! anything older is the flat legacy layout and is upgraded on load.

mod document;
mod legacy;

use std::path::Path;

use nalgebra::{Matrix3, Vector3};

use crate::error::{FusionError, Result};
use crate::geometry::{exp_so3, SE3};
use crate::state::DistortionModel;

pub const CALIBRATION_VERSION: u32 = 10;

/// Pose of a sensor relative to the body, with its uncertainty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extrinsics {
    /// Translation, meters.
    pub t: Vector3<f64>,
    pub t_variance: Vector3<f64>,
    /// Rotation as a rotation vector, radians.
    pub w: Vector3<f64>,
    pub w_variance: Vector3<f64>,
}

impl Extrinsics {
    pub fn identity() -> Self {
        Self {
            t: Vector3::zeros(),
            t_variance: Vector3::zeros(),
            w: Vector3::zeros(),
            w_variance: Vector3::zeros(),
        }
    }

    pub fn to_se3(&self) -> SE3 {
        SE3::new(exp_so3(&self.w), self.t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distortion {
    Undistorted,
    Polynomial3 { k: [f64; 3] },
    /// Field-of-view model.
    Fisheye { w: f64 },
}

impl Distortion {
    pub fn model(&self) -> DistortionModel {
        match self {
            Distortion::Undistorted => DistortionModel::Undistorted,
            Distortion::Polynomial3 { .. } => DistortionModel::Polynomial3,
            Distortion::Fisheye { .. } => DistortionModel::Fisheye,
        }
    }

    /// Coefficients in the filter's `k1, k2, k3` slots.
    pub fn coefficients(&self) -> [f64; 3] {
        match *self {
            Distortion::Undistorted => [0.0; 3],
            Distortion::Polynomial3 { k } => k,
            Distortion::Fisheye { w } => [w, 0.0, 0.0],
        }
    }

    pub fn from_model(model: DistortionModel, k: [f64; 3]) -> Self {
        match model {
            DistortionModel::Undistorted => Distortion::Undistorted,
            DistortionModel::Polynomial3 => Distortion::Polynomial3 { k },
            DistortionModel::Fisheye => Distortion::Fisheye { w: k[0] },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub width_px: u32,
    pub height_px: u32,
    pub f_x_px: f64,
    pub f_y_px: f64,
    pub c_x_px: f64,
    pub c_y_px: f64,
    pub distortion: Distortion,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraCalibration {
    pub intrinsics: CameraIntrinsics,
    /// Camera relative to the body.
    pub extrinsics: Extrinsics,
}

/// Intrinsics of one inertial sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InertialIntrinsics {
    pub scale_and_alignment: Matrix3<f64>,
    pub bias: Vector3<f64>,
    pub bias_variance: Vector3<f64>,
    pub measurement_variance: f64,
}

impl InertialIntrinsics {
    pub fn new(bias_variance: f64, measurement_variance: f64) -> Self {
        Self {
            scale_and_alignment: Matrix3::identity(),
            bias: Vector3::zeros(),
            bias_variance: Vector3::repeat(bias_variance),
            measurement_variance,
        }
    }

    /// The scale matrix, with an all-zero matrix read as "not calibrated".
    pub fn alignment_or_identity(&self) -> Matrix3<f64> {
        if self.scale_and_alignment == Matrix3::zeros() {
            Matrix3::identity()
        } else {
            self.scale_and_alignment
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuCalibration {
    /// m/s².
    pub accelerometer: InertialIntrinsics,
    /// rad/s.
    pub gyroscope: InertialIntrinsics,
    pub extrinsics: Extrinsics,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub device_id: String,
    pub device_type: String,
    pub version: u32,
    pub cameras: Vec<CameraCalibration>,
    pub depths: Vec<CameraCalibration>,
    pub imus: Vec<ImuCalibration>,
}

impl Calibration {
    /// Generic phone-class defaults for a camera of the given resolution.
    pub fn default_for_device(width_px: u32, height_px: u32) -> Self {
        let focal = 1.32 * height_px as f64;
        let camera = CameraCalibration {
            intrinsics: CameraIntrinsics {
                width_px,
                height_px,
                f_x_px: focal,
                f_y_px: focal,
                c_x_px: width_px as f64 / 2.0 - 0.5,
                c_y_px: height_px as f64 / 2.0 - 0.5,
                distortion: Distortion::Polynomial3 { k: [0.0; 3] },
            },
            extrinsics: Extrinsics {
                t_variance: Vector3::new(1e-6, 1e-6, 1e-10),
                w_variance: Vector3::repeat(1e-6),
                ..Extrinsics::identity()
            },
        };
        let imu = ImuCalibration {
            accelerometer: InertialIntrinsics::new(0.0096, 0.0009),
            gyroscope: InertialIntrinsics::new(0.0076, 0.000025),
            extrinsics: Extrinsics::identity(),
        };
        Self {
            device_id: String::new(),
            device_type: "default".to_string(),
            version: CALIBRATION_VERSION,
            cameras: vec![camera],
            depths: Vec::new(),
            imus: vec![imu],
        }
    }

    /// Parses either the current or the legacy schema.
    pub fn deserialize(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let version = document::version_of(&value)?;
        let calibration = if version < CALIBRATION_VERSION {
            legacy::upgrade(&value)?
        } else {
            document::from_value(value)?
        };
        calibration.validate()?;
        Ok(calibration)
    }

    /// Pretty-printed JSON in the current schema.
    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&document::to_document(self))?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::deserialize(&text)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.serialize()?)?;
        Ok(())
    }

    pub fn camera(&self) -> Result<&CameraCalibration> {
        self.cameras
            .first()
            .ok_or_else(|| FusionError::Calibration("no camera".to_string()))
    }

    pub fn imu(&self) -> Result<&ImuCalibration> {
        self.imus
            .first()
            .ok_or_else(|| FusionError::Calibration("no imu".to_string()))
    }

    fn validate(&self) -> Result<()> {
        let camera = self.camera()?;
        self.imu()?;
        let intrinsics = &camera.intrinsics;
        if intrinsics.width_px == 0 || intrinsics.height_px == 0 {
            return Err(FusionError::Calibration(format!(
                "image size {}x{}",
                intrinsics.width_px, intrinsics.height_px
            )));
        }
        if intrinsics.f_x_px <= 0.0 || intrinsics.f_y_px <= 0.0 {
            return Err(FusionError::Calibration("focal length must be positive".to_string()));
        }
        Ok(())
    }
}
