//! Serde schema of the current calibration format.
//!
//! Arrays are read as plain lists and length-checked on conversion so that a
//! short array reports which key was wrong.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{FusionError, Result};

use super::{
    Calibration, CameraCalibration, CameraIntrinsics, Distortion, Extrinsics, ImuCalibration, InertialIntrinsics,
    CALIBRATION_VERSION,
};

pub(super) const KEY_VERSION: &str = "calibration_version";
pub(super) const KEY_LEGACY_VERSION: &str = "calibrationVersion";

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct CalibrationDocument {
    device_id: String,
    device_type: String,
    calibration_version: u32,
    cameras: Vec<CameraDocument>,
    #[serde(default)]
    depths: Vec<CameraDocument>,
    imus: Vec<ImuDocument>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExtrinsicsDocument {
    #[serde(rename = "T")]
    t: Vec<f64>,
    #[serde(rename = "T_variance")]
    t_variance: Vec<f64>,
    #[serde(rename = "W")]
    w: Vec<f64>,
    #[serde(rename = "W_variance")]
    w_variance: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DistortionDocument {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    k: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    w: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CameraDocument {
    size_px: Vec<u32>,
    center_px: Vec<f64>,
    focal_length_px: Vec<f64>,
    distortion: DistortionDocument,
    extrinsics: ExtrinsicsDocument,
}

#[derive(Debug, Serialize, Deserialize)]
struct InertialDocument {
    scale_and_alignment: Vec<f64>,
    bias: Vec<f64>,
    bias_variance: Vec<f64>,
    measurement_variance: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ImuDocument {
    accelerometer: InertialDocument,
    gyroscope: InertialDocument,
    extrinsics: ExtrinsicsDocument,
}

/// Version of a parsed document, from either the current or the legacy key.
pub(super) fn version_of(value: &serde_json::Value) -> Result<u32> {
    value
        .get(KEY_VERSION)
        .or_else(|| value.get(KEY_LEGACY_VERSION))
        .and_then(serde_json::Value::as_u64)
        .map(|v| v as u32)
        .ok_or_else(|| FusionError::MissingKey(KEY_VERSION.to_string()))
}

pub(super) fn from_value(value: serde_json::Value) -> Result<Calibration> {
    let document: CalibrationDocument = serde_json::from_value(value)?;
    Ok(Calibration {
        device_id: document.device_id,
        device_type: document.device_type,
        version: document.calibration_version,
        cameras: document.cameras.iter().map(camera_from).collect::<Result<_>>()?,
        depths: document.depths.iter().map(camera_from).collect::<Result<_>>()?,
        imus: document.imus.iter().map(imu_from).collect::<Result<_>>()?,
    })
}

pub(super) fn to_document(calibration: &Calibration) -> CalibrationDocument {
    CalibrationDocument {
        device_id: calibration.device_id.clone(),
        device_type: calibration.device_type.clone(),
        calibration_version: CALIBRATION_VERSION,
        cameras: calibration.cameras.iter().map(camera_to).collect(),
        depths: calibration.depths.iter().map(camera_to).collect(),
        imus: calibration.imus.iter().map(imu_to).collect(),
    }
}

fn array<const N: usize, T: Copy + Default>(key: &str, values: &[T]) -> Result<[T; N]> {
    if values.len() != N {
        return Err(FusionError::ArrayLength {
            key: key.to_string(),
            expected: N,
            actual: values.len(),
        });
    }
    let mut out = [T::default(); N];
    out.copy_from_slice(values);
    Ok(out)
}

fn vector(key: &str, values: &[f64]) -> Result<Vector3<f64>> {
    Ok(Vector3::from(array::<3, f64>(key, values)?))
}

fn extrinsics_from(doc: &ExtrinsicsDocument) -> Result<Extrinsics> {
    Ok(Extrinsics {
        t: vector("T", &doc.t)?,
        t_variance: vector("T_variance", &doc.t_variance)?,
        w: vector("W", &doc.w)?,
        w_variance: vector("W_variance", &doc.w_variance)?,
    })
}

fn extrinsics_to(extrinsics: &Extrinsics) -> ExtrinsicsDocument {
    ExtrinsicsDocument {
        t: extrinsics.t.as_slice().to_vec(),
        t_variance: extrinsics.t_variance.as_slice().to_vec(),
        w: extrinsics.w.as_slice().to_vec(),
        w_variance: extrinsics.w_variance.as_slice().to_vec(),
    }
}

fn distortion_from(doc: &DistortionDocument) -> Result<Distortion> {
    match doc.kind.as_str() {
        "undistorted" => Ok(Distortion::Undistorted),
        "polynomial" => {
            let k = doc.k.as_ref().ok_or_else(|| FusionError::MissingKey("distortion.k".to_string()))?;
            Ok(Distortion::Polynomial3 { k: array("distortion.k", k)? })
        }
        "fisheye" => {
            let w = doc.w.ok_or_else(|| FusionError::MissingKey("distortion.w".to_string()))?;
            Ok(Distortion::Fisheye { w })
        }
        other => Err(FusionError::Calibration(format!("unknown distortion type \"{}\"", other))),
    }
}

fn distortion_to(distortion: &Distortion) -> DistortionDocument {
    match *distortion {
        Distortion::Undistorted => DistortionDocument {
            kind: "undistorted".to_string(),
            k: None,
            w: None,
        },
        Distortion::Polynomial3 { k } => DistortionDocument {
            kind: "polynomial".to_string(),
            k: Some(k.to_vec()),
            w: None,
        },
        Distortion::Fisheye { w } => DistortionDocument {
            kind: "fisheye".to_string(),
            k: None,
            w: Some(w),
        },
    }
}

fn camera_from(doc: &CameraDocument) -> Result<CameraCalibration> {
    let [width_px, height_px] = array::<2, u32>("size_px", &doc.size_px)?;
    let [c_x_px, c_y_px] = array::<2, f64>("center_px", &doc.center_px)?;
    let [f_x_px, f_y_px] = array::<2, f64>("focal_length_px", &doc.focal_length_px)?;
    Ok(CameraCalibration {
        intrinsics: CameraIntrinsics {
            width_px,
            height_px,
            f_x_px,
            f_y_px,
            c_x_px,
            c_y_px,
            distortion: distortion_from(&doc.distortion)?,
        },
        extrinsics: extrinsics_from(&doc.extrinsics)?,
    })
}

fn camera_to(camera: &CameraCalibration) -> CameraDocument {
    let intrinsics = &camera.intrinsics;
    CameraDocument {
        size_px: vec![intrinsics.width_px, intrinsics.height_px],
        center_px: vec![intrinsics.c_x_px, intrinsics.c_y_px],
        focal_length_px: vec![intrinsics.f_x_px, intrinsics.f_y_px],
        distortion: distortion_to(&intrinsics.distortion),
        extrinsics: extrinsics_to(&camera.extrinsics),
    }
}

fn inertial_from(doc: &InertialDocument) -> Result<InertialIntrinsics> {
    let scale: [f64; 9] = array("scale_and_alignment", &doc.scale_and_alignment)?;
    Ok(InertialIntrinsics {
        scale_and_alignment: Matrix3::from_row_slice(&scale),
        bias: vector("bias", &doc.bias)?,
        bias_variance: vector("bias_variance", &doc.bias_variance)?,
        measurement_variance: doc.measurement_variance,
    })
}

fn inertial_to(intrinsics: &InertialIntrinsics) -> InertialDocument {
    let m = &intrinsics.scale_and_alignment;
    InertialDocument {
        scale_and_alignment: (0..3).flat_map(|r| (0..3).map(move |c| m[(r, c)])).collect(),
        bias: intrinsics.bias.as_slice().to_vec(),
        bias_variance: intrinsics.bias_variance.as_slice().to_vec(),
        measurement_variance: intrinsics.measurement_variance,
    }
}

fn imu_from(doc: &ImuDocument) -> Result<ImuCalibration> {
    Ok(ImuCalibration {
        accelerometer: inertial_from(&doc.accelerometer)?,
        gyroscope: inertial_from(&doc.gyroscope)?,
        extrinsics: extrinsics_from(&doc.extrinsics)?,
    })
}

fn imu_to(imu: &ImuCalibration) -> ImuDocument {
    ImuDocument {
        accelerometer: inertial_to(&imu.accelerometer),
        gyroscope: inertial_to(&imu.gyroscope),
        extrinsics: extrinsics_to(&imu.extrinsics),
    }
}
