//! Flat pre-10 calibration layout: one number per key.

use nalgebra::Vector3;
use serde_json::Value;

use crate::error::{FusionError, Result};

use super::{
    Calibration, CameraCalibration, CameraIntrinsics, Distortion, Extrinsics, ImuCalibration, InertialIntrinsics,
    CALIBRATION_VERSION,
};

fn number(value: &Value, key: &str) -> Result<f64> {
    value
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| FusionError::MissingKey(key.to_string()))
}

/// `prefix0`, `prefix1`, `prefix2` as a vector.
fn triple(value: &Value, prefix: &str) -> Result<Vector3<f64>> {
    Ok(Vector3::new(
        number(value, &format!("{}0", prefix))?,
        number(value, &format!("{}1", prefix))?,
        number(value, &format!("{}2", prefix))?,
    ))
}

/// Converts a legacy record. Legacy IMUs always sit at the body origin.
pub(super) fn upgrade(value: &Value) -> Result<Calibration> {
    let width = number(value, "imageWidth")?;
    let height = number(value, "imageHeight")?;
    let k = triple(value, "K")?;

    let camera = CameraCalibration {
        intrinsics: CameraIntrinsics {
            width_px: width as u32,
            height_px: height as u32,
            f_x_px: number(value, "Fx")?,
            f_y_px: number(value, "Fy")?,
            c_x_px: number(value, "Cx")?,
            c_y_px: number(value, "Cy")?,
            distortion: Distortion::Polynomial3 { k: [k.x, k.y, k.z] },
        },
        extrinsics: Extrinsics {
            t: triple(value, "Tc")?,
            t_variance: triple(value, "TcVar")?,
            w: triple(value, "Wc")?,
            w_variance: triple(value, "WcVar")?,
        },
    };

    let mut accelerometer = InertialIntrinsics::new(0.0, number(value, "aMeasVar")?);
    accelerometer.bias = triple(value, "abias")?;
    accelerometer.bias_variance = triple(value, "abiasvar")?;
    let mut gyroscope = InertialIntrinsics::new(0.0, number(value, "wMeasVar")?);
    gyroscope.bias = triple(value, "wbias")?;
    gyroscope.bias_variance = triple(value, "wbiasvar")?;

    Ok(Calibration {
        device_id: value.get("device").and_then(Value::as_str).unwrap_or_default().to_string(),
        device_type: "legacy".to_string(),
        version: CALIBRATION_VERSION,
        cameras: vec![camera],
        depths: Vec::new(),
        imus: vec![ImuCalibration {
            accelerometer,
            gyroscope,
            extrinsics: Extrinsics::identity(),
        }],
    })
}
