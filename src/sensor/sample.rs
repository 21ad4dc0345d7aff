use nalgebra::Vector3;

use super::Timestamp;

/// Anything the sensor queue can order by time.
pub trait SensorSample {
    fn timestamp(&self) -> Timestamp;
}

/// Single accelerometer measurement in the device frame (m/s²).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelerometerSample {
    pub timestamp: Timestamp,
    pub accel_m_s2: Vector3<f64>,
}

impl AccelerometerSample {
    pub fn new(timestamp: Timestamp, accel_m_s2: Vector3<f64>) -> Self {
        Self {
            timestamp,
            accel_m_s2,
        }
    }
}

impl SensorSample for AccelerometerSample {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Single gyroscope measurement in the device frame (rad/s).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GyroSample {
    pub timestamp: Timestamp,
    pub angvel_rad_s: Vector3<f64>,
}

impl GyroSample {
    pub fn new(timestamp: Timestamp, angvel_rad_s: Vector3<f64>) -> Self {
        Self {
            timestamp,
            angvel_rad_s,
        }
    }
}

impl SensorSample for GyroSample {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}
