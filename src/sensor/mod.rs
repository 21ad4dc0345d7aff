//! Sensor sample types and the sensor clock.

pub mod clock;
pub mod image;
pub mod sample;

pub use clock::{SensorClock, Timestamp};
pub use image::{ImageFrame, ImageView};
pub use sample::{AccelerometerSample, GyroSample, SensorSample};
