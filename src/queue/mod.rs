//! Multi-sensor synchronization queue.
//!
//! Camera, accelerometer and gyroscope samples arrive on independent clocks
//! and rates. The queue buffers each stream in a bounded ring and releases
//! samples to a [`SensorSink`] in non-decreasing timestamp order, one at a
//! time, from a single dispatch context.

mod fusion_queue;
mod stream;

use serde::{Deserialize, Serialize};

use crate::sensor::{AccelerometerSample, GyroSample, ImageFrame};

pub use fusion_queue::{FusionQueue, QueueStats};
pub use stream::StreamStats;

/// Trade-off between dispatch latency and completeness of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyStrategy {
    /// Dispatch immediately. Streams with higher transport latency lose all data.
    EliminateLatency,
    /// Wait only for samples that are due and not yet late.
    MinimizeLatency,
    /// Buffer until a camera frame arrives, then dispatch everything before it.
    /// Without a camera this behaves like `MinimizeDrops`.
    ImageTrigger,
    /// Wait for camera frames; inertial data may be dropped once late.
    Balanced,
    /// Wait for every sample that is due.
    MinimizeDrops,
    /// Never dispatch while a configured stream is empty.
    EliminateDrops,
}

/// Receiver of dispatched samples. Called from exactly one thread at a time.
pub trait SensorSink: Send + 'static {
    fn receive_camera(&mut self, frame: ImageFrame);
    fn receive_accelerometer(&mut self, sample: AccelerometerSample);
    fn receive_gyro(&mut self, sample: GyroSample);
}
