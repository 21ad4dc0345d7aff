//! Host-facing layer: the fusion facade, its shared outputs and the
//! offline replay driver.

pub mod messages;
pub mod replay;
mod sensor_fusion;
pub mod shared_state;

pub use messages::FusionEvent;
pub use replay::{Replay, ReplayResult};
pub use sensor_fusion::{FusionSink, SensorFusion};
pub use shared_state::{SharedState, Snapshot};
