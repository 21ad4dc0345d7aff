//! Numeric kernel: fixed-capacity Kalman update and running statistics.

pub mod kalman;
pub mod stats;

pub use kalman::KalmanScratch;
pub use stats::{RunningStats, StdevVector};

/// Largest supported filter state dimension.
pub const MAX_STATE_SIZE: usize = 120;

/// Largest supported stacked measurement dimension per tick.
pub const MAX_OBSERVATION_SIZE: usize = 2 * MAX_STATE_SIZE;
