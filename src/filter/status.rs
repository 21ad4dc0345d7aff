//! Run state, failure flags and the status they aggregate into.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sensor::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Inactive,
    /// Device face up on a surface, refining biases.
    StaticCalibration,
    /// Device on its long edge.
    PortraitCalibration,
    /// Device on its short edge.
    LandscapeCalibration,
    /// Waiting for the device to be held still before tracking.
    SteadyInitialization,
    /// Waiting for tilt to converge while the device moves.
    DynamicInitialization,
    /// Orientation only, no translation or vision.
    InertialOnly,
    Running,
}

impl RunState {
    pub fn is_calibrating(&self) -> bool {
        matches!(
            self,
            RunState::StaticCalibration | RunState::PortraitCalibration | RunState::LandscapeCalibration
        )
    }

    pub fn is_initializing(&self) -> bool {
        matches!(self, RunState::SteadyInitialization | RunState::DynamicInitialization)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Inactive => "inactive",
            RunState::StaticCalibration => "static calibration",
            RunState::PortraitCalibration => "portrait calibration",
            RunState::LandscapeCalibration => "landscape calibration",
            RunState::SteadyInitialization => "steady initialization",
            RunState::DynamicInitialization => "dynamic initialization",
            RunState::InertialOnly => "inertial only",
            RunState::Running => "running",
        };
        f.write_str(name)
    }
}

/// Error reported with the status, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[default]
    None,
    Vision,
    TooFast,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    #[default]
    None,
    Low,
    Medium,
    High,
}

/// Sticky failure indicators. Only a reinitialization clears all of them;
/// vision failures also clear once features are detected again.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FailureFlags {
    pub detector_failed: bool,
    /// Set when every tracked feature is lost while running. Cleared as soon
    /// as a new group is added, the same way detection clears `detector_failed`.
    pub tracker_failed: bool,
    pub speed_failed: bool,
    pub speed_warning: bool,
    pub numeric_failed: bool,
    /// Set by anything that invalidates the calibration estimated so far.
    pub calibration_bad: bool,
    pub speed_warning_time: Timestamp,
}

impl FailureFlags {
    pub fn error(&self) -> ErrorCode {
        if self.numeric_failed {
            ErrorCode::Other
        } else if self.speed_failed {
            ErrorCode::TooFast
        } else if self.detector_failed || self.tracker_failed {
            ErrorCode::Vision
        } else {
            ErrorCode::None
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// What the host sees after each tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Status {
    pub run_state: RunState,
    pub error: ErrorCode,
    pub confidence: Confidence,
    /// Calibration or initialization progress in `[0, 1]`.
    pub progress: f64,
}

impl Status {
    pub fn new(run_state: RunState, error: ErrorCode, converged: bool, progress: f64) -> Self {
        let confidence = if run_state != RunState::Running {
            Confidence::None
        } else if error == ErrorCode::Vision {
            Confidence::Low
        } else if converged {
            Confidence::High
        } else {
            Confidence::Medium
        };
        Self {
            run_state,
            error,
            confidence,
            progress,
        }
    }

    /// Calibration finished: the filter went back to inactive on its own,
    /// without an error.
    pub fn finished_calibration(previous: &Status, current: &Status) -> bool {
        previous.run_state.is_calibrating()
            && current.run_state == RunState::Inactive
            && current.error == ErrorCode::None
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} error={:?} confidence={:?} progress={:.2}",
            self.run_state, self.error, self.confidence, self.progress
        )
    }
}
