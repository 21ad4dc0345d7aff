//! Events sent from the dispatch context to the host.

use crate::calibration::Calibration;
use crate::filter::{SampleKind, Status};
use crate::geometry::SE3;
use crate::sensor::Timestamp;

#[derive(Debug, Clone)]
pub enum FusionEvent {
    /// Body to world pose after a processed sample.
    Pose {
        time: Timestamp,
        pose: SE3,
        sample: SampleKind,
    },
    /// Sent only when the status differs from the previous one.
    Status(Status),
    /// Calibration ran to completion; carries the updated record.
    CalibrationFinished(Calibration),
}
