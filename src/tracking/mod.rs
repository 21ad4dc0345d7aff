//! Feature detection and frame-to-frame tracking.
//!
//! The filter owns feature state; a tracker only knows pixel positions and
//! whatever appearance model it keeps per feature id.

pub mod fast;
pub mod patch_tracker;

use nalgebra::Vector2;

use crate::sensor::ImageView;
use crate::state::FeatureId;

pub use fast::{Corner, FastDetector};
pub use patch_tracker::PatchTracker;

/// Where to look for a feature in the next image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackRequest {
    pub id: FeatureId,
    /// Position in the previous image.
    pub current: Vector2<f64>,
    /// Pixel motion between the last two images.
    pub velocity: Vector2<f64>,
    /// Position predicted by the filter.
    pub prediction: Vector2<f64>,
}

pub trait FeatureTracker: Send {
    /// New feature positions, avoiding the neighborhoods of `existing`.
    fn detect(&mut self, image: &ImageView<'_>, existing: &[Vector2<f64>], max: usize) -> Vec<Vector2<f64>>;

    /// Starts tracking `id` from `position`. Returns false if the position
    /// cannot be tracked, e.g. too close to the border.
    fn add_track(&mut self, image: &ImageView<'_>, id: FeatureId, position: &Vector2<f64>) -> bool;

    /// Position of the feature in `image`, or `None` if lost.
    fn track(&mut self, image: &ImageView<'_>, request: &TrackRequest) -> Option<Vector2<f64>>;

    fn drop_track(&mut self, id: FeatureId);

    fn reset(&mut self);
}
