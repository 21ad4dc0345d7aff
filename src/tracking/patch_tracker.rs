//! Frame-to-frame tracking by normalized cross-correlation of small patches.

use std::collections::HashMap;

use nalgebra::Vector2;

use crate::sensor::ImageView;
use crate::state::FeatureId;

use super::fast::FastDetector;
use super::{FeatureTracker, TrackRequest};

const HALF_PATCH: i64 = 3;
const PATCH_AREA: usize = ((2 * HALF_PATCH + 1) * (2 * HALF_PATCH + 1)) as usize;

/// Scores below this are not a match.
const MIN_MATCH: f32 = 0.4;
/// Scores above this end the search early.
const GOOD_MATCH: f32 = 0.75;
const SEARCH_RADIUS: i64 = 5;

#[derive(Clone)]
struct Patch {
    /// Zero-mean pixel values.
    pixels: [f32; PATCH_AREA],
    norm: f32,
}

impl Patch {
    fn sample(image: &ImageView<'_>, x: i64, y: i64) -> Option<Self> {
        if !image.contains(x, y, HALF_PATCH) {
            return None;
        }
        let mut pixels = [0.0f32; PATCH_AREA];
        let mut k = 0;
        for dy in -HALF_PATCH..=HALF_PATCH {
            for dx in -HALF_PATCH..=HALF_PATCH {
                pixels[k] = image.at((x + dx) as usize, (y + dy) as usize) as f32;
                k += 1;
            }
        }
        let mean = pixels.iter().sum::<f32>() / PATCH_AREA as f32;
        let mut norm = 0.0;
        for p in pixels.iter_mut() {
            *p -= mean;
            norm += *p * *p;
        }
        Some(Self {
            pixels,
            norm: norm.sqrt(),
        })
    }

    fn correlate(&self, other: &Patch) -> f32 {
        let denominator = self.norm * other.norm;
        if denominator < 1e-3 {
            return 0.0;
        }
        let dot: f32 = self.pixels.iter().zip(other.pixels.iter()).map(|(a, b)| a * b).sum();
        dot / denominator
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackMatch {
    pub position: Vector2<f64>,
    pub score: f32,
}

/// FAST detection plus NCC patch search.
pub struct PatchTracker {
    detector: FastDetector,
    patches: HashMap<FeatureId, Patch>,
}

impl PatchTracker {
    pub fn new(detector: FastDetector) -> Self {
        Self {
            detector,
            patches: HashMap::new(),
        }
    }

    pub fn track_count(&self) -> usize {
        self.patches.len()
    }

    /// Best match for `patch` within `radius` pixels of `center`, refined to
    /// sub-pixel precision. `None` if nothing scores above `min_score`.
    fn search(&self, image: &ImageView<'_>, patch: &Patch, center: &Vector2<f64>, radius: i64, min_score: f32) -> Option<TrackMatch> {
        if !center.x.is_finite() || !center.y.is_finite() {
            return None;
        }
        let cx = center.x.round() as i64;
        let cy = center.y.round() as i64;

        let mut best: Option<(i64, i64, f32)> = None;
        for y in cy - radius..=cy + radius {
            for x in cx - radius..=cx + radius {
                let Some(candidate) = Patch::sample(image, x, y) else {
                    continue;
                };
                let score = patch.correlate(&candidate);
                if best.map_or(true, |(_, _, s)| score > s) {
                    best = Some((x, y, score));
                }
            }
        }

        let (x, y, score) = best?;
        if score < min_score {
            return None;
        }

        let score_at = |x: i64, y: i64| Patch::sample(image, x, y).map(|p| patch.correlate(&p));
        let offset = |minus: Option<f32>, plus: Option<f32>| match (minus, plus) {
            (Some(m), Some(p)) => {
                let curvature = m - 2.0 * score + p;
                if curvature < 0.0 {
                    (0.5 * (m - p) / curvature).clamp(-0.5, 0.5) as f64
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        let dx = offset(score_at(x - 1, y), score_at(x + 1, y));
        let dy = offset(score_at(x, y - 1), score_at(x, y + 1));

        Some(TrackMatch {
            position: Vector2::new(x as f64 + dx, y as f64 + dy),
            score,
        })
    }
}

impl Default for PatchTracker {
    fn default() -> Self {
        Self::new(FastDetector::default())
    }
}

impl FeatureTracker for PatchTracker {
    fn detect(&mut self, image: &ImageView<'_>, existing: &[Vector2<f64>], max: usize) -> Vec<Vector2<f64>> {
        self.detector
            .detect(image, existing, max)
            .iter()
            .map(|corner| corner.position())
            .collect()
    }

    fn add_track(&mut self, image: &ImageView<'_>, id: FeatureId, position: &Vector2<f64>) -> bool {
        match Patch::sample(image, position.x.round() as i64, position.y.round() as i64) {
            Some(patch) => {
                self.patches.insert(id, patch);
                true
            }
            None => false,
        }
    }

    /// Searches around the velocity extrapolation first, then the filter
    /// prediction, then the last position.
    fn track(&mut self, image: &ImageView<'_>, request: &TrackRequest) -> Option<Vector2<f64>> {
        let patch = self.patches.get(&request.id)?;

        let mut best = self.search(image, patch, &(request.current + request.velocity), SEARCH_RADIUS, MIN_MATCH);
        let threshold = |best: &Option<TrackMatch>| best.map_or(MIN_MATCH, |m| m.score);

        if best.map_or(true, |m| m.score < GOOD_MATCH) {
            let candidate = self.search(image, patch, &request.prediction, SEARCH_RADIUS, threshold(&best));
            if candidate.is_some_and(|c| best.map_or(true, |b| c.score > b.score)) {
                best = candidate;
            }
        }
        if best.is_none() {
            best = self.search(image, patch, &request.current, SEARCH_RADIUS, MIN_MATCH);
        }
        best.map(|m| m.position)
    }

    fn drop_track(&mut self, id: FeatureId) {
        self.patches.remove(&id);
    }

    fn reset(&mut self) {
        self.patches.clear();
    }
}
