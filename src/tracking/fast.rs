//! FAST-9 corner detection with Harris scoring and grid non-maximum
//! suppression.

use std::collections::HashMap;

use nalgebra::Vector2;

use crate::sensor::ImageView;

/// 16-pixel Bresenham circle of radius 3, clockwise from the top.
const CIRCLE: [(i64, i64); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

const ARC_LENGTH: usize = 9;
const HARRIS_K: f32 = 0.04;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corner {
    pub x: usize,
    pub y: usize,
    /// Harris response.
    pub response: f32,
}

impl Corner {
    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.x as f64, self.y as f64)
    }
}

pub struct FastDetector {
    /// Intensity difference for a circle pixel to count as brighter/darker.
    pub threshold: u8,
    /// Side of the suppression cells in pixels.
    pub grid_size: usize,
    /// Corners closer than this to the image edge are ignored.
    pub border: usize,
}

impl Default for FastDetector {
    fn default() -> Self {
        Self {
            threshold: 20,
            grid_size: 16,
            border: 12,
        }
    }
}

impl FastDetector {
    pub fn new(threshold: u8, grid_size: usize, border: usize) -> Self {
        Self {
            threshold,
            grid_size: grid_size.max(1),
            border: border.max(4),
        }
    }

    /// Strongest corners, at most one per grid cell and none in a cell that
    /// already holds one of `occupied`, best first.
    pub fn detect(&self, image: &ImageView<'_>, occupied: &[Vector2<f64>], max: usize) -> Vec<Corner> {
        let border = self.border.max(4);
        if max == 0 || image.width <= 2 * border || image.height <= 2 * border {
            return Vec::new();
        }

        let cell_of = |x: usize, y: usize| (x / self.grid_size, y / self.grid_size);
        let blocked: Vec<(usize, usize)> = occupied
            .iter()
            .filter(|p| p.x >= 0.0 && p.y >= 0.0)
            .map(|p| cell_of(p.x as usize, p.y as usize))
            .collect();

        let mut grid: HashMap<(usize, usize), Corner> = HashMap::new();
        for y in border..image.height - border {
            for x in border..image.width - border {
                let cell = cell_of(x, y);
                if blocked.contains(&cell) || !self.is_corner(image, x, y) {
                    continue;
                }
                let corner = Corner {
                    x,
                    y,
                    response: harris_response(image, x, y),
                };
                match grid.get(&cell) {
                    Some(existing) if existing.response >= corner.response => {}
                    _ => {
                        grid.insert(cell, corner);
                    }
                }
            }
        }

        let mut corners: Vec<Corner> = grid.into_values().collect();
        corners.sort_by(|a, b| {
            b.response
                .total_cmp(&a.response)
                .then(a.y.cmp(&b.y))
                .then(a.x.cmp(&b.x))
        });
        corners.truncate(max);
        corners
    }

    fn is_corner(&self, image: &ImageView<'_>, x: usize, y: usize) -> bool {
        let center = image.at(x, y) as i16;
        let t = self.threshold as i16;
        let pixel = |i: usize| {
            let (dx, dy) = CIRCLE[i];
            image.at((x as i64 + dx) as usize, (y as i64 + dy) as usize) as i16
        };

        // a nine pixel arc always covers two of the four compass points
        let compass = [pixel(0), pixel(4), pixel(8), pixel(12)];
        let brighter = compass.iter().filter(|&&p| p > center + t).count();
        let darker = compass.iter().filter(|&&p| p < center - t).count();
        if brighter < 2 && darker < 2 {
            return false;
        }

        let ring: [i16; 16] = std::array::from_fn(pixel);
        longest_arc(&ring, |p| p > center + t) >= ARC_LENGTH
            || longest_arc(&ring, |p| p < center - t) >= ARC_LENGTH
    }
}

fn longest_arc(ring: &[i16; 16], pass: impl Fn(i16) -> bool) -> usize {
    let mut run = 0;
    let mut longest = 0;
    // twice around to catch arcs that wrap
    for i in 0..32 {
        if pass(ring[i % 16]) {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    longest.min(16)
}

/// `det(M) - k·trace(M)²` of the structure tensor over a 7×7 window.
fn harris_response(image: &ImageView<'_>, x: usize, y: usize) -> f32 {
    let mut ixx = 0.0f32;
    let mut iyy = 0.0f32;
    let mut ixy = 0.0f32;
    for py in y - 3..=y + 3 {
        for px in x - 3..=x + 3 {
            let right = (px + 1).min(image.width - 1);
            let down = (py + 1).min(image.height - 1);
            let ix = (image.at(right, py) as f32 - image.at(px - 1, py) as f32) * 0.5;
            let iy = (image.at(px, down) as f32 - image.at(px, py - 1) as f32) * 0.5;
            ixx += ix * ix;
            iyy += iy * iy;
            ixy += ix * iy;
        }
    }
    let det = ixx * iyy - ixy * ixy;
    let trace = ixx + iyy;
    det - HARRIS_K * trace * trace
}
