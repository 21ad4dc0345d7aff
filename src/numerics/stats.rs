//! Running mean and variance (Welford).

use nalgebra::Vector3;

/// Scalar running statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    pub count: u64,
    pub mean: f64,
    m2: f64,
    pub maximum: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        if self.count == 1 || x > self.maximum {
            self.maximum = x;
        }
    }

    /// Sample variance; zero until two values have been seen.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn stdev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Per-axis running statistics over 3-vectors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StdevVector {
    pub count: u32,
    pub mean: Vector3<f64>,
    m2: Vector3<f64>,
}

impl Default for StdevVector {
    fn default() -> Self {
        Self {
            count: 0,
            mean: Vector3::zeros(),
            m2: Vector3::zeros(),
        }
    }
}

impl StdevVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&mut self, x: &Vector3<f64>) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta.component_mul(&(x - self.mean));
    }

    pub fn variance(&self) -> Vector3<f64> {
        if self.count < 2 {
            Vector3::zeros()
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }
}
