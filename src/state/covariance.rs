//! Dense symmetric state covariance over the indexed leaves.

use nalgebra::{DMatrix, DVector};

use crate::error::{FusionError, Result};
use crate::numerics::kalman::symmetrize_upper;
use crate::numerics::MAX_STATE_SIZE;

/// Where row `i` of the remapped covariance comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemapEntry {
    /// Row in the current covariance, `None` for a newly added parameter.
    pub old_index: Option<usize>,
    pub initial_variance: f64,
    pub process_noise: f64,
}

/// Covariance storage sized once for the largest supported state.
///
/// Only the leading `size × size` block is meaningful. Rows are added and
/// removed exclusively through [`Covariance::remap`].
pub struct Covariance {
    cov: DMatrix<f64>,
    scratch: DMatrix<f64>,
    process_noise: DVector<f64>,
    size: usize,
}

impl Covariance {
    pub fn new() -> Self {
        Self::with_capacity(MAX_STATE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cov: DMatrix::zeros(capacity, capacity),
            scratch: DMatrix::zeros(capacity, capacity),
            process_noise: DVector::zeros(capacity),
            size: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cov.nrows()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.cov[(i, j)]
    }

    /// Sets both `(i, j)` and `(j, i)`.
    pub fn set(&mut self, i: usize, j: usize, value: f64) {
        self.cov[(i, j)] = value;
        self.cov[(j, i)] = value;
    }

    pub fn variance(&self, index: usize) -> f64 {
        self.cov[(index, index)]
    }

    pub fn process_noise(&self, index: usize) -> f64 {
        self.process_noise[index]
    }

    /// Full backing matrix, used by the Kalman update on its leading block.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.cov
    }

    pub fn matrix_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.cov
    }

    /// Rebuilds the covariance so row `i` corresponds to `entries[i]`.
    ///
    /// Surviving parameters keep their covariance with every other survivor;
    /// new parameters start uncorrelated at their initial variance; rows not
    /// referenced by any entry are gone.
    pub fn remap(&mut self, entries: &[RemapEntry]) -> Result<()> {
        let n = entries.len();
        if n > self.capacity() {
            return Err(FusionError::StateOverflow {
                size: n,
                capacity: self.capacity(),
            });
        }

        for (i, row) in entries.iter().enumerate() {
            for (j, col) in entries.iter().enumerate().take(i + 1) {
                let value = match (row.old_index, col.old_index) {
                    (Some(a), Some(b)) => self.cov[(a, b)],
                    _ if i == j => row.initial_variance,
                    _ => 0.0,
                };
                self.scratch[(i, j)] = value;
                self.scratch[(j, i)] = value;
            }
        }
        std::mem::swap(&mut self.cov, &mut self.scratch);

        for (i, entry) in entries.iter().enumerate() {
            self.process_noise[i] = entry.process_noise;
        }
        self.size = n;
        Ok(())
    }

    /// Decorrelates `variances.len()` rows starting at `index` and sets their
    /// diagonal.
    pub fn reset_block(&mut self, index: usize, variances: &[f64]) {
        let n = self.size;
        for (k, &variance) in variances.iter().enumerate() {
            let r = index + k;
            for j in 0..n {
                self.cov[(r, j)] = 0.0;
                self.cov[(j, r)] = 0.0;
            }
            self.cov[(r, r)] = variance;
        }
    }

    /// Makes rows `dst..dst+len` a copy of rows `src..src+len`, including the
    /// cross covariance between the two blocks, so the new parameter starts
    /// fully correlated with the one it was cloned from.
    pub fn copy_block(&mut self, dst: usize, src: usize, len: usize) {
        let n = self.size;
        for k in 0..len {
            for j in 0..n {
                if (dst..dst + len).contains(&j) {
                    continue;
                }
                let value = self.cov[(src + k, j)];
                self.cov[(dst + k, j)] = value;
                self.cov[(j, dst + k)] = value;
            }
        }
        for a in 0..len {
            for b in 0..len {
                self.cov[(dst + a, dst + b)] = self.cov[(src + a, src + b)];
            }
        }
    }

    pub fn perturb(&mut self, index: usize, factor: f64) {
        self.cov[(index, index)] *= factor;
    }

    pub fn add_process_noise(&mut self, dt: f64) {
        for i in 0..self.size {
            self.cov[(i, i)] += self.process_noise[i] * dt;
        }
    }

    pub fn symmetrize(&mut self) {
        symmetrize_upper(&mut self.cov, self.size);
    }

    /// Fails on the first non-finite or negative diagonal entry.
    pub fn check_diagonal(&self) -> Result<()> {
        for i in 0..self.size {
            let value = self.cov[(i, i)];
            if !value.is_finite() || value < 0.0 {
                return Err(FusionError::InvalidCovariance { index: i, value });
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.cov.view_mut((0, 0), (self.size, self.size)).fill(0.0);
        self.size = 0;
    }
}

impl Default for Covariance {
    fn default() -> Self {
        Self::new()
    }
}
