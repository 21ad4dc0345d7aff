//! Batched Kalman update over pre-sized scratch storage.
//!
//! Observations write their Jacobian rows, innovations and measurement
//! variances into a [`KalmanScratch`]; [`KalmanScratch::update`] then computes
//! the gain through an in-place Cholesky factorization and applies the Joseph
//! form covariance update. Buffers are allocated once at construction so the
//! per-tick path never touches the heap.

use nalgebra::{DMatrix, DVector};

use crate::error::{FusionError, Result};

use super::{MAX_OBSERVATION_SIZE, MAX_STATE_SIZE};

/// Tolerance for rounding error on a covariance diagonal before it counts as
/// negative.
const NEGATIVE_VARIANCE_TOLERANCE: f64 = 1e-9;

pub struct KalmanScratch {
    /// Stacked measurement Jacobian (rows × cols).
    h: DMatrix<f64>,
    /// H·P
    lc: DMatrix<f64>,
    /// Innovation covariance, replaced by its Cholesky factor.
    s: DMatrix<f64>,
    /// S⁻¹·H·P, the transposed gain.
    gain_t: DMatrix<f64>,
    /// Lᵀ·gain_t, used for the K·S·Kᵀ term.
    y: DMatrix<f64>,
    innovation: DVector<f64>,
    measurement_variance: DVector<f64>,
    correction: DVector<f64>,
    column: DVector<f64>,
    rows: usize,
    cols: usize,
}

impl KalmanScratch {
    pub fn new() -> Self {
        Self::with_capacity(MAX_OBSERVATION_SIZE, MAX_STATE_SIZE)
    }

    pub fn with_capacity(max_rows: usize, max_cols: usize) -> Self {
        Self {
            h: DMatrix::zeros(max_rows, max_cols),
            lc: DMatrix::zeros(max_rows, max_cols),
            s: DMatrix::zeros(max_rows, max_rows),
            gain_t: DMatrix::zeros(max_rows, max_cols),
            y: DMatrix::zeros(max_rows, max_cols),
            innovation: DVector::zeros(max_rows),
            measurement_variance: DVector::zeros(max_rows),
            correction: DVector::zeros(max_cols),
            column: DVector::zeros(max_rows),
            rows: 0,
            cols: 0,
        }
    }

    pub fn max_rows(&self) -> usize {
        self.h.nrows()
    }

    pub fn max_cols(&self) -> usize {
        self.h.ncols()
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Prepares a `rows × cols` problem and clears the Jacobian block.
    pub fn begin(&mut self, rows: usize, cols: usize) -> Result<()> {
        if cols > self.max_cols() {
            return Err(FusionError::StateOverflow {
                size: cols,
                capacity: self.max_cols(),
            });
        }
        if rows > self.max_rows() {
            return Err(FusionError::StateOverflow {
                size: rows,
                capacity: self.max_rows(),
            });
        }
        self.rows = rows;
        self.cols = cols;
        self.h.view_mut((0, 0), (rows, cols)).fill(0.0);
        Ok(())
    }

    /// Adds `value` to H(row, col). Unindexed parameters pass `None`.
    #[inline]
    pub fn add_jacobian(&mut self, row: usize, col: Option<usize>, value: f64) {
        if let Some(col) = col {
            self.h[(row, col)] += value;
        }
    }

    #[inline]
    pub fn set_innovation(&mut self, row: usize, value: f64) {
        self.innovation[row] = value;
    }

    #[inline]
    pub fn set_measurement_variance(&mut self, row: usize, value: f64) {
        self.measurement_variance[row] = value;
    }

    /// State correction from the last successful update.
    pub fn correction(&self) -> &[f64] {
        &self.correction.as_slice()[..self.cols]
    }

    /// Runs the update against the leading `cols × cols` block of `cov`.
    ///
    /// On success `cov` holds the updated, symmetrized covariance and
    /// [`correction`](Self::correction) the state increment. On failure `cov`
    /// is untouched.
    pub fn update(&mut self, cov: &mut DMatrix<f64>) -> Result<()> {
        let (m, n) = (self.rows, self.cols);
        if m == 0 {
            self.correction.rows_mut(0, n).fill(0.0);
            return Ok(());
        }

        self.project_covariance(cov);
        self.innovation_covariance();
        cholesky_in_place(&mut self.s, m)?;
        self.solve_gain();

        for j in 0..n {
            let mut sum = 0.0;
            for r in 0..m {
                sum += self.gain_t[(r, j)] * self.innovation[r];
            }
            self.correction[j] = sum;
        }

        // Y = Lᵀ·X so that K·S·Kᵀ = Yᵀ·Y
        for j in 0..n {
            for r in 0..m {
                let mut sum = 0.0;
                for k in r..m {
                    sum += self.s[(k, r)] * self.gain_t[(k, j)];
                }
                self.y[(r, j)] = sum;
            }
        }

        // Validate before committing so a failure leaves `cov` intact.
        for i in 0..n {
            let value = self.joseph_entry(cov, i, i);
            if !value.is_finite() || value < -NEGATIVE_VARIANCE_TOLERANCE {
                return Err(FusionError::InvalidCovariance { index: i, value });
            }
        }

        for j in 0..n {
            for i in 0..=j {
                let mut value = self.joseph_entry(cov, i, j);
                if i == j && value < 0.0 {
                    value = 0.0;
                }
                cov[(i, j)] = value;
            }
        }
        symmetrize_upper(cov, n);
        Ok(())
    }

    /// LC = H·P, skipping structurally zero Jacobian entries.
    fn project_covariance(&mut self, cov: &DMatrix<f64>) {
        let (m, n) = (self.rows, self.cols);
        self.lc.view_mut((0, 0), (m, n)).fill(0.0);
        for i in 0..m {
            for k in 0..n {
                let h = self.h[(i, k)];
                if h == 0.0 {
                    continue;
                }
                for j in 0..n {
                    self.lc[(i, j)] += h * cov[(k, j)];
                }
            }
        }
    }

    /// S = LC·Hᵀ + R, built from the lower triangle and mirrored.
    fn innovation_covariance(&mut self) {
        let (m, n) = (self.rows, self.cols);
        for i in 0..m {
            for j in 0..=i {
                let mut sum = 0.0;
                for k in 0..n {
                    let h = self.h[(j, k)];
                    if h != 0.0 {
                        sum += self.lc[(i, k)] * h;
                    }
                }
                self.s[(i, j)] = sum;
            }
            self.s[(i, i)] += self.measurement_variance[i];
        }
        for i in 0..m {
            for j in (i + 1)..m {
                self.s[(i, j)] = self.s[(j, i)];
            }
        }
    }

    /// Solves S·X = LC column by column with the Cholesky factor.
    fn solve_gain(&mut self) {
        let (m, n) = (self.rows, self.cols);
        for j in 0..n {
            for r in 0..m {
                self.column[r] = self.lc[(r, j)];
            }
            solve_cholesky(&self.s, m, &mut self.column);
            for r in 0..m {
                self.gain_t[(r, j)] = self.column[r];
            }
        }
    }

    /// (P − K·LC − LCᵀ·Kᵀ + K·S·Kᵀ)(i, j)
    #[inline]
    fn joseph_entry(&self, cov: &DMatrix<f64>, i: usize, j: usize) -> f64 {
        let mut klc_ij = 0.0;
        let mut klc_ji = 0.0;
        let mut ksk = 0.0;
        for r in 0..self.rows {
            klc_ij += self.gain_t[(r, i)] * self.lc[(r, j)];
            klc_ji += self.gain_t[(r, j)] * self.lc[(r, i)];
            ksk += self.y[(r, i)] * self.y[(r, j)];
        }
        cov[(i, j)] - klc_ij - klc_ji + ksk
    }
}

impl Default for KalmanScratch {
    fn default() -> Self {
        Self::new()
    }
}

/// Copies the upper triangle of the leading `n × n` block onto the lower.
pub fn symmetrize_upper(cov: &mut DMatrix<f64>, n: usize) {
    for j in 0..n {
        for i in (j + 1)..n {
            cov[(i, j)] = cov[(j, i)];
        }
    }
}

/// Lower Cholesky factor of the leading `n × n` block, in place.
///
/// The strict upper triangle is left untouched and must be ignored by callers.
pub fn cholesky_in_place(a: &mut DMatrix<f64>, n: usize) -> Result<()> {
    for j in 0..n {
        let mut diag = a[(j, j)];
        for k in 0..j {
            diag -= a[(j, k)] * a[(j, k)];
        }
        if diag <= 0.0 || !diag.is_finite() {
            return Err(FusionError::CholeskyFailed { dim: n });
        }
        let l_jj = diag.sqrt();
        a[(j, j)] = l_jj;

        for i in (j + 1)..n {
            let mut sum = a[(i, j)];
            for k in 0..j {
                sum -= a[(i, k)] * a[(j, k)];
            }
            a[(i, j)] = sum / l_jj;
        }
    }
    Ok(())
}

/// Solves L·Lᵀ·x = b in place given the factor from [`cholesky_in_place`].
pub fn solve_cholesky(l: &DMatrix<f64>, n: usize, b: &mut DVector<f64>) {
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[(i, k)] * b[k];
        }
        b[i] = sum / l[(i, i)];
    }
    for i in (0..n).rev() {
        let mut sum = b[i];
        for k in (i + 1)..n {
            sum -= l[(k, i)] * b[k];
        }
        b[i] = sum / l[(i, i)];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cholesky_reconstructs_matrix() {
        let original = DMatrix::from_row_slice(3, 3, &[
            4.0, 12.0, -16.0,
            12.0, 37.0, -43.0,
            -16.0, -43.0, 98.0,
        ]);
        let mut a = original.clone();
        cholesky_in_place(&mut a, 3).unwrap();
        let l = a.lower_triangle();
        assert_relative_eq!(&l * l.transpose(), original, epsilon = 1e-10);
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        let mut a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(matches!(
            cholesky_in_place(&mut a, 2),
            Err(FusionError::CholeskyFailed { dim: 2 })
        ));
    }

    #[test]
    fn test_solve_matches_inverse() {
        let original = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let mut a = original.clone();
        cholesky_in_place(&mut a, 2).unwrap();
        let mut b = DVector::from_vec(vec![1.0, 2.0]);
        solve_cholesky(&a, 2, &mut b);
        assert_relative_eq!(&original * &b, DVector::from_vec(vec![1.0, 2.0]), epsilon = 1e-12);
    }

    #[test]
    fn test_scalar_update_matches_closed_form() {
        // Direct observation of state 0 with variance r.
        let mut cov = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
        let mut scratch = KalmanScratch::with_capacity(4, 4);
        scratch.begin(1, 2).unwrap();
        scratch.add_jacobian(0, Some(0), 1.0);
        scratch.set_innovation(0, 1.0);
        scratch.set_measurement_variance(0, 2.0);
        scratch.update(&mut cov).unwrap();

        // K = P Hᵀ / (P00 + r) = [0.5, 0.125]
        assert_relative_eq!(scratch.correction()[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(scratch.correction()[1], 0.125, epsilon = 1e-12);
        assert_relative_eq!(cov[(0, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(cov[(0, 1)], 0.25, epsilon = 1e-12);
        assert_relative_eq!(cov[(1, 1)], 1.0 - 0.0625, epsilon = 1e-12);
    }

    #[test]
    fn test_update_keeps_covariance_symmetric() {
        let n = 6;
        let mut cov = DMatrix::<f64>::identity(n, n);
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    cov[(i, j)] = 0.1 / (1.0 + (i + j) as f64);
                }
            }
        }
        let mut scratch = KalmanScratch::with_capacity(8, 8);
        scratch.begin(3, n).unwrap();
        for r in 0..3 {
            scratch.add_jacobian(r, Some(r), 1.0);
            scratch.add_jacobian(r, Some(r + 3), -0.7);
            scratch.set_innovation(r, 0.1 * r as f64);
            scratch.set_measurement_variance(r, 0.5);
        }
        scratch.update(&mut cov).unwrap();

        for i in 0..n {
            assert!(cov[(i, i)] >= 0.0);
            for j in 0..n {
                assert!((cov[(i, j)] - cov[(j, i)]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_failed_update_leaves_covariance() {
        let mut cov = DMatrix::from_row_slice(1, 1, &[-5.0]);
        let mut scratch = KalmanScratch::with_capacity(2, 2);
        scratch.begin(1, 1).unwrap();
        scratch.add_jacobian(0, Some(0), 1.0);
        scratch.set_measurement_variance(0, 1.0);
        assert!(scratch.update(&mut cov).is_err());
        assert_relative_eq!(cov[(0, 0)], -5.0);
    }

    #[test]
    fn test_begin_rejects_oversize() {
        let mut scratch = KalmanScratch::with_capacity(2, 2);
        assert!(scratch.begin(3, 2).is_err());
        assert!(scratch.begin(2, 3).is_err());
    }
}
