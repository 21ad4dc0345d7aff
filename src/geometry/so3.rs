//! SO(3) helpers for the motion model and the measurement Jacobians.
//!
//! Orientation errors are expressed as left (world-frame) perturbations:
//! `R_true = exp(δθ) · R_est`.

use nalgebra::{Matrix3, Unit, UnitQuaternion, Vector3};

/// Below this rotation angle the Taylor expansions are used.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-6;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Exponential map from a rotation vector to a unit quaternion.
pub fn exp_so3(phi: &Vector3<f64>) -> UnitQuaternion<f64> {
    if phi.norm() < SMALL_ANGLE_THRESHOLD {
        // q ≈ (1, φ/2), renormalized
        return UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
            1.0,
            0.5 * phi.x,
            0.5 * phi.y,
            0.5 * phi.z,
        ));
    }
    UnitQuaternion::from_scaled_axis(*phi)
}

/// Right Jacobian Jr(φ) of SO(3).
///
/// ```text
/// Jr(φ) = I - (1 - cos|φ|)/|φ|² [φ]× + (|φ| - sin|φ|)/|φ|³ [φ]×²
/// ```
///
/// Near zero the second-order expansion `I - ½[φ]× + ⅙[φ]×²` is used.
pub fn right_jacobian_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let skew_phi = skew(phi);
    let skew_phi_sq = skew_phi * skew_phi;

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() - 0.5 * skew_phi + (1.0 / 6.0) * skew_phi_sq;
    }

    let theta_sq = theta * theta;
    Matrix3::identity() - ((1.0 - theta.cos()) / theta_sq) * skew_phi
        + ((theta - theta.sin()) / (theta_sq * theta)) * skew_phi_sq
}

/// Smallest rotation taking direction `from` onto direction `to`.
///
/// Antiparallel inputs have no unique answer; a half turn about the x axis
/// is returned.
pub fn rotation_between(from: &Vector3<f64>, to: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::rotation_between(from, to).unwrap_or_else(|| {
        UnitQuaternion::from_axis_angle(&Unit::new_normalize(Vector3::x()), std::f64::consts::PI)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);

        assert_relative_eq!(v.cross(&u), skew(&v) * u, epsilon = 1e-12);
    }

    #[test]
    fn test_skew_antisymmetric() {
        let skew_v = skew(&Vector3::new(1.0, 2.0, 3.0));
        assert_relative_eq!(skew_v, -skew_v.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_exp_matches_axis_angle() {
        let phi = Vector3::new(0.3, -0.2, 0.5);
        let q = exp_so3(&phi);
        assert_relative_eq!(q.scaled_axis(), phi, epsilon = 1e-12);
    }

    #[test]
    fn test_exp_small_angle_branch() {
        let phi = Vector3::new(1e-8, -2e-8, 3e-8);
        let q = exp_so3(&phi);
        assert_relative_eq!(q.scaled_axis(), phi, epsilon = 1e-14);
    }

    #[test]
    fn test_right_jacobian_identity_at_zero() {
        assert_relative_eq!(
            right_jacobian_so3(&Vector3::zeros()),
            Matrix3::identity(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_right_jacobian_first_order() {
        // exp(φ + δ) ≈ exp(φ) · exp(Jr(φ) δ)
        let phi = Vector3::new(0.4, 0.1, -0.3);
        let delta = Vector3::new(1e-6, -2e-6, 1.5e-6);
        let lhs = exp_so3(&(phi + delta));
        let rhs = exp_so3(&phi) * exp_so3(&(right_jacobian_so3(&phi) * delta));
        assert_relative_eq!(lhs.angle_to(&rhs), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_rotation_between_antiparallel() {
        let from = Vector3::new(0.0, 0.0, 1.0);
        let to = Vector3::new(0.0, 0.0, -1.0);
        let q = rotation_between(&from, &to);
        assert_relative_eq!(q * from, to, epsilon = 1e-12);
    }
}
