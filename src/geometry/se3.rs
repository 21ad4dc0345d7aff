//! Rigid body transforms.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// A rigid transform `x' = R x + t`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn from_rt(rotation: &Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_matrix(rotation),
            translation,
        }
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// `self ∘ other`: applies `other` first.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Row-major 3x4 `[R | t]`.
    pub fn to_matrix_3x4(&self) -> [[f64; 4]; 3] {
        let r = self.rotation_matrix();
        let t = self.translation;
        [
            [r[(0, 0)], r[(0, 1)], r[(0, 2)], t.x],
            [r[(1, 0)], r[(1, 1)], r[(1, 2)], t.y],
            [r[(2, 0)], r[(2, 1)], r[(2, 2)], t.z],
        ]
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.4, 1.2),
            Vector3::new(1.0, -2.0, 0.5),
        )
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        let pose = sample_pose();
        let id = pose.compose(&pose.inverse());
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(id.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_applies_right_first() {
        let a = sample_pose();
        let b = SE3::new(UnitQuaternion::from_euler_angles(0.3, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0));
        let p = Vector3::new(0.2, 0.3, 0.4);
        assert_relative_eq!(
            a.compose(&b).transform_point(&p),
            a.transform_point(&b.transform_point(&p)),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_matrix_layout() {
        let pose = sample_pose();
        let m = pose.to_matrix_3x4();
        let r = pose.rotation_matrix();
        assert_relative_eq!(m[1][2], r[(1, 2)]);
        assert_relative_eq!(m[2][3], pose.translation.z);
    }
}
