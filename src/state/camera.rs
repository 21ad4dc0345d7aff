//! Camera intrinsics, distortion and extrinsics.

use nalgebra::{Matrix2x3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

use super::node::{Node, StateBranch, StateScalar};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistortionModel {
    #[default]
    Undistorted,
    /// Radial polynomial `1 + k1 r² + k2 r⁴ + k3 r⁶`.
    Polynomial3,
    /// Field-of-view model with `k1` as the field of view parameter.
    Fisheye,
}

const MIN_DEPTH: f64 = 1e-6;

pub struct CameraState {
    /// Pixels.
    pub focal_length: StateScalar,
    pub center_x: StateScalar,
    pub center_y: StateScalar,
    pub k1: StateScalar,
    pub k2: StateScalar,
    pub k3: StateScalar,
    pub model: DistortionModel,
    pub width: usize,
    pub height: usize,
    /// Camera to body.
    pub extrinsics: SE3,
    pub estimate_intrinsics: bool,
}

impl CameraState {
    pub fn new(width: usize, height: usize, model: DistortionModel, estimate_intrinsics: bool) -> Self {
        let mut camera = Self {
            focal_length: StateScalar::new(height as f64, estimate_intrinsics, false),
            center_x: StateScalar::new(width as f64 / 2.0 - 0.5, estimate_intrinsics, false),
            center_y: StateScalar::new(height as f64 / 2.0 - 0.5, estimate_intrinsics, false),
            k1: StateScalar::new(0.0, estimate_intrinsics, false),
            k2: StateScalar::new(0.0, estimate_intrinsics, false),
            k3: StateScalar::new(0.0, estimate_intrinsics, false),
            model,
            width,
            height,
            extrinsics: SE3::identity(),
            estimate_intrinsics,
        };
        camera.reset_noise();
        camera
    }

    pub fn reset_noise(&mut self) {
        self.focal_length.set_initial_variance_uniform(10.0);
        self.center_x.set_initial_variance_uniform(2.0);
        self.center_y.set_initial_variance_uniform(2.0);
        let k_var = if self.model == DistortionModel::Fisheye { 0.1 * 0.1 } else { 2e-4 };
        for k in [&mut self.k1, &mut self.k2, &mut self.k3] {
            k.set_initial_variance_uniform(k_var);
            k.set_process_noise(1e-9);
        }
        for p in [&mut self.focal_length, &mut self.center_x, &mut self.center_y] {
            p.set_process_noise(1e-5);
        }
    }

    /// Radial scale applied to a normalized undistorted point.
    pub fn distortion_factor(&self, normalized: &Vector2<f64>) -> f64 {
        let r2 = normalized.norm_squared();
        match self.model {
            DistortionModel::Undistorted => 1.0,
            DistortionModel::Polynomial3 => {
                1.0 + r2 * (self.k1.v + r2 * (self.k2.v + r2 * self.k3.v))
            }
            DistortionModel::Fisheye => {
                let w = self.k1.v;
                let r = r2.sqrt();
                if r < 1e-9 || w.abs() < 1e-9 {
                    1.0
                } else {
                    (2.0 * r * (w / 2.0).tan()).atan() / (w * r)
                }
            }
        }
    }

    /// d(distortion factor)/d(k1, k2, k3) at a normalized point.
    pub fn distortion_jacobian(&self, normalized: &Vector2<f64>) -> [f64; 3] {
        let r2 = normalized.norm_squared();
        match self.model {
            DistortionModel::Undistorted => [0.0; 3],
            DistortionModel::Polynomial3 => [r2, r2 * r2, r2 * r2 * r2],
            DistortionModel::Fisheye => {
                let w = self.k1.v;
                let r = r2.sqrt();
                if r < 1e-9 || w.abs() < 1e-9 {
                    return [0.0; 3];
                }
                let tan_half = (w / 2.0).tan();
                let s = 2.0 * r * tan_half;
                let ds_dw = r * (1.0 + tan_half * tan_half);
                let dkr_dw = ds_dw / ((1.0 + s * s) * w * r) - s.atan() / (w * w * r);
                [dkr_dw, 0.0, 0.0]
            }
        }
    }

    /// Pixel coordinates of a camera-frame point, or `None` behind the camera.
    pub fn project(&self, point: &Vector3<f64>) -> Option<Vector2<f64>> {
        if point.z < MIN_DEPTH {
            return None;
        }
        let normalized = Vector2::new(point.x / point.z, point.y / point.z);
        let kr = self.distortion_factor(&normalized);
        Some(Vector2::new(
            self.focal_length.v * kr * normalized.x + self.center_x.v,
            self.focal_length.v * kr * normalized.y + self.center_y.v,
        ))
    }

    /// d(pixel)/d(point). The derivative of the distortion factor is
    /// neglected.
    pub fn projection_jacobian(&self, point: &Vector3<f64>) -> Matrix2x3<f64> {
        let inv_z = 1.0 / point.z;
        let normalized = Vector2::new(point.x * inv_z, point.y * inv_z);
        let scale = self.focal_length.v * self.distortion_factor(&normalized) * inv_z;
        Matrix2x3::new(
            scale, 0.0, -scale * normalized.x,
            0.0, scale, -scale * normalized.y,
        )
    }

    /// Undistorted normalized coordinates of a pixel.
    pub fn undistort(&self, pixel: &Vector2<f64>) -> Vector2<f64> {
        let distorted = Vector2::new(
            (pixel.x - self.center_x.v) / self.focal_length.v,
            (pixel.y - self.center_y.v) / self.focal_length.v,
        );
        match self.model {
            DistortionModel::Undistorted => distorted,
            DistortionModel::Fisheye => {
                let w = self.k1.v;
                let rd = distorted.norm();
                if rd < 1e-9 || w.abs() < 1e-9 {
                    distorted
                } else {
                    let r = (rd * w).tan() / (2.0 * (w / 2.0).tan());
                    distorted * (r / rd)
                }
            }
            DistortionModel::Polynomial3 => {
                let mut undistorted = distorted;
                for _ in 0..10 {
                    undistorted = distorted / self.distortion_factor(&undistorted);
                }
                undistorted
            }
        }
    }

    /// Unit-depth ray through a pixel.
    pub fn ray(&self, pixel: &Vector2<f64>) -> Vector3<f64> {
        let normalized = self.undistort(pixel);
        Vector3::new(normalized.x, normalized.y, 1.0)
    }
}

impl StateBranch for CameraState {
    fn children(&mut self, visit: &mut dyn FnMut(Node<'_>)) {
        if !self.estimate_intrinsics {
            return;
        }
        visit(Node::Scalar(&mut self.focal_length));
        visit(Node::Scalar(&mut self.center_x));
        visit(Node::Scalar(&mut self.center_y));
        if self.model != DistortionModel::Undistorted {
            visit(Node::Scalar(&mut self.k1));
            visit(Node::Scalar(&mut self.k2));
            visit(Node::Scalar(&mut self.k3));
        }
    }

    fn all_children(&mut self, visit: &mut dyn FnMut(Node<'_>)) {
        visit(Node::Scalar(&mut self.focal_length));
        visit(Node::Scalar(&mut self.center_x));
        visit(Node::Scalar(&mut self.center_y));
        visit(Node::Scalar(&mut self.k1));
        visit(Node::Scalar(&mut self.k2));
        visit(Node::Scalar(&mut self.k3));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera(model: DistortionModel) -> CameraState {
        let mut camera = CameraState::new(640, 480, model, false);
        camera.focal_length.v = 500.0;
        camera.center_x.v = 320.0;
        camera.center_y.v = 240.0;
        camera
    }

    #[test]
    fn test_project_then_ray_roundtrip_polynomial() {
        let mut camera = camera(DistortionModel::Polynomial3);
        camera.k1.v = -0.2;
        camera.k2.v = 0.05;
        let point = Vector3::new(0.3, -0.2, 2.0);
        let pixel = camera.project(&point).unwrap();
        let ray = camera.ray(&pixel);
        assert_relative_eq!(ray, point / point.z, epsilon = 1e-6);
    }

    #[test]
    fn test_project_then_ray_roundtrip_fisheye() {
        let mut camera = camera(DistortionModel::Fisheye);
        camera.k1.v = 0.9;
        let point = Vector3::new(-0.5, 0.4, 1.5);
        let pixel = camera.project(&point).unwrap();
        assert_relative_eq!(camera.ray(&pixel), point / point.z, epsilon = 1e-9);
    }

    #[test]
    fn test_behind_camera() {
        let camera = camera(DistortionModel::Undistorted);
        assert!(camera.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_projection_jacobian_numeric() {
        let camera = camera(DistortionModel::Undistorted);
        let point = Vector3::new(0.2, 0.1, 3.0);
        let jacobian = camera.projection_jacobian(&point);
        let eps = 1e-6;
        for k in 0..3 {
            let mut plus = point;
            plus[k] += eps;
            let numeric = (camera.project(&plus).unwrap() - camera.project(&point).unwrap()) / eps;
            assert_relative_eq!(jacobian[(0, k)], numeric.x, epsilon = 1e-3);
            assert_relative_eq!(jacobian[(1, k)], numeric.y, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_distortion_jacobian_numeric() {
        let normalized = Vector2::new(0.3, -0.4);
        let eps = 1e-7;
        for model in [DistortionModel::Polynomial3, DistortionModel::Fisheye] {
            let mut camera = camera(model);
            camera.k1.v = 0.8;
            camera.k2.v = 0.02;
            let analytic = camera.distortion_jacobian(&normalized);
            let base = camera.distortion_factor(&normalized);
            camera.k1.v += eps;
            let numeric = (camera.distortion_factor(&normalized) - base) / eps;
            assert_relative_eq!(analytic[0], numeric, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_children_follow_estimation_flag() {
        let mut fixed = camera(DistortionModel::Polynomial3);
        let mut count = 0;
        fixed.children(&mut |_| count += 1);
        assert_eq!(count, 0);

        let mut estimated = CameraState::new(640, 480, DistortionModel::Undistorted, true);
        estimated.children(&mut |_| count += 1);
        assert_eq!(count, 3);
    }
}
