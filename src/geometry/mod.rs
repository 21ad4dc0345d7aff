//! Geometry utilities: SO(3) helpers and rigid transforms.

pub mod se3;
pub mod so3;

pub use se3::SE3;
pub use so3::{exp_so3, right_jacobian_so3, rotation_between, skew};
