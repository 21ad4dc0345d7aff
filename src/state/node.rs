//! Parameter tree leaves and the generic walk over them.
//!
//! The tree has exactly four node kinds: scalar, 3-vector and rotation leaves,
//! and branches. Everything that needs to touch every parameter (index
//! assignment, correction, variance lookup) goes through [`walk`].

use nalgebra::{UnitQuaternion, Vector3};

use crate::geometry::exp_so3;

use super::covariance::Covariance;

/// Bookkeeping shared by every leaf.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeafMeta {
    /// First row/column in the covariance, if the leaf is currently estimated.
    pub index: Option<usize>,
    /// Whether the leaf should participate in the filter at all.
    pub estimate: bool,
    /// Whether the process model evolves the leaf between samples.
    pub dynamic: bool,
    /// Variance used when the leaf (re)enters the covariance.
    pub initial_variance: [f64; 3],
    /// Variance added per second during the time update.
    pub process_noise: [f64; 3],
    pub(crate) previous_index: Option<usize>,
}

impl LeafMeta {
    pub fn new(estimate: bool, dynamic: bool) -> Self {
        Self {
            index: None,
            estimate,
            dynamic,
            initial_variance: [0.0; 3],
            process_noise: [0.0; 3],
            previous_index: None,
        }
    }

    /// Covariance row of component `i`, if indexed.
    #[inline]
    pub fn row(&self, i: usize) -> Option<usize> {
        self.index.map(|index| index + i)
    }

    pub fn is_indexed(&self) -> bool {
        self.index.is_some()
    }
}

macro_rules! leaf_common {
    ($ty:ty, $dim:expr) => {
        impl $ty {
            pub const DIMENSION: usize = $dim;

            pub fn set_initial_variance(&mut self, variance: [f64; 3]) {
                self.meta.initial_variance = variance;
            }

            pub fn set_initial_variance_uniform(&mut self, variance: f64) {
                self.meta.initial_variance = [variance; 3];
            }

            pub fn set_process_noise(&mut self, noise: f64) {
                self.meta.process_noise = [noise; 3];
            }

            /// Replaces this leaf's covariance rows and columns with its
            /// initial variance.
            pub fn reset_covariance(&self, cov: &mut Covariance) {
                if let Some(index) = self.meta.index {
                    cov.reset_block(index, &self.meta.initial_variance[..$dim]);
                }
            }
        }
    };
}

/// A single estimated number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateScalar {
    pub v: f64,
    pub meta: LeafMeta,
}

impl StateScalar {
    pub fn new(v: f64, estimate: bool, dynamic: bool) -> Self {
        Self {
            v,
            meta: LeafMeta::new(estimate, dynamic),
        }
    }

    pub fn variance(&self, cov: &Covariance) -> f64 {
        match self.meta.index {
            Some(i) => cov.get(i, i),
            None => self.meta.initial_variance[0],
        }
    }
}

leaf_common!(StateScalar, 1);

/// An estimated 3-vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateVector {
    pub v: Vector3<f64>,
    pub meta: LeafMeta,
}

impl StateVector {
    pub fn new(v: Vector3<f64>, estimate: bool, dynamic: bool) -> Self {
        Self {
            v,
            meta: LeafMeta::new(estimate, dynamic),
        }
    }

    pub fn variance(&self, cov: &Covariance) -> Vector3<f64> {
        match self.meta.index {
            Some(i) => Vector3::new(cov.get(i, i), cov.get(i + 1, i + 1), cov.get(i + 2, i + 2)),
            None => Vector3::from(self.meta.initial_variance),
        }
    }
}

leaf_common!(StateVector, 3);

/// An estimated orientation. Its error is a world-frame rotation vector:
/// `R_true = exp(δθ) · R`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateRotation {
    pub v: UnitQuaternion<f64>,
    pub meta: LeafMeta,
}

impl StateRotation {
    pub fn new(v: UnitQuaternion<f64>, estimate: bool, dynamic: bool) -> Self {
        Self {
            v,
            meta: LeafMeta::new(estimate, dynamic),
        }
    }

    pub fn variance(&self, cov: &Covariance) -> Vector3<f64> {
        match self.meta.index {
            Some(i) => Vector3::new(cov.get(i, i), cov.get(i + 1, i + 1), cov.get(i + 2, i + 2)),
            None => Vector3::from(self.meta.initial_variance),
        }
    }
}

leaf_common!(StateRotation, 3);

/// Mutable access to one leaf during a walk.
pub enum LeafMut<'a> {
    Scalar(&'a mut StateScalar),
    Vector(&'a mut StateVector),
    Rotation(&'a mut StateRotation),
}

impl<'a> LeafMut<'a> {
    pub fn meta(&mut self) -> &mut LeafMeta {
        match self {
            LeafMut::Scalar(leaf) => &mut leaf.meta,
            LeafMut::Vector(leaf) => &mut leaf.meta,
            LeafMut::Rotation(leaf) => &mut leaf.meta,
        }
    }

    pub fn dimension(&self) -> usize {
        match self {
            LeafMut::Scalar(_) => StateScalar::DIMENSION,
            LeafMut::Vector(_) => StateVector::DIMENSION,
            LeafMut::Rotation(_) => StateRotation::DIMENSION,
        }
    }

    /// Adds the leaf's slice of `dx` to its value.
    pub fn apply_correction(&mut self, dx: &[f64]) {
        match self {
            LeafMut::Scalar(leaf) => {
                if let Some(i) = leaf.meta.index {
                    leaf.v += dx[i];
                }
            }
            LeafMut::Vector(leaf) => {
                if let Some(i) = leaf.meta.index {
                    leaf.v += Vector3::new(dx[i], dx[i + 1], dx[i + 2]);
                }
            }
            LeafMut::Rotation(leaf) => {
                if let Some(i) = leaf.meta.index {
                    let delta = Vector3::new(dx[i], dx[i + 1], dx[i + 2]);
                    leaf.v = exp_so3(&delta) * leaf.v;
                }
            }
        }
    }
}

/// A node of the parameter tree.
pub enum Node<'a> {
    Scalar(&'a mut StateScalar),
    Vector(&'a mut StateVector),
    Rotation(&'a mut StateRotation),
    Branch(&'a mut dyn StateBranch),
}

/// A composite node. `children` visits the currently attached children in a
/// fixed order; detached children are simply not visited.
pub trait StateBranch {
    fn children(&mut self, visit: &mut dyn FnMut(Node<'_>));

    /// Every child, attached or not.
    fn all_children(&mut self, visit: &mut dyn FnMut(Node<'_>)) {
        self.children(visit);
    }
}

/// Depth-first walk over the attached leaves of `node`.
pub fn walk(node: Node<'_>, visit: &mut dyn FnMut(LeafMut<'_>)) {
    match node {
        Node::Scalar(leaf) => visit(LeafMut::Scalar(leaf)),
        Node::Vector(leaf) => visit(LeafMut::Vector(leaf)),
        Node::Rotation(leaf) => visit(LeafMut::Rotation(leaf)),
        Node::Branch(branch) => branch.children(&mut |child| walk(child, visit)),
    }
}

/// Depth-first walk over every leaf of `node`, including detached ones.
pub fn walk_all(node: Node<'_>, visit: &mut dyn FnMut(LeafMut<'_>)) {
    match node {
        Node::Scalar(leaf) => visit(LeafMut::Scalar(leaf)),
        Node::Vector(leaf) => visit(LeafMut::Vector(leaf)),
        Node::Rotation(leaf) => visit(LeafMut::Rotation(leaf)),
        Node::Branch(branch) => branch.all_children(&mut |child| walk_all(child, visit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Pair {
        a: StateScalar,
        b: StateVector,
        attached: bool,
    }

    impl StateBranch for Pair {
        fn children(&mut self, visit: &mut dyn FnMut(Node<'_>)) {
            visit(Node::Scalar(&mut self.a));
            if self.attached {
                visit(Node::Vector(&mut self.b));
            }
        }

        fn all_children(&mut self, visit: &mut dyn FnMut(Node<'_>)) {
            visit(Node::Scalar(&mut self.a));
            visit(Node::Vector(&mut self.b));
        }
    }

    #[test]
    fn test_walk_respects_attachment() {
        let mut pair = Pair {
            a: StateScalar::new(1.0, true, false),
            b: StateVector::new(Vector3::zeros(), true, true),
            attached: false,
        };
        let mut dims = Vec::new();
        walk(Node::Branch(&mut pair), &mut |leaf| dims.push(leaf.dimension()));
        assert_eq!(dims, vec![1]);

        dims.clear();
        walk_all(Node::Branch(&mut pair), &mut |leaf| dims.push(leaf.dimension()));
        assert_eq!(dims, vec![1, 3]);
    }

    #[test]
    fn test_rotation_correction_is_left_multiplied() {
        let mut rotation = StateRotation::new(UnitQuaternion::from_euler_angles(0.0, 0.0, 0.5), true, true);
        rotation.meta.index = Some(1);
        let dx = [9.0, 0.0, 0.0, 0.25];
        LeafMut::Rotation(&mut rotation).apply_correction(&dx);
        let (_, _, yaw) = rotation.v.euler_angles();
        assert_relative_eq!(yaw, 0.75, epsilon = 1e-12);
    }

    #[test]
    fn test_unindexed_leaf_ignores_correction() {
        let mut scalar = StateScalar::new(2.0, false, false);
        LeafMut::Scalar(&mut scalar).apply_correction(&[5.0]);
        assert_relative_eq!(scalar.v, 2.0);
    }
}
