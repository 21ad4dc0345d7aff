//! Filter state: the parameter tree and its covariance.

pub mod camera;
pub mod covariance;
pub mod motion;
pub mod node;
pub mod vision;

use nalgebra::{Vector2, Vector3};
use tracing::{debug, warn};

use crate::config::FeatureConfig;
use crate::error::Result;
use crate::sensor::Timestamp;

pub use camera::{CameraState, DistortionModel};
pub use covariance::{Covariance, RemapEntry};
pub use motion::{gravity_at, ImuState, MotionState};
pub use node::{walk, walk_all, LeafMeta, LeafMut, Node, StateBranch, StateRotation, StateScalar, StateVector};
pub use vision::{FeatureId, FeatureStatus, FeatureSummary, GroupId, GroupStatus, VisionFeature, VisionGroup, VisionState};

/// Diagonal inflation applied to a freshly cloned group pose so it is not
/// perfectly correlated with the live pose.
const PERTURB_FACTOR: f64 = 1.1;

/// Position changes below this (meters) do not count towards path length.
const MIN_DISTANCE_STEP: f64 = 0.01;

pub struct FilterState {
    pub motion: MotionState,
    pub imu: ImuState,
    pub camera: CameraState,
    pub vision: VisionState,
    pub cov: Covariance,
    pub current_time: Timestamp,
    pub total_distance: f64,
    pub last_position: Vector3<f64>,
    remap_entries: Vec<RemapEntry>,
}

impl FilterState {
    pub fn new(camera: CameraState) -> Self {
        let cov = Covariance::new();
        let capacity = cov.capacity();
        Self {
            motion: MotionState::new(),
            imu: ImuState::new(),
            camera,
            vision: VisionState::new(),
            cov,
            current_time: Timestamp::ZERO,
            total_distance: 0.0,
            last_position: Vector3::zeros(),
            remap_entries: Vec::with_capacity(capacity),
        }
    }

    /// Number of estimated parameters.
    pub fn size(&self) -> usize {
        self.cov.size()
    }

    /// State size once every tracked feature has its depth estimated.
    pub fn committed_size(&self) -> usize {
        self.size() + self.vision.pending_features()
    }

    /// Clears vision state and motion, keeping IMU and camera intrinsics.
    pub fn reset(&mut self) -> Result<()> {
        self.vision.clear();
        self.motion.reset();
        self.imu.estimate_bias = true;
        self.current_time = Timestamp::ZERO;
        self.total_distance = 0.0;
        self.last_position = Vector3::zeros();
        self.cov.clear();
        // forget stale indices so every leaf re-enters at its initial variance
        walk_all(Node::Branch(&mut *self), &mut |mut leaf| leaf.meta().index = None);
        self.remap()
    }

    /// Reassigns contiguous covariance indices to every estimated leaf and
    /// rebuilds the covariance to match.
    ///
    /// Leaves that keep being estimated keep their covariance; leaves that
    /// stop are removed; new leaves start at their initial variance. On
    /// failure the previous indices are restored.
    pub fn remap(&mut self) -> Result<()> {
        let mut entries = std::mem::take(&mut self.remap_entries);
        entries.clear();

        walk_all(Node::Branch(&mut *self), &mut |mut leaf| {
            let meta = leaf.meta();
            meta.previous_index = meta.index.take();
        });

        let mut dynamic = 0;
        walk(Node::Branch(&mut *self), &mut |mut leaf| {
            let dimension = leaf.dimension();
            let meta = leaf.meta();
            if !meta.estimate {
                return;
            }
            meta.index = Some(entries.len());
            if meta.dynamic {
                dynamic += 1;
            }
            for k in 0..dimension {
                entries.push(RemapEntry {
                    old_index: meta.previous_index.map(|index| index + k),
                    initial_variance: meta.initial_variance[k],
                    process_noise: meta.process_noise[k],
                });
            }
        });

        let result = self.cov.remap(&entries);
        if let Err(err) = &result {
            warn!("remap failed: {}", err);
            walk_all(Node::Branch(&mut *self), &mut |mut leaf| {
                let meta = leaf.meta();
                meta.index = meta.previous_index;
            });
        } else {
            debug!(
                "remap: {} parameters, {} dynamic leaves, {} groups, {} features",
                entries.len(),
                dynamic,
                self.vision.group_count(),
                self.vision.feature_count()
            );
        }
        self.remap_entries = entries;
        result
    }

    /// Propagates the state and covariance to `time`.
    pub fn time_update(&mut self, time: Timestamp) {
        if self.current_time.is_zero() {
            self.current_time = time;
            return;
        }
        let dt = time.seconds_since(self.current_time);
        if dt <= 0.0 {
            return;
        }
        self.motion.project_covariance(&mut self.cov, dt);
        self.cov.add_process_noise(dt);
        self.cov.symmetrize();
        self.motion.evolve(dt);
        self.current_time = time;
    }

    /// Adds a Kalman correction to every indexed leaf.
    pub fn apply_correction(&mut self, dx: &[f64]) {
        walk(Node::Branch(&mut *self), &mut |mut leaf| leaf.apply_correction(dx));
    }

    /// Moves the origin to the current position.
    pub fn reset_position(&mut self) {
        let offset = self.motion.t.v;
        self.vision.shift(&offset);
        self.motion.t.v = Vector3::zeros();
        self.total_distance = 0.0;
        self.last_position = Vector3::zeros();
    }

    pub fn update_total_distance(&mut self) {
        let step = (self.motion.t.v - self.last_position).norm();
        if step > MIN_DISTANCE_STEP {
            self.total_distance += step;
            self.last_position = self.motion.t.v;
        }
    }

    /// Stops estimating translation, biases and everything visual.
    pub fn enable_orientation_only(&mut self) -> Result<()> {
        if !self.motion.enable_orientation_only() {
            return Ok(());
        }
        self.imu.disable_bias_estimation(&self.cov);
        self.vision.clear();
        self.remap()
    }

    pub fn disable_orientation_only(&mut self) -> Result<()> {
        if !self.motion.disable_orientation_only() {
            return Ok(());
        }
        self.imu.enable_bias_estimation();
        self.remap()
    }

    pub fn enable_bias_estimation(&mut self) -> Result<()> {
        if self.imu.enable_bias_estimation() {
            self.remap()?;
        }
        Ok(())
    }

    pub fn disable_bias_estimation(&mut self) -> Result<()> {
        if self.imu.disable_bias_estimation(&self.cov) {
            self.remap()?;
        }
        Ok(())
    }

    /// Creates a vision group at the current pose.
    ///
    /// The first group anchors the map and is constant. Later groups start
    /// as a copy of the live pose covariance, slightly inflated.
    pub fn add_group(&mut self) -> Result<GroupId> {
        let anchored = self.vision.groups.is_empty();
        let id = self
            .vision
            .add_group(self.motion.t.v, self.motion.q.v, anchored, self.current_time);
        self.remap()?;

        if let Some(group) = self.vision.groups.get(&id) {
            if let (Some(dst), Some(src)) = (group.tr.meta.index, self.motion.t.meta.index) {
                self.cov.copy_block(dst, src, 3);
                for k in 0..3 {
                    self.cov.perturb(dst + k, PERTURB_FACTOR);
                }
            }
            if let (Some(dst), Some(src)) = (group.qr.meta.index, self.motion.q.meta.index) {
                self.cov.copy_block(dst, src, 3);
                for k in 0..3 {
                    self.cov.perturb(dst + k, PERTURB_FACTOR);
                }
            }
        }
        Ok(id)
    }

    /// Adds an initializing feature. Its depth is not estimated until it is
    /// promoted, so no remap is needed here.
    pub fn add_feature(&mut self, group: GroupId, pixel: Vector2<f64>, config: &FeatureConfig) -> Option<FeatureId> {
        let id = self.vision.add_feature(group, pixel, self.current_time, config)?;
        if let Some(feature) = self.vision.features.get_mut(&id) {
            feature.ray = self.camera.ray(&pixel);
        }
        Some(id)
    }

    /// Prunes features and groups, then remaps.
    pub fn process_features(&mut self, config: &FeatureConfig) -> Result<FeatureSummary> {
        let summary = self.vision.process_features(&self.cov, config);
        self.remap()?;
        Ok(summary)
    }

    pub fn median_depth_variance(&self) -> f64 {
        self.vision.median_depth_variance(&self.cov)
    }

    pub fn compute_gravity(&mut self, latitude_deg: f64, altitude_m: f64) {
        self.motion.gravity = gravity_at(latitude_deg, altitude_m);
    }
}

impl StateBranch for FilterState {
    fn children(&mut self, visit: &mut dyn FnMut(Node<'_>)) {
        visit(Node::Branch(&mut self.motion));
        visit(Node::Branch(&mut self.imu));
        if !self.motion.orientation_only {
            visit(Node::Branch(&mut self.camera));
            visit(Node::Branch(&mut self.vision));
        }
    }

    fn all_children(&mut self, visit: &mut dyn FnMut(Node<'_>)) {
        visit(Node::Branch(&mut self.motion));
        visit(Node::Branch(&mut self.imu));
        visit(Node::Branch(&mut self.camera));
        visit(Node::Branch(&mut self.vision));
    }
}
