//! Vision groups and features, stored in id-keyed arenas.
//!
//! A group is the device pose at the moment a batch of features was first
//! detected. Each feature hangs off exactly one group and carries its depth
//! along the ray through its first observation, as log inverse depth.

use std::collections::BTreeMap;

use nalgebra::{UnitQuaternion, Vector2, Vector3};

use crate::config::FeatureConfig;
use crate::sensor::Timestamp;

use super::covariance::Covariance;
use super::node::{Node, StateBranch, StateRotation, StateScalar, StateVector};

pub type GroupId = u64;
pub type FeatureId = u64;

/// Process noise of group poses and feature depths. Effectively constant.
const REFERENCE_NOISE: f64 = 1e-30;
const FEATURE_PROCESS_NOISE: f64 = 1e-20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureStatus {
    /// Depth unknown; contributes rotation-only measurements.
    Initializing,
    /// Depth is estimated by the filter.
    Normal,
    /// Lost by the tracker.
    Dropped,
    /// Residual stayed beyond the rejection threshold.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// Created this frame; its features have not been tracked yet.
    Initializing,
    /// Kept at least the minimum number of features through tracking.
    Normal,
    /// The group currently anchoring the map.
    Reference,
    Empty,
}

#[derive(Debug, Clone)]
pub struct VisionFeature {
    pub id: FeatureId,
    pub group: GroupId,
    /// Log inverse depth along `ray`, in the group's camera frame.
    pub v: StateScalar,
    /// Pixel position when first detected.
    pub initial: Vector2<f64>,
    /// Latest tracked pixel position.
    pub current: Vector2<f64>,
    pub prediction: Vector2<f64>,
    pub image_velocity: Vector2<f64>,
    /// Unit-depth ray through `initial`.
    pub ray: Vector3<f64>,
    pub world: Vector3<f64>,
    /// Depth in the current camera frame.
    pub depth: f64,
    pub outlier: f64,
    pub status: FeatureStatus,
    pub found_time: Timestamp,
    pub last_seen: Timestamp,
}

impl VisionFeature {
    fn new(id: FeatureId, group: GroupId, pixel: Vector2<f64>, time: Timestamp, config: &FeatureConfig) -> Self {
        let mut v = StateScalar::new(0.0, false, false);
        v.set_initial_variance_uniform(config.initial_var);
        v.set_process_noise(FEATURE_PROCESS_NOISE);
        let mut feature = Self {
            id,
            group,
            v,
            initial: pixel,
            current: pixel,
            prediction: pixel,
            image_velocity: Vector2::zeros(),
            ray: Vector3::new(0.0, 0.0, 1.0),
            world: Vector3::zeros(),
            depth: config.initial_depth_m,
            outlier: 0.0,
            status: FeatureStatus::Initializing,
            found_time: time,
            last_seen: time,
        };
        feature.set_depth(config.initial_depth_m);
        feature
    }

    /// Depth along the reference ray, meters.
    pub fn reference_depth(&self) -> f64 {
        (-self.v.v).exp()
    }

    pub fn inverse_depth(&self) -> f64 {
        self.v.v.exp()
    }

    pub fn set_depth(&mut self, depth_m: f64) {
        self.v.v = -depth_m.ln();
    }

    pub fn is_initialized(&self) -> bool {
        self.status == FeatureStatus::Normal
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.status, FeatureStatus::Initializing | FeatureStatus::Normal)
    }

    pub fn is_good(&self, cov: &Covariance, max_variance: f64) -> bool {
        self.is_valid() && self.v.variance(cov) < max_variance
    }

    pub fn should_drop(&self) -> bool {
        matches!(self.status, FeatureStatus::Dropped | FeatureStatus::Rejected)
    }

    /// Starts estimating depth from the current triangulated value.
    pub fn promote(&mut self) {
        if self.status == FeatureStatus::Initializing {
            self.status = FeatureStatus::Normal;
            self.v.meta.estimate = true;
        }
    }

    /// Promotes an initializing feature with its depth reset to the prior.
    fn force_initialize(&mut self, config: &FeatureConfig) -> bool {
        if self.status != FeatureStatus::Initializing {
            return false;
        }
        self.set_depth(config.initial_depth_m);
        self.v.set_initial_variance_uniform(config.initial_var);
        self.promote();
        true
    }
}

#[derive(Debug, Clone)]
pub struct VisionGroup {
    pub id: GroupId,
    /// World position of the body when the group was created.
    pub tr: StateVector,
    /// Body to world rotation when the group was created.
    pub qr: StateRotation,
    pub status: GroupStatus,
    /// Number of good features.
    pub health: usize,
    pub features: Vec<FeatureId>,
    pub created: Timestamp,
}

/// Result of one pass of [`VisionState::process_features`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FeatureSummary {
    /// Features in groups past initialization.
    pub used: usize,
    pub dropped: Vec<FeatureId>,
    pub groups_removed: usize,
}

#[derive(Debug, Default)]
pub struct VisionState {
    pub groups: BTreeMap<GroupId, VisionGroup>,
    pub features: BTreeMap<FeatureId, VisionFeature>,
    pub reference: Option<GroupId>,
    next_group_id: GroupId,
    next_feature_id: FeatureId,
}

impl VisionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.features.clear();
        self.reference = None;
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Creates a group at the given pose. An anchored group is held constant
    /// and fixes the map's gauge.
    pub fn add_group(&mut self, position: Vector3<f64>, rotation: UnitQuaternion<f64>, anchored: bool, time: Timestamp) -> GroupId {
        let id = self.next_group_id;
        self.next_group_id += 1;

        let mut tr = StateVector::new(position, !anchored, false);
        let mut qr = StateRotation::new(rotation, !anchored, false);
        tr.set_process_noise(REFERENCE_NOISE);
        qr.set_process_noise(REFERENCE_NOISE);

        self.groups.insert(
            id,
            VisionGroup {
                id,
                tr,
                qr,
                status: GroupStatus::Initializing,
                health: 0,
                features: Vec::new(),
                created: time,
            },
        );
        id
    }

    /// Adds an initializing feature to `group`. Returns `None` if the group
    /// does not exist.
    pub fn add_feature(&mut self, group: GroupId, pixel: Vector2<f64>, time: Timestamp, config: &FeatureConfig) -> Option<FeatureId> {
        let owner = self.groups.get_mut(&group)?;
        let id = self.next_feature_id;
        self.next_feature_id += 1;
        owner.features.push(id);
        self.features.insert(id, VisionFeature::new(id, group, pixel, time, config));
        Some(id)
    }

    /// Tracked features whose depth is not estimated yet. Each one becomes
    /// a state parameter when promoted.
    pub fn pending_features(&self) -> usize {
        self.features
            .values()
            .filter(|f| f.is_valid() && !f.v.meta.estimate)
            .count()
    }

    /// Removes dropped and rejected features, deletes groups left without
    /// features, promotes initializing groups that kept
    /// `config.min_group_features` and elects a reference group if needed.
    ///
    /// The caller remaps afterwards.
    pub fn process_features(&mut self, cov: &Covariance, config: &FeatureConfig) -> FeatureSummary {
        let mut summary = FeatureSummary::default();

        for feature in self.features.values_mut() {
            if feature.is_valid() && feature.outlier > config.outlier_reject {
                feature.status = FeatureStatus::Rejected;
            }
        }

        let mut need_reference = true;
        let mut best: Option<(GroupId, usize)> = None;
        let mut empty = Vec::new();

        for group in self.groups.values_mut() {
            let features = &mut self.features;
            group.features.retain(|id| match features.get(id).map(VisionFeature::should_drop) {
                Some(true) => {
                    summary.dropped.push(*id);
                    features.remove(id);
                    false
                }
                Some(false) => true,
                None => false,
            });

            let in_group = group.features.len();
            let good = group
                .features
                .iter()
                .filter_map(|id| features.get(id))
                .filter(|feature| feature.is_good(cov, config.max_variance))
                .count();

            if in_group == 0 {
                group.status = GroupStatus::Empty;
                empty.push(group.id);
                continue;
            }
            group.health = good;
            if group.status == GroupStatus::Initializing && in_group >= config.min_group_features {
                group.status = GroupStatus::Normal;
            }
            if group.status != GroupStatus::Initializing {
                summary.used += in_group;
            }

            match group.status {
                GroupStatus::Reference => need_reference = false,
                GroupStatus::Normal => {
                    if best.map_or(true, |(_, health)| good > health) {
                        best = Some((group.id, good));
                    }
                }
                _ => {}
            }
        }

        for id in empty {
            if let Some(group) = self.groups.remove(&id) {
                for feature_id in group.features {
                    if self.features.remove(&feature_id).is_some() {
                        summary.dropped.push(feature_id);
                    }
                }
            }
            if self.reference == Some(id) {
                self.reference = None;
            }
            summary.groups_removed += 1;
        }

        if need_reference {
            if let Some((id, _)) = best {
                self.make_reference(id, config);
            }
        }
        summary
    }

    /// Marks `id` as the reference group and makes sure at least three of
    /// its features have their depth estimated.
    fn make_reference(&mut self, id: GroupId, config: &FeatureConfig) {
        let Some(group) = self.groups.get_mut(&id) else {
            return;
        };
        group.status = GroupStatus::Reference;
        self.reference = Some(id);

        let mut initialized = group
            .features
            .iter()
            .filter(|&fid| self.features.get(fid).is_some_and(|f| f.is_initialized()))
            .count();
        for fid in &group.features {
            if initialized >= 3 {
                break;
            }
            if let Some(feature) = self.features.get_mut(fid) {
                if feature.force_initialize(config) {
                    initialized += 1;
                }
            }
        }
    }

    /// Median depth variance of the estimated features, or 1 when there are
    /// none.
    pub fn median_depth_variance(&self, cov: &Covariance) -> f64 {
        let mut variances: Vec<f64> = self
            .features
            .values()
            .filter(|f| f.is_initialized() && f.v.meta.is_indexed())
            .map(|f| f.v.variance(cov))
            .collect();
        if variances.is_empty() {
            return 1.0;
        }
        variances.sort_by(|a, b| a.total_cmp(b));
        variances[variances.len() / 2]
    }

    /// Translates every group so `offset` becomes the origin.
    pub fn shift(&mut self, offset: &Vector3<f64>) {
        for group in self.groups.values_mut() {
            group.tr.v -= offset;
        }
        for feature in self.features.values_mut() {
            feature.world -= offset;
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }
}

impl StateBranch for VisionState {
    fn children(&mut self, visit: &mut dyn FnMut(Node<'_>)) {
        for group in self.groups.values_mut() {
            visit(Node::Vector(&mut group.tr));
            visit(Node::Rotation(&mut group.qr));
            for id in &group.features {
                if let Some(feature) = self.features.get_mut(id) {
                    visit(Node::Scalar(&mut feature.v));
                }
            }
        }
    }
}
