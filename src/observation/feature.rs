//! Pixel measurement of a tracked vision feature.
//!
//! A feature lives in the camera frame of its group at `ray·d`, with `d` the
//! reference depth. Its predicted pixel is the projection of that point into
//! the current camera:
//!
//! `X_c = Rcᵀ·(Rᵀ·(Rr·(Rc·X_ref + Tc) + Tr − T) − Tc)`

use nalgebra::{Matrix2x3, Matrix3, Vector2, Vector3};

use crate::config::FeatureConfig;
use crate::geometry::skew;
use crate::numerics::KalmanScratch;
use crate::sensor::Timestamp;
use crate::state::{FeatureId, FeatureStatus, FilterState};
use crate::tracking::TrackRequest;

use super::{add_block, TrackingContext};

/// Inverse depth search interval for triangulation, m⁻¹.
const MIN_INVERSE_DEPTH: f64 = 0.01;
const MAX_INVERSE_DEPTH: f64 = 10.0;
const TRIANGULATION_ITERATIONS: usize = 10;

/// Baseline, in multiples of the pixel standard deviation, at which a
/// feature's depth becomes observable.
const BASELINE_SIGMAS: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct FeatureObservation {
    pub feature: FeatureId,
    pub time: Timestamp,
    meas: Vector2<f64>,
    pred: Vector2<f64>,
    visible: bool,
    initialized: bool,
    variance: f64,
    /// Point in the group camera frame.
    x_ref: Vector3<f64>,
    /// Point in the current camera frame.
    x_c: Vector3<f64>,
    /// `X_w − T`
    relative_world: Vector3<f64>,
    /// `Rr·(Rc·X_ref + Tc)`
    rotated_anchor: Vector3<f64>,
    /// World to current camera rotation, `Rcᵀ·Rᵀ`.
    world_to_camera: Matrix3<f64>,
    /// Group camera to current camera.
    rtot: Matrix3<f64>,
    ttot: Vector3<f64>,
}

impl FeatureObservation {
    pub const SIZE: usize = 2;

    pub fn new(feature: FeatureId, time: Timestamp) -> Self {
        Self {
            feature,
            time,
            meas: Vector2::zeros(),
            pred: Vector2::zeros(),
            visible: false,
            initialized: false,
            variance: 0.0,
            x_ref: Vector3::zeros(),
            x_c: Vector3::zeros(),
            relative_world: Vector3::zeros(),
            rotated_anchor: Vector3::zeros(),
            world_to_camera: Matrix3::identity(),
            rtot: Matrix3::identity(),
            ttot: Vector3::zeros(),
        }
    }

    pub fn prediction(&self) -> &Vector2<f64> {
        &self.pred
    }

    pub fn measurement(&self) -> &Vector2<f64> {
        &self.meas
    }

    pub fn predict(&mut self, state: &mut FilterState) {
        let Some(feature) = state.vision.features.get(&self.feature) else {
            self.visible = false;
            return;
        };
        let Some(group) = state.vision.groups.get(&feature.group) else {
            self.visible = false;
            return;
        };

        let r = state.motion.q.v.to_rotation_matrix().into_inner();
        let rr = group.qr.v.to_rotation_matrix().into_inner();
        let rc = state.camera.extrinsics.rotation_matrix();
        let tc = state.camera.extrinsics.translation;
        let rct = rc.transpose();

        self.x_ref = feature.ray * feature.reference_depth();
        self.rotated_anchor = rr * (rc * self.x_ref + tc);
        let world = self.rotated_anchor + group.tr.v;
        self.relative_world = world - state.motion.t.v;
        self.world_to_camera = rct * r.transpose();
        self.x_c = rct * (r.transpose() * self.relative_world - tc);
        self.rtot = self.world_to_camera * rr * rc;
        self.ttot = rct * (r.transpose() * (rr * tc + group.tr.v - state.motion.t.v) - tc);
        self.initialized = feature.is_initialized();

        let projected = state.camera.project(&self.x_c);
        self.visible = projected.is_some();
        if let Some(pixel) = projected {
            self.pred = pixel;
        }

        let depth = self.x_c.z;
        if let Some(feature) = state.vision.features.get_mut(&self.feature) {
            feature.world = world;
            feature.depth = depth;
            if let Some(pixel) = projected {
                feature.prediction = pixel;
            }
        }
    }

    /// Tracks the feature into the new image. A lost feature is marked
    /// dropped and its observation pruned.
    pub fn measure(&mut self, state: &mut FilterState, tracking: Option<&mut TrackingContext<'_>>, config: &FeatureConfig) -> bool {
        let Some(tracking) = tracking else {
            return false;
        };
        let Some(feature) = state.vision.features.get_mut(&self.feature) else {
            return false;
        };
        if !self.visible {
            feature.image_velocity = Vector2::zeros();
            feature.status = FeatureStatus::Dropped;
            return false;
        }

        let request = TrackRequest {
            id: feature.id,
            current: feature.current,
            velocity: feature.image_velocity,
            prediction: self.pred,
        };
        match tracking.tracker.track(&tracking.image, &request) {
            Some(found) => {
                feature.image_velocity = found - feature.current;
                feature.current = found;
                feature.last_seen = self.time;
                self.meas = found;
            }
            None => {
                feature.image_velocity = Vector2::zeros();
                feature.status = FeatureStatus::Dropped;
                return false;
            }
        }

        if !feature.is_initialized() {
            self.triangulate(state, config);
            self.predict(state);
        }
        self.visible
    }

    /// Picks the depth along the reference ray that best explains the
    /// measurement, by bisection over inverse depth. Promotes the feature
    /// once the baseline makes its depth observable.
    fn triangulate(&mut self, state: &mut FilterState, config: &FeatureConfig) {
        let camera = &state.camera;
        let Some(feature) = state.vision.features.get(&self.feature) else {
            return;
        };
        let at_infinity = self.rtot * feature.ray;
        let normalized = |p: Vector3<f64>| Vector2::new(p.x / p.z, p.y / p.z);

        let near = at_infinity + MAX_INVERSE_DEPTH * self.ttot;
        let baseline = (normalized(at_infinity) - normalized(near)).norm_squared()
            * camera.focal_length.v
            * camera.focal_length.v;
        let observable = at_infinity.z > 0.0
            && near.z > 0.0
            && baseline > BASELINE_SIGMAS * BASELINE_SIGMAS * config.measurement_var;

        let meas = self.meas;
        let residual = |inverse_depth: f64| {
            camera
                .project(&(at_infinity + inverse_depth * self.ttot))
                .map_or(f64::INFINITY, |pixel| (pixel - meas).norm_squared())
        };

        let (mut min, mut max) = (MIN_INVERSE_DEPTH, MAX_INVERSE_DEPTH);
        let mut min_d2 = residual(min);
        let mut max_d2 = residual(max);
        let (mut best, mut best_d2) = (min, min_d2);
        for _ in 0..TRIANGULATION_ITERATIONS {
            if min_d2 < max_d2 {
                max = 0.5 * (min + max);
                max_d2 = residual(max);
                if min_d2 < best_d2 {
                    best_d2 = min_d2;
                    best = min;
                }
            } else {
                min = 0.5 * (min + max);
                min_d2 = residual(min);
                if max_d2 < best_d2 {
                    best_d2 = max_d2;
                    best = max;
                }
            }
        }

        if let Some(feature) = state.vision.features.get_mut(&self.feature) {
            if best > MIN_INVERSE_DEPTH && best < MAX_INVERSE_DEPTH {
                feature.set_depth(1.0 / best);
            }
            if observable {
                feature.promote();
            }
        }
    }

    pub fn innovation(&self, i: usize) -> f64 {
        self.meas[i] - self.pred[i]
    }

    /// Pixel variance, inflated in proportion to how far the residual lies
    /// beyond the outlier threshold. Accumulates the feature's outlier score.
    pub fn measurement_variance(&mut self, state: &mut FilterState, config: &FeatureConfig) -> f64 {
        let residual = (self.meas - self.pred).norm_squared();
        let threshold = config.measurement_var * config.outlier_thresh * config.outlier_thresh;
        let feature = state.vision.features.get_mut(&self.feature);
        self.variance = if residual > threshold {
            let ratio = (residual / threshold).sqrt();
            if let Some(feature) = feature {
                feature.outlier += ratio;
            }
            ratio * config.measurement_var
        } else {
            if let Some(feature) = feature {
                feature.outlier = 0.0;
            }
            config.measurement_var
        };
        self.variance
    }

    pub fn fill_jacobian(&self, state: &FilterState, scratch: &mut KalmanScratch, row: usize) {
        let Some(feature) = state.vision.features.get(&self.feature) else {
            return;
        };
        let Some(group) = state.vision.groups.get(&feature.group) else {
            return;
        };
        let camera = &state.camera;
        let j: Matrix2x3<f64> = camera.projection_jacobian(&self.x_c);
        let j_world = j * self.world_to_camera;

        add_block(scratch, row, &state.motion.q.meta, &(j_world * skew(&self.relative_world)));
        add_block(scratch, row, &group.qr.meta, &(-j_world * skew(&self.rotated_anchor)));
        if !self.initialized {
            return;
        }

        add_block(scratch, row, &state.motion.t.meta, &(-j_world));
        add_block(scratch, row, &group.tr.meta, &j_world);
        add_block(scratch, row, &feature.v.meta, &(j * (self.rtot * -self.x_ref)));

        if !camera.estimate_intrinsics {
            return;
        }
        let f = camera.focal_length.v;
        let depth = feature.reference_depth();
        let ray = Vector2::new(feature.ray.x, feature.ray.y);
        let kr_ref = camera.distortion_factor(&ray);
        let predicted = Vector2::new(self.x_c.x / self.x_c.z, self.x_c.y / self.x_c.z);
        let kr = camera.distortion_factor(&predicted);
        let through_ray = |d_ray: Vector2<f64>| j * (self.rtot * (depth * Vector3::new(d_ray.x, d_ray.y, 0.0)));

        let d_f = predicted * kr + through_ray(-ray / f);
        let d_cx = Vector2::new(1.0, 0.0) + through_ray(Vector2::new(-1.0 / (kr_ref * f), 0.0));
        let d_cy = Vector2::new(0.0, 1.0) + through_ray(Vector2::new(0.0, -1.0 / (kr_ref * f)));
        add_block(scratch, row, &camera.focal_length.meta, &d_f);
        add_block(scratch, row, &camera.center_x.meta, &d_cx);
        add_block(scratch, row, &camera.center_y.meta, &d_cy);

        let dkr = camera.distortion_jacobian(&predicted);
        let dkr_ref = camera.distortion_jacobian(&ray);
        for (k, leaf) in [&camera.k1, &camera.k2, &camera.k3].into_iter().enumerate() {
            let d_k = predicted * (f * dkr[k]) + through_ray(-ray * (dkr_ref[k] / kr_ref));
            add_block(scratch, row, &leaf.meta, &d_k);
        }
    }
}
