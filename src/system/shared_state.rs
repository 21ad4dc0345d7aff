//! State shared between the dispatch context and the host thread.
//!
//! The dispatch context writes a snapshot after every processed sample; the
//! host reads it without touching the filter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::filter::{FeaturePoint, Status};
use crate::geometry::SE3;
use crate::sensor::Timestamp;

/// Outputs as of the last processed sample.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub time: Timestamp,
    pub pose: SE3,
    pub status: Status,
    pub path_length_m: f64,
    /// Updated on camera frames only.
    pub features: Vec<FeaturePoint>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            time: Timestamp::ZERO,
            pose: SE3::identity(),
            status: Status::default(),
            path_length_m: 0.0,
            features: Vec::new(),
        }
    }
}

pub struct SharedState {
    pub snapshot: RwLock<Snapshot>,
    /// Inertial samples reach the filter only while set.
    running: AtomicBool,
    /// Camera frames reach the filter only while set; otherwise they only
    /// refresh the pose.
    processing_video: AtomicBool,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, value: bool) {
        self.running.store(value, Ordering::SeqCst);
    }

    pub fn is_processing_video(&self) -> bool {
        self.processing_video.load(Ordering::SeqCst)
    }

    pub fn set_processing_video(&self, value: bool) {
        self.processing_video.store(value, Ordering::SeqCst);
    }

    pub fn status(&self) -> Status {
        self.snapshot.read().status
    }

    pub fn pose(&self) -> (Timestamp, SE3) {
        let snapshot = self.snapshot.read();
        (snapshot.time, snapshot.pose)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            snapshot: RwLock::new(Snapshot::default()),
            running: AtomicBool::new(false),
            processing_video: AtomicBool::new(false),
        }
    }
}
