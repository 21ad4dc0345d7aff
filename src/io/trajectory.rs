use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use csv::{Writer, WriterBuilder};
use serde::Serialize;

use crate::geometry::SE3;
use crate::sensor::Timestamp;

#[derive(Debug, Serialize)]
struct PoseRecord {
    time_us: u64,
    tx: f64,
    ty: f64,
    tz: f64,
    qw: f64,
    qx: f64,
    qy: f64,
    qz: f64,
}

impl PoseRecord {
    fn new(time: Timestamp, pose: &SE3) -> Self {
        let q = pose.rotation.quaternion();
        Self {
            time_us: time.as_micros(),
            tx: pose.translation.x,
            ty: pose.translation.y,
            tz: pose.translation.z,
            qw: q.w,
            qx: q.i,
            qy: q.j,
            qz: q.k,
        }
    }
}

/// Estimated trajectory as CSV: `time_us,tx,ty,tz,qw,qx,qy,qz`.
pub struct TrajectoryWriter<W: Write> {
    writer: Writer<W>,
    rows: usize,
}

impl TrajectoryWriter<File> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self::new(file))
    }
}

impl<W: Write> TrajectoryWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: WriterBuilder::new().has_headers(true).from_writer(inner),
            rows: 0,
        }
    }

    pub fn write_pose(&mut self, time: Timestamp, pose: &SE3) -> Result<()> {
        self.writer.serialize(PoseRecord::new(time, pose))?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn finish(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("Failed to flush trajectory: {}", err.error()))
    }
}
