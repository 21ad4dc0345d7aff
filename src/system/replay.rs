//! Offline replay of a capture file through the fusion engine.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::calibration::Calibration;
use crate::config::FusionConfig;
use crate::filter::{SampleKind, Status};
use crate::geometry::SE3;
use crate::io::packet::CONTROL_SET_REFERENCE;
use crate::io::{Packet, PacketReader, TrajectoryWriter};
use crate::queue::QueueStats;
use crate::sensor::{ImageFrame, Timestamp};
use crate::tracking::PatchTracker;

use super::messages::FusionEvent;
use super::sensor_fusion::SensorFusion;

/// Captures do not record exposure; frames are assumed to be exposed for a
/// full 30 Hz period.
const DEFAULT_EXPOSURE_US: u64 = 33_333;

/// Realtime playback skips over recording gaps longer than this.
const MAX_REALTIME_GAP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ReplayResult {
    pub packets: usize,
    pub path_length_m: f64,
    pub final_pose: SE3,
    pub final_status: Status,
    pub queue_stats: QueueStats,
}

pub struct Replay {
    reader: PacketReader<BufReader<File>>,
    fusion: SensorFusion,
    realtime: bool,
    trajectory: Option<TrajectoryWriter<File>>,
}

impl Replay {
    pub fn open<P: AsRef<Path>>(path: P, calibration: Calibration, config: FusionConfig) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open capture {}", path.display()))?;
        let fusion = SensorFusion::new(calibration, config, Box::new(PatchTracker::default()))
            .context("Failed to set up sensor fusion")?;
        Ok(Self {
            reader: PacketReader::new(BufReader::new(file)),
            fusion,
            realtime: false,
            trajectory: None,
        })
    }

    /// Calibration stored next to a capture: `<capture>.json`, then
    /// `calibration.json` in the same directory.
    pub fn find_calibration(capture: &Path) -> Option<PathBuf> {
        let mut beside = capture.as_os_str().to_owned();
        beside.push(".json");
        let beside = PathBuf::from(beside);
        if beside.is_file() {
            return Some(beside);
        }
        let shared = capture.parent().unwrap_or(Path::new(".")).join("calibration.json");
        shared.is_file().then_some(shared)
    }

    /// Paces packets to their recorded timestamps.
    pub fn set_realtime(&mut self, realtime: bool) {
        self.realtime = realtime;
    }

    pub fn write_trajectory<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.trajectory = Some(TrajectoryWriter::create(path)?);
        Ok(())
    }

    pub fn fusion(&self) -> &SensorFusion {
        &self.fusion
    }

    /// Feeds every packet to the engine and hands each output event to
    /// `observer`.
    pub fn run<F>(mut self, mut observer: F) -> Result<ReplayResult>
    where
        F: FnMut(&FusionEvent),
    {
        self.fusion.start_offline();
        let started = Instant::now();
        let mut first_time: Option<Timestamp> = None;
        let mut skipped = Duration::ZERO;
        let mut packets = 0;

        while let Some(packet) = self.reader.next_packet().context("Failed to read capture")? {
            if self.realtime {
                let first = *first_time.get_or_insert(packet.time());
                let due = Duration::from_micros(packet.time().as_micros().saturating_sub(first.as_micros()));
                let due = due.saturating_sub(skipped);
                let elapsed = started.elapsed();
                if due > elapsed + MAX_REALTIME_GAP {
                    warn!("skipping a {:.3} second gap", (due - elapsed).as_secs_f64());
                    skipped += due - elapsed;
                } else if due > elapsed {
                    thread::sleep(due - elapsed);
                }
            }

            self.dispatch(packet);
            packets += 1;
            self.drain(&mut observer)?;
        }

        self.fusion.stop();
        self.drain(&mut observer)?;
        if let Some(trajectory) = self.trajectory.take() {
            let rows = trajectory.rows();
            trajectory.finish()?;
            info!("wrote {} trajectory rows", rows);
        }

        Ok(ReplayResult {
            packets,
            path_length_m: self.fusion.path_length(),
            final_pose: self.fusion.latest_pose().1,
            final_status: self.fusion.latest_status(),
            queue_stats: self.fusion.queue_stats(),
        })
    }

    fn dispatch(&self, packet: Packet) {
        match packet {
            Packet::Camera {
                time,
                width,
                height,
                pixels,
            } => {
                let frame = ImageFrame::new(time, width, height, width, pixels.into()).with_exposure(DEFAULT_EXPOSURE_US);
                self.fusion.receive_image(frame);
            }
            Packet::Accelerometer(sample) => {
                self.fusion.receive_accelerometer(sample);
            }
            Packet::Gyroscope(sample) => {
                self.fusion.receive_gyro(sample);
            }
            Packet::Imu { accel, gyro } => {
                self.fusion.receive_accelerometer(accel);
                self.fusion.receive_gyro(gyro);
            }
            Packet::FilterControl { code, .. } => {
                if code == CONTROL_SET_REFERENCE {
                    self.fusion.set_reference_now();
                }
            }
            Packet::Unknown(header) => debug!("skipping packet type {}", header.kind),
        }
    }

    fn drain<F: FnMut(&FusionEvent)>(&mut self, observer: &mut F) -> Result<()> {
        for event in self.fusion.events().try_iter() {
            if let (Some(trajectory), FusionEvent::Pose { time, pose, sample: SampleKind::Camera }) = (self.trajectory.as_mut(), &event) {
                trajectory.write_pose(*time, pose)?;
            }
            observer(&event);
        }
        Ok(())
    }
}
