//! The host-facing facade: owns the sensor queue, drives the filter from
//! the queue's dispatch context and publishes poses and status.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, error, info};

use crate::calibration::Calibration;
use crate::config::FusionConfig;
use crate::error::Result;
use crate::filter::{ErrorCode, FeaturePoint, Filter, SampleKind, Status};
use crate::geometry::SE3;
use crate::queue::{FusionQueue, QueueStats, SensorSink};
use crate::sensor::{AccelerometerSample, GyroSample, ImageFrame, Timestamp};
use crate::tracking::FeatureTracker;

use super::messages::FusionEvent;
use super::shared_state::SharedState;

/// Events beyond this many unread ones are dropped; the snapshot in
/// [`SharedState`] always holds the latest outputs.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Receives samples from the queue. Everything here runs on the dispatch
/// context, one sample at a time.
pub struct FusionSink {
    filter: Filter,
    shared: Arc<SharedState>,
    events: Sender<FusionEvent>,
    last_status: Status,
}

impl FusionSink {
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut Filter {
        &mut self.filter
    }

    /// Reinitializes the filter and enters a start state.
    fn restart(&mut self, start: impl FnOnce(&mut Filter)) {
        if let Err(err) = self.filter.initialize() {
            error!("filter initialization failed: {}", err);
            return;
        }
        start(&mut self.filter);
    }

    fn send(&self, event: FusionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("event channel full, dropping event"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Emits the status if it changed since the last tick and reacts to
    /// failures.
    fn update_status(&mut self) {
        let status = self.filter.status();
        if status == self.last_status {
            return;
        }

        if status.error == ErrorCode::Other {
            error!("numeric failure, restarting the filter");
            let last_pose = self.filter.pose();
            self.restart(|filter| {
                filter.set_origin(last_pose, true);
                filter.start_dynamic();
            });
        } else if Status::finished_calibration(&self.last_status, &status) {
            info!("calibration finished");
            self.shared.set_running(false);
            self.send(FusionEvent::CalibrationFinished(self.filter.device_calibration()));
        }

        self.shared.snapshot.write().status = status;
        self.send(FusionEvent::Status(status));
        self.last_status = status;
    }

    fn publish(&mut self, time: Timestamp, sample: SampleKind) {
        let pose = self.filter.pose();
        {
            let mut snapshot = self.shared.snapshot.write();
            snapshot.time = time;
            snapshot.pose = pose;
            snapshot.path_length_m = self.filter.path_length();
            if sample == SampleKind::Camera {
                snapshot.features = self.filter.features();
            }
        }
        self.send(FusionEvent::Pose { time, pose, sample });
    }
}

impl SensorSink for FusionSink {
    fn receive_camera(&mut self, frame: ImageFrame) {
        let time = frame.timestamp;
        let publish = if self.shared.is_processing_video() {
            self.filter.image_measurement(&frame)
        } else {
            // preview only: the pose is meaningful once leveled
            self.filter.state().motion.orientation_initialized
        };
        drop(frame);
        self.update_status();
        if publish {
            self.publish(time, SampleKind::Camera);
        }
    }

    fn receive_accelerometer(&mut self, sample: AccelerometerSample) {
        if !self.shared.is_running() {
            return;
        }
        let processed = self.filter.accelerometer_measurement(&sample);
        self.update_status();
        if processed {
            self.publish(sample.timestamp, SampleKind::Accelerometer);
        }
    }

    fn receive_gyro(&mut self, sample: GyroSample) {
        let processed = self.filter.gyroscope_measurement(&sample);
        self.update_status();
        if processed {
            self.publish(sample.timestamp, SampleKind::Gyroscope);
        }
    }
}

/// Sensor fusion engine.
///
/// Samples go in through `receive_*`; the queue orders them and feeds the
/// filter. Results come out as [`FusionEvent`]s and through the snapshot
/// accessors. Control calls are applied between samples.
pub struct SensorFusion {
    queue: FusionQueue<FusionSink>,
    shared: Arc<SharedState>,
    events: Receiver<FusionEvent>,
}

impl SensorFusion {
    pub fn new(calibration: Calibration, config: FusionConfig, tracker: Box<dyn FeatureTracker>) -> Result<Self> {
        let filter = Filter::new(config.filter.clone(), calibration, tracker)?;
        let shared = SharedState::new();
        let (sender, events) = bounded(EVENT_CHANNEL_CAPACITY);
        let sink = FusionSink {
            filter,
            shared: shared.clone(),
            events: sender,
            last_status: Status::default(),
        };
        Ok(Self {
            queue: FusionQueue::new(sink, &config.queue),
            shared,
            events,
        })
    }

    fn start_queue(&mut self, threaded: bool, expect_camera: bool) {
        if threaded {
            self.queue.start_async(expect_camera);
        } else {
            self.queue.start_singlethreaded(expect_camera);
        }
    }

    fn begin(&mut self, processing_video: bool, start: impl FnOnce(&mut Filter) + Send) {
        self.shared.set_running(true);
        self.shared.set_processing_video(processing_video);
        self.queue.dispatch_sync(|sink| sink.restart(start));
    }

    /// Static, portrait and landscape calibration with the camera ignored.
    pub fn start_calibration(&mut self, threaded: bool) {
        self.begin(false, Filter::start_static_calibration);
        self.start_queue(threaded, false);
    }

    /// Starts tracking once the device is held still.
    pub fn start(&mut self, threaded: bool) {
        self.begin(true, Filter::start_hold_steady);
        self.start_queue(threaded, true);
    }

    /// Starts tracking while the device moves.
    pub fn start_unstable(&mut self, threaded: bool) {
        self.begin(true, Filter::start_dynamic);
        self.start_queue(threaded, true);
    }

    /// Replays recorded data: single-threaded, arrival delays ignored.
    pub fn start_offline(&mut self) {
        self.begin(true, |filter| {
            filter.set_ignore_lateness(true);
            filter.start_dynamic();
        });
        self.start_queue(false, true);
    }

    /// Accepts samples before any start; they are processed once started.
    pub fn start_buffering(&self) {
        self.queue.start_buffering();
    }

    /// Processes everything buffered, then stops. Outputs stay readable.
    pub fn stop(&mut self) {
        self.queue.stop_sync();
        self.shared.set_running(false);
        self.shared.set_processing_video(false);
    }

    /// Discards buffered samples and reinitializes with `initial_pose` at
    /// `time`.
    pub fn reset(&mut self, time: Timestamp, initial_pose: SE3, gravity_aligned: bool) -> Result<()> {
        self.stop();
        self.queue.reset();
        self.queue.dispatch_sync(|sink| {
            sink.last_status = Status::default();
            sink.filter.reset_to(time, initial_pose, gravity_aligned)
        })?;
        *self.shared.snapshot.write() = Default::default();
        Ok(())
    }

    /// Stops vision and translation; orientation continues.
    pub fn pause_and_reset_position(&self) {
        self.shared.set_processing_video(false);
        self.queue.dispatch_async(|sink| sink.filter.start_inertial_only());
    }

    pub fn unpause(&self) {
        self.shared.set_processing_video(true);
        self.queue.dispatch_async(|sink| sink.filter.start_dynamic());
    }

    pub fn set_location(&self, latitude_deg: f64, _longitude_deg: f64, altitude_m: f64) {
        self.queue
            .dispatch_async(move |sink| sink.filter.compute_gravity(latitude_deg, altitude_m));
    }

    /// Makes the current pose, gravity aligned, the output origin.
    pub fn set_reference_now(&self) {
        self.queue.dispatch_sync(|sink| sink.filter.set_reference());
    }

    /// Returns false if the queue is not accepting data. The timestamp is
    /// moved to the middle of the exposure.
    pub fn receive_image(&self, mut frame: ImageFrame) -> bool {
        frame.timestamp = frame.timestamp.saturating_add_micros((frame.exposure_us / 2) as i64);
        self.queue.receive_camera(frame)
    }

    pub fn receive_accelerometer(&self, sample: AccelerometerSample) -> bool {
        self.queue.receive_accelerometer(sample)
    }

    pub fn receive_gyro(&self, sample: GyroSample) -> bool {
        self.queue.receive_gyro(sample)
    }

    pub fn events(&self) -> &Receiver<FusionEvent> {
        &self.events
    }

    pub fn latest_status(&self) -> Status {
        self.shared.status()
    }

    pub fn latest_pose(&self) -> (Timestamp, SE3) {
        self.shared.pose()
    }

    pub fn latest_features(&self) -> Vec<FeaturePoint> {
        self.shared.snapshot.read().features.clone()
    }

    pub fn path_length(&self) -> f64 {
        self.shared.snapshot.read().path_length_m
    }

    pub fn device_calibration(&self) -> Calibration {
        self.queue.dispatch_sync(|sink| sink.filter.device_calibration())
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::RunState;
    use crate::tracking::PatchTracker;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn fusion() -> SensorFusion {
        let calibration = Calibration::default_for_device(64, 48);
        SensorFusion::new(calibration, FusionConfig::default(), Box::new(PatchTracker::default())).unwrap()
    }

    fn feed_still(fusion: &SensorFusion, start: u64, count: u64) {
        for k in 0..count {
            let time = Timestamp(start + k * 5_000);
            fusion.receive_gyro(GyroSample::new(time, Vector3::zeros()));
            fusion.receive_accelerometer(AccelerometerSample::new(time, Vector3::new(0.0, 0.0, 9.81)));
        }
    }

    fn drain(fusion: &SensorFusion) -> Vec<FusionEvent> {
        fusion.events().try_iter().collect()
    }

    #[test]
    fn test_inactive_until_started() {
        let fusion = fusion();
        assert!(!fusion.receive_gyro(GyroSample::new(Timestamp(1), Vector3::zeros())));
        assert_eq!(fusion.latest_status(), Status::default());
        assert!(drain(&fusion).is_empty());
    }

    #[test]
    fn test_offline_run_publishes_pose_and_status() {
        let mut fusion = fusion();
        fusion.start_offline();
        feed_still(&fusion, 1_000_000, 100);
        fusion.stop();

        let events = drain(&fusion);
        let statuses: Vec<Status> = events
            .iter()
            .filter_map(|event| match event {
                FusionEvent::Status(status) => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].run_state, RunState::DynamicInitialization);

        let poses = events
            .iter()
            .filter(|event| matches!(event, FusionEvent::Pose { .. }))
            .count();
        assert!(poses > 150);

        let (time, pose) = fusion.latest_pose();
        assert_eq!(time, Timestamp(1_000_000 + 99 * 5_000));
        assert_relative_eq!(pose.rotation * Vector3::z(), Vector3::z(), epsilon = 1e-3);
        let stats = fusion.queue_stats();
        assert_eq!(stats.accelerometer.total_out, 100);
        assert_eq!(stats.gyroscope.total_out, 100);
    }

    #[test]
    fn test_image_timestamp_centered_in_exposure() {
        let mut fusion = fusion();
        fusion.start_offline();
        feed_still(&fusion, 1_000_000, 40);
        let frame = ImageFrame::new(Timestamp(1_200_000), 64, 48, 64, vec![0u8; 64 * 48].into()).with_exposure(20_000);
        assert!(fusion.receive_image(frame));
        feed_still(&fusion, 1_200_000, 40);
        fusion.stop();

        let camera_times: Vec<Timestamp> = drain(&fusion)
            .into_iter()
            .filter_map(|event| match event {
                FusionEvent::Pose {
                    time,
                    sample: SampleKind::Camera,
                    ..
                } => Some(time),
                _ => None,
            })
            .collect();
        assert_eq!(camera_times, vec![Timestamp(1_210_000)]);
    }

    #[test]
    fn test_threaded_run_consumes_everything() {
        let mut fusion = fusion();
        fusion.start_unstable(true);
        feed_still(&fusion, 1_000_000, 100);
        fusion.stop();

        let stats = fusion.queue_stats();
        assert_eq!(stats.accelerometer.total_in, 100);
        assert_eq!(stats.accelerometer.total_out + stats.accelerometer.drop_late + stats.accelerometer.drop_full, 100);
        assert_eq!(fusion.latest_status().run_state, RunState::DynamicInitialization);
    }

    #[test]
    fn test_pause_and_unpause() {
        let mut fusion = fusion();
        fusion.start_offline();
        feed_still(&fusion, 1_000_000, 20);
        fusion.pause_and_reset_position();
        feed_still(&fusion, 1_100_000, 5);
        assert_eq!(fusion.latest_status().run_state, RunState::InertialOnly);
        fusion.unpause();
        feed_still(&fusion, 1_125_000, 5);
        fusion.stop();
        assert_eq!(fusion.latest_status().run_state, RunState::DynamicInitialization);
    }

    #[test]
    fn test_calibration_reaches_portrait() {
        let mut fusion = fusion();
        fusion.start_calibration(false);
        feed_still(&fusion, 1_000_000, 400);
        fusion.stop();

        let states: Vec<RunState> = drain(&fusion)
            .into_iter()
            .filter_map(|event| match event {
                FusionEvent::Status(status) => Some(status.run_state),
                _ => None,
            })
            .collect();
        assert_eq!(states.first(), Some(&RunState::StaticCalibration));
        assert!(states.contains(&RunState::PortraitCalibration));
        let calibration = fusion.device_calibration();
        assert_relative_eq!(calibration.imu().unwrap().accelerometer.measurement_variance, 5e-3);
    }

    #[test]
    fn test_reset_clears_outputs() {
        let mut fusion = fusion();
        fusion.start_offline();
        feed_still(&fusion, 1_000_000, 20);
        let origin = SE3::new(nalgebra::UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0));
        fusion.reset(Timestamp(2_000_000), origin, true).unwrap();
        assert_eq!(fusion.latest_status(), Status::default());
        assert_eq!(fusion.latest_pose().0, Timestamp::ZERO);
        assert_eq!(fusion.path_length(), 0.0);
    }
}
