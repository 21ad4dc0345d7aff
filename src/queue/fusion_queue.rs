use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::QueueConfig;
use crate::sensor::{AccelerometerSample, GyroSample, ImageFrame, Timestamp};

use super::stream::{SensorStream, StreamStats};
use super::{LatencyStrategy, SensorSink};

type Control<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Snapshot of per-stream counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueStats {
    pub camera: StreamStats,
    pub accelerometer: StreamStats,
    pub gyroscope: StreamStats,
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Camera: {}", self.camera)?;
        writeln!(f, "Accel: {}", self.accelerometer)?;
        write!(f, "Gyro: {}", self.gyroscope)
    }
}

enum Dispatch {
    Camera(ImageFrame),
    Accelerometer(AccelerometerSample),
    Gyro(GyroSample),
}

struct QueueState<S> {
    camera: SensorStream<ImageFrame>,
    accel: SensorStream<AccelerometerSample>,
    gyro: SensorStream<GyroSample>,
    controls: VecDeque<Control<S>>,
    active: bool,
    /// Set by the dispatcher thread while its loop runs.
    dispatching: bool,
    wait_for_camera: bool,
    singlethreaded: bool,
    /// Set by `stop_async`; the dispatcher drains the buffers before exiting.
    flush_on_exit: bool,
    last_dispatched: Timestamp,
    strategy: LatencyStrategy,
    jitter_us: u64,
}

impl<S> QueueState<S> {
    fn global_latest_received(&self) -> Timestamp {
        self.camera
            .stats
            .last_in
            .max(self.accel.stats.last_in)
            .max(self.gyro.stats.last_in)
    }

    fn ok_to_dispatch(&self, time: Timestamp) -> bool {
        if self.strategy == LatencyStrategy::EliminateLatency {
            return true;
        }

        if self.camera.is_full() || self.accel.is_full() || self.gyro.is_full() {
            return true;
        }

        if self.strategy == LatencyStrategy::EliminateDrops {
            if self.wait_for_camera && self.camera.is_empty() {
                return false;
            }
            return !self.accel.is_empty() && !self.gyro.is_empty();
        }

        // Without a camera there is nothing to trigger on.
        let strategy = if self.strategy == LatencyStrategy::ImageTrigger && !self.wait_for_camera {
            LatencyStrategy::MinimizeDrops
        } else {
            self.strategy
        };

        if strategy == LatencyStrategy::ImageTrigger {
            return !self.camera.is_empty();
        }

        let camera_expected = self.camera.expected(time);
        let accel_expected = self.accel.expected(time);
        let gyro_expected = self.gyro.expected(time);

        let latest = self.global_latest_received();
        let camera_late = self.camera.late(latest, self.jitter_us);
        let accel_late = self.accel.late(latest, self.jitter_us);
        let gyro_late = self.gyro.late(latest, self.jitter_us);

        let camera_missing = self.wait_for_camera && self.camera.is_empty();

        match strategy {
            LatencyStrategy::Balanced => {
                if camera_missing && camera_expected {
                    return false;
                }
                if accel_expected && self.accel.is_empty() && (camera_missing || !accel_late) {
                    return false;
                }
                if gyro_expected && self.gyro.is_empty() && (camera_missing || !gyro_late) {
                    return false;
                }
                true
            }
            LatencyStrategy::MinimizeLatency => {
                if camera_missing && camera_expected && !camera_late {
                    return false;
                }
                if accel_expected && self.accel.is_empty() && !accel_late {
                    return false;
                }
                if gyro_expected && self.gyro.is_empty() && !gyro_late {
                    return false;
                }
                true
            }
            _ => {
                if camera_missing && camera_expected {
                    return false;
                }
                if accel_expected && self.accel.is_empty() {
                    return false;
                }
                if gyro_expected && self.gyro.is_empty() {
                    return false;
                }
                true
            }
        }
    }

    /// Pops the oldest eligible sample. Ties go camera, accelerometer, gyro.
    fn next_dispatch(&mut self, force: bool) -> Option<Dispatch> {
        let camera_time = self.camera.next_time(self.last_dispatched);
        let accel_time = self.accel.next_time(self.last_dispatched);
        let gyro_time = self.gyro.next_time(self.last_dispatched);

        let not_after = |t: Timestamp, other: Option<Timestamp>| other.map_or(true, |o| t <= o);

        let (time, pick) = match (camera_time, accel_time, gyro_time) {
            (Some(c), a, g) if not_after(c, a) && not_after(c, g) => (c, 0),
            (_, Some(a), g) if not_after(a, g) => (a, 1),
            (_, _, Some(g)) => (g, 2),
            _ => return None,
        };

        if !force && !self.ok_to_dispatch(time) {
            return None;
        }

        self.last_dispatched = time;
        match pick {
            0 => self.camera.pop().map(Dispatch::Camera),
            1 => self.accel.pop().map(Dispatch::Accelerometer),
            _ => self.gyro.pop().map(Dispatch::Gyro),
        }
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            camera: self.camera.stats,
            accelerometer: self.accel.stats,
            gyroscope: self.gyro.stats,
        }
    }
}

struct Shared<S> {
    state: Mutex<QueueState<S>>,
    cond: Condvar,
    /// Locked only after `state` when both are needed.
    sink: Mutex<S>,
}

impl<S: SensorSink> Shared<S> {
    fn run_control(&self, guard: &mut MutexGuard<'_, QueueState<S>>) -> bool {
        let Some(control) = guard.controls.pop_front() else {
            return false;
        };
        MutexGuard::unlocked(guard, || control(&mut *self.sink.lock()));
        true
    }

    fn dispatch_next(&self, guard: &mut MutexGuard<'_, QueueState<S>>, force: bool) -> bool {
        let Some(item) = guard.next_dispatch(force) else {
            return false;
        };
        MutexGuard::unlocked(guard, || {
            let mut sink = self.sink.lock();
            match item {
                Dispatch::Camera(frame) => sink.receive_camera(frame),
                Dispatch::Accelerometer(sample) => sink.receive_accelerometer(sample),
                Dispatch::Gyro(sample) => sink.receive_gyro(sample),
            }
        });
        true
    }

    fn dispatch_singlethread(&self, force: bool) {
        let mut guard = self.state.lock();
        while self.run_control(&mut guard) || self.dispatch_next(&mut guard, force) {}
    }

    fn runloop(&self) {
        let mut guard = self.state.lock();
        guard.dispatching = true;
        self.cond.notify_all();

        while guard.active {
            while guard.active && !self.run_control(&mut guard) && !self.dispatch_next(&mut guard, false) {
                self.cond.wait(&mut guard);
            }
            // Greedy: we are only woken when new data arrives.
            while self.run_control(&mut guard) || self.dispatch_next(&mut guard, false) {}
        }

        if guard.flush_on_exit {
            while self.run_control(&mut guard) || self.dispatch_next(&mut guard, true) {}
        }
        guard.dispatching = false;
        info!("Sensor queue finished\n{}", guard.stats());
    }
}

/// Merges sensor streams into one causally ordered sequence for a sink.
///
/// Three scheduling modes are supported: a background dispatcher thread
/// (`start_async` / `start_sync`), and a cooperative mode
/// (`start_singlethreaded`) in which every `receive_*` call dispatches
/// synchronously on the caller's thread. The cooperative mode expects a
/// single producer thread.
pub struct FusionQueue<S: SensorSink> {
    shared: Arc<Shared<S>>,
    thread: Option<JoinHandle<()>>,
}

impl<S: SensorSink> FusionQueue<S> {
    pub fn new(sink: S, config: &QueueConfig) -> Self {
        let state = QueueState {
            camera: SensorStream::new(config.camera_capacity),
            accel: SensorStream::new(config.accelerometer_capacity),
            gyro: SensorStream::new(config.gyroscope_capacity),
            controls: VecDeque::new(),
            active: false,
            dispatching: false,
            wait_for_camera: true,
            singlethreaded: false,
            flush_on_exit: false,
            last_dispatched: Timestamp::ZERO,
            strategy: config.strategy,
            jitter_us: config.jitter_us,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                cond: Condvar::new(),
                sink: Mutex::new(sink),
            }),
            thread: None,
        }
    }

    pub fn strategy(&self) -> LatencyStrategy {
        self.shared.state.lock().strategy
    }

    pub fn set_strategy(&self, strategy: LatencyStrategy) {
        self.shared.state.lock().strategy = strategy;
    }

    pub fn is_active(&self) -> bool {
        self.shared.state.lock().active
    }

    // ─────────────────────────────────────────────────────────────────────
    // Ingestion
    // ─────────────────────────────────────────────────────────────────────

    /// Returns false if the queue is not accepting data.
    pub fn receive_camera(&self, frame: ImageFrame) -> bool {
        self.push(|state| &mut state.camera, frame)
    }

    pub fn receive_accelerometer(&self, sample: AccelerometerSample) -> bool {
        self.push(|state| &mut state.accel, sample)
    }

    pub fn receive_gyro(&self, sample: GyroSample) -> bool {
        self.push(|state| &mut state.gyro, sample)
    }

    fn push<T, F>(&self, stream: F, sample: T) -> bool
    where
        T: crate::sensor::SensorSample,
        F: FnOnce(&mut QueueState<S>) -> &mut SensorStream<T>,
    {
        let singlethreaded = {
            let mut guard = self.shared.state.lock();
            if !guard.active {
                return false;
            }
            stream(&mut *guard).push(sample);
            guard.singlethreaded
        };
        self.shared.cond.notify_all();
        if singlethreaded {
            self.shared.dispatch_singlethread(false);
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────
    // Control injection
    // ─────────────────────────────────────────────────────────────────────

    /// Runs `f` on the sink right now, between two dispatched samples.
    pub fn dispatch_sync<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut S) -> R,
    {
        let _state = self.shared.state.lock();
        let mut sink = self.shared.sink.lock();
        f(&mut *sink)
    }

    /// Queues `f` to run on the sink from the dispatch context, ahead of the
    /// next sample.
    pub fn dispatch_async<F>(&self, f: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let singlethreaded = {
            let mut guard = self.shared.state.lock();
            guard.controls.push_back(Box::new(f));
            guard.singlethreaded
        };
        self.shared.cond.notify_all();
        if singlethreaded {
            self.shared.dispatch_singlethread(false);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Accepts and holds samples without dispatching them.
    pub fn start_buffering(&self) {
        self.shared.state.lock().active = true;
    }

    /// Starts the dispatcher thread. The queue accepts data from the moment
    /// this returns.
    pub fn start_async(&mut self, expect_camera: bool) {
        // A stopped dispatcher is on its way out and will not see the restart.
        if !self.shared.state.lock().active {
            self.wait_until_finished();
        }
        {
            let mut guard = self.shared.state.lock();
            guard.wait_for_camera = expect_camera;
            guard.singlethreaded = false;
            guard.flush_on_exit = false;
            guard.active = true;
        }
        if self.thread.is_none() {
            self.spawn();
        }
    }

    /// Like `start_async`, but returns only once the dispatcher is running,
    /// or once it has been stopped again.
    pub fn start_sync(&mut self, expect_camera: bool) {
        self.start_async(expect_camera);
        let shared = Arc::clone(&self.shared);
        let mut guard = shared.state.lock();
        while guard.active && !guard.dispatching {
            shared.cond.wait(&mut guard);
        }
    }

    fn spawn(&mut self) {
        let shared = self.shared.clone();
        debug!("Starting sensor dispatcher thread");
        self.thread = Some(thread::spawn(move || shared.runloop()));
    }

    pub fn start_singlethreaded(&mut self, expect_camera: bool) {
        {
            let mut guard = self.shared.state.lock();
            guard.wait_for_camera = expect_camera;
            guard.singlethreaded = true;
            guard.active = true;
        }
        // Anything buffered before the start goes out now.
        self.shared.dispatch_singlethread(false);
    }

    /// Stops accepting data. The dispatcher finishes its current sample and
    /// exits without flushing.
    pub fn stop_immediately(&self) {
        {
            let mut guard = self.shared.state.lock();
            guard.active = false;
            guard.flush_on_exit = false;
        }
        self.shared.cond.notify_all();
    }

    /// Stops accepting data. Buffered samples are flushed before the
    /// dispatcher exits; in single-threaded mode the flush happens here.
    pub fn stop_async(&self) {
        let singlethreaded = self.shared.state.lock().singlethreaded;
        if singlethreaded {
            self.shared.dispatch_singlethread(true);
            info!("Sensor queue finished\n{}", self.stats());
            self.stop_immediately();
            return;
        }
        {
            let mut guard = self.shared.state.lock();
            guard.active = false;
            guard.flush_on_exit = true;
        }
        self.shared.cond.notify_all();
    }

    /// Flushes all buffered samples and waits for the dispatcher to exit.
    pub fn stop_sync(&mut self) {
        self.stop_async();
        self.wait_until_finished();
    }

    pub fn wait_until_finished(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Stops the dispatcher and discards every buffered sample and control.
    pub fn reset(&mut self) {
        self.stop_immediately();
        self.wait_until_finished();
        let mut guard = self.shared.state.lock();
        guard.camera.reset();
        guard.accel.reset();
        guard.gyro.reset();
        guard.controls.clear();
        guard.active = false;
        guard.dispatching = false;
        guard.singlethreaded = false;
        guard.flush_on_exit = false;
        guard.last_dispatched = Timestamp::ZERO;
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.state.lock().stats()
    }

    /// Number of samples currently buffered in (camera, accel, gyro).
    pub fn pending(&self) -> (usize, usize, usize) {
        let guard = self.shared.state.lock();
        (guard.camera.len(), guard.accel.len(), guard.gyro.len())
    }
}

impl<S: SensorSink> Drop for FusionQueue<S> {
    fn drop(&mut self) {
        self.stop_immediately();
        self.wait_until_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Kind {
        Camera,
        Accel,
        Gyro,
        Control,
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<(Kind, Timestamp)>,
    }

    impl SensorSink for Recorder {
        fn receive_camera(&mut self, frame: ImageFrame) {
            self.events.push((Kind::Camera, frame.timestamp));
        }
        fn receive_accelerometer(&mut self, sample: AccelerometerSample) {
            self.events.push((Kind::Accel, sample.timestamp));
        }
        fn receive_gyro(&mut self, sample: GyroSample) {
            self.events.push((Kind::Gyro, sample.timestamp));
        }
    }

    fn config(strategy: LatencyStrategy) -> QueueConfig {
        QueueConfig {
            strategy,
            ..QueueConfig::default()
        }
    }

    fn accel(t: u64) -> AccelerometerSample {
        AccelerometerSample::new(Timestamp(t), Vector3::new(0.0, 0.0, 9.8))
    }

    fn gyro(t: u64) -> GyroSample {
        GyroSample::new(Timestamp(t), Vector3::zeros())
    }

    fn frame(t: u64) -> ImageFrame {
        ImageFrame::new(Timestamp(t), 2, 2, 2, Arc::from(vec![0u8; 4]))
    }

    fn events<S: SensorSink + Clone>(queue: &FusionQueue<S>) -> S {
        queue.dispatch_sync(|sink| sink.clone())
    }

    impl Clone for Recorder {
        fn clone(&self) -> Self {
            Self {
                events: self.events.clone(),
            }
        }
    }

    #[test]
    fn test_overflow_keeps_capacity() {
        let queue = FusionQueue::new(Recorder::default(), &config(LatencyStrategy::MinimizeDrops));
        queue.start_buffering();
        for i in 1..=50 {
            assert!(queue.receive_accelerometer(accel(i * 1000)));
        }
        let stats = queue.stats();
        assert_eq!(queue.pending().1, 32);
        assert_eq!(stats.accelerometer.drop_full, 50 - 32);
        assert!(events(&queue).events.is_empty());
    }

    #[test]
    fn test_inactive_queue_rejects() {
        let queue = FusionQueue::new(Recorder::default(), &config(LatencyStrategy::MinimizeDrops));
        assert!(!queue.receive_gyro(gyro(1000)));
        assert_eq!(queue.stats().gyroscope.total_in, 0);
    }

    #[test]
    fn test_singlethreaded_dispatch_is_ordered() {
        let mut queue = FusionQueue::new(Recorder::default(), &config(LatencyStrategy::MinimizeDrops));
        queue.start_singlethreaded(true);
        // interleaved with jitter between streams
        for i in 0..40u64 {
            let base = 10_000 + i * 5_000;
            queue.receive_gyro(gyro(base + 700));
            queue.receive_accelerometer(accel(base));
            if i % 6 == 0 {
                queue.receive_camera(frame(base + 2_000));
            }
        }
        queue.stop_sync();

        let recorded = events(&queue).events;
        assert!(!recorded.is_empty());
        for pair in recorded.windows(2) {
            assert!(pair[0].1 <= pair[1].1, "{:?} dispatched after {:?}", pair[1], pair[0]);
        }
        let stats = queue.stats();
        let delivered = stats.camera.total_out + stats.accelerometer.total_out + stats.gyroscope.total_out;
        assert_eq!(delivered as usize, recorded.len());
    }

    #[test]
    fn test_eliminate_drops_waits_for_all_streams() {
        let mut queue = FusionQueue::new(Recorder::default(), &config(LatencyStrategy::EliminateDrops));
        queue.start_singlethreaded(false);
        for i in 1..=5 {
            queue.receive_accelerometer(accel(i * 1000));
        }
        assert!(events(&queue).events.is_empty());

        queue.receive_gyro(gyro(10_500));
        let recorded = events(&queue).events;
        // accel samples flow once gyro has data; gyro itself waits for more accel
        assert_eq!(recorded.len(), 5);
        assert!(recorded.iter().all(|(kind, _)| *kind == Kind::Accel));

        queue.receive_accelerometer(accel(11_000));
        let recorded = events(&queue).events;
        assert_eq!(recorded.last(), Some(&(Kind::Gyro, Timestamp(10_500))));
    }

    #[test]
    fn test_late_sample_is_dropped() {
        let mut queue = FusionQueue::new(Recorder::default(), &config(LatencyStrategy::EliminateLatency));
        queue.start_singlethreaded(false);
        queue.receive_accelerometer(accel(5_000));
        queue.receive_gyro(gyro(4_000));
        let stats = queue.stats();
        assert_eq!(stats.gyroscope.drop_late, 1);
        assert_eq!(events(&queue).events, vec![(Kind::Accel, Timestamp(5_000))]);
    }

    #[test]
    fn test_stop_sync_flushes_buffered() {
        let mut queue = FusionQueue::new(Recorder::default(), &config(LatencyStrategy::MinimizeDrops));
        queue.start_singlethreaded(true);
        for i in 1..=5 {
            queue.receive_accelerometer(accel(i * 1000));
        }
        // waiting on the camera and gyro streams
        assert!(events(&queue).events.is_empty());
        queue.stop_sync();
        assert_eq!(events(&queue).events.len(), 5);
    }

    #[test]
    fn test_dispatch_async_runs_in_order() {
        let mut queue = FusionQueue::new(Recorder::default(), &config(LatencyStrategy::EliminateLatency));
        queue.start_singlethreaded(false);
        queue.receive_accelerometer(accel(1000));
        queue.dispatch_async(|sink: &mut Recorder| sink.events.push((Kind::Control, Timestamp::ZERO)));
        queue.receive_accelerometer(accel(2000));
        let kinds: Vec<Kind> = events(&queue).events.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![Kind::Accel, Kind::Control, Kind::Accel]);
    }

    #[test]
    fn test_threaded_dispatch_delivers_everything() {
        let mut queue = FusionQueue::new(Recorder::default(), &config(LatencyStrategy::MinimizeDrops));
        queue.start_sync(false);
        for i in 1..=20u64 {
            queue.receive_accelerometer(accel(i * 2_000));
            queue.receive_gyro(gyro(i * 2_000 + 500));
        }
        queue.stop_sync();

        let recorded = events(&queue).events;
        assert_eq!(recorded.len(), 40);
        for pair in recorded.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
    }

    fn counted_frame(t: u64, released: &Arc<AtomicUsize>) -> ImageFrame {
        let counter = released.clone();
        frame(t).with_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_dispatched_frame_released_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut queue = FusionQueue::new(Recorder::default(), &config(LatencyStrategy::EliminateLatency));
        queue.start_singlethreaded(false);
        queue.receive_camera(counted_frame(1_000, &released));
        assert_eq!(events(&queue).events, vec![(Kind::Camera, Timestamp(1_000))]);
        assert_eq!(released.load(Ordering::SeqCst), 1);

        queue.stop_sync();
        queue.reset();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_evicted_frames_released_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut queue = FusionQueue::new(Recorder::default(), &config(LatencyStrategy::MinimizeDrops));
        queue.start_buffering();
        for i in 1..=11u64 {
            queue.receive_camera(counted_frame(i * 33_000, &released));
        }
        assert_eq!(queue.stats().camera.drop_full, 3);
        assert_eq!(released.load(Ordering::SeqCst), 3);

        queue.reset();
        assert_eq!(released.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_late_frame_released_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut queue = FusionQueue::new(Recorder::default(), &config(LatencyStrategy::EliminateLatency));
        queue.start_singlethreaded(false);
        queue.receive_accelerometer(accel(5_000));
        queue.receive_camera(counted_frame(4_000, &released));

        assert_eq!(queue.stats().camera.drop_late, 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(events(&queue).events, vec![(Kind::Accel, Timestamp(5_000))]);
        queue.reset();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_immediately_skips_flush() {
        let mut queue = FusionQueue::new(Recorder::default(), &config(LatencyStrategy::MinimizeDrops));
        queue.start_sync(true);
        for i in 1..=5 {
            assert!(queue.receive_accelerometer(accel(i * 1000)));
        }
        // held back until the camera stream delivers
        queue.stop_immediately();
        queue.wait_until_finished();
        assert!(events(&queue).events.is_empty());
        assert_eq!(queue.pending(), (0, 5, 0));
        assert!(!queue.receive_accelerometer(accel(6_000)));

        let mut queue = FusionQueue::new(Recorder::default(), &config(LatencyStrategy::MinimizeDrops));
        queue.start_sync(true);
        for i in 1..=5 {
            queue.receive_accelerometer(accel(i * 1000));
        }
        queue.stop_sync();
        assert_eq!(events(&queue).events.len(), 5);
        assert_eq!(queue.pending(), (0, 0, 0));
    }

    #[test]
    fn test_async_start_stop_cycles() {
        let (done, finished) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            for _ in 0..200 {
                let mut queue = FusionQueue::new(Recorder::default(), &config(LatencyStrategy::MinimizeDrops));
                queue.start_async(false);
                queue.stop_sync();
                assert!(!queue.is_active());
            }
            let mut queue = FusionQueue::new(Recorder::default(), &config(LatencyStrategy::MinimizeDrops));
            for i in 1..=50u64 {
                queue.start_async(false);
                assert!(queue.receive_accelerometer(accel(i * 1000)));
                queue.stop_sync();
            }
            for _ in 0..20 {
                queue.start_async(false);
                queue.stop_immediately();
            }
            queue.start_async(false);
            assert!(queue.receive_accelerometer(accel(60_000)));
            queue.stop_sync();
            let _ = done.send(events(&queue).events.len());
        });
        let delivered = finished
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("start_async followed by stop_sync did not return");
        assert_eq!(delivered, 51);
    }

    #[test]
    fn test_reset_releases_frames() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut queue = FusionQueue::new(Recorder::default(), &config(LatencyStrategy::MinimizeDrops));
        queue.start_buffering();
        for i in 1..=3u64 {
            let counter = released.clone();
            queue.receive_camera(frame(i * 33_000).with_release(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        queue.reset();
        assert_eq!(released.load(Ordering::SeqCst), 3);
        assert_eq!(queue.pending(), (0, 0, 0));
    }
}
