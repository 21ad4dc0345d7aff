//! State-size budget that adapts to how far behind real time the camera
//! pipeline runs.

use tracing::{debug, warn};

use crate::config::FilterConfig;
use crate::numerics::MAX_STATE_SIZE;
use crate::sensor::Timestamp;

/// Parameters reserved for the motion model when sizing a new group.
const GROUP_OVERHEAD: usize = 6;

#[derive(Debug, Clone)]
pub struct AdmissionControl {
    max_state_size: usize,
    min_state_size: usize,
    capacity: usize,
    min_group_add: usize,
    max_camera_delay_us: i64,
    /// Smallest arrival delay seen, taken as the pipeline's fixed latency.
    min_delay_us: Option<i64>,
    last_arrival: Timestamp,
}

impl AdmissionControl {
    pub fn new(config: &FilterConfig) -> Self {
        let capacity = config.max_state_size.min(MAX_STATE_SIZE);
        if capacity < config.max_state_size {
            warn!("max_state_size {} exceeds the supported {}", config.max_state_size, MAX_STATE_SIZE);
        }
        Self {
            max_state_size: capacity,
            min_state_size: config.min_state_size.min(capacity),
            capacity,
            min_group_add: config.min_group_add,
            max_camera_delay_us: config.max_camera_delay_us as i64,
            min_delay_us: None,
            last_arrival: Timestamp::ZERO,
        }
    }

    pub fn reset(&mut self) {
        self.max_state_size = self.capacity;
        self.min_delay_us = None;
        self.last_arrival = Timestamp::ZERO;
    }

    pub fn max_state_size(&self) -> usize {
        self.max_state_size
    }

    /// Decides whether a frame captured at `time` and processed at `now`
    /// is used, adjusting the budget on the way.
    ///
    /// Frames later than the camera delay bound are dropped. Lateness beyond
    /// two frame periods also drops the frame and shrinks the budget; beyond
    /// one period it only shrinks the budget. Running well ahead grows it
    /// back by one parameter per frame.
    pub fn admit(&mut self, time: Timestamp, now: Timestamp, state_size: usize) -> bool {
        let delay = now.micros_since(time);
        if delay > self.max_camera_delay_us {
            warn!("dropped an old video frame: timestamp {}, now {}", time, now);
            return false;
        }
        let min_delay = *self.min_delay_us.get_or_insert(delay);
        let min_delay = min_delay.min(delay);
        self.min_delay_us = Some(min_delay);

        let lateness = delay - min_delay;
        let period = time.micros_since(self.last_arrival);
        self.last_arrival = time;

        if lateness > 2 * period {
            self.max_state_size = state_size.saturating_sub(1).max(self.min_state_size);
            warn!(
                "frame {} is {}us late with a {}us period, dropping it; state budget now {}",
                time, lateness, period, self.max_state_size
            );
            return false;
        }
        if lateness > period && self.max_state_size > self.min_state_size && state_size < self.max_state_size {
            self.max_state_size = state_size.saturating_sub(1).max(self.min_state_size);
            debug!("falling behind by {}us, state budget now {}", lateness, self.max_state_size);
        }
        if lateness < period / 4
            && state_size + self.min_group_add > self.max_state_size
            && self.max_state_size + 1 < self.capacity
        {
            self.max_state_size += 1;
        }
        true
    }

    /// Number of features that may be added in a new group.
    ///
    /// `committed_size` must count every tracked feature as a parameter,
    /// estimated yet or not, so features never outgrow the budget when they
    /// are promoted.
    pub fn space(&self, committed_size: usize, max_group_add: usize) -> usize {
        self.max_state_size
            .saturating_sub(committed_size + GROUP_OVERHEAD)
            .min(max_group_add)
    }
}
