//! Dispatcher configuration

use std::time::Duration;

use crate::media::pool::{DEFAULT_AUDIO_POOL_SIZE, DEFAULT_VIDEO_POOL_SIZE};
use crate::media::DataMode;

/// Ring capacity before the GOP size is known
pub const INITIAL_BUFFER_CAPACITY: usize = 50;

/// Hard ceiling on ring capacity
pub const MAX_BUFFER_CAPACITY: usize = 800;

/// Slack added on top of a measured GOP
pub const BUFFER_CAPACITY_INCREMENT: usize = 10;

/// Dispatcher configuration options
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Ring capacity until the first GOP has been measured (and the floor after)
    pub initial_capacity: usize,

    /// Capacity never exceeds this
    pub max_capacity: usize,

    /// Slots added to the measured GOP size
    pub capacity_increment: usize,

    /// Report a stalled producer after this long without a write (None = never)
    pub write_timeout: Option<Duration>,

    /// Media carried by the channel
    pub data_mode: DataMode,

    /// Idle audio buffers kept by the pool
    pub audio_pool_size: usize,

    /// Idle video buffers kept by the pool
    pub video_pool_size: usize,

    /// How often the notifier thread wakes on its own to check the write timeout
    pub housekeeping_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            initial_capacity: INITIAL_BUFFER_CAPACITY,
            max_capacity: MAX_BUFFER_CAPACITY,
            capacity_increment: BUFFER_CAPACITY_INCREMENT,
            write_timeout: Some(Duration::from_secs(30)),
            data_mode: DataMode::AudioVideo,
            audio_pool_size: DEFAULT_AUDIO_POOL_SIZE,
            video_pool_size: DEFAULT_VIDEO_POOL_SIZE,
            housekeeping_interval: Duration::from_millis(500),
        }
    }
}

impl DispatcherConfig {
    /// Set initial capacity (raised to at least 1, lowered to max capacity)
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity.max(1);
        self.max_capacity = self.max_capacity.max(self.initial_capacity);
        self
    }

    /// Set max capacity (never below initial capacity)
    pub fn max_capacity(mut self, capacity: usize) -> Self {
        self.max_capacity = capacity.max(1);
        self.initial_capacity = self.initial_capacity.min(self.max_capacity);
        self
    }

    /// Set capacity increment
    pub fn capacity_increment(mut self, increment: usize) -> Self {
        self.capacity_increment = increment;
        self
    }

    /// Set write timeout
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Never report write timeouts
    pub fn disable_write_timeout(mut self) -> Self {
        self.write_timeout = None;
        self
    }

    /// Set data mode
    pub fn data_mode(mut self, mode: DataMode) -> Self {
        self.data_mode = mode;
        self
    }

    /// Set pool free-list sizes
    pub fn pool_size(mut self, audio: usize, video: usize) -> Self {
        self.audio_pool_size = audio;
        self.video_pool_size = video;
        self
    }

    /// Set housekeeping interval
    pub fn housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Capacity that the backpressure growth may reach before calibration
    pub(crate) fn initial_double_capacity(&self) -> usize {
        (self.initial_capacity * 2).min(self.max_capacity)
    }
}
