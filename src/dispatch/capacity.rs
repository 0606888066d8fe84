//! Adaptive ring capacity
//!
//! Capacity starts at the configured initial value. The first complete GOP
//! (key frame to key frame, counted in slots) calibrates a base capacity of
//! `gop + increment`; backpressure may then grow the ring up to twice that,
//! and relief shrinks it back.

use super::config::DispatcherConfig;

/// Capacity bounds and the counters that move them
#[derive(Debug, Clone)]
pub(crate) struct CapacityState {
    base: usize,
    double: usize,
    max: usize,
    initial: usize,
    increment: usize,
    calibrated: bool,
    counting: bool,
    base_counter: usize,
    audio_frame_cnt: usize,
}

impl CapacityState {
    pub fn new(config: &DispatcherConfig) -> Self {
        Self {
            base: config.initial_capacity,
            double: config.initial_double_capacity(),
            max: config.max_capacity,
            initial: config.initial_capacity,
            increment: config.capacity_increment,
            calibrated: false,
            counting: false,
            base_counter: 0,
            audio_frame_cnt: 0,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn double(&self) -> usize {
        self.double
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    /// Feed one accepted frame; returns the new base capacity once the first
    /// GOP has been measured
    pub fn observe(&mut self, key_frame: bool) -> Option<usize> {
        if self.calibrated {
            return None;
        }

        if !key_frame {
            if self.counting {
                self.base_counter += 1;
            }
            return None;
        }

        if !self.counting {
            self.counting = true;
            self.base_counter = 1;
            return None;
        }

        let observed = self.base_counter;
        self.base = (observed + self.increment).max(self.initial).min(self.max);
        self.double = (self.base * 2).min(self.max);
        self.calibrated = true;
        self.counting = false;
        self.base_counter = 0;
        Some(self.base)
    }

    /// Capacity to grow to under backpressure, if growth is still allowed
    pub fn grow_target(&self, current: usize) -> Option<usize> {
        (current < self.double).then(|| (current * 2).min(self.double))
    }

    /// Count an audio frame; returns true when a shrink evaluation is due
    ///
    /// Evaluation only runs while the ring is above base capacity, once every
    /// `current` audio frames. Video-only channels therefore never shrink back.
    pub fn note_audio(&mut self, current: usize) -> bool {
        if current <= self.base {
            self.audio_frame_cnt = 0;
            return false;
        }
        self.audio_frame_cnt += 1;
        if self.audio_frame_cnt >= current {
            self.audio_frame_cnt = 0;
            return true;
        }
        false
    }

    /// Forget in-flight counters (keeps calibration)
    pub fn reset_counters(&mut self) {
        self.counting = false;
        self.base_counter = 0;
        self.audio_frame_cnt = 0;
    }
}
