//! Statistics for a buffer dispatcher

use crate::media::PoolStats;

/// Point-in-time snapshot of a dispatcher
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Buffered frames
    pub ring_len: usize,
    /// Current ring capacity
    pub capacity: usize,
    /// Capacity derived from the measured GOP (initial capacity until then)
    pub base_capacity: usize,
    /// Ceiling for growth under backpressure
    pub double_capacity: usize,
    /// Whether the first GOP has been measured
    pub calibrated: bool,
    /// Attached receivers
    pub receivers: usize,
    /// Buffered key frames
    pub key_frames: usize,
    /// Oldest and newest buffered pts
    pub pts_range: Option<(u64, u64)>,
    /// Frames stored in the ring
    pub frames_written: u64,
    /// Frames dropped by the key-frame gate or the data mode
    pub frames_discarded: u64,
    /// Empty frames rejected
    pub frames_invalid: u64,
    /// Frames removed from the ring
    pub frames_evicted: u64,
    /// Evicted frames that some receiver had not read yet
    pub unread_evicted: u64,
    /// Forced eviction passes on a full ring
    pub forced_evictions: u64,
    /// Payload pool counters
    pub pool: PoolStats,
}

impl DispatcherStats {
    /// Ring fill level in percent
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.ring_len as f64 / self.capacity as f64) * 100.0
    }

    /// Span between the oldest and newest buffered frame, in pts units
    pub fn buffered_span(&self) -> u64 {
        self.pts_range
            .map(|(first, last)| last.saturating_sub(first))
            .unwrap_or(0)
    }

    /// Share of evicted frames that were lost to at least one receiver
    pub fn loss_ratio(&self) -> f64 {
        if self.frames_evicted == 0 {
            return 0.0;
        }
        self.unread_evicted as f64 / self.frames_evicted as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stats() {
        let stats = DispatcherStats::default();
        assert_eq!(stats.ring_len, 0);
        assert_eq!(stats.utilization(), 0.0);
        assert_eq!(stats.buffered_span(), 0);
        assert_eq!(stats.loss_ratio(), 0.0);
    }

    #[test]
    fn test_utilization() {
        let stats = DispatcherStats {
            ring_len: 25,
            capacity: 100,
            ..Default::default()
        };
        assert_eq!(stats.utilization(), 25.0);
    }

    #[test]
    fn test_buffered_span() {
        let stats = DispatcherStats {
            pts_range: Some((3_000, 4_500)),
            ..Default::default()
        };
        assert_eq!(stats.buffered_span(), 1_500);
    }

    #[test]
    fn test_loss_ratio() {
        let stats = DispatcherStats {
            frames_evicted: 40,
            unread_evicted: 10,
            ..Default::default()
        };
        assert_eq!(stats.loss_ratio(), 0.25);
    }
}
