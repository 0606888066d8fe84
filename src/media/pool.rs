//! Reusable payload buffers for the write path
//!
//! The producer asks for a buffer per frame. Buffers of evicted frames come
//! back here once no reader still holds the frame, so a steady stream runs
//! without allocating. Audio and video keep separate free-lists because their
//! payload sizes differ by orders of magnitude.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

use super::frame::{MediaData, MediaType};

/// Default number of idle audio buffers kept
pub const DEFAULT_AUDIO_POOL_SIZE: usize = 100;

/// Default number of idle video buffers kept
pub const DEFAULT_VIDEO_POOL_SIZE: usize = 50;

#[derive(Debug, Default)]
struct FreeLists {
    audio: Vec<BytesMut>,
    video: Vec<BytesMut>,
}

impl FreeLists {
    fn list_mut(&mut self, media_type: MediaType) -> &mut Vec<BytesMut> {
        match media_type {
            MediaType::Audio => &mut self.audio,
            MediaType::Video => &mut self.video,
        }
    }
}

/// Pool usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers freshly allocated
    pub allocations: u64,
    /// Buffers handed out from a free-list
    pub reuses: u64,
    /// Buffers returned to a free-list
    pub recycled: u64,
    /// Idle audio buffers
    pub idle_audio: usize,
    /// Idle video buffers
    pub idle_video: usize,
}

/// Bounded two-list pool of payload buffers
#[derive(Debug)]
pub struct FramePool {
    lists: Mutex<FreeLists>,
    max_audio: usize,
    max_video: usize,
    allocations: AtomicU64,
    reuses: AtomicU64,
    recycled: AtomicU64,
}

impl FramePool {
    /// Create a pool keeping at most the given number of idle buffers per type
    pub fn new(max_audio: usize, max_video: usize) -> Self {
        Self {
            lists: Mutex::new(FreeLists::default()),
            max_audio,
            max_video,
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
        }
    }

    fn limit(&self, media_type: MediaType) -> usize {
        match media_type {
            MediaType::Audio => self.max_audio,
            MediaType::Video => self.max_video,
        }
    }

    /// Get an empty frame whose payload can hold at least `size` bytes
    pub fn request(&self, media_type: MediaType, size: usize) -> MediaData {
        let reused = self.lists.lock().list_mut(media_type).pop();

        let payload = match reused {
            Some(mut buf) => {
                self.reuses.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf.reserve(size);
                buf
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(size)
            }
        };

        MediaData::new(media_type, payload)
    }

    /// Return a frame's payload to the pool
    ///
    /// Dropped instead when the free-list for its type is full.
    pub fn release(&self, data: MediaData) {
        let limit = self.limit(data.media_type);
        let mut payload = data.payload;
        payload.clear();

        let mut lists = self.lists.lock();
        let list = lists.list_mut(data.media_type);
        if list.len() < limit {
            list.push(payload);
            self.recycled.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop every idle buffer
    pub fn clear(&self) {
        let mut lists = self.lists.lock();
        lists.audio.clear();
        lists.video.clear();
    }

    /// Snapshot of pool counters
    pub fn stats(&self) -> PoolStats {
        let lists = self.lists.lock();
        PoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            idle_audio: lists.audio.len(),
            idle_video: lists.video.len(),
        }
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIO_POOL_SIZE, DEFAULT_VIDEO_POOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_allocates_when_empty() {
        let pool = FramePool::new(2, 2);
        let data = pool.request(MediaType::Video, 1024);

        assert_eq!(data.media_type, MediaType::Video);
        assert!(data.payload.capacity() >= 1024);
        assert!(data.is_empty());
        assert_eq!(pool.stats().allocations, 1);
        assert_eq!(pool.stats().reuses, 0);
    }

    #[test]
    fn test_release_then_reuse() {
        let pool = FramePool::new(2, 2);
        let mut data = pool.request(MediaType::Audio, 64);
        data.payload.extend_from_slice(&[1, 2, 3]);
        pool.release(data);

        assert_eq!(pool.stats().idle_audio, 1);

        let again = pool.request(MediaType::Audio, 16);
        assert!(again.is_empty());
        assert_eq!(again.media_type, MediaType::Audio);

        let stats = pool.stats();
        assert_eq!(stats.reuses, 1);
        assert_eq!(stats.idle_audio, 0);
    }

    #[test]
    fn test_lists_are_separate() {
        let pool = FramePool::new(4, 4);
        pool.release(MediaData::audio(0, &[1]));

        let video = pool.request(MediaType::Video, 8);
        assert_eq!(video.media_type, MediaType::Video);

        let stats = pool.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.idle_audio, 1);
    }

    #[test]
    fn test_release_is_bounded() {
        let pool = FramePool::new(1, 1);
        pool.release(MediaData::video(0, &[1], true));
        pool.release(MediaData::video(1, &[2], false));

        let stats = pool.stats();
        assert_eq!(stats.idle_video, 1);
        assert_eq!(stats.recycled, 1);
    }

    #[test]
    fn test_clear() {
        let pool = FramePool::default();
        pool.release(MediaData::audio(0, &[1]));
        pool.release(MediaData::video(0, &[1], false));
        pool.clear();

        let stats = pool.stats();
        assert_eq!(stats.idle_audio, 0);
        assert_eq!(stats.idle_video, 0);
    }
}
