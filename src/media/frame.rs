//! Media frame types
//!
//! This module defines the unit of data moved through the dispatcher and the
//! small enums describing what a channel carries and what a reader wants.

use std::sync::Arc;

use bytes::BytesMut;

/// Media type of a single frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// Audio frame
    Audio,
    /// Video frame
    Video,
}

impl MediaType {
    /// Both media types, audio first
    pub const ALL: [MediaType; 2] = [MediaType::Audio, MediaType::Video];
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Audio => write!(f, "audio"),
            MediaType::Video => write!(f, "video"),
        }
    }
}

/// What a receiver reads on a single `request_read` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    /// Audio frames only
    Audio,
    /// Video frames only
    Video,
    /// One interleaved audio+video stream
    Mixed,
}

impl ReadKind {
    /// Whether frames of `media_type` are delivered to this kind of read
    pub fn covers(self, media_type: MediaType) -> bool {
        match self {
            ReadKind::Mixed => true,
            ReadKind::Audio => media_type == MediaType::Audio,
            ReadKind::Video => media_type == MediaType::Video,
        }
    }
}

impl From<MediaType> for ReadKind {
    fn from(media_type: MediaType) -> Self {
        match media_type {
            MediaType::Audio => ReadKind::Audio,
            MediaType::Video => ReadKind::Video,
        }
    }
}

/// Which media a dispatcher channel carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataMode {
    /// Audio and video interleaved
    #[default]
    AudioVideo,
    /// Audio only; the key-frame gate is bypassed
    AudioOnly,
    /// Video only
    VideoOnly,
}

impl DataMode {
    /// Whether frames of `media_type` are stored in this mode
    pub fn accepts(self, media_type: MediaType) -> bool {
        match self {
            DataMode::AudioVideo => true,
            DataMode::AudioOnly => media_type == MediaType::Audio,
            DataMode::VideoOnly => media_type == MediaType::Video,
        }
    }

    /// Whether the channel carries video (and so waits for key frames)
    pub fn has_video(self) -> bool {
        self != DataMode::AudioOnly
    }
}

/// One encoded audio or video unit
///
/// Producers obtain a `MediaData` from
/// [`BufferDispatcher::request_buffer`](crate::dispatch::BufferDispatcher::request_buffer),
/// fill the payload and hand it to `input_data`. From then on it is shared
/// immutably as a [`Frame`].
#[derive(Debug, Clone)]
pub struct MediaData {
    /// Audio or video
    pub media_type: MediaType,
    /// Whether this is a self-contained video frame
    pub key_frame: bool,
    /// Presentation timestamp
    pub pts: u64,
    /// Source identifier
    pub ssrc: u32,
    /// Encoded payload
    pub payload: BytesMut,
}

/// A frame owned by the dispatcher and lent to readers
pub type Frame = Arc<MediaData>;

impl MediaData {
    /// Create an empty frame around a payload buffer
    pub fn new(media_type: MediaType, payload: BytesMut) -> Self {
        Self {
            media_type,
            key_frame: false,
            pts: 0,
            ssrc: 0,
            payload,
        }
    }

    /// Create a video frame
    pub fn video(pts: u64, data: &[u8], key_frame: bool) -> Self {
        Self {
            media_type: MediaType::Video,
            key_frame,
            pts,
            ssrc: 0,
            payload: BytesMut::from(data),
        }
    }

    /// Create an audio frame
    pub fn audio(pts: u64, data: &[u8]) -> Self {
        Self {
            media_type: MediaType::Audio,
            key_frame: false,
            pts,
            ssrc: 0,
            payload: BytesMut::from(data),
        }
    }

    /// Set the source identifier
    pub fn with_ssrc(mut self, ssrc: u32) -> Self {
        self.ssrc = ssrc;
        self
    }

    pub fn is_audio(&self) -> bool {
        self.media_type == MediaType::Audio
    }

    pub fn is_video(&self) -> bool {
        self.media_type == MediaType::Video
    }

    /// Key video frame (audio frames are never key frames for GOP purposes)
    pub fn is_key_video(&self) -> bool {
        self.is_video() && self.key_frame
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_frame() {
        let frame = MediaData::video(40, &[0x65, 0x88], true).with_ssrc(7);
        assert!(frame.is_video());
        assert!(frame.is_key_video());
        assert_eq!(frame.pts, 40);
        assert_eq!(frame.ssrc, 7);
        assert_eq!(frame.size(), 2);
    }

    #[test]
    fn test_audio_frame_is_never_key_video() {
        let mut frame = MediaData::audio(20, &[0xFF, 0xF1]);
        frame.key_frame = true;
        assert!(frame.is_audio());
        assert!(!frame.is_key_video());
    }

    #[test]
    fn test_empty_frame() {
        let frame = MediaData::new(MediaType::Video, BytesMut::new());
        assert!(frame.is_empty());
        assert!(!frame.key_frame);
    }

    #[test]
    fn test_read_kind_covers() {
        assert!(ReadKind::Mixed.covers(MediaType::Audio));
        assert!(ReadKind::Mixed.covers(MediaType::Video));
        assert!(ReadKind::Audio.covers(MediaType::Audio));
        assert!(!ReadKind::Audio.covers(MediaType::Video));
        assert_eq!(ReadKind::from(MediaType::Video), ReadKind::Video);
    }

    #[test]
    fn test_data_mode() {
        assert!(DataMode::AudioVideo.accepts(MediaType::Video));
        assert!(!DataMode::AudioOnly.accepts(MediaType::Video));
        assert!(!DataMode::VideoOnly.accepts(MediaType::Audio));
        assert!(!DataMode::AudioOnly.has_video());
        assert!(DataMode::VideoOnly.has_video());
        assert_eq!(DataMode::default(), DataMode::AudioVideo);
    }
}
