//! Broadcast frame buffer for screen-casting
//!
//! A single producer (an encoder) pushes audio and video frames into a
//! [`BufferDispatcher`]. Any number of readers, up to sixteen, attach a
//! [`BufferReceiver`] and pull frames independently: a slow network sender
//! does not hold back a fast one, and a late joiner starts at the most recent
//! key frame.
//!
//! # Example
//!
//! ```no_run
//! use cast_buffer::{BufferDispatcher, BufferReceiver, DispatcherConfig, MediaData, ReadKind};
//!
//! let dispatcher = BufferDispatcher::new(DispatcherConfig::default())?;
//! let receiver = BufferReceiver::new();
//! dispatcher.attach(&receiver)?;
//!
//! dispatcher.input_data(MediaData::video(0, &[0x65, 0x88], true))?;
//! receiver.request_read(ReadKind::Video, |frame| {
//!     println!("pts {} ({} bytes)", frame.pts, frame.size());
//! })?;
//! # Ok::<(), cast_buffer::DispatchError>(())
//! ```

pub mod dispatch;
pub mod error;
pub mod media;
pub mod stats;

pub use dispatch::{
    BufferDispatcher, BufferReceiver, DispatcherConfig, DispatcherEvent, DispatcherListener,
    ReceiverListener,
};
pub use error::{DispatchError, Result};
pub use media::{DataMode, Frame, FramePool, MediaData, MediaType, ReadKind};
pub use stats::DispatcherStats;
