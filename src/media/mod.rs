//! Media frames and buffer pooling
//!
//! This module provides:
//! - The frame type shared between producer and readers
//! - Channel data modes and read kinds
//! - A bounded pool of reusable payload buffers

pub mod frame;
pub mod pool;

pub use frame::{DataMode, Frame, MediaData, MediaType, ReadKind};
pub use pool::{FramePool, PoolStats};
