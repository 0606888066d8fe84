//! Dispatcher error types
//!
//! A single error enum covers the producer and consumer surfaces. Only
//! [`DispatchError::NoData`] is expected during normal operation; readers
//! should treat it as "try again" rather than as a failure.

use thiserror::Error;

/// Error type for buffer dispatcher operations
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Nothing to deliver right now (caught up, skipped frame, duplicate wake)
    #[error("no data available")]
    NoData,

    /// All consumer slots are in use
    #[error("all {0} receiver slots are in use")]
    SlotsExhausted(usize),

    /// Frame payload was empty; the frame was dropped
    #[error("frame payload is empty")]
    InvalidFrame,

    /// Receiver is not attached to a dispatcher
    #[error("receiver is not attached")]
    NotAttached,

    /// Receiver is already attached (or was attached once before)
    #[error("receiver already attached")]
    AlreadyAttached,

    /// Receiver was detached while reading
    #[error("receiver detached")]
    Detached,

    /// Read kind differs from the mode fixed by the first read
    #[error("read mode is fixed to {fixed:?}, requested {requested:?}")]
    ReadModeMismatch {
        fixed: crate::media::ReadKind,
        requested: crate::media::ReadKind,
    },

    /// Dispatcher has been stopped
    #[error("dispatcher stopped")]
    Stopped,

    /// Notifier thread could not be spawned
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DispatchError {
    /// Whether this is the expected "nothing to read" outcome
    pub fn is_no_data(&self) -> bool {
        matches!(self, DispatchError::NoData)
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ReadKind;

    #[test]
    fn test_is_no_data() {
        assert!(DispatchError::NoData.is_no_data());
        assert!(!DispatchError::Detached.is_no_data());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            DispatchError::SlotsExhausted(16).to_string(),
            "all 16 receiver slots are in use"
        );
        let err = DispatchError::ReadModeMismatch {
            fixed: ReadKind::Mixed,
            requested: ReadKind::Audio,
        };
        assert_eq!(
            err.to_string(),
            "read mode is fixed to Mixed, requested Audio"
        );
    }
}
