//! Lifecycle callbacks and dispatcher events
//!
//! The surrounding session layer learns about consumer and producer health in
//! two ways: listener traits invoked synchronously by the core, and a
//! `tokio::sync::broadcast` channel of [`DispatcherEvent`]s that any number of
//! observers can subscribe to.

use std::time::Duration;

/// Callbacks a reader-side component receives about its own receiver
///
/// Invoked on the reading thread (acceleration) or the caller's thread (key
/// mode), never while a dispatcher lock is held.
pub trait ReceiverListener: Send + Sync {
    /// Key-only catch-up has reached the live edge
    fn on_acceleration_done(&self) {}

    /// Key-only mode was switched
    fn on_key_mode_changed(&self, _enabled: bool) {}
}

/// Callbacks about the producer side of a dispatcher
pub trait DispatcherListener: Send + Sync {
    /// No frame was written for the configured interval
    fn on_write_timeout(&self);
}

/// Event broadcast to dispatcher observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatcherEvent {
    /// A receiver took slot `slot`
    ReceiverAttached { id: u32, slot: usize },
    /// A receiver left
    ReceiverDetached { id: u32 },
    /// Ring capacity changed
    CapacityChanged { from: usize, to: usize },
    /// Producer stalled
    WriteTimeout { idle: Duration },
    /// All buffered frames were dropped
    Flushed,
}

/// Event channel capacity; slow observers lose the oldest events
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;
