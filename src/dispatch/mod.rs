//! Broadcast frame dispatch
//!
//! One producer writes encoded frames into a [`BufferDispatcher`]; up to
//! sixteen [`BufferReceiver`]s read them, each at its own pace. Frames live in
//! a single ring and are shared by reference; a slot is only evicted once every
//! receiver that still needs it has read it (or the ring is at its capacity
//! ceiling, in which case eviction is forced).
//!
//! # Architecture
//!
//! ```text
//!    [Producer]                                       [Reader threads]
//!    input_data()                                     request_read()
//!         │                                                 ▲
//!         ▼                                                 │ Condvar
//!   ┌───────────────────────────────┐               ┌───────┴────────┐
//!   │ BufferDispatcher              │  notify_pass  │ BufferReceiver │
//!   │  store: RwLock<ring, keys,    │──────────────►│  audio / video │
//!   │         capacity>             │               │  / mixed cond  │
//!   │  consumers: Mutex<cursors,    │◄──────────────│                │
//!   │             ReadySet>         │ read_buffer_  └────────────────┘
//!   └──────────────┬────────────────┘ data
//!                  │ wake
//!                  ▼
//!         notifier thread (data_ready & want_read)
//! ```
//!
//! # Lock order
//!
//! Store lock, then consumer table, then a receiver's own state. User
//! callbacks run with no dispatcher lock held.

pub(crate) mod capacity;
pub mod config;
pub(crate) mod consumer;
pub mod events;
pub(crate) mod notifier;
pub mod ready;
pub mod receiver;
pub(crate) mod ring;
pub mod store;

pub use config::DispatcherConfig;
pub use events::{DispatcherEvent, DispatcherListener, ReceiverListener};
pub use ready::{SlotBit, MAX_RECEIVERS};
pub use receiver::BufferReceiver;
pub use store::BufferDispatcher;
