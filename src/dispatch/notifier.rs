//! Notifier thread
//!
//! One OS thread per dispatcher turns "data is ready" and "a reader is waiting"
//! into condition-variable signals. It sleeps until the write path or a read
//! registration wakes it, or until the housekeeping interval elapses (used for
//! the write-timeout check and for pruning receivers whose handle was dropped).

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::store::BufferDispatcher;

#[derive(Debug, Default)]
struct SignalState {
    pending: bool,
    shutdown: bool,
}

/// Wakeup channel between the dispatcher and its notifier thread
#[derive(Debug, Default)]
pub(crate) struct NotifySignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl NotifySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a notification pass
    pub fn wake(&self) {
        let mut state = self.state.lock();
        state.pending = true;
        self.cond.notify_one();
    }

    /// Ask the thread to exit
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cond.notify_all();
    }

    /// Block until woken or `interval` passes; false once shut down
    fn wait(&self, interval: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.pending && !state.shutdown {
            self.cond.wait_for(&mut state, interval);
        }
        state.pending = false;
        !state.shutdown
    }
}

/// Start the notifier thread for `dispatcher`
///
/// The thread holds only a weak reference so dropping the last dispatcher
/// handle ends it.
pub(crate) fn spawn(
    id: u64,
    dispatcher: Weak<BufferDispatcher>,
    signal: Arc<NotifySignal>,
    interval: Duration,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("buffer-notifier-{id}"))
        .spawn(move || run(dispatcher, signal, interval))
}

fn run(dispatcher: Weak<BufferDispatcher>, signal: Arc<NotifySignal>, interval: Duration) {
    tracing::debug!("Notifier thread started");

    while signal.wait(interval) {
        let Some(dispatcher) = dispatcher.upgrade() else {
            break;
        };
        dispatcher.notify_pass();
        dispatcher.housekeeping();
    }

    tracing::debug!("Notifier thread stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn test_wait_returns_immediately_when_pending() {
        let signal = NotifySignal::new();
        signal.wake();

        let start = Instant::now();
        assert!(signal.wait(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_times_out() {
        let signal = NotifySignal::new();
        assert!(signal.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_shutdown_ends_wait() {
        let signal = Arc::new(NotifySignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        signal.shutdown();

        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_thread_exits_without_dispatcher() {
        let signal = Arc::new(NotifySignal::new());
        let handle = spawn(0, Weak::new(), Arc::clone(&signal), Duration::from_millis(5)).unwrap();
        assert_eq!(handle.thread().name(), Some("buffer-notifier-0"));
        signal.wake();
        handle.join().unwrap();
    }
}
