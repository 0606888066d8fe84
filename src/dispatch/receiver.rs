//! Reader handle
//!
//! A [`BufferReceiver`] is owned by one reading component. It blocks in
//! [`request_read`](BufferReceiver::request_read) on its own condition
//! variables until the notifier thread reports data, then pulls the frame from
//! the dispatcher and hands it to the caller's closure outside any lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{DispatchError, Result};
use crate::media::{MediaData, ReadKind};

use super::events::ReceiverListener;
use super::ready::Pending;
use super::store::BufferDispatcher;

#[derive(Debug, Default)]
struct ReceiverState {
    dispatcher: Weak<BufferDispatcher>,
    id: Option<u32>,
    attaching: bool,
    ever_attached: bool,
    detached: bool,
    mode: Option<ReadKind>,
    audio_ready: bool,
    video_ready: bool,
    mixed_ready: bool,
}

impl ReceiverState {
    fn take_ready(&mut self, kind: ReadKind) -> bool {
        let flag = match kind {
            ReadKind::Audio => &mut self.audio_ready,
            ReadKind::Video => &mut self.video_ready,
            ReadKind::Mixed => &mut self.mixed_ready,
        };
        std::mem::take(flag)
    }
}

/// Reader handle attached to one [`BufferDispatcher`]
///
/// A receiver can be attached once; after detaching, create a new one.
pub struct BufferReceiver {
    state: Mutex<ReceiverState>,
    audio_cond: Condvar,
    video_cond: Condvar,
    mixed_cond: Condvar,
    key_only: AtomicBool,
    key_redirect: AtomicBool,
    listener: Mutex<Option<Weak<dyn ReceiverListener>>>,
}

impl BufferReceiver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ReceiverState::default()),
            audio_cond: Condvar::new(),
            video_cond: Condvar::new(),
            mixed_cond: Condvar::new(),
            key_only: AtomicBool::new(false),
            key_redirect: AtomicBool::new(false),
            listener: Mutex::new(None),
        })
    }

    pub fn set_listener(&self, listener: Weak<dyn ReceiverListener>) {
        *self.listener.lock() = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn ReceiverListener>> {
        self.listener.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Receiver id assigned by the dispatcher, while attached
    pub fn id(&self) -> Option<u32> {
        self.state.lock().id
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().id.is_some()
    }

    pub fn is_key_only(&self) -> bool {
        self.key_only.load(Ordering::Acquire)
    }

    pub fn is_key_redirect(&self) -> bool {
        self.key_redirect.load(Ordering::Acquire)
    }

    /// Read kind fixed by the first read, if any
    pub fn read_mode(&self) -> Option<ReadKind> {
        self.state.lock().mode
    }

    fn binding(&self) -> Option<(Arc<BufferDispatcher>, u32)> {
        let state = self.state.lock();
        let id = state.id?;
        state.dispatcher.upgrade().map(|dispatcher| (dispatcher, id))
    }

    /// Block until a frame of `kind` is available and pass it to `on_frame`
    ///
    /// Returns `NoData` when woken without a deliverable frame; call again.
    /// The first call fixes whether this receiver reads mixed or split.
    pub fn request_read<F>(&self, kind: ReadKind, on_frame: F) -> Result<()>
    where
        F: FnOnce(&MediaData),
    {
        self.read(kind, None, on_frame)
    }

    /// Like [`request_read`](Self::request_read) but gives up with `NoData`
    /// after `timeout`
    pub fn request_read_timeout<F>(&self, kind: ReadKind, timeout: Duration, on_frame: F) -> Result<()>
    where
        F: FnOnce(&MediaData),
    {
        self.read(kind, Some(Instant::now() + timeout), on_frame)
    }

    fn read<F>(&self, kind: ReadKind, deadline: Option<Instant>, on_frame: F) -> Result<()>
    where
        F: FnOnce(&MediaData),
    {
        let (dispatcher, id) = self.prepare(kind)?;
        dispatcher
            .notify_read_ready(id, kind)
            .map_err(|err| self.translate(err))?;
        drop(dispatcher);

        self.wait_ready(kind, deadline)?;

        let (dispatcher, id) = self.binding().ok_or(DispatchError::Detached)?;
        let outcome = dispatcher
            .read_buffer_data(id, kind)
            .map_err(|err| self.translate(err))?;
        drop(dispatcher);

        on_frame(&outcome.frame);

        if outcome.acceleration_done {
            tracing::debug!(receiver = id, "Key-only catch-up reached live edge");
            if let Some(listener) = self.listener() {
                listener.on_acceleration_done();
            }
        }
        Ok(())
    }

    fn prepare(&self, kind: ReadKind) -> Result<(Arc<BufferDispatcher>, u32)> {
        let mut state = self.state.lock();
        if state.detached {
            return Err(DispatchError::Detached);
        }
        let id = state.id.ok_or(DispatchError::NotAttached)?;

        // Mode check comes before the upgrade: dropping the last dispatcher
        // handle with the state lock held would re-enter it through detach.
        if let Some(fixed) = state.mode {
            if (fixed == ReadKind::Mixed) != (kind == ReadKind::Mixed) {
                return Err(DispatchError::ReadModeMismatch {
                    fixed,
                    requested: kind,
                });
            }
        }
        let dispatcher = state.dispatcher.upgrade().ok_or(DispatchError::Detached)?;
        state.mode.get_or_insert(kind);
        drop(state);

        Ok((dispatcher, id))
    }

    fn wait_ready(&self, kind: ReadKind, deadline: Option<Instant>) -> Result<()> {
        let cond = match kind {
            ReadKind::Audio => &self.audio_cond,
            ReadKind::Video => &self.video_cond,
            ReadKind::Mixed => &self.mixed_cond,
        };

        let mut state = self.state.lock();
        loop {
            if state.detached {
                return Err(DispatchError::Detached);
            }
            if state.take_ready(kind) {
                return Ok(());
            }
            match deadline {
                None => cond.wait(&mut state),
                Some(deadline) => {
                    if cond.wait_until(&mut state, deadline).timed_out() {
                        return match (state.detached, state.take_ready(kind)) {
                            (true, _) => Err(DispatchError::Detached),
                            (false, true) => Ok(()),
                            (false, false) => Err(DispatchError::NoData),
                        };
                    }
                }
            }
        }
    }

    fn translate(&self, err: DispatchError) -> DispatchError {
        match err {
            DispatchError::NotAttached if self.state.lock().detached => DispatchError::Detached,
            other => other,
        }
    }

    /// Switch key-frame-only reading
    ///
    /// Enabling also requests accelerated catch-up; the listener hears
    /// `on_acceleration_done` once the reader is near the live edge.
    pub fn enable_key_mode(&self, enable: bool) {
        if self.key_only.swap(enable, Ordering::AcqRel) == enable {
            return;
        }
        if let Some((dispatcher, id)) = self.binding() {
            dispatcher.set_key_mode(id, enable);
            tracing::debug!(receiver = id, enable, "Key-only mode switched");
        }
        if let Some(listener) = self.listener() {
            listener.on_key_mode_changed(enable);
        }
    }

    /// Jump to the next key frame when it is written
    pub fn enable_key_redirect(&self, enable: bool) {
        self.key_redirect.store(enable, Ordering::Release);
        if let Some((dispatcher, id)) = self.binding() {
            dispatcher.set_key_redirect(id, enable);
        }
    }

    /// Detach from the dispatcher; a no-op when not attached
    pub fn detach(&self) -> bool {
        match self.binding() {
            Some((dispatcher, id)) => dispatcher.detach_id(id),
            None => false,
        }
    }

    pub(crate) fn begin_attach(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.ever_attached || state.attaching {
            return Err(DispatchError::AlreadyAttached);
        }
        state.attaching = true;
        Ok(())
    }

    pub(crate) fn abort_attach(&self) {
        self.state.lock().attaching = false;
    }

    pub(crate) fn bind(&self, dispatcher: Weak<BufferDispatcher>, id: u32) {
        let mut state = self.state.lock();
        state.dispatcher = dispatcher;
        state.id = Some(id);
        state.attaching = false;
        state.ever_attached = true;
    }

    pub(crate) fn is_bound_to(&self, dispatcher: &BufferDispatcher) -> bool {
        std::ptr::eq(self.state.lock().dispatcher.as_ptr(), dispatcher)
    }

    /// Wake every blocked read with `Detached`
    pub(crate) fn mark_detached(&self) {
        let mut state = self.state.lock();
        state.detached = true;
        state.id = None;
        state.dispatcher = Weak::new();
        self.wake_all(&mut state);
    }

    pub(crate) fn on_data_notify(&self, pending: Pending) {
        let mut state = self.state.lock();
        if state.mode == Some(ReadKind::Mixed) {
            state.mixed_ready = true;
            self.mixed_cond.notify_all();
            return;
        }
        if pending.audio {
            state.audio_ready = true;
            self.audio_cond.notify_all();
        }
        if pending.video {
            state.video_ready = true;
            self.video_cond.notify_all();
        }
    }

    pub(crate) fn key_redirect_consumed(&self) {
        self.key_redirect.store(false, Ordering::Release);
    }

    fn wake_all(&self, state: &mut MutexGuard<'_, ReceiverState>) {
        state.audio_ready = true;
        state.video_ready = true;
        state.mixed_ready = true;
        self.audio_cond.notify_all();
        self.video_cond.notify_all();
        self.mixed_cond.notify_all();
    }
}

impl std::fmt::Debug for BufferReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BufferReceiver")
            .field("id", &state.id)
            .field("detached", &state.detached)
            .field("mode", &state.mode)
            .field("key_only", &self.is_key_only())
            .field("key_redirect", &self.is_key_redirect())
            .finish()
    }
}
