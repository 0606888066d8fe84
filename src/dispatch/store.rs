//! Broadcast dispatcher implementation
//!
//! The dispatcher owns the ring, the key-frame index list, capacity state and
//! the consumer table. Structural changes (append, evict, resize) take the
//! store lock for writing; readers take it for reading and set their bit in
//! the slot's atomic read mask. The consumer table is a separate, briefer
//! lock always taken after the store lock.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::error::{DispatchError, Result};
use crate::media::{DataMode, Frame, FramePool, MediaData, MediaType, ReadKind};
use crate::stats::DispatcherStats;

use super::capacity::CapacityState;
use super::config::DispatcherConfig;
use super::consumer::{ConsumerSlot, ConsumerTable};
use super::events::{DispatcherEvent, DispatcherListener, EVENT_CHANNEL_CAPACITY};
use super::notifier::{self, NotifySignal};
use super::ready::{SlotBit, MAX_RECEIVERS};
use super::receiver::BufferReceiver;
use super::ring::RingStore;

/// Frame handed to a reader plus what the read triggered
pub(crate) struct ReadOutcome {
    pub frame: Frame,
    pub acceleration_done: bool,
}

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    discarded: AtomicU64,
    invalid: AtomicU64,
    evicted: AtomicU64,
    unread_evicted: AtomicU64,
    forced_evictions: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Work collected under the locks and finished after they are released
#[derive(Default)]
struct WriteEffects {
    appended: bool,
    rejected: Option<MediaData>,
    evicted: Vec<Frame>,
    capacity_changes: Vec<(usize, usize)>,
    redirect_done: Vec<Weak<BufferReceiver>>,
}

#[derive(Debug)]
struct WriteClock {
    last: Instant,
    reported: bool,
}

/// Ring and index bookkeeping guarded by the store lock
#[derive(Debug)]
struct StoreState {
    ring: RingStore,
    /// Ring-relative indices of buffered key frames, increasing
    key_frames: VecDeque<usize>,
    last_audio: Option<usize>,
    last_video: Option<usize>,
    /// Cold-start gate: nothing is stored before the first key frame
    waiting_key: bool,
    /// Set while forced eviction is running back to back
    overloaded: bool,
    capacity: CapacityState,
    next_sequence: u64,
    data_mode: DataMode,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

fn shift(index: Option<usize>) -> Option<usize> {
    index.and_then(|i| i.checked_sub(1))
}

impl StoreState {
    fn new(config: &DispatcherConfig) -> Self {
        Self {
            ring: RingStore::new(config.initial_capacity),
            key_frames: VecDeque::new(),
            last_audio: None,
            last_video: None,
            waiting_key: config.data_mode.has_video(),
            overloaded: false,
            capacity: CapacityState::new(config),
            next_sequence: 0,
            data_mode: config.data_mode,
            sps: None,
            pps: None,
        }
    }

    fn is_reserved(&self, index: usize, table: &ConsumerTable) -> bool {
        self.ring.at(index).is_some_and(|slot| {
            let attached = table.reserve_mask(slot.media_type());
            !slot.read_mask().all_attached_have_read(attached)
        })
    }

    /// Next index of `media_type` at or after `from`
    ///
    /// With `needs_key`, non-key video slots on the way are marked read for
    /// `bit` so they no longer hold back eviction.
    fn seek(&self, bit: SlotBit, media_type: MediaType, from: usize, needs_key: bool) -> Option<usize> {
        for index in from..self.ring.len() {
            let Some(slot) = self.ring.at(index) else {
                break;
            };
            if slot.media_type() != media_type {
                continue;
            }
            if needs_key && !slot.is_key_video() {
                slot.read_mask().mark_read(bit);
                continue;
            }
            return Some(index);
        }
        None
    }

    fn mark_range(&self, bit: SlotBit, media_type: Option<MediaType>, range: Range<usize>) {
        for index in range {
            if let Some(slot) = self.ring.at(index) {
                if media_type.map_or(true, |m| slot.media_type() == m) {
                    slot.read_mask().mark_read(bit);
                }
            }
        }
    }

    /// Initial cursors for a receiver joining now
    fn seed_cursors(&self, consumer: &mut ConsumerSlot) {
        let bit = consumer.bit;

        if self.ring.is_empty() {
            consumer.wait_key = self.data_mode.has_video();
            return;
        }

        if !self.data_mode.has_video() {
            consumer.audio_index = self.last_audio;
            let end = self.last_audio.unwrap_or(self.ring.len());
            self.mark_range(bit, None, 0..end);
            return;
        }

        match self.key_frames.back().copied() {
            Some(key) => {
                consumer.video_index = Some(key);
                consumer.audio_index = self
                    .ring
                    .find_from(key + 1, |slot| slot.media_type() == MediaType::Audio);
                self.mark_range(bit, None, 0..key);
            }
            None => {
                consumer.wait_key = true;
                self.mark_range(bit, None, 0..self.ring.len());
            }
        }
    }

    /// Pop the head slot and renumber every index that refers into the ring
    ///
    /// Returns the evicted slot's type and whether some receiver still needed it.
    fn evict_front(
        &mut self,
        table: &mut ConsumerTable,
        fx: &mut WriteEffects,
        counters: &Counters,
    ) -> Option<(MediaType, bool)> {
        let reserved = self.is_reserved(0, table);
        let slot = self.ring.pop_front()?;
        let media_type = slot.media_type();

        if self.key_frames.front() == Some(&0) {
            self.key_frames.pop_front();
        }
        for index in self.key_frames.iter_mut() {
            *index -= 1;
        }
        self.last_audio = shift(self.last_audio);
        self.last_video = shift(self.last_video);

        for consumer in table.slots.values_mut() {
            for media in MediaType::ALL {
                let next = match consumer.cursor(media) {
                    // The receiver's next frame is gone; resume at what follows
                    Some(0) => self.seek(consumer.bit, media, 0, consumer.needs_key(media)),
                    other => shift(other),
                };
                consumer.set_cursor(media, next);
                if next.is_none() {
                    table.ready.set_data_ready(consumer.bit, media, false);
                }
            }
        }

        bump(&counters.evicted);
        if reserved {
            bump(&counters.unread_evicted);
        }
        fx.evicted.push(slot.into_frame());
        Some((media_type, reserved))
    }

    /// Drop the GOP before the latest buffered key frame, up to the first
    /// slot a receiver still needs
    fn erase_old_gop(&mut self, table: &mut ConsumerTable, fx: &mut WriteEffects, counters: &Counters) {
        let mut erased = 0usize;
        while let Some(&boundary) = self.key_frames.back() {
            if boundary == 0 || self.is_reserved(0, table) {
                break;
            }
            self.evict_front(table, fx, counters);
            erased += 1;
        }

        if erased > 0 {
            tracing::trace!(erased, remaining = self.ring.len(), "Old GOP erased");
        }
    }

    /// Hard valve: evict through the oldest video slot regardless of readers
    fn force_evict(&mut self, table: &mut ConsumerTable, fx: &mut WriteEffects, counters: &Counters) {
        let mut count = 0usize;
        let mut dropped_unread = false;

        if self.data_mode.has_video() && self.last_video.is_some() {
            while let Some((media_type, reserved)) = self.evict_front(table, fx, counters) {
                count += 1;
                dropped_unread |= reserved;
                if media_type == MediaType::Video {
                    break;
                }
            }
            // Audio up to the next video slot goes with it
            if self.last_video.is_some() {
                while self
                    .ring
                    .front()
                    .is_some_and(|slot| slot.media_type() == MediaType::Audio)
                {
                    if let Some((_, reserved)) = self.evict_front(table, fx, counters) {
                        count += 1;
                        dropped_unread |= reserved;
                    }
                }
            }
        } else if let Some((_, reserved)) = self.evict_front(table, fx, counters) {
            count += 1;
            dropped_unread = reserved;
        }

        bump(&counters.forced_evictions);
        if dropped_unread && !self.overloaded {
            self.overloaded = true;
            tracing::warn!(
                evicted = count,
                capacity = self.ring.capacity(),
                "Ring full, evicting frames not yet read by all receivers"
            );
        }
    }

    /// Free one slot, growing the ring instead while a receiver holds the head
    fn make_room(&mut self, table: &mut ConsumerTable, fx: &mut WriteEffects, counters: &Counters) {
        let mut forced = false;
        while self.ring.is_full() {
            let current = self.ring.capacity();
            if self.is_reserved(0, table) {
                if let Some(target) = self.capacity.grow_target(current) {
                    self.ring.set_capacity(target);
                    fx.capacity_changes.push((current, target));
                    tracing::debug!(from = current, to = target, "Ring grown under backpressure");
                    continue;
                }
            }
            self.force_evict(table, fx, counters);
            forced = true;
        }

        if !forced && self.overloaded {
            self.overloaded = false;
            tracing::debug!("Ring no longer overloaded");
        }
    }

    /// Shrink back to base capacity once the backlog has cleared
    ///
    /// Triggered by the audio frame counter (see `CapacityState::note_audio`).
    fn relieve(&mut self, table: &mut ConsumerTable, fx: &mut WriteEffects, counters: &Counters) {
        let current = self.ring.capacity();
        if !self.capacity.note_audio(current) {
            return;
        }

        let latest_key = self.key_frames.back().copied().unwrap_or(0);
        let gop_local = self.ring.len().saturating_sub(latest_key);
        if gop_local >= current {
            return;
        }

        let base = self.capacity.base();
        while self.ring.len() > base {
            self.evict_front(table, fx, counters);
        }
        if self.ring.set_capacity(base) {
            fx.capacity_changes.push((current, base));
            tracing::debug!(from = current, to = base, gop_local, "Ring shrunk to base capacity");
        }
    }

    /// Write path for one frame
    fn write_frame(
        &mut self,
        data: MediaData,
        table: &mut ConsumerTable,
        rapid_mode: bool,
        fx: &mut WriteEffects,
        counters: &Counters,
    ) {
        let media_type = data.media_type;
        let key = data.is_key_video();

        if !self.data_mode.accepts(media_type) {
            bump(&counters.discarded);
            tracing::trace!(media = %media_type, mode = ?self.data_mode, "Frame outside data mode dropped");
            fx.rejected = Some(data);
            return;
        }

        if self.waiting_key && self.data_mode.has_video() {
            if !key {
                bump(&counters.discarded);
                tracing::trace!(media = %media_type, pts = data.pts, "Waiting for key frame, frame dropped");
                fx.rejected = Some(data);
                return;
            }
            self.waiting_key = false;
            tracing::info!(pts = data.pts, "First key frame received, buffering started");
        }

        if key && !table.any_key_only() {
            self.erase_old_gop(table, fx, counters);
        }

        if let Some(base) = self.capacity.observe(key) {
            let current = self.ring.capacity();
            let target = base.max(self.ring.len());
            if target != current && self.ring.set_capacity(target) {
                fx.capacity_changes.push((current, target));
            }
            tracing::info!(
                base_capacity = base,
                double_capacity = self.capacity.double(),
                "Capacity calibrated from observed GOP"
            );
        }

        if media_type == MediaType::Audio {
            self.relieve(table, fx, counters);
        }

        self.make_room(table, fx, counters);

        let sequence = self.next_sequence;
        let index = match self.ring.append(Arc::new(data), sequence) {
            Ok(index) => index,
            Err(frame) => {
                tracing::error!(capacity = self.ring.capacity(), "Ring still full after eviction");
                fx.evicted.push(frame);
                return;
            }
        };
        self.next_sequence += 1;

        match media_type {
            MediaType::Audio => self.last_audio = Some(index),
            MediaType::Video => self.last_video = Some(index),
        }
        if key {
            self.key_frames.push_back(index);
        }
        bump(&counters.written);
        fx.appended = true;

        self.activate_consumers(index, media_type, key, table, rapid_mode, fx);
    }

    /// Point waiting receivers at the new slot and apply key redirects
    fn activate_consumers(
        &self,
        index: usize,
        media_type: MediaType,
        key: bool,
        table: &mut ConsumerTable,
        rapid_mode: bool,
        fx: &mut WriteEffects,
    ) {
        for (id, consumer) in table.slots.iter_mut() {
            let bit = consumer.bit;

            if consumer.cursor(media_type).is_none() {
                if consumer.needs_key(media_type) && !key {
                    self.mark_range(bit, None, index..index + 1);
                } else {
                    consumer.set_cursor(media_type, Some(index));
                    if key {
                        consumer.wait_key = false;
                    }
                }
            }

            if key && consumer.key_redirect {
                let from = [consumer.audio_index, consumer.video_index]
                    .into_iter()
                    .flatten()
                    .filter(|&cursor| cursor < index)
                    .min();
                let skipped = match from {
                    Some(from) => {
                        self.mark_range(bit, None, from..index);
                        index - from
                    }
                    None => 0,
                };
                consumer.video_index = Some(index);
                consumer.audio_index = self
                    .ring
                    .find_from(index + 1, |slot| slot.media_type() == MediaType::Audio);
                consumer.wait_key = false;
                table
                    .ready
                    .set_data_ready(bit, MediaType::Audio, consumer.audio_index.is_some());
                if !rapid_mode {
                    consumer.key_redirect = false;
                    fx.redirect_done.push(consumer.receiver.clone());
                }
                tracing::debug!(receiver = *id, skipped, index, "Receiver redirected to key frame");
            }

            table
                .ready
                .set_data_ready(bit, media_type, consumer.cursor(media_type).is_some());
        }
    }

    /// Read the frame at a receiver's cursor and advance it
    fn read_at_cursor(&self, table: &mut ConsumerTable, id: u32, kind: ReadKind) -> Result<ReadOutcome> {
        let consumer = table.slots.get_mut(&id).ok_or(DispatchError::NotAttached)?;
        let bit = consumer.bit;

        let media_type = match kind {
            ReadKind::Audio => MediaType::Audio,
            ReadKind::Video => MediaType::Video,
            ReadKind::Mixed => match (consumer.audio_index, consumer.video_index) {
                (Some(audio), Some(video)) if audio < video => MediaType::Audio,
                (Some(_), Some(_)) => MediaType::Video,
                (Some(_), None) => MediaType::Audio,
                (None, Some(_)) => MediaType::Video,
                (None, None) => {
                    table.ready.set_data_ready(bit, MediaType::Audio, false);
                    table.ready.set_data_ready(bit, MediaType::Video, false);
                    return Err(DispatchError::NoData);
                }
            },
        };

        let Some(index) = consumer.cursor(media_type) else {
            table.ready.set_data_ready(bit, media_type, false);
            return Err(DispatchError::NoData);
        };
        let needs_key = consumer.needs_key(media_type);

        let Some(slot) = self.ring.at(index) else {
            tracing::trace!(receiver = id, index, len = self.ring.len(), "Stale cursor reset");
            consumer.set_cursor(media_type, None);
            table.ready.set_data_ready(bit, media_type, false);
            return Err(DispatchError::NoData);
        };

        if slot.media_type() != media_type {
            let next = self.seek(bit, media_type, index, needs_key);
            consumer.set_cursor(media_type, next);
            table.ready.set_data_ready(bit, media_type, next.is_some());
            return Err(DispatchError::NoData);
        }

        let skip_delta = consumer.key_only && media_type == MediaType::Video && !slot.is_key_video();
        if skip_delta || slot.read_mask().has_read(bit) {
            slot.read_mask().mark_read(bit);
            let next = self.seek(bit, media_type, index + 1, needs_key);
            consumer.set_cursor(media_type, next);
            table.ready.set_data_ready(bit, media_type, next.is_some());
            return Err(DispatchError::NoData);
        }

        slot.read_mask().mark_read(bit);
        let frame = Arc::clone(slot.frame());
        tracing::trace!(receiver = id, index, sequence = slot.sequence(), media = %media_type, "Frame read");
        let next = self.seek(bit, media_type, index + 1, needs_key);
        consumer.set_cursor(media_type, next);

        let mut acceleration_done = false;
        if consumer.accelerating {
            let remaining = next.map_or(0, |n| self.ring.len() - n);
            if remaining < 3 {
                consumer.accelerating = false;
                acceleration_done = true;
            }
        }

        table.ready.set_data_ready(bit, media_type, next.is_some());
        Ok(ReadOutcome {
            frame,
            acceleration_done,
        })
    }

    /// Drop every slot and send all receivers back to waiting for a key frame
    fn flush(&mut self, table: &mut ConsumerTable, fx: &mut WriteEffects) {
        fx.evicted
            .extend(self.ring.drain().into_iter().map(|slot| slot.into_frame()));
        self.key_frames.clear();
        self.last_audio = None;
        self.last_video = None;
        self.waiting_key = self.data_mode.has_video();
        self.overloaded = false;
        self.capacity.reset_counters();

        for consumer in table.slots.values_mut() {
            consumer.audio_index = None;
            consumer.video_index = None;
            consumer.wait_key = self.data_mode.has_video();
            for media in MediaType::ALL {
                table.ready.set_data_ready(consumer.bit, media, false);
            }
        }
    }
}

/// Broadcast frame buffer for one media channel
///
/// Create with [`BufferDispatcher::new`] and share the returned `Arc` with the
/// producer and with every reader. Readers attach a [`BufferReceiver`] and
/// read through it.
pub struct BufferDispatcher {
    config: DispatcherConfig,
    store: RwLock<StoreState>,
    consumers: Mutex<ConsumerTable>,
    pool: FramePool,
    signal: Arc<NotifySignal>,
    notifier: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    rapid_mode: AtomicBool,
    write_clock: Mutex<WriteClock>,
    listener: Mutex<Option<Weak<dyn DispatcherListener>>>,
    events: broadcast::Sender<DispatcherEvent>,
    counters: Counters,
}

impl BufferDispatcher {
    /// Create a dispatcher and start its notifier thread
    pub fn new(config: DispatcherConfig) -> Result<Arc<Self>> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let signal = Arc::new(NotifySignal::new());
        let interval = config.housekeeping_interval;
        let id = NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed);

        let dispatcher = Arc::new(Self {
            store: RwLock::new(StoreState::new(&config)),
            consumers: Mutex::new(ConsumerTable::new()),
            pool: FramePool::new(config.audio_pool_size, config.video_pool_size),
            signal: Arc::clone(&signal),
            notifier: Mutex::new(None),
            running: AtomicBool::new(true),
            rapid_mode: AtomicBool::new(false),
            write_clock: Mutex::new(WriteClock {
                last: Instant::now(),
                reported: false,
            }),
            listener: Mutex::new(None),
            events,
            counters: Counters::default(),
            config,
        });

        let handle = notifier::spawn(id, Arc::downgrade(&dispatcher), signal, interval)?;
        *dispatcher.notifier.lock() = Some(handle);

        tracing::info!(
            dispatcher = id,
            capacity = dispatcher.config.initial_capacity,
            max_capacity = dispatcher.config.max_capacity,
            mode = ?dispatcher.config.data_mode,
            "Buffer dispatcher started"
        );

        Ok(dispatcher)
    }

    /// Create a dispatcher with default configuration
    pub fn with_defaults() -> Result<Arc<Self>> {
        Self::new(DispatcherConfig::default())
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Register the producer-side listener
    pub fn set_listener(&self, listener: Weak<dyn DispatcherListener>) {
        *self.listener.lock() = Some(listener);
    }

    /// Subscribe to lifecycle events
    pub fn subscribe_events(&self) -> broadcast::Receiver<DispatcherEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DispatcherEvent) {
        // Err only means nobody is subscribed
        let _ = self.events.send(event);
    }

    // ---- producer side ----

    /// Get an empty frame from the pool
    pub fn request_buffer(&self, media_type: MediaType, size: usize) -> MediaData {
        self.pool.request(media_type, size)
    }

    /// Write one frame
    ///
    /// Frames arriving before the first key frame (or outside the data mode)
    /// are dropped silently and still return `Ok`.
    pub fn input_data(&self, data: MediaData) -> Result<()> {
        if !self.is_running() {
            self.pool.release(data);
            return Err(DispatchError::Stopped);
        }
        if data.is_empty() {
            bump(&self.counters.invalid);
            tracing::debug!(media = %data.media_type, pts = data.pts, "Empty frame dropped");
            self.pool.release(data);
            return Err(DispatchError::InvalidFrame);
        }

        {
            let mut clock = self.write_clock.lock();
            clock.last = Instant::now();
            clock.reported = false;
        }

        let mut fx = WriteEffects::default();
        {
            let mut store = self.store.write();
            let mut table = self.consumers.lock();
            let rapid_mode = self.rapid_mode.load(Ordering::Relaxed);
            store.write_frame(data, &mut table, rapid_mode, &mut fx, &self.counters);
        }
        self.finish(fx);
        Ok(())
    }

    fn finish(&self, fx: WriteEffects) {
        if let Some(data) = fx.rejected {
            self.pool.release(data);
        }
        for frame in fx.evicted {
            // Readers may still hold the frame; the buffer comes back only when unique
            if let Ok(data) = Arc::try_unwrap(frame) {
                self.pool.release(data);
            }
        }
        for (from, to) in fx.capacity_changes {
            self.emit(DispatcherEvent::CapacityChanged { from, to });
        }
        for receiver in fx.redirect_done {
            if let Some(receiver) = receiver.upgrade() {
                receiver.key_redirect_consumed();
            }
        }
        if fx.appended {
            self.signal.wake();
        }
    }

    /// Cache the H.264 SPS for late joiners
    pub fn set_sps(&self, sps: Bytes) {
        self.store.write().sps = Some(sps);
    }

    /// Cache the H.264 PPS for late joiners
    pub fn set_pps(&self, pps: Bytes) {
        self.store.write().pps = Some(pps);
    }

    pub fn sps(&self) -> Option<Bytes> {
        self.store.read().sps.clone()
    }

    pub fn pps(&self) -> Option<Bytes> {
        self.store.read().pps.clone()
    }

    /// Change the media carried by the channel
    pub fn set_data_mode(&self, mode: DataMode) {
        let mut store = self.store.write();
        if store.data_mode == mode {
            return;
        }
        tracing::info!(from = ?store.data_mode, to = ?mode, "Data mode changed");
        store.data_mode = mode;
        if !mode.has_video() {
            store.waiting_key = false;
        } else if store.key_frames.is_empty() {
            store.waiting_key = true;
        }
    }

    pub fn data_mode(&self) -> DataMode {
        self.store.read().data_mode
    }

    /// Keep key-redirect enabled after it fires
    pub fn set_rapid_mode(&self, enable: bool) {
        self.rapid_mode.store(enable, Ordering::Relaxed);
    }

    /// Drop all buffered frames; the next stored frame is a key frame again
    pub fn flush_buffer(&self) {
        let mut fx = WriteEffects::default();
        {
            let mut store = self.store.write();
            let mut table = self.consumers.lock();
            store.flush(&mut table, &mut fx);
        }
        tracing::info!(dropped = fx.evicted.len(), "Buffer flushed");
        self.finish(fx);
        self.emit(DispatcherEvent::Flushed);
    }

    // ---- consumer side ----

    /// Attach a receiver, returning its id
    ///
    /// The receiver starts at the most recent key frame (or the newest audio
    /// frame on an audio-only channel), or at the next frame written when the
    /// buffer is empty.
    pub fn attach(self: &Arc<Self>, receiver: &Arc<BufferReceiver>) -> Result<u32> {
        if !self.is_running() {
            return Err(DispatchError::Stopped);
        }
        receiver.begin_attach()?;

        let attached = {
            let store = self.store.read();
            let mut table = self.consumers.lock();

            table.bits.lowest_free().map(|bit| {
                let id = table.next_id();
                for slot in store.ring.iter() {
                    slot.read_mask().clear(bit);
                }

                let mut consumer = ConsumerSlot::new(Arc::downgrade(receiver), bit);
                consumer.key_only = receiver.is_key_only();
                consumer.accelerating = consumer.key_only;
                consumer.key_redirect = receiver.is_key_redirect();
                store.seed_cursors(&mut consumer);

                for media in MediaType::ALL {
                    let ready = consumer.cursor(media).is_some();
                    table.ready.set_data_ready(bit, media, ready);
                }
                let cursors = (consumer.audio_index, consumer.video_index);
                table.bits.insert(bit);
                table.slots.insert(id, consumer);
                (id, bit, cursors)
            })
        };

        let Some((id, bit, (audio_index, video_index))) = attached else {
            receiver.abort_attach();
            tracing::warn!(max = MAX_RECEIVERS, "Receiver refused, all slots in use");
            return Err(DispatchError::SlotsExhausted(MAX_RECEIVERS));
        };

        receiver.bind(Arc::downgrade(self), id);

        tracing::info!(
            receiver = id,
            slot = bit.index(),
            audio_index = ?audio_index,
            video_index = ?video_index,
            "Receiver attached"
        );
        self.emit(DispatcherEvent::ReceiverAttached {
            id,
            slot: bit.index(),
        });
        self.signal.wake();
        Ok(id)
    }

    /// Detach a receiver; a no-op if it is not attached here
    pub fn detach(&self, receiver: &BufferReceiver) -> bool {
        match receiver.id() {
            Some(id) if receiver.is_bound_to(self) => self.detach_id(id),
            _ => false,
        }
    }

    /// Detach by receiver id; returns false if the id is unknown
    pub fn detach_id(&self, id: u32) -> bool {
        let removed = {
            let mut table = self.consumers.lock();
            let Some(consumer) = table.slots.remove(&id) else {
                return false;
            };
            table.bits.remove(consumer.bit);
            table.ready.clear(consumer.bit);
            consumer
        };

        if let Some(receiver) = removed.receiver.upgrade() {
            receiver.mark_detached();
        }

        tracing::info!(receiver = id, slot = removed.bit.index(), "Receiver detached");
        self.emit(DispatcherEvent::ReceiverDetached { id });
        true
    }

    /// Detach every receiver
    pub fn release_all_receivers(&self) {
        let ids: Vec<u32> = self.consumers.lock().slots.keys().copied().collect();
        for id in ids {
            self.detach_id(id);
        }
    }

    /// Number of attached receivers
    pub fn receiver_count(&self) -> usize {
        self.consumers.lock().slots.len()
    }

    pub(crate) fn set_key_mode(&self, id: u32, enable: bool) {
        if let Some(consumer) = self.consumers.lock().slots.get_mut(&id) {
            consumer.key_only = enable;
            consumer.accelerating = enable;
        }
    }

    pub(crate) fn set_key_redirect(&self, id: u32, enable: bool) {
        if let Some(consumer) = self.consumers.lock().slots.get_mut(&id) {
            consumer.key_redirect = enable;
        }
    }

    /// Register a waiting reader and refresh its data-ready bits
    pub(crate) fn notify_read_ready(&self, id: u32, kind: ReadKind) -> Result<()> {
        {
            let store = self.store.read();
            let mut table = self.consumers.lock();
            let consumer = table.slots.get_mut(&id).ok_or(DispatchError::NotAttached)?;
            consumer.register_read(kind);
            let bit = consumer.bit;

            let len = store.ring.len();
            let readiness = MediaType::ALL.map(|media| {
                let ready = consumer.cursor(media).is_some_and(|index| index < len);
                (media, ready)
            });

            for (media, ready) in readiness {
                if kind.covers(media) {
                    table.ready.set_data_ready(bit, media, ready);
                }
            }
            table.ready.set_want_read(bit, kind, true);
        }
        self.signal.wake();
        Ok(())
    }

    /// Read the frame at a receiver's cursor
    pub(crate) fn read_buffer_data(&self, id: u32, kind: ReadKind) -> Result<ReadOutcome> {
        let store = self.store.read();
        let mut table = self.consumers.lock();
        store.read_at_cursor(&mut table, id, kind)
    }

    /// Signal every receiver that is waiting for data it can now read
    pub(crate) fn notify_pass(&self) {
        let targets = {
            let mut table = self.consumers.lock();
            let pending = table.ready.pending();
            let mut targets = Vec::with_capacity(pending.len());

            for (bit, which) in pending {
                let Some(id) = table.id_for_bit(bit) else {
                    table.ready.clear(bit);
                    continue;
                };
                let (receiver, mixed) = {
                    let consumer = &table.slots[&id];
                    (consumer.receiver.clone(), consumer.mixed)
                };

                if mixed {
                    table.ready.set_want_read(bit, ReadKind::Mixed, false);
                } else {
                    if which.audio {
                        table.ready.set_want_read(bit, ReadKind::Audio, false);
                    }
                    if which.video {
                        table.ready.set_want_read(bit, ReadKind::Video, false);
                    }
                }
                targets.push((receiver, which));
            }
            targets
        };

        for (receiver, which) in targets {
            if let Some(receiver) = receiver.upgrade() {
                receiver.on_data_notify(which);
            }
        }
    }

    /// Periodic checks run by the notifier thread
    pub(crate) fn housekeeping(&self) {
        self.check_write_timeout();

        let dead = self.consumers.lock().dead_ids();
        for id in dead {
            tracing::debug!(receiver = id, "Receiver handle dropped, detaching");
            self.detach_id(id);
        }
    }

    fn check_write_timeout(&self) {
        let Some(timeout) = self.config.write_timeout else {
            return;
        };
        if !self.is_running() {
            return;
        }

        let idle = {
            let mut clock = self.write_clock.lock();
            let idle = clock.last.elapsed();
            if clock.reported || idle < timeout {
                return;
            }
            clock.reported = true;
            idle
        };

        tracing::warn!(idle_ms = idle.as_millis() as u64, "No frame written within write timeout");

        let listener = self.listener.lock().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.on_write_timeout();
        }
        self.emit(DispatcherEvent::WriteTimeout { idle });
    }

    /// Detach all receivers and stop the notifier thread
    ///
    /// Writes and attaches fail with `Stopped` afterwards.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.release_all_receivers();
        self.shutdown_notifier();
        self.pool.clear();
        tracing::info!("Buffer dispatcher stopped");
    }

    fn shutdown_notifier(&self) {
        self.signal.shutdown();
        let handle = self.notifier.lock().take();
        if let Some(handle) = handle {
            // The last handle may be dropped by the notifier thread itself
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> DispatcherStats {
        let store = self.store.read();
        let receivers = self.consumers.lock().slots.len();
        let pts_range = store
            .ring
            .front()
            .zip(store.ring.back())
            .map(|(first, last)| (first.frame().pts, last.frame().pts));

        DispatcherStats {
            ring_len: store.ring.len(),
            capacity: store.ring.capacity(),
            base_capacity: store.capacity.base(),
            double_capacity: store.capacity.double(),
            calibrated: store.capacity.is_calibrated(),
            receivers,
            key_frames: store.key_frames.len(),
            pts_range,
            frames_written: self.counters.written.load(Ordering::Relaxed),
            frames_discarded: self.counters.discarded.load(Ordering::Relaxed),
            frames_invalid: self.counters.invalid.load(Ordering::Relaxed),
            frames_evicted: self.counters.evicted.load(Ordering::Relaxed),
            unread_evicted: self.counters.unread_evicted.load(Ordering::Relaxed),
            forced_evictions: self.counters.forced_evictions.load(Ordering::Relaxed),
            pool: self.pool.stats(),
        }
    }

    /// Number of buffered frames
    pub fn ring_len(&self) -> usize {
        self.store.read().ring.len()
    }

    /// Current ring capacity
    pub fn capacity(&self) -> usize {
        self.store.read().ring.capacity()
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self, id: u32, media_type: MediaType) -> Option<usize> {
        self.consumers
            .lock()
            .slots
            .get(&id)
            .and_then(|consumer| consumer.cursor(media_type))
    }

    #[cfg(test)]
    pub(crate) fn key_frame_indices(&self) -> Vec<usize> {
        self.store.read().key_frames.iter().copied().collect()
    }

    #[cfg(test)]
    pub(crate) fn has_read(&self, id: u32, index: usize) -> bool {
        let store = self.store.read();
        let table = self.consumers.lock();
        match (store.ring.at(index), table.slots.get(&id)) {
            (Some(slot), Some(consumer)) => slot.read_mask().has_read(consumer.bit),
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn pts_at(&self, index: usize) -> Option<u64> {
        self.store.read().ring.at(index).map(|slot| slot.frame().pts)
    }
}

impl Drop for BufferDispatcher {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.release_all_receivers();
        self.shutdown_notifier();
    }
}

impl std::fmt::Debug for BufferDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferDispatcher")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
