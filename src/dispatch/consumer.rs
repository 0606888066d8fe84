//! Per-receiver bookkeeping inside the dispatcher
//!
//! A [`ConsumerSlot`] exists for every attached receiver. It holds the two
//! read cursors (ring-relative indices, `None` while the receiver waits for the
//! next frame of that type), the receiver's bit, and the mode flags the write
//! path needs without calling back into the receiver.

use std::collections::HashMap;
use std::sync::Weak;

use crate::media::{MediaType, ReadKind};

use super::ready::{ConsumerMask, ReadySet, SlotBit};
use super::receiver::BufferReceiver;

/// Dispatcher-side record of one attached receiver
#[derive(Debug)]
pub(crate) struct ConsumerSlot {
    pub receiver: Weak<BufferReceiver>,
    pub bit: SlotBit,
    pub audio_index: Option<usize>,
    pub video_index: Option<usize>,
    /// Video cursor only activates on a key frame
    pub wait_key: bool,
    pub key_only: bool,
    pub key_redirect: bool,
    /// Key-only catch-up requested and not yet reported done
    pub accelerating: bool,
    /// Receiver waits through the mixed condition variable
    pub mixed: bool,
    reads_audio: bool,
    reads_video: bool,
}

impl ConsumerSlot {
    pub fn new(receiver: Weak<BufferReceiver>, bit: SlotBit) -> Self {
        Self {
            receiver,
            bit,
            audio_index: None,
            video_index: None,
            wait_key: false,
            key_only: false,
            key_redirect: false,
            accelerating: false,
            mixed: false,
            reads_audio: false,
            reads_video: false,
        }
    }

    pub fn cursor(&self, media_type: MediaType) -> Option<usize> {
        match media_type {
            MediaType::Audio => self.audio_index,
            MediaType::Video => self.video_index,
        }
    }

    pub fn set_cursor(&mut self, media_type: MediaType, index: Option<usize>) {
        match media_type {
            MediaType::Audio => self.audio_index = index,
            MediaType::Video => self.video_index = index,
        }
    }

    /// Whether the next video frame handed to this receiver must be a key frame
    pub fn needs_key(&self, media_type: MediaType) -> bool {
        media_type == MediaType::Video && (self.wait_key || self.key_only)
    }

    /// Record the media types this receiver actually reads
    pub fn register_read(&mut self, kind: ReadKind) {
        self.reads_audio |= kind.covers(MediaType::Audio);
        self.reads_video |= kind.covers(MediaType::Video);
        self.mixed |= kind == ReadKind::Mixed;
    }

    /// Whether slots of `media_type` are held back for this receiver
    ///
    /// Before its first read a receiver holds back everything.
    pub fn reserves(&self, media_type: MediaType) -> bool {
        if !self.reads_audio && !self.reads_video {
            return true;
        }
        match media_type {
            MediaType::Audio => self.reads_audio,
            MediaType::Video => self.reads_video,
        }
    }
}

/// Attached receivers plus the wakeup masks
#[derive(Debug, Default)]
pub(crate) struct ConsumerTable {
    pub slots: HashMap<u32, ConsumerSlot>,
    pub bits: ConsumerMask,
    pub ready: ReadySet,
    next_id: u32,
}

impl ConsumerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u32 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    /// Receivers that must have read a slot of `media_type` before it can go
    pub fn reserve_mask(&self, media_type: MediaType) -> ConsumerMask {
        let mut mask = ConsumerMask::empty();
        for slot in self.slots.values() {
            if slot.reserves(media_type) {
                mask.insert(slot.bit);
            }
        }
        mask
    }

    pub fn any_key_only(&self) -> bool {
        self.slots.values().any(|slot| slot.key_only)
    }

    pub fn id_for_bit(&self, bit: SlotBit) -> Option<u32> {
        self.slots
            .iter()
            .find(|(_, slot)| slot.bit == bit)
            .map(|(id, _)| *id)
    }

    /// Receivers whose handle has been dropped
    pub fn dead_ids(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.receiver.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(bit: usize) -> ConsumerSlot {
        ConsumerSlot::new(Weak::new(), SlotBit::new(bit).unwrap())
    }

    #[test]
    fn test_reserves_everything_before_first_read() {
        let slot = slot(0);
        assert!(slot.reserves(MediaType::Audio));
        assert!(slot.reserves(MediaType::Video));
    }

    #[test]
    fn test_reserves_only_read_types() {
        let mut slot = slot(0);
        slot.register_read(ReadKind::Video);
        assert!(!slot.reserves(MediaType::Audio));
        assert!(slot.reserves(MediaType::Video));
        assert!(!slot.mixed);

        slot.register_read(ReadKind::Audio);
        assert!(slot.reserves(MediaType::Audio));
    }

    #[test]
    fn test_mixed_registers_both() {
        let mut slot = slot(0);
        slot.register_read(ReadKind::Mixed);
        assert!(slot.mixed);
        assert!(slot.reserves(MediaType::Audio));
        assert!(slot.reserves(MediaType::Video));
    }

    #[test]
    fn test_needs_key() {
        let mut slot = slot(0);
        assert!(!slot.needs_key(MediaType::Video));
        slot.key_only = true;
        assert!(slot.needs_key(MediaType::Video));
        assert!(!slot.needs_key(MediaType::Audio));
    }

    #[test]
    fn test_reserve_mask() {
        let mut table = ConsumerTable::new();
        let mut audio_reader = slot(0);
        audio_reader.register_read(ReadKind::Audio);
        table.slots.insert(1, audio_reader);
        table.slots.insert(2, slot(3));

        let audio = table.reserve_mask(MediaType::Audio);
        let video = table.reserve_mask(MediaType::Video);
        assert_eq!(audio.len(), 2);
        assert_eq!(video.len(), 1);
        assert!(video.contains(SlotBit::new(3).unwrap()));
    }

    #[test]
    fn test_dead_ids() {
        let mut table = ConsumerTable::new();
        table.slots.insert(7, slot(0));
        assert_eq!(table.dead_ids(), vec![7]);
        assert_eq!(table.id_for_bit(SlotBit::new(0).unwrap()), Some(7));
    }
}
