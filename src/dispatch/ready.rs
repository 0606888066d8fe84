//! Consumer bit bookkeeping and the wakeup ready-set
//!
//! Each attached receiver owns one [`SlotBit`] (0..16). The bit is used in two
//! places: the per-slot read masks in the ring, and the wakeup masks below,
//! where it expands to two bits (audio at `2·slot`, video at `2·slot + 1`).
//!
//! ```text
//!  want_read   ..  v1 a1 v0 a0      set while receiver waits for that type
//!  data_ready  ..  v1 a1 v0 a0      set while its cursor has a frame
//!              ───────────────
//!  pending  =  data_ready & want_read   →  notifier signals receiver
//! ```

use crate::media::{MediaType, ReadKind};

/// Fixed number of receivers one dispatcher can serve
pub const MAX_RECEIVERS: usize = 16;

/// Position of a receiver in the read and wakeup masks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotBit(u8);

impl SlotBit {
    /// Bit for slot index `index`, if within range
    pub fn new(index: usize) -> Option<Self> {
        (index < MAX_RECEIVERS).then_some(SlotBit(index as u8))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn mask(self) -> u16 {
        1 << self.0
    }

    fn ready_bit(self, media_type: MediaType) -> u32 {
        let offset = match media_type {
            MediaType::Audio => 0,
            MediaType::Video => 1,
        };
        1 << (self.0 as u32 * 2 + offset)
    }

    fn ready_pair(self) -> u32 {
        0b11 << (self.0 as u32 * 2)
    }
}

/// Set of receiver bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerMask(u16);

impl ConsumerMask {
    pub fn empty() -> Self {
        ConsumerMask(0)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, bit: SlotBit) -> bool {
        self.0 & bit.mask() != 0
    }

    pub fn insert(&mut self, bit: SlotBit) {
        self.0 |= bit.mask();
    }

    pub fn remove(&mut self, bit: SlotBit) {
        self.0 &= !bit.mask();
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Lowest bit not in the set
    pub fn lowest_free(self) -> Option<SlotBit> {
        SlotBit::new((!self.0).trailing_zeros() as usize)
    }
}

/// Wakeup masks shared by the write path, the read path and the notifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadySet {
    data_ready: u32,
    want_read: u32,
}

impl ReadySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_data_ready(&mut self, bit: SlotBit, media_type: MediaType, ready: bool) {
        if ready {
            self.data_ready |= bit.ready_bit(media_type);
        } else {
            self.data_ready &= !bit.ready_bit(media_type);
        }
    }

    pub fn is_data_ready(&self, bit: SlotBit, media_type: MediaType) -> bool {
        self.data_ready & bit.ready_bit(media_type) != 0
    }

    /// Register (or withdraw) a waiting reader for every type `kind` covers
    pub fn set_want_read(&mut self, bit: SlotBit, kind: ReadKind, want: bool) {
        for media_type in MediaType::ALL {
            if !kind.covers(media_type) {
                continue;
            }
            if want {
                self.want_read |= bit.ready_bit(media_type);
            } else {
                self.want_read &= !bit.ready_bit(media_type);
            }
        }
    }

    pub fn is_want_read(&self, bit: SlotBit, media_type: MediaType) -> bool {
        self.want_read & bit.ready_bit(media_type) != 0
    }

    /// Forget both wakeup bits of a receiver
    pub fn clear(&mut self, bit: SlotBit) {
        self.data_ready &= !bit.ready_pair();
        self.want_read &= !bit.ready_pair();
    }

    /// Receivers that wait for data which is available, with the types involved
    ///
    /// This is the only place the wakeup condition is evaluated.
    pub fn pending(&self) -> Vec<(SlotBit, Pending)> {
        let notify = self.data_ready & self.want_read;
        let mut out = Vec::new();
        if notify == 0 {
            return out;
        }

        for index in 0..MAX_RECEIVERS {
            let bit = SlotBit(index as u8);
            let audio = notify & bit.ready_bit(MediaType::Audio) != 0;
            let video = notify & bit.ready_bit(MediaType::Video) != 0;
            if audio || video {
                out.push((bit, Pending { audio, video }));
            }
        }
        out
    }
}

/// Which of a receiver's types became readable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    pub audio: bool,
    pub video: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bit(i: usize) -> SlotBit {
        SlotBit::new(i).unwrap()
    }

    #[test]
    fn test_slot_bit_range() {
        assert!(SlotBit::new(15).is_some());
        assert!(SlotBit::new(16).is_none());
    }

    #[test]
    fn test_lowest_free() {
        let mut mask = ConsumerMask::empty();
        assert!(mask.is_empty());
        assert_eq!(mask.lowest_free(), Some(bit(0)));

        mask.insert(bit(0));
        mask.insert(bit(1));
        mask.insert(bit(3));
        assert_eq!(mask.lowest_free(), Some(bit(2)));

        mask.remove(bit(1));
        assert_eq!(mask.lowest_free(), Some(bit(1)));
        assert_eq!(mask.len(), 2);

        mask.remove(bit(0));
        mask.remove(bit(3));
        assert!(mask.is_empty());
    }

    #[test]
    fn test_lowest_free_exhausted() {
        let mut mask = ConsumerMask::empty();
        for i in 0..MAX_RECEIVERS {
            mask.insert(bit(i));
        }
        assert_eq!(mask.lowest_free(), None);
    }

    #[test]
    fn test_pending_requires_both_masks() {
        let mut ready = ReadySet::new();
        ready.set_data_ready(bit(2), MediaType::Video, true);
        assert!(ready.pending().is_empty());

        ready.set_want_read(bit(2), ReadKind::Audio, true);
        assert!(ready.pending().is_empty());

        ready.set_want_read(bit(2), ReadKind::Video, true);
        let pending = ready.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, bit(2));
        assert!(pending[0].1.video);
        assert!(!pending[0].1.audio);
    }

    #[test]
    fn test_mixed_want_sets_both() {
        let mut ready = ReadySet::new();
        ready.set_want_read(bit(1), ReadKind::Mixed, true);
        assert!(ready.is_want_read(bit(1), MediaType::Audio));
        assert!(ready.is_want_read(bit(1), MediaType::Video));

        ready.set_data_ready(bit(1), MediaType::Audio, true);
        let pending = ready.pending();
        assert_eq!(pending, vec![(bit(1), Pending { audio: true, video: false })]);
    }

    #[test]
    fn test_clear_only_touches_one_receiver() {
        let mut ready = ReadySet::new();
        for i in [0, 1] {
            ready.set_want_read(bit(i), ReadKind::Mixed, true);
            ready.set_data_ready(bit(i), MediaType::Audio, true);
        }
        ready.clear(bit(0));
        assert!(!ready.is_data_ready(bit(0), MediaType::Audio));
        assert!(!ready.is_want_read(bit(0), MediaType::Video));
        assert!(ready.is_data_ready(bit(1), MediaType::Audio));
        assert!(!ready.is_data_ready(bit(1), MediaType::Video));

        let pending = ready.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, bit(1));
    }

    #[test]
    fn test_highest_slot_bits() {
        let mut ready = ReadySet::new();
        ready.set_want_read(bit(15), ReadKind::Video, true);
        ready.set_data_ready(bit(15), MediaType::Video, true);
        assert_eq!(ready.pending()[0].0, bit(15));
    }
}
