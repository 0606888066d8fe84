//! Capacity-bounded ring of frame slots
//!
//! Slots are addressed by their position relative to the head (index 0 is the
//! oldest frame). The dispatcher keeps every cursor in that coordinate system,
//! so each `pop_front` must be followed by renumbering the cursors; the ring
//! itself knows nothing about readers.
//!
//! Storage is a fixed arena of `capacity` cells with a moving head. Changing
//! the capacity re-lays the live slots out from cell 0.

use std::sync::atomic::{AtomicU16, Ordering};

use crate::media::{Frame, MediaType};

use super::ready::{ConsumerMask, SlotBit};

/// Which receivers have consumed a slot
///
/// Atomic so readers can mark slots under the shared store lock.
#[derive(Debug, Default)]
pub struct ReadMask(AtomicU16);

impl ReadMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_read(&self, bit: SlotBit) {
        self.0.fetch_or(bit.mask(), Ordering::AcqRel);
    }

    pub fn has_read(&self, bit: SlotBit) -> bool {
        self.0.load(Ordering::Acquire) & bit.mask() != 0
    }

    pub fn clear(&self, bit: SlotBit) {
        self.0.fetch_and(!bit.mask(), Ordering::AcqRel);
    }

    /// Whether every receiver in `attached` has read the slot
    ///
    /// Bits of receivers outside `attached` are ignored.
    pub fn all_attached_have_read(&self, attached: ConsumerMask) -> bool {
        let read = self.0.load(Ordering::Acquire);
        read & attached.bits() == attached.bits()
    }
}

/// One buffered frame and its read bookkeeping
#[derive(Debug)]
pub struct Slot {
    frame: Frame,
    read_mask: ReadMask,
    sequence: u64,
}

impl Slot {
    pub fn new(frame: Frame, sequence: u64) -> Self {
        Self {
            frame,
            read_mask: ReadMask::new(),
            sequence,
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn into_frame(self) -> Frame {
        self.frame
    }

    pub fn media_type(&self) -> MediaType {
        self.frame.media_type
    }

    pub fn is_key_video(&self) -> bool {
        self.frame.is_key_video()
    }

    pub fn read_mask(&self) -> &ReadMask {
        &self.read_mask
    }

    /// Write order of this slot, contiguous across the ring
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Arena ring store
#[derive(Debug)]
pub struct RingStore {
    cells: Vec<Option<Slot>>,
    head: usize,
    len: usize,
}

impl RingStore {
    /// Create an empty ring; a zero capacity is raised to one
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: empty_cells(capacity.max(1)),
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.cells.len()
    }

    fn cell(&self, index: usize) -> usize {
        (self.head + index) % self.cells.len()
    }

    /// Slot at ring-relative `index`
    pub fn at(&self, index: usize) -> Option<&Slot> {
        if index >= self.len {
            return None;
        }
        self.cells[self.cell(index)].as_ref()
    }

    pub fn front(&self) -> Option<&Slot> {
        self.at(0)
    }

    pub fn back(&self) -> Option<&Slot> {
        self.len.checked_sub(1).and_then(|i| self.at(i))
    }

    /// Append at the tail; hands the frame back when the ring is full
    pub fn append(&mut self, frame: Frame, sequence: u64) -> Result<usize, Frame> {
        if self.is_full() {
            return Err(frame);
        }
        let index = self.len;
        let cell = self.cell(index);
        self.cells[cell] = Some(Slot::new(frame, sequence));
        self.len += 1;
        Ok(index)
    }

    /// Remove the oldest slot
    pub fn pop_front(&mut self) -> Option<Slot> {
        if self.len == 0 {
            return None;
        }
        let slot = self.cells[self.head].take();
        self.head = (self.head + 1) % self.cells.len();
        self.len -= 1;
        slot
    }

    /// Resize the arena, keeping slot order
    ///
    /// Fails (returns false) when `capacity` is below the current length; the
    /// caller evicts first so cursors can be renumbered.
    pub fn set_capacity(&mut self, capacity: usize) -> bool {
        let capacity = capacity.max(1);
        if capacity < self.len {
            return false;
        }
        if capacity == self.cells.len() {
            return true;
        }

        let mut cells = empty_cells(capacity);
        for (target, index) in (0..self.len).enumerate() {
            let cell = self.cell(index);
            cells[target] = self.cells[cell].take();
        }
        self.cells = cells;
        self.head = 0;
        true
    }

    /// First index at or after `from` whose slot matches `pred`
    pub fn find_from<F>(&self, from: usize, mut pred: F) -> Option<usize>
    where
        F: FnMut(&Slot) -> bool,
    {
        (from..self.len).find(|&i| self.at(i).is_some_and(&mut pred))
    }

    /// Slots from head to tail
    pub fn iter(&self) -> impl Iterator<Item = &Slot> + '_ {
        (0..self.len).filter_map(move |i| self.at(i))
    }

    /// Remove every slot, head to tail
    pub fn drain(&mut self) -> Vec<Slot> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(slot) = self.pop_front() {
            out.push(slot);
        }
        self.head = 0;
        out
    }
}

fn empty_cells(capacity: usize) -> Vec<Option<Slot>> {
    (0..capacity).map(|_| None).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::media::MediaData;

    fn video(pts: u64, key: bool) -> Frame {
        Arc::new(MediaData::video(pts, &[0x01], key))
    }

    fn audio(pts: u64) -> Frame {
        Arc::new(MediaData::audio(pts, &[0x02]))
    }

    fn bit(i: usize) -> SlotBit {
        SlotBit::new(i).unwrap()
    }

    #[test]
    fn test_append_until_full() {
        let mut ring = RingStore::new(3);
        for pts in 0..3 {
            assert_eq!(ring.append(video(pts, false), pts).ok(), Some(pts as usize));
        }
        assert!(ring.is_full());
        assert!(ring.append(video(3, false), 3).is_err());
    }

    #[test]
    fn test_wraparound_keeps_order() {
        let mut ring = RingStore::new(3);
        for seq in 0..3 {
            ring.append(video(seq, false), seq).unwrap();
        }
        ring.pop_front();
        ring.append(video(3, false), 3).unwrap();

        let seqs: Vec<u64> = ring.iter().map(|s| s.sequence()).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(ring.front().unwrap().sequence(), 1);
        assert_eq!(ring.back().unwrap().sequence(), 3);
        assert!(ring.at(3).is_none());
    }

    #[test]
    fn test_grow_after_wrap() {
        let mut ring = RingStore::new(2);
        ring.append(video(0, true), 0).unwrap();
        ring.append(video(1, false), 1).unwrap();
        ring.pop_front();
        ring.append(video(2, false), 2).unwrap();

        assert!(ring.set_capacity(4));
        assert_eq!(ring.capacity(), 4);
        ring.append(video(3, false), 3).unwrap();

        let pts: Vec<u64> = ring.iter().map(|s| s.frame().pts).collect();
        assert_eq!(pts, vec![1, 2, 3]);
    }

    #[test]
    fn test_shrink_below_len_is_refused() {
        let mut ring = RingStore::new(4);
        for seq in 0..3 {
            ring.append(audio(seq), seq).unwrap();
        }
        assert!(!ring.set_capacity(2));
        assert_eq!(ring.capacity(), 4);
        assert!(ring.set_capacity(3));
        assert!(ring.is_full());
    }

    #[test]
    fn test_find_from() {
        let mut ring = RingStore::new(8);
        ring.append(video(0, true), 0).unwrap();
        ring.append(audio(1), 1).unwrap();
        ring.append(video(2, false), 2).unwrap();
        ring.append(video(3, true), 3).unwrap();

        assert_eq!(ring.find_from(1, |s| s.media_type() == MediaType::Video), Some(2));
        assert_eq!(ring.find_from(1, |s| s.is_key_video()), Some(3));
        assert_eq!(ring.find_from(2, |s| s.media_type() == MediaType::Audio), None);
    }

    #[test]
    fn test_read_mask() {
        let mask = ReadMask::new();
        let mut attached = ConsumerMask::empty();
        attached.insert(bit(0));
        attached.insert(bit(3));

        assert!(!mask.all_attached_have_read(attached));
        mask.mark_read(bit(0));
        assert!(!mask.all_attached_have_read(attached));
        mask.mark_read(bit(3));
        assert!(mask.all_attached_have_read(attached));

        // A stale bit of a detached receiver does not matter
        mask.mark_read(bit(7));
        assert!(mask.all_attached_have_read(attached));

        mask.clear(bit(3));
        assert!(!mask.has_read(bit(3)));
        assert!(mask.all_attached_have_read(ConsumerMask::empty()));
    }

    #[test]
    fn test_drain() {
        let mut ring = RingStore::new(2);
        ring.append(audio(0), 0).unwrap();
        ring.append(audio(1), 1).unwrap();

        let slots = ring.drain();
        assert_eq!(slots.len(), 2);
        assert!(ring.is_empty());
        assert!(ring.append(audio(2), 2).is_ok());
    }
}
