use std::collections::VecDeque;

use crate::packet::PacketShape;

/// One live packet view inside the scratch buffer: where its bytes live and
/// what index/shape they belong to. The bytes themselves stay in `Ring::buf`;
/// this is bookkeeping only.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RingEntry {
    pub index: u64,
    pub offset: usize,
    pub len: usize,
    pub shape: PacketShape,
}

/// The byte-bounded scratch ring a Precacher's worker thread fills and the
/// consumer thread reads out of (through the mutex the Precacher wraps this
/// in — `Ring` itself assumes exclusive access to its caller).
///
/// `entries` is the ground truth for occupancy: `head`/`tail` are cached
/// offsets kept in lockstep with it (`tail` advances on every push, `head`
/// snaps to the new front entry's offset on every pop) rather than derived
/// from raw offset arithmetic, so a "jump to offset 0" that strands a
/// contiguous run of trailing bytes before they're popped never leaves the
/// head pointer referencing space that isn't actually at the front of the
/// queue (I1, I3).
pub(crate) struct Ring {
    buf: Box<[u8]>,
    capacity: usize,
    head: usize,
    tail: usize,
    used: usize,
    entries: VecDeque<RingEntry>,
}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            capacity,
            head: 0,
            tail: 0,
            used: 0,
            entries: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used_bytes(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn front_index(&self) -> Option<u64> {
        self.entries.front().map(|e| e.index)
    }

    /// Drops every queued entry and resets occupancy to nothing. Used on
    /// flush-and-reload (gap, backward jump, or empty-queue request).
    pub fn flush(&mut self) {
        self.entries.clear();
        self.used = 0;
        self.head = 0;
        self.tail = 0;
    }

    /// Finds a placement offset for `len` bytes without disturbing any
    /// currently-queued packet, per I2/I3. Returns `None` if `len` does not
    /// fit anywhere right now (caller should stop filling, not flush).
    fn placement_for(&self, len: usize) -> Option<usize> {
        if len == 0 || len > self.capacity {
            return None;
        }
        if self.used == 0 {
            return Some(0);
        }
        if self.used + len > self.capacity {
            return None;
        }
        if self.tail > self.head {
            let tail_room = self.capacity - self.tail;
            if len <= tail_room {
                Some(self.tail)
            } else if len <= self.head {
                // Jump to the front; the slack [tail, capacity) is abandoned
                // until the entries occupying it are popped (I3).
                Some(0)
            } else {
                None
            }
        } else if self.tail < self.head {
            let room = self.head - self.tail;
            if len <= room {
                Some(self.tail)
            } else {
                None
            }
        } else {
            // tail == head with used > 0: no guaranteed contiguous room.
            None
        }
    }

    /// Attempts to enqueue one packet's bytes at the tail. Returns `false`
    /// without mutating state if it does not currently fit.
    pub fn try_push(&mut self, index: u64, bytes: &[u8], shape: PacketShape) -> bool {
        let len = bytes.len();
        let Some(offset) = self.placement_for(len) else {
            return false;
        };
        self.buf[offset..offset + len].copy_from_slice(bytes);
        self.tail = offset + len;
        if self.tail == self.capacity {
            self.tail = 0;
        }
        self.used += len;
        self.entries.push_back(RingEntry { index, offset, len, shape });
        true
    }

    /// Pops the oldest entry, returning a fresh owned copy of its bytes. The
    /// scratch bytes are never handed out by reference; `get_packet` only
    /// ever returns copies made under the lock (see DESIGN.md).
    pub fn pop_front(&mut self) -> Option<(RingEntry, Box<[u8]>)> {
        let entry = self.entries.pop_front()?;
        self.used -= entry.len;
        match self.entries.front() {
            Some(next) => self.head = next.offset,
            None => {
                self.head = 0;
                self.tail = 0;
            }
        }
        let bytes = self.buf[entry.offset..entry.offset + entry.len].to_vec().into_boxed_slice();
        Some((entry, bytes))
    }

    /// Discards queued entries from the head until the front matches
    /// `target_index`, inclusive of popping it. Returns its bytes, or `None`
    /// if `target_index` never appears in the queue (caller should flush).
    pub fn discard_until(&mut self, target_index: u64) -> Option<(RingEntry, Box<[u8]>)> {
        loop {
            let front = self.entries.front()?;
            if front.index == target_index {
                return self.pop_front();
            }
            if front.index > target_index {
                return None;
            }
            self.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> PacketShape {
        PacketShape::new(1, 1, 1, 1)
    }

    #[test]
    fn push_and_pop_roundtrip_bytes() {
        let mut ring = Ring::new(16);
        assert!(ring.try_push(0, &[1, 2, 3, 4], shape()));
        assert_eq!(ring.used_bytes(), 4);
        let (entry, bytes) = ring.pop_front().unwrap();
        assert_eq!(entry.index, 0);
        assert_eq!(&*bytes, &[1, 2, 3, 4]);
        assert_eq!(ring.used_bytes(), 0);
    }

    #[test]
    fn refuses_to_overwrite_queued_bytes() {
        let mut ring = Ring::new(8);
        assert!(ring.try_push(0, &[1; 6], shape()));
        // Only 2 bytes free; a 4-byte packet must not fit.
        assert!(!ring.try_push(1, &[2; 4], shape()));
        assert!(ring.try_push(1, &[2; 2], shape()));
    }

    #[test]
    fn wraps_to_front_when_prefix_is_free() {
        let mut ring = Ring::new(10);
        assert!(ring.try_push(0, &[1; 6], shape())); // offset 0..6, tail=6
        assert!(ring.try_push(1, &[2; 2], shape())); // offset 6..8, tail=8
        let (entry, bytes) = ring.pop_front().unwrap(); // drop packet 0, head -> 6
        assert_eq!(entry.index, 0);
        assert_eq!(&*bytes, &[1; 6]);
        // tail_room (10-8=2) is too small for 4 bytes, but the freed prefix
        // [0, head=6) has room: this must jump to offset 0 rather than fail.
        assert!(ring.try_push(2, &[3; 4], shape()));
        assert_eq!(ring.used_bytes(), 6);
        assert_eq!(ring.front_index(), Some(1));
        let (_, bytes1) = ring.pop_front().unwrap();
        assert_eq!(&*bytes1, &[2; 2]);
        let (_, bytes2) = ring.pop_front().unwrap();
        assert_eq!(&*bytes2, &[3; 4]);
    }

    #[test]
    fn discard_until_finds_and_pops_target() {
        let mut ring = Ring::new(32);
        for i in 0..4u64 {
            assert!(ring.try_push(i, &[i as u8; 2], shape()));
        }
        let (entry, bytes) = ring.discard_until(2).unwrap();
        assert_eq!(entry.index, 2);
        assert_eq!(&*bytes, &[2u8, 2]);
        assert_eq!(ring.front_index(), Some(3));
    }

    #[test]
    fn discard_until_missing_index_returns_none() {
        let mut ring = Ring::new(32);
        ring.try_push(5, &[1; 2], shape());
        assert!(ring.discard_until(9).is_none());
    }
}
