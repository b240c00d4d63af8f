//! Chunk layout, size classes and address-to-owner arithmetic.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────┬───────────────────────────┬───────┬─────────┐
//! │ ChunkHeader (16 bytes)       │ payload (required bytes)  │ guard │ unused  │
//! │ magic │ required │ seg │ cls │                           │ (u32) │         │
//! └──────────────────────────────┴───────────────────────────┴───────┴─────────┘
//! ^ chunk start (multiple of 128 from the segment base)     chunk start + 2^class ^
//! ```
//!
//! While a chunk sits on a free list the first 16 payload bytes hold its
//! [`FreeLinks`]. Free-list links are byte offsets from the segment base,
//! so they mean the same thing in every process.

use crate::config::{CHUNK_MAGIC, CHUNK_MIN_CLASS, CHUNK_MIN_SIZE};
use std::mem::size_of;

/// Bytes in front of every payload.
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Bytes of the tail guard word.
pub const CHUNK_GUARD_SIZE: usize = size_of::<u32>();

/// Free-list terminator.
pub(crate) const NIL: u64 = u64::MAX;

/// Lifecycle state recorded in a chunk header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkState {
    /// Header absorbed by a merge; must never be reached by a walk.
    Cleared = 0,
    /// On a free list.
    Free = 1,
    /// Handed out to a caller.
    Active = 2,
}

/// Header stamped at the start of every chunk.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChunkHeader {
    /// Head guard, always [`CHUNK_MAGIC`].
    pub magic_head: u32,
    /// Length the caller asked for. Zero while free.
    pub required: u32,
    /// Owning segment slot.
    pub segment_id: u32,
    /// log2 of the chunk size.
    pub class: u8,
    /// Raw [`ChunkState`].
    pub state: u8,
    _reserved: u16,
}

const _: () = assert!(size_of::<ChunkHeader>() == CHUNK_HEADER_SIZE);
const _: () = assert!(CHUNK_HEADER_SIZE + size_of::<FreeLinks>() <= CHUNK_MIN_SIZE);

impl ChunkHeader {
    /// Fresh header of a free chunk.
    pub fn free(segment_id: u32, class: u32) -> Self {
        Self {
            magic_head: CHUNK_MAGIC,
            required: 0,
            segment_id,
            class: class as u8,
            state: ChunkState::Free as u8,
            _reserved: 0,
        }
    }

    /// Zeroed header left behind when a chunk is absorbed by its buddy.
    pub fn cleared() -> Self {
        Self {
            magic_head: 0,
            required: 0,
            segment_id: 0,
            class: 0,
            state: ChunkState::Cleared as u8,
            _reserved: 0,
        }
    }

    #[inline]
    pub fn has_magic(&self) -> bool {
        self.magic_head == CHUNK_MAGIC
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.state == ChunkState::Free as u8
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state == ChunkState::Active as u8
    }

    /// Exactly the header written by [`ChunkHeader::cleared`].
    #[inline]
    pub fn is_cleared(&self) -> bool {
        self.magic_head == 0
            && self.required == 0
            && self.class == 0
            && self.state == ChunkState::Cleared as u8
    }
}

/// Doubly-linked free-list node, stored right after the header of a free chunk.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct FreeLinks {
    pub prev: u64,
    pub next: u64,
}

/// Chunk size of a class.
#[inline]
pub const fn class_size(class: u32) -> usize {
    1usize << class
}

/// Largest payload a chunk of `class` can carry.
#[inline]
pub const fn payload_capacity(class: u32) -> usize {
    class_size(class) - CHUNK_HEADER_SIZE - CHUNK_GUARD_SIZE
}

/// Smallest class whose payload capacity covers `required` bytes.
///
/// Returns `None` only when the computation overflows `usize`; callers
/// compare the result with the segment's class to detect oversize requests.
pub fn size_class_for(required: usize) -> Option<u32> {
    let total = required.checked_add(CHUNK_HEADER_SIZE + CHUNK_GUARD_SIZE)?;
    let class = total.checked_next_power_of_two()?.trailing_zeros();
    Some(class.max(CHUNK_MIN_CLASS))
}

/// Human-readable chunk size (`128b`, `4kB`, `256MB`, `4GB`).
pub fn class_label(class: u32) -> String {
    match class {
        0..=9 => format!("{}b", 1u64 << class),
        10..=19 => format!("{}kB", 1u64 << (class - 10)),
        20..=29 => format!("{}MB", 1u64 << (class - 20)),
        30..=39 => format!("{}GB", 1u64 << (class - 30)),
        _ => format!("{}TB", 1u64 << (class - 40)),
    }
}

/// Where a payload pointer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLocation {
    /// Owning segment slot.
    pub segment_id: u32,
    /// Offset of the chunk header from the segment base.
    pub offset: usize,
}

/// Geometry of the reserved virtual range: `num_segments` slots of
/// `2^segment_class` bytes starting at `base`.
///
/// Every process of the group reserves the range at the same address, so
/// the owner of any pointer follows from its numeric value alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressLayout {
    base: usize,
    segment_class: u32,
    num_segments: u32,
}

impl AddressLayout {
    /// Describe a reservation.
    pub const fn new(base: usize, segment_class: u32, num_segments: u32) -> Self {
        Self {
            base,
            segment_class,
            num_segments,
        }
    }

    /// First reserved address.
    #[inline]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Bytes per segment.
    #[inline]
    pub const fn segment_size(&self) -> usize {
        1usize << self.segment_class
    }

    /// log2 of the segment size.
    #[inline]
    pub const fn segment_class(&self) -> u32 {
        self.segment_class
    }

    /// Number of segment slots.
    #[inline]
    pub const fn num_segments(&self) -> u32 {
        self.num_segments
    }

    /// Total reserved bytes.
    #[inline]
    pub const fn len(&self) -> usize {
        self.segment_size() * self.num_segments as usize
    }

    /// Always false: a validated layout has at least one slot.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.num_segments == 0
    }

    /// Whether `addr` falls inside the reserved range.
    #[inline]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.len()
    }

    /// Fixed address of a segment slot.
    #[inline]
    pub const fn segment_base(&self, segment_id: u32) -> usize {
        self.base + ((segment_id as usize) << self.segment_class)
    }

    /// Slot containing `addr`, if it is in range.
    #[inline]
    pub const fn segment_of(&self, addr: usize) -> Option<u32> {
        if self.contains(addr) {
            Some(((addr - self.base) >> self.segment_class) as u32)
        } else {
            None
        }
    }

    /// Recover the chunk that owns a payload pointer.
    ///
    /// # Errors
    ///
    /// Returns a short reason when `addr` cannot be a payload address:
    /// outside the range, or not at header distance from a 128-byte
    /// chunk boundary.
    pub fn locate(&self, addr: usize) -> Result<ChunkLocation, &'static str> {
        let chunk = addr
            .checked_sub(CHUNK_HEADER_SIZE)
            .filter(|chunk| self.contains(*chunk))
            .ok_or("outside the shared buffer range")?;
        let rel = chunk - self.base;
        if rel % CHUNK_MIN_SIZE != 0 {
            return Err("not a chunk payload address");
        }
        Ok(ChunkLocation {
            segment_id: (rel >> self.segment_class) as u32,
            offset: rel & (self.segment_size() - 1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class_for() {
        assert_eq!(size_class_for(0), Some(7));
        assert_eq!(size_class_for(108), Some(7));
        assert_eq!(size_class_for(109), Some(8));
        // 16 + 1000 + 4 = 1020 fits the 1 KiB class
        assert_eq!(size_class_for(1000), Some(10));
        assert_eq!(size_class_for(1005), Some(11));
        assert_eq!(size_class_for(usize::MAX), None);
    }

    #[test]
    fn test_size_class_is_smallest_fit() {
        for required in [0usize, 1, 100, 500, 4000, 70_000, 1 << 20] {
            let class = size_class_for(required).unwrap();
            assert!(payload_capacity(class) >= required);
            if class > CHUNK_MIN_CLASS {
                assert!(payload_capacity(class - 1) < required, "class {class} not minimal");
            }
        }
    }

    #[test]
    fn test_class_labels() {
        assert_eq!(class_label(7), "128b");
        assert_eq!(class_label(10), "1kB");
        assert_eq!(class_label(28), "256MB");
        assert_eq!(class_label(32), "4GB");
    }

    #[test]
    fn test_layout_segment_arithmetic() {
        let layout = AddressLayout::new(0x1000_0000, 20, 4);
        assert_eq!(layout.segment_size(), 1 << 20);
        assert_eq!(layout.len(), 4 << 20);
        assert_eq!(layout.segment_base(2), 0x1020_0000);
        assert_eq!(layout.segment_of(0x1020_0010), Some(2));
        assert_eq!(layout.segment_of(0x0fff_ffff), None);
        assert_eq!(layout.segment_of(0x1040_0000), None);
    }

    #[test]
    fn test_locate_payload() {
        let layout = AddressLayout::new(0x1000_0000, 20, 4);
        let loc = layout.locate(0x1010_0400 + CHUNK_HEADER_SIZE).unwrap();
        assert_eq!(
            loc,
            ChunkLocation {
                segment_id: 1,
                offset: 0x400
            }
        );
    }

    #[test]
    fn test_locate_rejects_bad_pointers() {
        let layout = AddressLayout::new(0x1000_0000, 20, 4);
        assert!(layout.locate(0x1000_0000).is_err());
        assert!(layout.locate(0x1000_0001 + CHUNK_HEADER_SIZE).is_err());
        assert!(layout.locate(0x2000_0000).is_err());
        assert!(layout.locate(8).is_err());
    }

    #[test]
    fn test_header_states() {
        let header = ChunkHeader::free(3, 9);
        assert!(header.has_magic());
        assert!(header.is_free());
        assert!(!header.is_active());
        assert_eq!(header.class, 9);

        let cleared = ChunkHeader::cleared();
        assert!(!cleared.has_magic());
        assert!(!cleared.is_free());
    }
}
