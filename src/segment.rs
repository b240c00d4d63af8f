//! Power-of-two buddy allocator over the memory of one segment.
//!
//! The per-segment bookkeeping ([`SegmentState`]) lives in the shared
//! segment directory; the chunks themselves live inside the segment.
//! [`Buddy`] ties the two together for the duration of one locked
//! directory operation.
//!
//! # Invariants
//!
//! - The chunks of a segment tile it exactly: walking from offset 0 by
//!   `2^class` steps visits every chunk once and ends at the segment size.
//! - Every chunk is either on the free list of its class or active.
//! - Two free buddies of the same class never coexist; `release` merges
//!   them as soon as the second one is freed.

use crate::chunk::{
    CHUNK_HEADER_SIZE, ChunkHeader, ChunkState, FreeLinks, NIL, class_size, payload_capacity,
};
use crate::config::{CHUNK_MAGIC, CHUNK_MIN_CLASS, NUM_CLASSES};
use crate::error::{Error, Result};
use std::ptr::NonNull;

/// Buddy bookkeeping of one segment slot, stored in shared memory.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegmentState {
    /// Chunks currently handed out.
    pub num_active: u32,
    /// Class of the whole segment.
    pub max_class: u32,
    /// Head offset of each class's free list, [`NIL`] when empty.
    pub free_chunks: [u64; NUM_CLASSES],
}

impl SegmentState {
    /// State of a slot with no backing segment.
    pub const fn empty() -> Self {
        Self {
            num_active: 0,
            max_class: 0,
            free_chunks: [NIL; NUM_CLASSES],
        }
    }

    /// Head offset of the free list of `class`.
    #[cfg(test)]
    fn free_list_head(&self, class: u32) -> u64 {
        self.free_chunks[class_index(class)]
    }
}

#[inline]
fn class_index(class: u32) -> usize {
    (class - CHUNK_MIN_CLASS) as usize
}

/// Buddy operations on one segment.
pub(crate) struct Buddy<'a> {
    state: &'a mut SegmentState,
    base: NonNull<u8>,
    segment_id: u32,
}

impl<'a> Buddy<'a> {
    /// Bind bookkeeping to segment memory.
    ///
    /// # Safety
    ///
    /// `base` must point to `2^state.max_class` bytes of readable and
    /// writable memory (or memory the fault handler will make so) that
    /// nothing else mutates while the `Buddy` is alive.
    pub unsafe fn new(state: &'a mut SegmentState, base: NonNull<u8>, segment_id: u32) -> Self {
        Self {
            state,
            base,
            segment_id,
        }
    }

    /// Reset the segment to one free chunk spanning all of it.
    ///
    /// # Safety
    ///
    /// Same contract as [`Buddy::new`], for a segment of `2^max_class` bytes.
    pub unsafe fn format(
        state: &'a mut SegmentState,
        base: NonNull<u8>,
        segment_id: u32,
        max_class: u32,
    ) -> Self {
        *state = SegmentState::empty();
        state.max_class = max_class;
        // SAFETY: forwarded from the caller.
        let mut buddy = unsafe { Self::new(state, base, segment_id) };
        buddy.write_header(0, ChunkHeader::free(segment_id, max_class));
        buddy.push_free(0, max_class);
        buddy
    }

    /// Chunks handed out and not yet released.
    #[inline]
    pub fn num_active(&self) -> u32 {
        self.state.num_active
    }

    /// Class of the whole segment.
    #[inline]
    pub fn max_class(&self) -> u32 {
        self.state.max_class
    }

    /// Header stored at `offset`, whatever it contains.
    pub(crate) fn header_at(&self, offset: u64) -> ChunkHeader {
        self.read_header(offset)
    }

    /// Whether the tail guard behind `required` payload bytes is intact.
    pub(crate) fn tail_guard_intact(&self, offset: u64, required: usize) -> bool {
        self.read_tail_guard(offset, required) == CHUNK_MAGIC
    }

    /// Hand out a chunk of `class` for `required` payload bytes.
    ///
    /// Returns `Ok(None)` when the segment has no room, even after
    /// splitting larger free chunks.
    ///
    /// # Errors
    ///
    /// [`Error::Corruption`] if a free-list chunk lost its head guard.
    pub fn carve(&mut self, required: usize, class: u32) -> Result<Option<NonNull<u8>>> {
        debug_assert!(payload_capacity(class) >= required);
        if class > self.state.max_class || !self.split(class)? {
            return Ok(None);
        }

        let offset = self.pop_free(class);
        let mut header = self.read_header(offset);
        if !header.has_magic() || u32::from(header.class) != class || !header.is_free() {
            return Err(self.corruption(offset as usize, "free-list chunk lost its header"));
        }
        header.required = required as u32;
        header.state = ChunkState::Active as u8;
        header.segment_id = self.segment_id;
        self.write_header(offset, header);
        self.write_tail_guard(offset, required);
        self.state.num_active += 1;

        // SAFETY: offset + header lies inside the segment.
        let payload = unsafe { self.base.add(offset as usize + CHUNK_HEADER_SIZE) };
        Ok(Some(payload))
    }

    /// Give back the chunk at `offset`, merging buddies upward.
    ///
    /// Returns `true` when the segment has no active chunk left.
    ///
    /// # Errors
    ///
    /// - [`Error::Corruption`] if a guard word or a buddy header is damaged.
    /// - [`Error::InvalidPointer`] if the chunk is already free.
    pub fn release(&mut self, offset: usize) -> Result<bool> {
        let mut offset = offset as u64;
        let header = self.check_active(offset)?;
        let mut class = u32::from(header.class);

        while class < self.state.max_class {
            let buddy = offset ^ class_size(class) as u64;
            let buddy_header = self.read_header(buddy);
            if !buddy_header.has_magic() {
                return Err(self.corruption(buddy as usize, "buddy head guard mismatch"));
            }
            if u32::from(buddy_header.class) != class || !buddy_header.is_free() {
                break;
            }
            self.unlink_free(buddy, class);
            let upper = offset.max(buddy);
            self.write_header(upper, ChunkHeader::cleared());
            offset = offset.min(buddy);
            class += 1;
        }

        self.write_header(offset, ChunkHeader::free(self.segment_id, class));
        self.push_free(offset, class);
        self.state.num_active -= 1;
        Ok(self.state.num_active == 0)
    }

    /// Header of a live chunk, after checking both guard words.
    pub(crate) fn check_active(&self, offset: u64) -> Result<ChunkHeader> {
        let header = self.read_header(offset);
        if header.is_cleared() {
            return Err(Error::InvalidPointer {
                addr: self.payload_addr(offset),
                reason: "chunk was merged into a free buddy (double free)",
            });
        }
        if !header.has_magic() {
            if !self.is_chunk_start(offset) {
                return Err(Error::InvalidPointer {
                    addr: self.payload_addr(offset),
                    reason: "not the start of a chunk",
                });
            }
            return Err(self.corruption(offset as usize, "head guard mismatch"));
        }
        let class = u32::from(header.class);
        if !(CHUNK_MIN_CLASS..=self.state.max_class).contains(&class)
            || offset as usize % class_size(class) != 0
        {
            return Err(self.corruption(offset as usize, "chunk class out of range"));
        }
        if header.is_free() {
            return Err(Error::InvalidPointer {
                addr: self.payload_addr(offset),
                reason: "chunk is already free (double free)",
            });
        }
        if !header.is_active() {
            return Err(self.corruption(offset as usize, "unknown chunk state"));
        }
        if header.required as usize > payload_capacity(class) {
            return Err(self.corruption(offset as usize, "required length exceeds chunk"));
        }
        if self.read_tail_guard(offset, header.required as usize) != CHUNK_MAGIC {
            return Err(self.corruption(offset as usize, "tail guard mismatch"));
        }
        Ok(header)
    }

    /// Change the required length of a live chunk in place.
    pub(crate) fn resize_in_place(&mut self, offset: u64, required: usize) {
        let mut header = self.read_header(offset);
        debug_assert!(required <= payload_capacity(u32::from(header.class)));
        header.required = required as u32;
        self.write_header(offset, header);
        self.write_tail_guard(offset, required);
    }

    /// Whether a chunk begins at `offset`, found by walking the headers
    /// from the segment start. Only used on error paths.
    fn is_chunk_start(&self, offset: u64) -> bool {
        let mut cursor = 0u64;
        while cursor < offset {
            let header = self.read_header(cursor);
            let class = u32::from(header.class);
            if !header.has_magic() || !(CHUNK_MIN_CLASS..=self.state.max_class).contains(&class) {
                return false;
            }
            cursor += class_size(class) as u64;
        }
        cursor == offset
    }

    /// Make sure the free list of `class` is not empty, halving larger
    /// free chunks as needed. Returns `false` if nothing large enough is free.
    fn split(&mut self, class: u32) -> Result<bool> {
        let Some(mut from) = (class..=self.state.max_class)
            .find(|c| self.state.free_chunks[class_index(*c)] != NIL)
        else {
            return Ok(false);
        };

        while from > class {
            let offset = self.pop_free(from);
            let header = self.read_header(offset);
            if !header.has_magic() || u32::from(header.class) != from {
                return Err(self.corruption(offset as usize, "free-list chunk lost its header"));
            }
            let half = from - 1;
            let upper = offset + class_size(half) as u64;
            self.write_header(upper, ChunkHeader::free(self.segment_id, half));
            self.write_header(offset, ChunkHeader::free(self.segment_id, half));
            // lower half ends up at the head so addresses are handed out bottom-up
            self.push_free(upper, half);
            self.push_free(offset, half);
            from = half;
        }
        Ok(true)
    }

    fn push_free(&mut self, offset: u64, class: u32) {
        let idx = class_index(class);
        let head = self.state.free_chunks[idx];
        self.write_links(
            offset,
            FreeLinks {
                prev: NIL,
                next: head,
            },
        );
        if head != NIL {
            let mut links = self.read_links(head);
            links.prev = offset;
            self.write_links(head, links);
        }
        self.state.free_chunks[idx] = offset;
    }

    fn pop_free(&mut self, class: u32) -> u64 {
        let offset = self.state.free_chunks[class_index(class)];
        debug_assert_ne!(offset, NIL);
        self.unlink_free(offset, class);
        offset
    }

    fn unlink_free(&mut self, offset: u64, class: u32) {
        let links = self.read_links(offset);
        if links.prev == NIL {
            self.state.free_chunks[class_index(class)] = links.next;
        } else {
            let mut prev = self.read_links(links.prev);
            prev.next = links.next;
            self.write_links(links.prev, prev);
        }
        if links.next != NIL {
            let mut next = self.read_links(links.next);
            next.prev = links.prev;
            self.write_links(links.next, next);
        }
    }

    fn corruption(&self, offset: usize, detail: &'static str) -> Error {
        Error::Corruption {
            segment_id: self.segment_id,
            offset,
            detail,
        }
    }

    #[inline]
    fn payload_addr(&self, offset: u64) -> usize {
        self.base.as_ptr() as usize + offset as usize + CHUNK_HEADER_SIZE
    }

    #[inline]
    fn at(&self, offset: u64) -> *mut u8 {
        // SAFETY: every offset used by the buddy lies inside the segment.
        unsafe { self.base.as_ptr().add(offset as usize) }
    }

    fn read_header(&self, offset: u64) -> ChunkHeader {
        // SAFETY: chunk starts are 128-byte aligned inside the segment.
        unsafe { self.at(offset).cast::<ChunkHeader>().read_volatile() }
    }

    fn write_header(&mut self, offset: u64, header: ChunkHeader) {
        // SAFETY: chunk starts are 128-byte aligned inside the segment.
        unsafe { self.at(offset).cast::<ChunkHeader>().write_volatile(header) }
    }

    fn read_links(&self, offset: u64) -> FreeLinks {
        // SAFETY: free chunks are at least 128 bytes, links follow the header.
        unsafe {
            self.at(offset + CHUNK_HEADER_SIZE as u64)
                .cast::<FreeLinks>()
                .read_volatile()
        }
    }

    fn write_links(&mut self, offset: u64, links: FreeLinks) {
        // SAFETY: free chunks are at least 128 bytes, links follow the header.
        unsafe {
            self.at(offset + CHUNK_HEADER_SIZE as u64)
                .cast::<FreeLinks>()
                .write_volatile(links)
        }
    }

    fn read_tail_guard(&self, offset: u64, required: usize) -> u32 {
        // SAFETY: required <= payload capacity, so the guard is inside the chunk.
        unsafe {
            self.at(offset + (CHUNK_HEADER_SIZE + required) as u64)
                .cast::<u32>()
                .read_unaligned()
        }
    }

    fn write_tail_guard(&mut self, offset: u64, required: usize) {
        // SAFETY: required <= payload capacity, so the guard is inside the chunk.
        unsafe {
            self.at(offset + (CHUNK_HEADER_SIZE + required) as u64)
                .cast::<u32>()
                .write_unaligned(CHUNK_MAGIC)
        }
    }
}
