//! Process-shared Segment Directory.
//!
//! The directory is one `MAP_SHARED | MAP_ANONYMOUS` region created by the
//! owning process before it forks, so every process of the group sees it
//! at the same address.
//!
//! # Memory Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ DirectoryHeader                             │
//! │   magic, segment_class, num_segments        │
//! │   poisoned: AtomicBool                      │
//! │   lists: SpinLock<DirectoryLists>           │
//! │     active { head, len }  free { head, len }│
//! │     counters                                │
//! ├─────────────────────────────────────────────┤
//! │ SegmentSlot[0]                              │
//! │   revision: AtomicU32   (odd = object live) │
//! │   prev, next            (list links)        │
//! │   SegmentState          (buddy free lists)  │
//! ├─────────────────────────────────────────────┤
//! │ SegmentSlot[1] ...                          │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Everything except the revision counters and the poison flag is only
//! touched while the directory lock is held. The revision counters are
//! read without the lock by the fault handler.

use crate::config::ShmBufferConfig;
use crate::error::{Error, Result};
use crate::local_map::AddressSpace;
use crate::lock::{SpinLock, SpinLockGuard};
use crate::segment::{Buddy, SegmentState};
use rustix::mm::{MapFlags, ProtFlags};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::debug;

/// Magic number identifying an initialized directory ("SHBD").
const DIRECTORY_MAGIC: u32 = 0x5348_4244;

/// List terminator for slot links.
pub(crate) const NO_SLOT: u32 = u32::MAX;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SlotList {
    head: u32,
    len: u32,
}

impl SlotList {
    const fn empty() -> Self {
        Self {
            head: NO_SLOT,
            len: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    segments_created: u64,
    segments_destroyed: u64,
    allocations: u64,
    frees: u64,
}

/// Lock-protected part of the directory header.
#[repr(C)]
pub(crate) struct DirectoryLists {
    active: SlotList,
    free: SlotList,
    counters: Counters,
}

#[derive(Clone, Copy)]
enum ListKind {
    Active,
    Free,
}

#[repr(C)]
struct DirectoryHeader {
    magic: u32,
    segment_class: u32,
    num_segments: u32,
    poisoned: AtomicBool,
    lists: SpinLock<DirectoryLists>,
}

#[repr(C)]
struct SlotInner {
    prev: u32,
    next: u32,
    buddy: SegmentState,
}

/// One segment slot in the directory.
#[repr(C)]
pub(crate) struct SegmentSlot {
    revision: AtomicU32,
    inner: UnsafeCell<SlotInner>,
}

/// Point-in-time counters of a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectoryStats {
    /// Configured number of slots.
    pub num_segments: u32,
    /// Segments with a live backing object.
    pub active_segments: u32,
    /// Slots available for new segments.
    pub free_segments: u32,
    /// Segments created since startup.
    pub segments_created: u64,
    /// Segments destroyed since startup.
    pub segments_destroyed: u64,
    /// Successful allocations since startup.
    pub allocations: u64,
    /// Successful frees since startup.
    pub frees: u64,
    /// Chunks currently handed out, over all segments.
    pub live_chunks: u64,
}

/// Compute (total size, slot array offset) of the region.
fn calculate_layout(num_segments: u32) -> (usize, usize) {
    let header = std::mem::size_of::<DirectoryHeader>();
    let align = std::mem::align_of::<SegmentSlot>();
    let slots_offset = header.next_multiple_of(align);
    let total = slots_offset + num_segments as usize * std::mem::size_of::<SegmentSlot>();
    (total.next_multiple_of(4096), slots_offset)
}

/// Handle on the shared directory region.
pub(crate) struct Directory {
    base: NonNull<u8>,
    total_size: usize,
    header: NonNull<DirectoryHeader>,
    slots: NonNull<SegmentSlot>,
    num_segments: u32,
}

// SAFETY: Directory is Send + Sync because:
// - the lists and slot internals are only touched under the spin lock
// - revisions and the poison flag are atomics
unsafe impl Send for Directory {}
unsafe impl Sync for Directory {}

impl Directory {
    /// Map and initialize a directory for `config`. Every slot starts on
    /// the free list with revision 0.
    pub fn create(config: &ShmBufferConfig) -> Result<Self> {
        let num_segments = config.num_segments;
        let (total_size, slots_offset) = calculate_layout(num_segments);

        let base = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                total_size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
            )?
        };
        let base = NonNull::new(base.cast::<u8>())
            .ok_or(Error::System(rustix::io::Errno::NOMEM))?;

        let header = base.cast::<DirectoryHeader>();
        // SAFETY: the region is fresh, large enough and suitably aligned.
        let slots: NonNull<SegmentSlot> = unsafe { NonNull::new_unchecked(base.as_ptr().add(slots_offset).cast()) };

        unsafe {
            header.as_ptr().write(DirectoryHeader {
                magic: DIRECTORY_MAGIC,
                segment_class: config.segment_class(),
                num_segments,
                poisoned: AtomicBool::new(false),
                lists: SpinLock::new(DirectoryLists {
                    active: SlotList::empty(),
                    free: SlotList {
                        head: 0,
                        len: num_segments,
                    },
                    counters: Counters::default(),
                }),
            });
            for id in 0..num_segments {
                slots.as_ptr().add(id as usize).write(SegmentSlot {
                    revision: AtomicU32::new(0),
                    inner: UnsafeCell::new(SlotInner {
                        prev: if id == 0 { NO_SLOT } else { id - 1 },
                        next: if id + 1 == num_segments { NO_SLOT } else { id + 1 },
                        buddy: SegmentState::empty(),
                    }),
                });
            }
        }

        Ok(Self {
            base,
            total_size,
            header,
            slots,
            num_segments,
        })
    }

    fn header(&self) -> &DirectoryHeader {
        // SAFETY: initialized in create and mapped until drop.
        unsafe { self.header.as_ref() }
    }

    fn slot(&self, segment_id: u32) -> &SegmentSlot {
        assert!(segment_id < self.num_segments);
        // SAFETY: bounds checked above.
        unsafe { &*self.slots.as_ptr().add(segment_id as usize) }
    }

    /// log2 of the segment size.
    #[inline]
    pub fn segment_class(&self) -> u32 {
        self.header().segment_class
    }

    /// Whether the header carries the expected magic.
    pub fn is_valid(&self) -> bool {
        self.header().magic == DIRECTORY_MAGIC
    }

    /// Current revision of a slot. Lock-free; used by the fault handler.
    #[inline]
    pub fn revision(&self, segment_id: u32) -> u32 {
        self.slot(segment_id).revision.load(Ordering::Acquire)
    }

    /// Whether a fatal error poisoned the directory.
    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.header().poisoned.load(Ordering::Acquire)
    }

    /// Mark the directory unusable for every process of the group.
    pub fn poison(&self) {
        self.header().poisoned.store(true, Ordering::Release);
    }

    /// Take the directory lock.
    ///
    /// Fails with [`Error::Poisoned`] instead of spinning forever when the
    /// lock is held and the directory is poisoned: the holder may have died
    /// mid-operation.
    pub fn lock(&self) -> Result<DirectoryGuard<'_>> {
        let lists = self
            .header()
            .lists
            .lock_unless(|| self.is_poisoned())
            .ok_or(Error::Poisoned)?;
        Ok(DirectoryGuard { dir: self, lists })
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.total_size);
        }
    }
}

/// Exclusive access to the directory lists and every slot's buddy state.
pub(crate) struct DirectoryGuard<'a> {
    dir: &'a Directory,
    lists: SpinLockGuard<'a, DirectoryLists>,
}

impl DirectoryGuard<'_> {
    fn inner(&self, segment_id: u32) -> &SlotInner {
        // SAFETY: slot internals are only accessed under the directory lock.
        unsafe { &*self.dir.slot(segment_id).inner.get() }
    }

    fn inner_mut(&mut self, segment_id: u32) -> &mut SlotInner {
        // SAFETY: the lock is held and `&mut self` rules out other borrows.
        unsafe { &mut *self.dir.slot(segment_id).inner.get() }
    }

    fn list_mut(&mut self, kind: ListKind) -> &mut SlotList {
        match kind {
            ListKind::Active => &mut self.lists.active,
            ListKind::Free => &mut self.lists.free,
        }
    }

    fn push_head(&mut self, kind: ListKind, segment_id: u32) {
        let head = self.list_mut(kind).head;
        let inner = self.inner_mut(segment_id);
        inner.prev = NO_SLOT;
        inner.next = head;
        if head != NO_SLOT {
            self.inner_mut(head).prev = segment_id;
        }
        let list = self.list_mut(kind);
        list.head = segment_id;
        list.len += 1;
    }

    fn unlink(&mut self, kind: ListKind, segment_id: u32) {
        let (prev, next) = {
            let inner = self.inner(segment_id);
            (inner.prev, inner.next)
        };
        if prev == NO_SLOT {
            self.list_mut(kind).head = next;
        } else {
            self.inner_mut(prev).next = next;
        }
        if next != NO_SLOT {
            self.inner_mut(next).prev = prev;
        }
        let inner = self.inner_mut(segment_id);
        inner.prev = NO_SLOT;
        inner.next = NO_SLOT;
        self.list_mut(kind).len -= 1;
    }

    fn pop_free(&mut self) -> Option<u32> {
        let head = self.lists.free.head;
        if head == NO_SLOT {
            return None;
        }
        self.unlink(ListKind::Free, head);
        Some(head)
    }

    /// Most recently created active segment.
    pub fn first_active(&self) -> Option<u32> {
        Some(self.lists.active.head).filter(|id| *id != NO_SLOT)
    }

    /// Active segment created before `segment_id`.
    pub fn next_active(&self, segment_id: u32) -> Option<u32> {
        Some(self.inner(segment_id).next).filter(|id| *id != NO_SLOT)
    }

    /// Active segment ids, most recently created first.
    pub fn active_ids(&self) -> Vec<u32> {
        let mut ids = Vec::with_capacity(self.lists.active.len as usize);
        let mut cursor = self.first_active();
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.next_active(id);
        }
        ids
    }

    /// Current revision of a slot.
    pub fn revision(&self, segment_id: u32) -> u32 {
        self.dir.revision(segment_id)
    }

    /// Buddy state of a slot, read-only.
    pub fn state(&self, segment_id: u32) -> &SegmentState {
        &self.inner(segment_id).buddy
    }

    /// Buddy operations on an active segment.
    pub fn buddy<'g>(&'g mut self, space: &AddressSpace, segment_id: u32) -> Buddy<'g> {
        debug_assert_eq!(self.revision(segment_id) % 2, 1);
        let base = space.segment_ptr(segment_id);
        // SAFETY: the segment is live, so its fixed range is either mapped
        // here or gets mapped by the fault handler on first touch; the
        // directory lock serializes every mutation of its chunks.
        unsafe { Buddy::new(&mut self.inner_mut(segment_id).buddy, base, segment_id) }
    }

    /// Count a successful allocation.
    pub fn record_alloc(&mut self) {
        self.lists.counters.allocations += 1;
    }

    /// Count a successful free.
    pub fn record_free(&mut self) {
        self.lists.counters.frees += 1;
    }

    /// Back a free slot with a fresh shared-memory object.
    ///
    /// Pops the head of the free list, creates and maps the object for the
    /// next (odd) revision, formats the slot as one free chunk, publishes
    /// the revision and pushes the slot at the head of the active list.
    ///
    /// Returns `Ok(None)` when no free slot remains.
    pub fn create_segment(&mut self, space: &AddressSpace) -> Result<Option<u32>> {
        let Some(segment_id) = self.pop_free() else {
            return Ok(None);
        };
        let revision = self.revision(segment_id).wrapping_add(1);
        debug_assert_eq!(revision % 2, 1);

        if let Err(e) = space.attach_new(segment_id, revision) {
            self.push_head(ListKind::Free, segment_id);
            return Err(e);
        }

        let class = space.layout().segment_class();
        let base = space.segment_ptr(segment_id);
        // SAFETY: the new object was just mapped read/write at `base`.
        unsafe { Buddy::format(&mut self.inner_mut(segment_id).buddy, base, segment_id, class) };

        self.dir
            .slot(segment_id)
            .revision
            .store(revision, Ordering::Release);
        self.push_head(ListKind::Active, segment_id);
        self.lists.counters.segments_created += 1;

        debug!(segment_id, revision, "created segment");
        Ok(Some(segment_id))
    }

    /// Tear down an empty segment and recycle its slot.
    ///
    /// The revision turns even before the backing object disappears, so a
    /// process touching the segment afterwards is diagnosed as holding a
    /// dangling reference. The slot goes to the head of the free list and
    /// is the first one reused.
    pub fn destroy_segment(&mut self, space: &AddressSpace, segment_id: u32) -> Result<()> {
        debug_assert_eq!(self.state(segment_id).num_active, 0);
        self.unlink(ListKind::Active, segment_id);

        let revision = self
            .dir
            .slot(segment_id)
            .revision
            .fetch_add(1, Ordering::AcqRel);
        self.inner_mut(segment_id).buddy = SegmentState::empty();

        let result = space.detach_destroyed(segment_id, revision);
        self.push_head(ListKind::Free, segment_id);
        self.lists.counters.segments_destroyed += 1;

        debug!(segment_id, revision = revision + 1, "destroyed segment");
        result
    }

    /// Snapshot of the directory counters.
    pub fn stats(&self) -> DirectoryStats {
        let live_chunks = self
            .active_ids()
            .into_iter()
            .map(|id| u64::from(self.state(id).num_active))
            .sum();
        let counters = self.lists.counters;
        DirectoryStats {
            num_segments: self.dir.num_segments,
            active_segments: self.lists.active.len,
            free_segments: self.lists.free.len,
            segments_created: counters.segments_created,
            segments_destroyed: counters.segments_destroyed,
            allocations: counters.allocations,
            frees: counters.frees,
            live_chunks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(num_segments: u32) -> ShmBufferConfig {
        ShmBufferConfig::default()
            .with_segment_size(1 << 20)
            .with_num_segments(num_segments)
    }

    #[test]
    fn test_fresh_directory() {
        let dir = Directory::create(&config(4)).unwrap();
        assert!(dir.is_valid());
        assert_eq!(dir.segment_class(), 20);
        assert!(!dir.is_poisoned());
        for id in 0..4 {
            assert_eq!(dir.revision(id), 0);
        }

        let guard = dir.lock().unwrap();
        assert_eq!(guard.first_active(), None);
        let stats = guard.stats();
        assert_eq!(stats.num_segments, 4);
        assert_eq!(stats.free_segments, 4);
        assert_eq!(stats.active_segments, 0);
    }

    #[test]
    fn test_free_list_pops_in_slot_order() {
        let dir = Directory::create(&config(3)).unwrap();
        let mut guard = dir.lock().unwrap();
        assert_eq!(guard.pop_free(), Some(0));
        assert_eq!(guard.pop_free(), Some(1));
        guard.push_head(ListKind::Free, 0);
        assert_eq!(guard.pop_free(), Some(0));
        assert_eq!(guard.pop_free(), Some(2));
        assert_eq!(guard.pop_free(), None);
        assert_eq!(guard.stats().free_segments, 0);
    }

    #[test]
    fn test_active_list_order_and_unlink() {
        let dir = Directory::create(&config(4)).unwrap();
        let mut guard = dir.lock().unwrap();
        for _ in 0..4 {
            let id = guard.pop_free().unwrap();
            guard.push_head(ListKind::Active, id);
        }
        assert_eq!(guard.active_ids(), vec![3, 2, 1, 0]);

        guard.unlink(ListKind::Active, 2);
        assert_eq!(guard.active_ids(), vec![3, 1, 0]);
        guard.unlink(ListKind::Active, 3);
        assert_eq!(guard.active_ids(), vec![1, 0]);
        guard.unlink(ListKind::Active, 0);
        assert_eq!(guard.active_ids(), vec![1]);
        assert_eq!(guard.stats().active_segments, 1);
    }

    #[test]
    fn test_poison_flag() {
        let dir = Directory::create(&config(1)).unwrap();
        dir.poison();
        assert!(dir.is_poisoned());
        // an uncontended lock is still granted so state stays inspectable
        assert!(dir.lock().is_ok());
    }

    #[test]
    fn test_lock_held_by_dead_holder_fails_when_poisoned() {
        let dir = Directory::create(&config(2)).unwrap();
        // SAFETY: the child only touches the shared directory and exits.
        let pid = unsafe { libc::fork() };
        if pid == 0 {
            // die holding the lock, the way an aborting process would
            if let Ok(guard) = dir.lock() {
                dir.poison();
                std::mem::forget(guard);
            }
            unsafe { libc::_exit(0) };
        }
        let mut status = 0;
        unsafe { libc::waitpid(pid, &mut status, 0) };
        assert!(dir.is_poisoned());
        assert!(matches!(dir.lock(), Err(Error::Poisoned)));
    }

    #[test]
    fn test_lock_shared_with_forked_child() {
        let dir = Directory::create(&config(2)).unwrap();
        // SAFETY: the child only touches the shared directory and exits.
        let pid = unsafe { libc::fork() };
        if pid == 0 {
            let code = match dir.lock() {
                Ok(mut guard) => {
                    guard.record_alloc();
                    guard.record_alloc();
                    0
                }
                Err(_) => 1,
            };
            unsafe { libc::_exit(code) };
        }
        let mut status = 0;
        unsafe { libc::waitpid(pid, &mut status, 0) };
        assert!(libc::WIFEXITED(status));
        assert_eq!(dir.lock().unwrap().stats().allocations, 2);
    }
}
