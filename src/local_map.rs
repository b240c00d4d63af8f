//! Per-process Local Mapping Table and the reserved address range.
//!
//! Each process keeps, for every segment slot, which revision of the
//! segment it currently has mapped at the slot's fixed address. The table
//! is the only allocator state the fault handler writes, so each entry has
//! its own [`EntryLock`] instead of relying on the directory lock.
//!
//! ```text
//!  reserved range (PROT_NONE placeholder unless attached)
//!  ┌────────────┬────────────┬────────────┬────────────┐
//!  │ slot 0     │ slot 1     │ slot 2     │ slot 3     │
//!  │ rev 3  ✔   │ unmapped   │ rev 1 (stale, now 5)    │
//!  └────────────┴────────────┴────────────┴────────────┘
//! ```
//!
//! Per (process, segment) a mapping is *unmapped*, *mapped at r*, or
//! *stale* (mapped at r while the directory already moved on). Stale
//! mappings are never repaired eagerly; the next access faults and
//! [`AddressSpace::attach_on_demand`] replaces them.

use crate::backing::{self, BackingObject};
use crate::chunk::AddressLayout;
use crate::config::ShmBufferConfig;
use crate::directory::Directory;
use crate::error::Result;
use crate::fault::FaultError;
use crate::lock::{Acquire, EntryLock, EntryLockGuard};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// What one process knows about one segment slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalMapping {
    /// Revision of the object mapped (or last mapped) at the slot.
    pub revision: u32,
    /// Whether the slot's range is currently backed by that object here.
    pub attached: bool,
    /// Mappings established by the fault path for this slot, counting both
    /// first touches and stale-generation refreshes.
    pub remaps: u32,
}

struct LocalEntry {
    lock: EntryLock<LocalMapping>,
    /// Bumped on every change of the entry. A fault handler that waited
    /// for the lock compares it to tell a stale fault from a lost race.
    epoch: AtomicU64,
}

/// Reserved virtual range plus the Local Mapping Table of this process.
///
/// Created by the owning process before forking; children inherit both the
/// reservation and a private copy of the table.
pub struct AddressSpace {
    layout: AddressLayout,
    namespace: u32,
    entries: Box<[LocalEntry]>,
}

impl AddressSpace {
    /// Reserve `segment_size * num_segments` bytes of no-access address space.
    pub fn reserve(config: &ShmBufferConfig) -> Result<Self> {
        let len = config.segment_size * config.num_segments as usize;
        let base = backing::reserve(len)?;
        let layout = AddressLayout::new(base, config.segment_class(), config.num_segments);
        let entries = (0..config.num_segments)
            .map(|_| LocalEntry {
                lock: EntryLock::new(LocalMapping::default()),
                epoch: AtomicU64::new(0),
            })
            .collect();

        debug!(
            base = format_args!("{base:#x}"),
            len,
            num_segments = config.num_segments,
            "reserved shared buffer address range"
        );
        Ok(Self {
            layout,
            namespace: config.namespace,
            entries,
        })
    }

    /// Geometry of the reserved range.
    #[inline]
    pub fn layout(&self) -> &AddressLayout {
        &self.layout
    }

    /// Namespace embedded in backing object names.
    #[inline]
    pub fn namespace(&self) -> u32 {
        self.namespace
    }

    /// Fixed base address of a segment slot.
    pub fn segment_ptr(&self, segment_id: u32) -> NonNull<u8> {
        let addr = self.layout.segment_base(segment_id);
        // SAFETY: the reservation never starts at address zero.
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    /// Current local record for a slot.
    pub fn mapping(&self, segment_id: u32) -> LocalMapping {
        *self.lock_entry(segment_id)
    }

    /// Lock an entry from ordinary (non-handler) code.
    fn lock_entry(&self, segment_id: u32) -> EntryLockGuard<'_, LocalMapping> {
        match self.entries[segment_id as usize].lock.acquire() {
            Acquire::Locked(guard) => guard,
            // Only a fault handler interrupting its own thread can observe
            // this, and the handler never calls back into this path.
            Acquire::HeldBySelf => unreachable!("mapping entry {segment_id} locked twice"),
        }
    }

    fn bump_epoch(&self, segment_id: u32) {
        self.entries[segment_id as usize]
            .epoch
            .fetch_add(1, Ordering::Release);
    }

    /// Create the object for a new segment generation and map it here.
    ///
    /// A mapping of an older generation still present at the slot (a
    /// ghost left behind when another process destroyed the segment) is
    /// replaced by the no-access placeholder first.
    pub(crate) fn attach_new(&self, segment_id: u32, revision: u32) -> Result<()> {
        let addr = self.layout.segment_base(segment_id);
        let size = self.layout.segment_size();
        let mut entry = self.lock_entry(segment_id);

        if entry.attached {
            let ghost = BackingObject::new(self.namespace, segment_id, entry.revision);
            // SAFETY: the slot range belongs to this reservation and the
            // old generation has no live allocations.
            unsafe { ghost.unmap(addr, size)? };
            entry.attached = false;
            self.bump_epoch(segment_id);
            debug!(segment_id, revision = entry.revision, "dropped ghost mapping");
        }

        let object = BackingObject::new(self.namespace, segment_id, revision);
        let fd = object.create(size)?;
        // SAFETY: the slot range belongs to this reservation and holds only
        // the placeholder.
        if let Err(e) = unsafe { object.map(&fd, addr, size) } {
            let _ = object.remove();
            return Err(e);
        }

        entry.revision = revision;
        entry.attached = true;
        self.bump_epoch(segment_id);
        debug!(segment_id, revision, name = %object.name(), "mapped new segment");
        Ok(())
    }

    /// Unmap a destroyed segment here and remove its backing object.
    ///
    /// `revision` is the generation being destroyed (odd).
    pub(crate) fn detach_destroyed(&self, segment_id: u32, revision: u32) -> Result<()> {
        let addr = self.layout.segment_base(segment_id);
        let size = self.layout.segment_size();
        let object = BackingObject::new(self.namespace, segment_id, revision);
        {
            let mut entry = self.lock_entry(segment_id);
            // SAFETY: the segment has no live chunks left.
            unsafe { object.unmap(addr, size)? };
            entry.revision = revision;
            entry.attached = false;
            self.bump_epoch(segment_id);
        }
        object.remove()
    }

    /// Establish or refresh the mapping that covers `addr`.
    ///
    /// This is the body of the fault handler: it never allocates, never
    /// takes the directory lock, and limits itself to one entry lock, an
    /// atomic revision read, `shm_open`, `mmap` and `close`.
    pub(crate) fn attach_on_demand(
        &self,
        addr: usize,
        directory: &Directory,
    ) -> std::result::Result<(), FaultError> {
        let Some(segment_id) = self.layout.segment_of(addr) else {
            return Err(FaultError::OutOfRange { addr });
        };
        self.attach_at_epoch(segment_id, self.epoch(segment_id), directory)
    }

    /// Mapping changes seen for a slot so far.
    pub(crate) fn epoch(&self, segment_id: u32) -> u64 {
        self.entries[segment_id as usize].epoch.load(Ordering::Acquire)
    }

    /// Second half of [`attach_on_demand`](Self::attach_on_demand): `epoch`
    /// is the slot's epoch read before waiting for the entry lock.
    pub(crate) fn attach_at_epoch(
        &self,
        segment_id: u32,
        epoch: u64,
        directory: &Directory,
    ) -> std::result::Result<(), FaultError> {
        let slot = &self.entries[segment_id as usize];
        let mut entry = match slot.lock.acquire() {
            Acquire::Locked(guard) => guard,
            Acquire::HeldBySelf => return Err(FaultError::Reentrant { segment_id }),
        };
        if slot.epoch.load(Ordering::Acquire) != epoch {
            // Another thread changed the mapping while we waited: retry the access.
            return Ok(());
        }

        let revision = directory.revision(segment_id);
        if revision % 2 == 0 {
            return Err(FaultError::SegmentMissing {
                segment_id,
                revision,
            });
        }
        if entry.attached && entry.revision == revision {
            return Err(FaultError::AlreadyMapped {
                segment_id,
                revision,
            });
        }

        let object = BackingObject::new(self.namespace, segment_id, revision);
        let fd = object.open().map_err(|errno| FaultError::Open {
            segment_id,
            revision,
            errno,
        })?;
        // SAFETY: the range is this slot of our own reservation; MAP_FIXED
        // atomically replaces the placeholder or the stale generation.
        unsafe {
            backing::map_fixed(
                &fd,
                self.layout.segment_base(segment_id),
                self.layout.segment_size(),
            )
        }
        .map_err(|errno| FaultError::Map {
            segment_id,
            revision,
            errno,
        })?;

        entry.revision = revision;
        entry.attached = true;
        entry.remaps = entry.remaps.wrapping_add(1);
        slot.epoch.fetch_add(1, Ordering::Release);
        Ok(())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // SAFETY: the reservation is ours and the owning context is gone.
        unsafe { backing::release(self.layout.base(), self.layout.len()) };
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
    fn test_reserve_layout() {
        let space = AddressSpace::reserve(&config(4)).unwrap();
        let layout = space.layout();
        assert_eq!(layout.num_segments(), 4);
        assert_eq!(layout.len(), 4 << 20);
        assert_eq!(
            space.segment_ptr(1).as_ptr() as usize,
            layout.base() + (1 << 20)
        );
        assert_eq!(space.mapping(0), LocalMapping::default());
    }

    #[test]
    fn test_attach_new_then_detach() {
        let config = config(2);
        let space = AddressSpace::reserve(&config).unwrap();
        space.attach_new(1, 1).unwrap();
        assert_eq!(
            space.mapping(1),
            LocalMapping {
                revision: 1,
                attached: true,
                remaps: 0,
            }
        );

        let ptr = space.segment_ptr(1).as_ptr().cast::<u32>();
        unsafe {
            ptr.write(77);
            assert_eq!(ptr.read(), 77);
        }

        space.detach_destroyed(1, 1).unwrap();
        assert!(!space.mapping(1).attached);
        assert!(BackingObject::new(config.namespace, 1, 1).open().is_err());
    }

    #[test]
    fn test_attach_new_replaces_ghost() {
        let config = config(1);
        let space = AddressSpace::reserve(&config).unwrap();
        space.attach_new(0, 1).unwrap();
        // another process destroyed generation 1 and we never noticed
        BackingObject::new(config.namespace, 0, 1).remove().unwrap();
        space.attach_new(0, 3).unwrap();
        assert_eq!(space.mapping(0).revision, 3);
        space.detach_destroyed(0, 3).unwrap();
    }

    #[test]
    fn test_attach_on_demand_states() {
        let config = config(2);
        let directory = Directory::create(&config).unwrap();
        let space = AddressSpace::reserve(&config).unwrap();
        let addr = space.layout().segment_base(0) + 64;

        // slot 0 has never been created
        assert!(matches!(
            space.attach_on_demand(addr, &directory),
            Err(FaultError::SegmentMissing { segment_id: 0, .. })
        ));
        assert!(matches!(
            space.attach_on_demand(space.layout().base() + space.layout().len(), &directory),
            Err(FaultError::OutOfRange { .. })
        ));

        let id = directory.lock().unwrap().create_segment(&space).unwrap().unwrap();
        assert_eq!(id, 0);
        assert!(matches!(
            space.attach_on_demand(addr, &directory),
            Err(FaultError::AlreadyMapped { revision: 1, .. })
        ));
        directory.lock().unwrap().destroy_segment(&space, 0).unwrap();
    }

    #[test]
    fn test_fault_under_own_entry_lock_is_reentrant() {
        let config = config(1);
        let directory = Directory::create(&config).unwrap();
        let space = AddressSpace::reserve(&config).unwrap();
        let addr = space.layout().segment_base(0);

        let _held = space.lock_entry(0);
        assert!(matches!(
            space.attach_on_demand(addr, &directory),
            Err(FaultError::Reentrant { segment_id: 0 })
        ));
    }

    #[test]
    fn test_fault_after_concurrent_remap_only_retries() {
        let config = config(1);
        let directory = Directory::create(&config).unwrap();
        let space = AddressSpace::reserve(&config).unwrap();

        // a faulting thread read the epoch, then another thread mapped the
        // slot before the faulting thread got the entry lock
        let seen = space.epoch(0);
        directory.lock().unwrap().create_segment(&space).unwrap().unwrap();
        assert_ne!(space.epoch(0), seen);

        assert!(space.attach_at_epoch(0, seen, &directory).is_ok());
        assert_eq!(space.mapping(0).remaps, 0);
        assert!(matches!(
            space.attach_at_epoch(0, space.epoch(0), &directory),
            Err(FaultError::AlreadyMapped { revision: 1, .. })
        ));
        directory.lock().unwrap().destroy_segment(&space, 0).unwrap();
    }

    #[test]
    fn test_stale_generation_is_remapped_once() {
        let config = config(1);
        let directory = Directory::create(&config).unwrap();
        let owner = AddressSpace::reserve(&config).unwrap();
        let worker = AddressSpace::reserve(&config).unwrap();
        let addr = worker.layout().segment_base(0);

        directory.lock().unwrap().create_segment(&owner).unwrap().unwrap();
        worker.attach_on_demand(addr, &directory).unwrap();
        assert_eq!(worker.mapping(0).revision, 1);
        assert_eq!(worker.mapping(0).remaps, 1);

        {
            let mut guard = directory.lock().unwrap();
            guard.destroy_segment(&owner, 0).unwrap();
            guard.create_segment(&owner).unwrap().unwrap();
        }
        assert_eq!(directory.revision(0), 3);

        worker.attach_on_demand(addr, &directory).unwrap();
        assert!(matches!(
            worker.attach_on_demand(addr, &directory),
            Err(FaultError::AlreadyMapped { revision: 3, .. })
        ));
        let mapping = worker.mapping(0);
        assert_eq!(mapping.revision, 3);
        assert_eq!(mapping.remaps, 2);

        directory.lock().unwrap().destroy_segment(&owner, 0).unwrap();
    }
}
