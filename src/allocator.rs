//! The shared buffer context and its allocation API.
//!
//! [`ShmBuffer`] owns everything the allocator needs: the shared Segment
//! Directory, the reserved address range with its Local Mapping Table, and
//! the fault handler registration. There is no global allocator state
//! besides the fault handler registry.
//!
//! # Process model
//!
//! ```text
//!  owner process                         forked worker
//!  ┌──────────────────────────┐          ┌──────────────────────────┐
//!  │ ShmBuffer::new()         │  fork()  │ inherited ShmBuffer      │
//!  │  directory (MAP_SHARED) ─┼──────────┼─ same directory          │
//!  │  reservation @ base      │          │  reservation @ base      │
//!  │  local table (private)   │          │  local table (copy)      │
//!  └──────────────────────────┘          └──────────────────────────┘
//! ```
//!
//! Pointers returned by [`ShmBuffer::alloc`] are valid in every process of
//! the group: segments not yet mapped locally are mapped by the fault
//! handler on first touch.
//!
//! # Example
//!
//! ```rust,ignore
//! use shmbuf::{ShmBuffer, ShmBufferConfig};
//!
//! let shmbuf = ShmBuffer::new(ShmBufferConfig::default().with_num_segments(16))?;
//! let ptr = shmbuf.alloc(1000)?;
//! // ... hand `ptr` to a forked worker ...
//! unsafe { shmbuf.free(ptr)? };
//! ```

use crate::backing;
use crate::chunk::{AddressLayout, ChunkLocation, payload_capacity, size_class_for};
use crate::config::{FatalPolicy, ShmBufferConfig};
use crate::diagnostics::{SegmentReport, walk_segment};
use crate::directory::{Directory, DirectoryGuard, DirectoryStats};
use crate::error::{BackingOp, Error, OomCause, Result};
use crate::fault::{self, FaultError, FaultRegistration, FaultResolver};
use crate::local_map::{AddressSpace, LocalMapping};
use std::ptr::NonNull;
use tracing::{debug, error, info, trace, warn};

/// State shared with the fault handler. Boxed so its address stays fixed.
struct Inner {
    config: ShmBufferConfig,
    directory: Directory,
    space: AddressSpace,
}

impl FaultResolver for Inner {
    fn resolve(&self, addr: usize) -> std::result::Result<(), FaultError> {
        self.space.attach_on_demand(addr, &self.directory)
    }
}

/// A dynamic shared-memory heap for a group of forked processes.
pub struct ShmBuffer {
    inner: Box<Inner>,
    registration: Option<FaultRegistration>,
    owner_pid: u32,
}

impl ShmBuffer {
    /// Set up the allocator for a process group.
    ///
    /// Validates `config`, installs the fault handler, removes backing
    /// objects an earlier owner of the namespace left behind, maps the
    /// Segment Directory, reserves the address range and, with
    /// [`preallocate`](ShmBufferConfig::preallocate), creates the first
    /// segment. Call this in the owner before forking workers.
    pub fn new(config: ShmBufferConfig) -> Result<Self> {
        config.validate()?;
        fault::install()?;

        let stale = backing::remove_namespace(config.namespace)?;
        if stale > 0 {
            warn!(namespace = config.namespace, stale, "removed leftover backing objects");
        }

        let directory = Directory::create(&config)?;
        debug_assert!(directory.is_valid());
        debug_assert_eq!(directory.segment_class(), config.segment_class());
        let space = AddressSpace::reserve(&config)?;
        let inner = Box::new(Inner {
            config,
            directory,
            space,
        });

        let layout = *inner.space.layout();
        let resolver: &(dyn FaultResolver + 'static) = &*inner;
        // SAFETY: `inner` is boxed and outlives the registration, which is
        // dropped first in `Drop for ShmBuffer`.
        let registration =
            unsafe { FaultRegistration::new(layout.base(), layout.base() + layout.len(), resolver) }?;

        let shmbuf = Self {
            inner,
            registration: Some(registration),
            owner_pid: std::process::id(),
        };

        if shmbuf.inner.config.preallocate {
            let mut dir = shmbuf.inner.directory.lock()?;
            dir.create_segment(&shmbuf.inner.space)
                .map_err(|e| shmbuf.escalate(e))?;
        }

        info!(
            namespace = shmbuf.inner.config.namespace,
            segment_size = shmbuf.inner.config.segment_size,
            num_segments = shmbuf.inner.config.num_segments,
            base = format_args!("{:#x}", layout.base()),
            "shared buffer ready"
        );
        Ok(shmbuf)
    }

    /// Configuration the context was built with.
    pub fn config(&self) -> &ShmBufferConfig {
        &self.inner.config
    }

    /// Geometry of the reserved address range.
    pub fn layout(&self) -> &AddressLayout {
        self.inner.space.layout()
    }

    /// Whether an earlier fatal error poisoned the allocator.
    pub fn is_poisoned(&self) -> bool {
        self.inner.directory.is_poisoned()
    }

    /// Whether `ptr` lies inside the reserved range.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.layout().contains(ptr as usize)
    }

    /// Segment and chunk offset owning a payload pointer.
    pub fn locate(&self, ptr: *const u8) -> Result<ChunkLocation> {
        let addr = ptr as usize;
        self.layout()
            .locate(addr)
            .map_err(|reason| Error::InvalidPointer { addr, reason })
    }

    /// Current revision of a segment slot (odd while it exists), or `None`
    /// past the last slot.
    pub fn segment_revision(&self, segment_id: u32) -> Option<u32> {
        (segment_id < self.layout().num_segments()).then(|| self.inner.directory.revision(segment_id))
    }

    /// This process's record of a segment slot, or `None` past the last slot.
    pub fn local_mapping(&self, segment_id: u32) -> Option<LocalMapping> {
        (segment_id < self.layout().num_segments()).then(|| self.inner.space.mapping(segment_id))
    }

    /// Allocate `size` bytes of shared memory.
    ///
    /// Scans the active segments newest first and takes the first one that
    /// can carve a chunk of the needed class, creating a new segment only
    /// when none can.
    ///
    /// # Errors
    ///
    /// - [`Error::OutOfMemory`] if the request exceeds the largest chunk or
    ///   every slot is in use.
    /// - [`Error::Poisoned`] after a fatal error under [`FatalPolicy::Poison`].
    /// - Fatal errors ([`Error::Corruption`], [`Error::Backing`]) abort the
    ///   process unless the policy is [`FatalPolicy::Poison`].
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        self.check_poisoned()?;
        let segment_class = self.layout().segment_class();
        let class = match size_class_for(size) {
            Some(class) if class <= segment_class => class,
            _ => {
                let cause = OomCause::TooLarge {
                    max: payload_capacity(segment_class),
                };
                warn!(size, %cause, "allocation failed");
                return Err(Error::OutOfMemory {
                    requested: size,
                    cause,
                });
            }
        };

        let mut dir = self.inner.directory.lock()?;
        let mut cursor = dir.first_active();
        while let Some(segment_id) = cursor {
            if let Some(ptr) = self.carve(&mut dir, segment_id, size, class)? {
                return Ok(ptr);
            }
            cursor = dir.next_active(segment_id);
        }

        match dir.create_segment(&self.inner.space) {
            Ok(Some(segment_id)) => match self.carve(&mut dir, segment_id, size, class)? {
                Some(ptr) => Ok(ptr),
                None => Err(self.escalate(Error::Corruption {
                    segment_id,
                    offset: 0,
                    detail: "fresh segment cannot hold a request that fits its class",
                })),
            },
            Ok(None) => {
                let cause = OomCause::SlotsExhausted {
                    num_segments: self.inner.config.num_segments,
                };
                warn!(size, %cause, "allocation failed");
                Err(Error::OutOfMemory {
                    requested: size,
                    cause,
                })
            }
            Err(e) => Err(self.escalate(e)),
        }
    }

    fn carve(
        &self,
        dir: &mut DirectoryGuard<'_>,
        segment_id: u32,
        size: usize,
        class: u32,
    ) -> Result<Option<NonNull<u8>>> {
        let carved = dir
            .buddy(&self.inner.space, segment_id)
            .carve(size, class)
            .map_err(|e| self.escalate(e))?;
        if carved.is_some() {
            dir.record_alloc();
            trace!(size, class, segment_id, "alloc");
        }
        Ok(carved)
    }

    /// Allocate `size` zero-filled bytes.
    pub fn alloc_zeroed(&self, size: usize) -> Result<NonNull<u8>> {
        let ptr = self.alloc(size)?;
        // SAFETY: the chunk payload holds at least `size` bytes.
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    /// Return an allocation.
    ///
    /// The owner is derived from the pointer value alone. If the segment
    /// has no active chunk left it is destroyed and its slot recycled.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPointer`] (state untouched) for pointers that are not
    /// live payloads of this allocator, including double frees.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used again, in any process, after this returns
    /// `Ok`.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        self.check_poisoned()?;
        let addr = ptr.as_ptr() as usize;
        let location = self.locate(ptr.as_ptr()).inspect_err(|e| warn!(%e, "free rejected"))?;
        let segment_id = location.segment_id;

        let mut dir = self.inner.directory.lock()?;
        if dir.revision(segment_id) % 2 == 0 {
            warn!(addr = format_args!("{addr:#x}"), segment_id, "free of pointer into missing segment");
            return Err(Error::InvalidPointer {
                addr,
                reason: "segment does not exist",
            });
        }

        let emptied = dir
            .buddy(&self.inner.space, segment_id)
            .release(location.offset)
            .map_err(|e| self.escalate(e))
            .inspect_err(|e| {
                if !e.is_fatal() {
                    warn!(%e, "free rejected");
                }
            })?;
        dir.record_free();
        trace!(addr = format_args!("{addr:#x}"), segment_id, "free");

        if emptied {
            dir.destroy_segment(&self.inner.space, segment_id)
                .map_err(|e| self.escalate(e))?;
        }
        Ok(())
    }

    /// Resize an allocation.
    ///
    /// Stays in place when `size` still fits the chunk's class; otherwise
    /// allocates a new chunk, copies the smaller of both lengths and frees
    /// the old one.
    ///
    /// # Safety
    ///
    /// Same as [`free`](Self::free) for `ptr` when the chunk moves.
    pub unsafe fn realloc(&self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>> {
        self.check_poisoned()?;
        let location = self.locate(ptr.as_ptr())?;
        let segment_id = location.segment_id;

        let old_required = {
            let mut dir = self.inner.directory.lock()?;
            if dir.revision(segment_id) % 2 == 0 {
                return Err(Error::InvalidPointer {
                    addr: ptr.as_ptr() as usize,
                    reason: "segment does not exist",
                });
            }
            let mut buddy = dir.buddy(&self.inner.space, segment_id);
            let header = buddy
                .check_active(location.offset as u64)
                .map_err(|e| self.escalate(e))?;
            if size <= payload_capacity(u32::from(header.class)) {
                buddy.resize_in_place(location.offset as u64, size);
                trace!(size, segment_id, "realloc in place");
                return Ok(ptr);
            }
            header.required as usize
        };

        let moved = self.alloc(size)?;
        // SAFETY: both chunks are live, distinct and at least this long.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), old_required.min(size));
            self.free(ptr)?;
        }
        Ok(moved)
    }

    /// Largest length `ptr` can be resized to without moving.
    ///
    /// Writing past the length passed to `alloc`/`realloc` overwrites the
    /// tail guard; grow with [`realloc`](Self::realloc) first.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        let location = self.locate(ptr.as_ptr())?;
        let mut dir = self.inner.directory.lock()?;
        if dir.revision(location.segment_id) % 2 == 0 {
            return Err(Error::InvalidPointer {
                addr: ptr.as_ptr() as usize,
                reason: "segment does not exist",
            });
        }
        let header = dir
            .buddy(&self.inner.space, location.segment_id)
            .check_active(location.offset as u64)
            .map_err(|e| self.escalate(e))?;
        Ok(payload_capacity(u32::from(header.class)))
    }

    /// Walk every active segment and account its chunks.
    ///
    /// Corrupted segments are flagged in their report and logged; use
    /// [`check_integrity`](Self::check_integrity) to escalate them.
    pub fn segment_diagnostics(&self) -> Result<Vec<SegmentReport>> {
        let mut dir = self.inner.directory.lock()?;
        let mut reports = Vec::new();
        for segment_id in dir.active_ids() {
            let revision = dir.revision(segment_id);
            let report = walk_segment(&dir.buddy(&self.inner.space, segment_id), segment_id, revision);
            if report.corrupted {
                error!(segment_id, revision, "segment failed its guard word checks");
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// Run [`segment_diagnostics`](Self::segment_diagnostics) and treat a
    /// corrupted segment as a fatal error.
    pub fn check_integrity(&self) -> Result<()> {
        self.check_poisoned()?;
        match self.segment_diagnostics()?.into_iter().find(|r| r.corrupted) {
            Some(report) => Err(self.escalate(Error::Corruption {
                segment_id: report.segment_id,
                offset: 0,
                detail: "guard word mismatch found by segment walk",
            })),
            None => Ok(()),
        }
    }

    /// Snapshot of the directory counters.
    ///
    /// Still readable after a poisoning unless the poisoning process died
    /// holding the directory lock.
    pub fn stats(&self) -> Result<DirectoryStats> {
        Ok(self.inner.directory.lock()?.stats())
    }

    /// Map the segment covering `ptr` now instead of on first touch.
    ///
    /// This is the same operation the fault handler performs; a segment
    /// that is already mapped at its current revision is left alone.
    pub fn attach_on_demand(&self, ptr: *const u8) -> Result<()> {
        let addr = ptr as usize;
        match self.inner.resolve(addr) {
            Ok(()) | Err(FaultError::AlreadyMapped { .. }) => Ok(()),
            Err(FaultError::OutOfRange { .. }) => Err(Error::InvalidPointer {
                addr,
                reason: "outside the shared buffer range",
            }),
            Err(FaultError::SegmentMissing { .. }) => Err(Error::InvalidPointer {
                addr,
                reason: "segment does not exist",
            }),
            Err(FaultError::Reentrant { .. }) => Err(Error::InvalidPointer {
                addr,
                reason: "mapping entry is locked by this thread",
            }),
            Err(FaultError::Open {
                segment_id,
                revision,
                errno,
            }) => Err(self.backing_error(BackingOp::Open, segment_id, revision, errno)),
            Err(FaultError::Map {
                segment_id,
                revision,
                errno,
            }) => Err(self.backing_error(BackingOp::Map, segment_id, revision, errno)),
        }
    }

    fn backing_error(
        &self,
        op: BackingOp,
        segment_id: u32,
        revision: u32,
        source: rustix::io::Errno,
    ) -> Error {
        let name = backing::SegmentName::new(self.inner.config.namespace, segment_id, revision);
        self.escalate(Error::Backing {
            op,
            name: name.to_string(),
            segment_id,
            revision,
            source,
        })
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.inner.directory.is_poisoned() {
            return Err(Error::Poisoned);
        }
        Ok(())
    }

    /// Apply the fatal policy to fatal errors; pass the rest through.
    ///
    /// The directory is poisoned under either policy. An aborting process
    /// may still hold the directory lock, and the flag is what lets the
    /// other processes stop waiting for it.
    fn escalate(&self, error: Error) -> Error {
        if !error.is_fatal() {
            return error;
        }
        error!(%error, namespace = self.inner.config.namespace, "fatal shared buffer error");
        self.inner.directory.poison();
        match self.inner.config.fatal_policy {
            FatalPolicy::Abort => {
                if self.owner_pid == std::process::id() {
                    // Drop never runs past abort()
                    if let Err(e) = backing::remove_namespace(self.inner.config.namespace) {
                        warn!(%e, "failed to clean up shared buffer namespace");
                    }
                }
                std::process::abort()
            }
            FatalPolicy::Poison => error,
        }
    }
}

impl Drop for ShmBuffer {
    fn drop(&mut self) {
        // unregister before `inner` goes away
        self.registration.take();

        if self.owner_pid == std::process::id() && self.inner.config.cleanup_on_drop {
            match backing::remove_namespace(self.inner.config.namespace) {
                Ok(removed) => debug!(
                    namespace = self.inner.config.namespace,
                    removed, "cleaned up shared buffer namespace"
                ),
                Err(e) => warn!(%e, "failed to clean up shared buffer namespace"),
            }
        }
    }
}

impl std::fmt::Debug for ShmBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmBuffer")
            .field("config", &self.inner.config)
            .field("layout", self.layout())
            .field("owner_pid", &self.owner_pid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(num_segments: u32) -> ShmBufferConfig {
        ShmBufferConfig::default()
            .with_segment_size(1 << 20)
            .with_num_segments(num_segments)
            .with_fatal_policy(FatalPolicy::Poison)
    }

    #[test]
    fn test_new_preallocates_first_segment() {
        let shmbuf = ShmBuffer::new(small(4)).unwrap();
        let stats = shmbuf.stats().unwrap();
        assert_eq!(stats.active_segments, 1);
        assert_eq!(stats.free_segments, 3);
        assert_eq!(shmbuf.segment_revision(0), Some(1));
        assert!(shmbuf.local_mapping(0).unwrap().attached);
    }

    #[test]
    fn test_slot_queries_past_last_segment() {
        let shmbuf = ShmBuffer::new(small(2)).unwrap();
        assert_eq!(shmbuf.segment_revision(1), Some(0));
        assert_eq!(shmbuf.segment_revision(2), None);
        assert_eq!(shmbuf.local_mapping(2), None);
        assert_eq!(shmbuf.local_mapping(u32::MAX), None);
    }

    #[test]
    fn test_new_removes_leftover_objects() {
        let config = small(2);
        let namespace = config.namespace;
        // an object a crashed owner of this namespace left behind
        let leftover = backing::BackingObject::new(namespace, 1, 5);
        drop(leftover.create(4096).unwrap());

        let shmbuf = ShmBuffer::new(config).unwrap();
        assert!(leftover.open().is_err());
        assert_eq!(shmbuf.segment_revision(0), Some(1));
    }

    #[test]
    fn test_without_preallocation() {
        let shmbuf = ShmBuffer::new(small(2).with_preallocate(false)).unwrap();
        assert_eq!(shmbuf.stats().unwrap().active_segments, 0);
        let ptr = shmbuf.alloc(10).unwrap();
        assert_eq!(shmbuf.stats().unwrap().active_segments, 1);
        unsafe { shmbuf.free(ptr).unwrap() };
        assert_eq!(shmbuf.stats().unwrap().active_segments, 0);
    }

    #[test]
    fn test_too_large_request() {
        let shmbuf = ShmBuffer::new(small(2)).unwrap();
        let err = shmbuf.alloc(1 << 20).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfMemory {
                cause: OomCause::TooLarge { .. },
                ..
            }
        ));
        assert!(shmbuf.alloc(payload_capacity(20)).is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = ShmBuffer::new(small(0)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_free_foreign_pointer() {
        let shmbuf = ShmBuffer::new(small(2)).unwrap();
        let mut local = 0u64;
        let err = unsafe { shmbuf.free(NonNull::from(&mut local).cast()) }.unwrap_err();
        assert!(matches!(err, Error::InvalidPointer { .. }));
        assert!(!shmbuf.is_poisoned());
    }

    #[test]
    fn test_free_into_missing_segment() {
        let shmbuf = ShmBuffer::new(small(2)).unwrap();
        let addr = shmbuf.layout().segment_base(1) + 16;
        let err = unsafe { shmbuf.free(NonNull::new(addr as *mut u8).unwrap()) }.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidPointer {
                reason: "segment does not exist",
                ..
            }
        ));
    }

    #[test]
    fn test_attach_on_demand_is_idempotent() {
        let shmbuf = ShmBuffer::new(small(2)).unwrap();
        let ptr = shmbuf.alloc(64).unwrap();
        shmbuf.attach_on_demand(ptr.as_ptr()).unwrap();
        shmbuf.attach_on_demand(ptr.as_ptr()).unwrap();
        let missing = shmbuf.layout().segment_base(1) as *const u8;
        assert!(shmbuf.attach_on_demand(missing).is_err());
    }

    #[test]
    fn test_drop_removes_objects() {
        let config = small(2);
        let namespace = config.namespace;
        let shmbuf = ShmBuffer::new(config).unwrap();
        let _ = shmbuf.alloc(10).unwrap();
        drop(shmbuf);
        assert_eq!(backing::remove_namespace(namespace).unwrap(), 0);
    }
}
