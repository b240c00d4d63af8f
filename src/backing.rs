//! OS shared-memory objects behind the segments.
//!
//! Every segment generation is one POSIX shared-memory object whose name
//! is derived from the namespace, the slot id and `revision / 2`:
//!
//! ```text
//! /.shmbuf_<namespace>.<segment id>:<generation>
//! ```
//!
//! The creator and every fault handler compute the same name, so no
//! file descriptors ever travel between processes.
//!
//! Nothing in this module allocates on the paths used by the fault
//! handler ([`SegmentName`], [`BackingObject::open`], [`map_fixed`]).

use crate::error::{BackingOp, Error, Result};
use rustix::fd::{AsFd, OwnedFd};
use rustix::fs::FallocateFlags;
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags};
use rustix::shm;
use std::ffi::CStr;
use std::fmt::{self, Write};

/// Directory where Linux exposes POSIX shared-memory objects.
pub const SHM_DIR: &str = "/dev/shm";

/// Leading part of every object name, without the `/`.
pub const NAME_PREFIX: &str = ".shmbuf_";

const NAME_CAPACITY: usize = 64;

/// Object name rendered into a fixed stack buffer.
pub struct SegmentName {
    buf: [u8; NAME_CAPACITY],
    len: usize,
}

impl SegmentName {
    /// Name of the object backing `segment_id` at `revision`.
    pub fn new(namespace: u32, segment_id: u32, revision: u32) -> Self {
        let mut name = Self {
            buf: [0; NAME_CAPACITY],
            len: 0,
        };
        // Three u32 values always fit, the buffer cannot overflow.
        let _ = write!(
            name,
            "/{NAME_PREFIX}{namespace}.{segment_id}:{}",
            revision >> 1
        );
        name
    }

    /// The name as text.
    pub fn as_str(&self) -> &str {
        // write_str only ever appends whole `str`s
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }

    /// The name as a NUL-terminated string for `shm_open`.
    pub fn as_cstr(&self) -> &CStr {
        // SAFETY: write_str keeps one trailing zero byte and the rendered
        // text consists of ASCII digits and punctuation, never NUL.
        unsafe { CStr::from_bytes_with_nul_unchecked(&self.buf[..=self.len]) }
    }
}

impl Write for SegmentName {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.len + s.len();
        if end >= NAME_CAPACITY {
            return Err(fmt::Error);
        }
        self.buf[self.len..end].copy_from_slice(s.as_bytes());
        self.len = end;
        Ok(())
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SegmentName").field(&self.as_str()).finish()
    }
}

/// One generation of one segment's backing object.
#[derive(Debug)]
pub struct BackingObject {
    name: SegmentName,
    segment_id: u32,
    revision: u32,
}

impl BackingObject {
    /// Identify the object for `segment_id` at `revision`.
    pub fn new(namespace: u32, segment_id: u32, revision: u32) -> Self {
        Self {
            name: SegmentName::new(namespace, segment_id, revision),
            segment_id,
            revision,
        }
    }

    /// Object name.
    pub fn name(&self) -> &SegmentName {
        &self.name
    }

    fn error(&self, op: BackingOp, source: Errno) -> Error {
        Error::Backing {
            op,
            name: self.name.to_string(),
            segment_id: self.segment_id,
            revision: self.revision,
            source,
        }
    }

    /// Create (or truncate a leftover of) the object and give it `size`
    /// bytes of physical backing.
    ///
    /// Physical pages are allocated up front with `fallocate` so that
    /// exhaustion shows up here rather than as a bus fault on first touch.
    pub fn create(&self, size: usize) -> Result<OwnedFd> {
        let fd = shm::open(
            self.name.as_cstr(),
            shm::OFlags::CREATE | shm::OFlags::TRUNC | shm::OFlags::RDWR,
            shm::Mode::RUSR | shm::Mode::WUSR,
        )
        .map_err(|e| self.error(BackingOp::Create, e))?;

        loop {
            match rustix::fs::fallocate(&fd, FallocateFlags::empty(), 0, size as u64) {
                Ok(()) => break,
                Err(Errno::INTR) => continue,
                Err(e) => {
                    let _ = shm::unlink(self.name.as_cstr());
                    return Err(self.error(BackingOp::Allocate, e));
                }
            }
        }
        Ok(fd)
    }

    /// Open the existing object read/write. Async-signal-safe.
    pub fn open(&self) -> rustix::io::Result<OwnedFd> {
        shm::open(
            self.name.as_cstr(),
            shm::OFlags::RDWR,
            shm::Mode::empty(),
        )
    }

    /// Map `fd` at the segment's fixed address, turning a backing error
    /// into [`Error::Backing`].
    ///
    /// # Safety
    ///
    /// See [`map_fixed`].
    pub unsafe fn map(&self, fd: impl AsFd, addr: usize, len: usize) -> Result<()> {
        // SAFETY: forwarded from the caller.
        unsafe { map_fixed(fd, addr, len) }.map_err(|e| self.error(BackingOp::Map, e))
    }

    /// Truncate the object to zero length, then unlink it.
    ///
    /// Truncation makes every stale mapping in other processes raise a
    /// bus fault on its next access, which sends them through the fault
    /// handler instead of letting them read a dead generation.
    pub fn remove(&self) -> Result<()> {
        let fd = shm::open(
            self.name.as_cstr(),
            shm::OFlags::RDWR | shm::OFlags::TRUNC,
            shm::Mode::empty(),
        )
        .map_err(|e| self.error(BackingOp::Truncate, e))?;
        drop(fd);
        shm::unlink(self.name.as_cstr()).map_err(|e| self.error(BackingOp::Unlink, e))
    }

    /// Replace the local mapping with the no-access placeholder, reporting
    /// failures as [`Error::Backing`].
    ///
    /// # Safety
    ///
    /// See [`placeholder`].
    pub unsafe fn unmap(&self, addr: usize, len: usize) -> Result<()> {
        // SAFETY: forwarded from the caller.
        unsafe { placeholder(addr, len) }.map_err(|e| self.error(BackingOp::Unmap, e))
    }
}

/// Reserve `len` bytes of address space with no access and no backing.
pub fn reserve(len: usize) -> rustix::io::Result<usize> {
    // SAFETY: a fresh anonymous mapping at a kernel-chosen address does
    // not alias any existing memory.
    let base = unsafe {
        rustix::mm::mmap_anonymous(
            std::ptr::null_mut(),
            len,
            ProtFlags::empty(),
            MapFlags::PRIVATE | MapFlags::NORESERVE,
        )?
    };
    Ok(base as usize)
}

/// Turn `[addr, addr + len)` back into reserved, no-access address space.
///
/// # Safety
///
/// The range must lie inside a reservation owned by the caller and no live
/// Rust reference may point into it.
pub unsafe fn placeholder(addr: usize, len: usize) -> rustix::io::Result<()> {
    // SAFETY: caller owns the range; MAP_FIXED replaces it atomically.
    unsafe {
        rustix::mm::mmap_anonymous(
            addr as *mut _,
            len,
            ProtFlags::empty(),
            MapFlags::PRIVATE | MapFlags::FIXED | MapFlags::NORESERVE,
        )?;
    }
    Ok(())
}

/// Map a backing object read/write at exactly `addr`. Async-signal-safe.
///
/// # Safety
///
/// Same contract as [`placeholder`]: whatever was mapped at the range is
/// discarded.
pub unsafe fn map_fixed(fd: impl AsFd, addr: usize, len: usize) -> rustix::io::Result<()> {
    // SAFETY: caller owns the range; MAP_FIXED replaces it atomically.
    unsafe {
        rustix::mm::mmap(
            addr as *mut _,
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED | MapFlags::FIXED,
            fd,
            0,
        )?;
    }
    Ok(())
}

/// Release a reservation.
///
/// # Safety
///
/// The range must have come from [`reserve`] and nothing may use it again.
pub unsafe fn release(addr: usize, len: usize) {
    // SAFETY: caller gives up the whole reservation.
    unsafe {
        let _ = rustix::mm::munmap(addr as *mut _, len);
    }
}

/// Remove every backing object left under `namespace`.
///
/// Returns how many objects were unlinked. Objects that vanish while the
/// directory is being scanned are skipped.
pub fn remove_namespace(namespace: u32) -> Result<usize> {
    let prefix = format!("{NAME_PREFIX}{namespace}.");
    let mut removed = 0;

    for entry in std::fs::read_dir(SHM_DIR)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !name.starts_with(&prefix) {
            continue;
        }
        match shm::unlink(format!("/{name}").as_str()) {
            Ok(()) => {
                tracing::info!(name, namespace, "removed leftover shared memory object");
                removed += 1;
            }
            Err(Errno::NOENT) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_namespace() -> u32 {
        crate::config::default_namespace()
    }

    #[test]
    fn test_segment_name_format() {
        let name = SegmentName::new(5432, 7, 5);
        assert_eq!(name.as_str(), "/.shmbuf_5432.7:2");
        assert_eq!(name.as_cstr().to_bytes(), b"/.shmbuf_5432.7:2");

        // odd revision and the even revision before it share a generation
        assert_eq!(
            SegmentName::new(1, 0, 3).as_str(),
            SegmentName::new(1, 0, 2).as_str()
        );
    }

    #[test]
    fn test_segment_name_max_values() {
        let name = SegmentName::new(u32::MAX, u32::MAX, u32::MAX);
        assert_eq!(
            name.as_str(),
            format!("/.shmbuf_{}.{}:{}", u32::MAX, u32::MAX, u32::MAX >> 1)
        );
    }

    #[test]
    fn test_create_map_remove() {
        let object = BackingObject::new(test_namespace(), 0, 1);
        let fd = object.create(1 << 20).unwrap();
        assert_eq!(rustix::fs::fstat(&fd).unwrap().st_size, 1 << 20);

        let base = reserve(1 << 20).unwrap();
        unsafe {
            object.map(&fd, base, 1 << 20).unwrap();
            (base as *mut u64).write(0xfeed);
        }

        // a second mapping of the same object sees the write
        let reopened = object.open().unwrap();
        let other = reserve(1 << 20).unwrap();
        unsafe {
            map_fixed(&reopened, other, 1 << 20).unwrap();
            assert_eq!((other as *const u64).read(), 0xfeed);
        }

        object.remove().unwrap();
        assert_eq!(object.open().unwrap_err(), Errno::NOENT);
        unsafe {
            release(base, 1 << 20);
            release(other, 1 << 20);
        }
    }

    #[test]
    fn test_remove_missing_object_fails() {
        let object = BackingObject::new(test_namespace(), 3, 9);
        let err = object.remove().unwrap_err();
        assert!(matches!(
            err,
            Error::Backing {
                op: BackingOp::Truncate,
                segment_id: 3,
                revision: 9,
                ..
            }
        ));
    }

    #[test]
    fn test_remove_namespace() {
        let namespace = test_namespace();
        let fds: Vec<_> = (0..3)
            .map(|id| BackingObject::new(namespace, id, 1).create(4096).unwrap())
            .collect();
        let other = BackingObject::new(namespace ^ 0x8000_0000, 0, 1);
        other.create(4096).unwrap();

        assert_eq!(remove_namespace(namespace).unwrap(), 3);
        assert_eq!(remove_namespace(namespace).unwrap(), 0);
        assert!(other.open().is_ok());
        other.remove().unwrap();
        drop(fds);
    }
}
