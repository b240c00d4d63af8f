//! Error types for shmbuf.

use thiserror::Error;

/// Result type alias using shmbuf's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Why an allocation request could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OomCause {
    /// No active segment had room and every segment slot is in use.
    SlotsExhausted {
        /// Configured number of segment slots.
        num_segments: u32,
    },
    /// The request is larger than the biggest chunk a segment can hold.
    TooLarge {
        /// Largest payload a single chunk can carry.
        max: usize,
    },
}

impl std::fmt::Display for OomCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OomCause::SlotsExhausted { num_segments } => write!(
                f,
                "all {num_segments} segment slots are in use (enlarge num_segments)"
            ),
            OomCause::TooLarge { max } => {
                write!(f, "request exceeds the largest chunk payload of {max} bytes")
            }
        }
    }
}

/// The backing-store operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingOp {
    /// `shm_open(O_CREAT)` of a new object.
    Create,
    /// `shm_open` of an existing object.
    Open,
    /// `fallocate` to size a new object.
    Allocate,
    /// `mmap` of the object at its fixed slot address.
    Map,
    /// Replacing a mapping with the no-access placeholder.
    Unmap,
    /// Truncating a dropped object to zero length.
    Truncate,
    /// `shm_unlink` of a dropped object.
    Unlink,
}

impl std::fmt::Display for BackingOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            BackingOp::Create => "shm_open(O_CREAT)",
            BackingOp::Open => "shm_open",
            BackingOp::Allocate => "fallocate",
            BackingOp::Map => "mmap",
            BackingOp::Unmap => "munmap",
            BackingOp::Truncate => "truncate",
            BackingOp::Unlink => "shm_unlink",
        };
        f.write_str(op)
    }
}

/// Main error type for shmbuf operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The request cannot be served from shared memory.
    #[error("out of shared memory: {requested} bytes requested, {cause}")]
    OutOfMemory {
        /// Bytes the caller asked for.
        requested: usize,
        /// What ran out.
        cause: OomCause,
    },

    /// A chunk header or guard word does not carry the expected value.
    #[error("shared memory corruption in segment {segment_id} at offset {offset:#x}: {detail}")]
    Corruption {
        /// Segment slot containing the damaged chunk.
        segment_id: u32,
        /// Byte offset of the chunk within the segment.
        offset: usize,
        /// Which check failed.
        detail: &'static str,
    },

    /// A shared-memory object could not be created, mapped or removed.
    #[error("{op} failed for '{name}' (segment {segment_id}, revision {revision}): {source}")]
    Backing {
        /// The failing operation.
        op: BackingOp,
        /// Name of the backing object.
        name: String,
        /// Segment slot the object belongs to.
        segment_id: u32,
        /// Segment revision at the time of the failure.
        revision: u32,
        /// Underlying errno.
        #[source]
        source: rustix::io::Errno,
    },

    /// The pointer is not a live allocation of this allocator.
    #[error("invalid pointer {addr:#x}: {reason}")]
    InvalidPointer {
        /// Address passed by the caller.
        addr: usize,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// An earlier fatal error left the segment directory untrustworthy.
    #[error("shared memory allocator is poisoned by an earlier fatal error")]
    Poisoned,

    /// Configuration rejected at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Fatal errors mean the invariants shared by the whole process group
    /// are broken; they are never recovered from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corruption { .. } | Error::Backing { .. })
    }

    /// True for both flavours of [`Error::OutOfMemory`].
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let corruption = Error::Corruption {
            segment_id: 1,
            offset: 0x80,
            detail: "head guard mismatch",
        };
        assert!(corruption.is_fatal());

        let backing = Error::Backing {
            op: BackingOp::Map,
            name: "/.shmbuf_1.0:0".into(),
            segment_id: 0,
            revision: 1,
            source: rustix::io::Errno::NOMEM,
        };
        assert!(backing.is_fatal());

        let oom = Error::OutOfMemory {
            requested: 10,
            cause: OomCause::SlotsExhausted { num_segments: 1 },
        };
        assert!(!oom.is_fatal());
        assert!(oom.is_out_of_memory());
        assert!(!Error::Poisoned.is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::OutOfMemory {
            requested: 4096,
            cause: OomCause::SlotsExhausted { num_segments: 3 },
        };
        let msg = err.to_string();
        assert!(msg.contains("4096"));
        assert!(msg.contains("enlarge num_segments"));

        let err = Error::Backing {
            op: BackingOp::Unlink,
            name: "/.shmbuf_7.2:1".into(),
            segment_id: 2,
            revision: 3,
            source: rustix::io::Errno::NOENT,
        };
        let msg = err.to_string();
        assert!(msg.starts_with("shm_unlink failed for '/.shmbuf_7.2:1'"));
        assert!(msg.contains("segment 2, revision 3"));
    }
}
