//! # shmbuf
//!
//! A dynamic shared-memory heap for groups of forked processes.
//!
//! The heap grows and shrinks by whole segments: each segment is one POSIX
//! shared-memory object of fixed size, carved into power-of-two chunks by a
//! buddy allocator. Segments live at fixed addresses inside an address
//! range every process reserves identically, so a pointer means the same
//! thing everywhere. Processes map segments lazily: touching a segment
//! that is not (or no longer) mapped raises a fault that the library
//! resolves by mapping the segment's current generation.
//!
//! ## Features
//!
//! - **Buddy allocation**: 128-byte to 4 GiB chunks with head and tail guard words
//! - **Elastic**: segments are created on demand and destroyed when their
//!   last chunk is freed
//! - **Lazy mapping**: SIGSEGV/SIGBUS driven, no cross-process notification
//! - **Revision tracking**: odd/even counters detect stale mappings and
//!   dangling references
//! - **Diagnostics**: per-segment, per-class accounting with corruption checks
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shmbuf::prelude::*;
//!
//! let shmbuf = ShmBuffer::new(
//!     ShmBufferConfig::default()
//!         .with_segment_size(32 << 20)
//!         .with_num_segments(64),
//! )?;
//!
//! let ptr = shmbuf.alloc_zeroed(1000)?;
//! // fork workers; `ptr` is valid in all of them
//! unsafe { shmbuf.free(ptr)? };
//!
//! for report in shmbuf.segment_diagnostics()? {
//!     println!("{report}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(not(target_os = "linux"))]
compile_error!("shmbuf relies on Linux shared memory and fault semantics");

pub mod allocator;
pub mod backing;
pub mod chunk;
pub mod config;
pub mod diagnostics;
mod directory;
pub mod error;
pub mod fault;
pub mod local_map;
pub mod lock;
mod segment;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::allocator::ShmBuffer;
    pub use crate::config::{FatalPolicy, ShmBufferConfig};
    pub use crate::diagnostics::{ClassUsage, SegmentReport};
    pub use crate::directory::DirectoryStats;
    pub use crate::error::{Error, Result};
}

pub use allocator::ShmBuffer;
pub use config::{FatalPolicy, ShmBufferConfig};
pub use diagnostics::{ClassUsage, SegmentReport};
pub use directory::DirectoryStats;
pub use error::{Error, OomCause, Result};
