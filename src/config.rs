//! Allocator configuration and size constants.
//!
//! All values are fixed when the process group starts: the context reads
//! its [`ShmBufferConfig`] once, validates it, and never changes it
//! afterwards. Every process forked from the owner inherits the same view.
//!
//! # Usage
//!
//! ```rust,ignore
//! use shmbuf::{ShmBuffer, ShmBufferConfig};
//!
//! let config = ShmBufferConfig::default()
//!     .with_segment_size(32 << 20)
//!     .with_num_segments(64);
//! let shmbuf = ShmBuffer::new(config)?;
//! ```

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};

// =============================================================================
// Chunk geometry
// =============================================================================

/// log2 of the smallest chunk (128 bytes).
pub const CHUNK_MIN_CLASS: u32 = 7;

/// log2 of the largest chunk (4 GiB).
pub const CHUNK_MAX_CLASS: u32 = 32;

/// Number of size classes between [`CHUNK_MIN_CLASS`] and [`CHUNK_MAX_CLASS`].
pub const NUM_CLASSES: usize = (CHUNK_MAX_CLASS - CHUNK_MIN_CLASS + 1) as usize;

/// Smallest chunk size in bytes.
pub const CHUNK_MIN_SIZE: usize = 1 << CHUNK_MIN_CLASS;

/// Guard word stamped at the head and tail of every chunk.
pub const CHUNK_MAGIC: u32 = 0xdead_beaf;

// =============================================================================
// Segment geometry
// =============================================================================

/// Smallest accepted segment size (1 MiB).
pub const MIN_SEGMENT_SIZE: usize = 1 << 20;

/// Largest accepted segment size (4 GiB).
pub const MAX_SEGMENT_SIZE: usize = 1 << CHUNK_MAX_CLASS;

/// Default segment size (256 MiB).
pub const DEFAULT_SEGMENT_SIZE: usize = 256 << 20;

/// Lower bound for the default slot count.
pub const DEFAULT_MIN_SEGMENTS: u32 = 10;

/// Upper bound on the number of slots, keeps slot ids inside `u32`
/// with room for list sentinels.
pub const MAX_SEGMENTS: u32 = 1 << 24;

/// What happens after a fatal error (corruption or backing-store failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalPolicy {
    /// Log and abort the process.
    #[default]
    Abort,
    /// Log, mark the directory poisoned for every process, and return the
    /// error. Later calls fail with [`Error::Poisoned`].
    Poison,
}

/// Startup configuration of a [`ShmBuffer`](crate::ShmBuffer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmBufferConfig {
    /// Size of one segment in bytes. Power of two.
    pub segment_size: usize,
    /// Number of segment slots reserved in the address space.
    pub num_segments: u32,
    /// Listener/port identifier embedded in backing object names.
    pub namespace: u32,
    /// Create the first segment during initialization.
    pub preallocate: bool,
    /// Reaction to fatal errors.
    pub fatal_policy: FatalPolicy,
    /// Remove all backing objects of the namespace when the owning
    /// process drops the context.
    pub cleanup_on_drop: bool,
}

/// Counter mixed into default namespaces so that several contexts in one
/// process get distinct object names.
static NAMESPACE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Pick a namespace unique to this process and call.
pub fn default_namespace() -> u32 {
    let seq = NAMESPACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::process::id().wrapping_mul(1000).wrapping_add(seq)
}

/// Default slot count: twice the physical memory, in segments.
fn default_num_segments(segment_size: usize) -> u32 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let (pages, page_size) =
        unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
    if pages <= 0 || page_size <= 0 {
        return DEFAULT_MIN_SEGMENTS;
    }
    let phys = (pages as u128) * (page_size as u128);
    let count = (2 * phys) / segment_size as u128;
    count.clamp(DEFAULT_MIN_SEGMENTS as u128, MAX_SEGMENTS as u128) as u32
}

impl Default for ShmBufferConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            num_segments: default_num_segments(DEFAULT_SEGMENT_SIZE),
            namespace: default_namespace(),
            preallocate: true,
            fatal_policy: FatalPolicy::Abort,
            cleanup_on_drop: true,
        }
    }
}

impl ShmBufferConfig {
    /// Set the segment size.
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size;
        self
    }

    /// Set the number of segment slots.
    pub fn with_num_segments(mut self, num_segments: u32) -> Self {
        self.num_segments = num_segments;
        self
    }

    /// Set the namespace used in backing object names.
    pub fn with_namespace(mut self, namespace: u32) -> Self {
        self.namespace = namespace;
        self
    }

    /// Enable or disable creation of the first segment at startup.
    pub fn with_preallocate(mut self, preallocate: bool) -> Self {
        self.preallocate = preallocate;
        self
    }

    /// Set the reaction to fatal errors.
    pub fn with_fatal_policy(mut self, fatal_policy: FatalPolicy) -> Self {
        self.fatal_policy = fatal_policy;
        self
    }

    /// Enable or disable namespace cleanup when the owner drops the context.
    pub fn with_cleanup_on_drop(mut self, cleanup_on_drop: bool) -> Self {
        self.cleanup_on_drop = cleanup_on_drop;
        self
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the segment size is not a power
    /// of two inside the accepted bounds, if there are no slots, or if the
    /// reservation would overflow the address space.
    pub fn validate(&self) -> Result<()> {
        if !self.segment_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "segment_size ({} bytes) is not a power of two",
                self.segment_size
            )));
        }
        if self.segment_size < MIN_SEGMENT_SIZE || self.segment_size > MAX_SEGMENT_SIZE {
            return Err(Error::InvalidConfig(format!(
                "segment_size ({} bytes) must be within {}..={} bytes",
                self.segment_size, MIN_SEGMENT_SIZE, MAX_SEGMENT_SIZE
            )));
        }
        if self.num_segments == 0 || self.num_segments > MAX_SEGMENTS {
            return Err(Error::InvalidConfig(format!(
                "num_segments ({}) must be within 1..={}",
                self.num_segments, MAX_SEGMENTS
            )));
        }
        if self.reservation_size().is_none() {
            return Err(Error::InvalidConfig(
                "segment_size * num_segments overflows the address space".into(),
            ));
        }
        Ok(())
    }

    /// log2 of the segment size, which is also the largest chunk class.
    #[inline]
    pub fn segment_class(&self) -> u32 {
        self.segment_size.trailing_zeros()
    }

    /// Bytes of virtual address space reserved for all slots.
    pub fn reservation_size(&self) -> Option<usize> {
        self.segment_size.checked_mul(self.num_segments as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ShmBufferConfig {
        ShmBufferConfig::default()
            .with_segment_size(MIN_SEGMENT_SIZE)
            .with_num_segments(4)
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ShmBufferConfig::default();
        config.validate().unwrap();
        assert_eq!(config.segment_size, DEFAULT_SEGMENT_SIZE);
        assert!(config.num_segments >= DEFAULT_MIN_SEGMENTS);
        assert_eq!(config.fatal_policy, FatalPolicy::Abort);
    }

    #[test]
    fn test_segment_size_must_be_power_of_two() {
        let config = small().with_segment_size(3 << 20);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_segment_size_bounds() {
        assert!(small().with_segment_size(512 << 10).validate().is_err());
        assert!(small().with_segment_size(MAX_SEGMENT_SIZE * 2).validate().is_err());
        assert!(small().with_segment_size(MIN_SEGMENT_SIZE).validate().is_ok());
    }

    #[test]
    fn test_zero_segments_rejected() {
        assert!(small().with_num_segments(0).validate().is_err());
    }

    #[test]
    fn test_segment_class() {
        assert_eq!(small().segment_class(), 20);
        assert_eq!(small().with_segment_size(1 << 28).segment_class(), 28);
    }

    #[test]
    fn test_default_namespaces_differ() {
        let a = ShmBufferConfig::default();
        let b = ShmBufferConfig::default();
        assert_ne!(a.namespace, b.namespace);
    }

    #[test]
    fn test_class_table_size() {
        assert_eq!(NUM_CLASSES, 26);
        assert_eq!(CHUNK_MIN_SIZE, 128);
    }
}
