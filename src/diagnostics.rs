//! Per-segment accounting for introspection.
//!
//! The walk reads chunk headers in address order instead of following the
//! free lists, so it sees every chunk exactly once and notices damaged
//! headers that the lists would skip over.

use crate::chunk::{class_label, class_size, payload_capacity};
use crate::config::CHUNK_MIN_CLASS;
use crate::segment::Buddy;
use std::fmt;

/// Chunk counts of one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassUsage {
    /// log2 of the chunk size.
    pub class: u32,
    /// Chunks handed out.
    pub active: u32,
    /// Chunks on the free list.
    pub free: u32,
}

impl ClassUsage {
    /// Chunk size as text, e.g. `4kB`.
    pub fn label(&self) -> String {
        class_label(self.class)
    }
}

/// Result of walking one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentReport {
    /// Segment slot.
    pub segment_id: u32,
    /// Revision at the time of the walk.
    pub revision: u32,
    /// Non-empty size classes, smallest first.
    pub classes: Vec<ClassUsage>,
    /// Payload bytes requested by callers of active chunks.
    pub required_space: u64,
    /// Bytes of active chunks.
    pub alloc_space: u64,
    /// Bytes of free chunks.
    pub free_space: u64,
    /// A guard word or header did not match; the walk stopped at the
    /// first unreadable header.
    pub corrupted: bool,
}

impl SegmentReport {
    /// Active chunks over all classes.
    pub fn active_chunks(&self) -> u32 {
        self.classes.iter().map(|c| c.active).sum()
    }

    /// Free chunks over all classes.
    pub fn free_chunks(&self) -> u32 {
        self.classes.iter().map(|c| c.free).sum()
    }

    /// Usage of one class, if any chunk of it exists.
    pub fn class(&self, class: u32) -> Option<&ClassUsage> {
        self.classes.iter().find(|c| c.class == class)
    }
}

impl fmt::Display for SegmentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment {} (revision {}):", self.segment_id, self.revision)?;
        for usage in &self.classes {
            write!(
                f,
                " {}[active={} free={}]",
                usage.label(),
                usage.active,
                usage.free
            )?;
        }
        write!(
            f,
            " required={} alloc={} free={}",
            self.required_space, self.alloc_space, self.free_space
        )?;
        if self.corrupted {
            f.write_str(" CORRUPTED")?;
        }
        Ok(())
    }
}

/// Walk every chunk of a segment in address order.
pub(crate) fn walk_segment(buddy: &Buddy<'_>, segment_id: u32, revision: u32) -> SegmentReport {
    let max_class = buddy.max_class();
    let segment_size = class_size(max_class) as u64;
    let mut counts = vec![(0u32, 0u32); (max_class - CHUNK_MIN_CLASS + 1) as usize];
    let mut report = SegmentReport {
        segment_id,
        revision,
        classes: Vec::new(),
        required_space: 0,
        alloc_space: 0,
        free_space: 0,
        corrupted: false,
    };

    let mut offset = 0u64;
    while offset < segment_size {
        let header = buddy.header_at(offset);
        let class = u32::from(header.class);
        if !header.has_magic()
            || !(CHUNK_MIN_CLASS..=max_class).contains(&class)
            || offset % class_size(class) as u64 != 0
        {
            report.corrupted = true;
            break;
        }

        let size = class_size(class) as u64;
        let slot = &mut counts[(class - CHUNK_MIN_CLASS) as usize];
        if header.is_active() {
            let required = header.required as usize;
            if required > payload_capacity(class) || !buddy.tail_guard_intact(offset, required) {
                report.corrupted = true;
            }
            slot.0 += 1;
            report.required_space += required as u64;
            report.alloc_space += size;
        } else if header.is_free() {
            slot.1 += 1;
            report.free_space += size;
        } else {
            report.corrupted = true;
            break;
        }
        offset += size;
    }

    let active: u32 = counts.iter().map(|(active, _)| active).sum();
    if !report.corrupted && active != buddy.num_active() {
        report.corrupted = true;
    }

    report.classes = counts
        .into_iter()
        .enumerate()
        .filter(|(_, (active, free))| active + free > 0)
        .map(|(i, (active, free))| ClassUsage {
            class: CHUNK_MIN_CLASS + i as u32,
            active,
            free,
        })
        .collect();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::CHUNK_HEADER_SIZE;
    use crate::segment::tests::TestSegment;

    #[test]
    fn test_fresh_segment_report() {
        let mut seg = TestSegment::new(20);
        let report = walk_segment(&seg.buddy(), 0, 1);
        assert_eq!(
            report.classes,
            vec![ClassUsage {
                class: 20,
                active: 0,
                free: 1
            }]
        );
        assert_eq!(report.free_space, 1 << 20);
        assert_eq!(report.alloc_space, 0);
        assert!(!report.corrupted);
    }

    #[test]
    fn test_report_counts_active_and_free() {
        let mut seg = TestSegment::new(20);
        seg.alloc(1000).unwrap();
        seg.alloc(100).unwrap();
        let report = walk_segment(&seg.buddy(), 0, 1);

        assert_eq!(report.active_chunks(), 2);
        assert_eq!(report.required_space, 1100);
        assert_eq!(report.alloc_space, 1024 + 128);
        assert_eq!(report.alloc_space + report.free_space, 1 << 20);
        assert_eq!(report.class(10).unwrap().active, 1);
        assert_eq!(report.class(7).unwrap().active, 1);
        assert_eq!(report.class(7).unwrap().free, 1);
        assert!(!report.corrupted);
    }

    #[test]
    fn test_tail_overrun_flags_corruption() {
        let mut seg = TestSegment::new(20);
        let ptr = seg.alloc(200).unwrap();
        seg.alloc(200).unwrap();
        unsafe { ptr.as_ptr().add(200).write_bytes(0, 4) };

        let report = walk_segment(&seg.buddy(), 0, 1);
        assert!(report.corrupted);
        // the walk continues past a damaged tail
        assert_eq!(report.active_chunks(), 2);
    }

    #[test]
    fn test_head_overwrite_stops_walk() {
        let mut seg = TestSegment::new(20);
        let ptr = seg.alloc(200).unwrap();
        unsafe {
            ptr.as_ptr()
                .sub(CHUNK_HEADER_SIZE)
                .write_bytes(0x55, CHUNK_HEADER_SIZE)
        };

        let report = walk_segment(&seg.buddy(), 0, 1);
        assert!(report.corrupted);
        assert_eq!(report.active_chunks(), 0);
    }

    #[test]
    fn test_report_display() {
        let mut seg = TestSegment::new(20);
        seg.alloc(1000).unwrap();
        let text = walk_segment(&seg.buddy(), 2, 3).to_string();
        assert!(text.starts_with("segment 2 (revision 3):"));
        assert!(text.contains("1kB[active=1 free=1]"));
        assert!(text.contains("required=1000 alloc=1024"));
        assert!(!text.contains("CORRUPTED"));
    }
}
