//! Cross-process demo: an owner and forked workers sharing one heap.
//!
//! The owner forks workers before any segment exists. Each worker builds a
//! linked list in shared memory and reports its head pointer; the owner
//! walks the lists (mapping the workers' segments on first touch) and frees
//! every node, which destroys the segments again.
//!
//! Run with: cargo run --example cross_process

use shmbuf::prelude::*;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::ptr::NonNull;

#[repr(C)]
struct Node {
    next: u64,
    worker: u32,
    index: u32,
}

const WORKERS: u32 = 3;
const NODES: u32 = 1000;

fn build_list(shmbuf: &ShmBuffer, worker: u32) -> Result<u64> {
    let mut head = 0u64;
    for index in 0..NODES {
        // vary the size so the lists spread over several classes
        let size = std::mem::size_of::<Node>() + (index as usize % 7) * 300;
        let node = shmbuf.alloc(size)?.cast::<Node>();
        unsafe {
            node.as_ptr().write(Node {
                next: head,
                worker,
                index,
            })
        };
        head = node.as_ptr() as u64;
    }
    Ok(head)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("shmbuf=debug")
        .init();

    println!("=== Cross-Process Shared Buffer Demo ===\n");

    let shmbuf = ShmBuffer::new(
        ShmBufferConfig::default()
            .with_segment_size(1 << 20)
            .with_num_segments(16)
            .with_preallocate(false),
    )?;
    println!("reserved {:#x} bytes at {:#x}", shmbuf.layout().len(), shmbuf.layout().base());

    let mut streams = Vec::new();
    let mut pids = Vec::new();
    for worker in 0..WORKERS {
        let (mut owner_end, mut worker_end) = UnixStream::pair()?;
        let pid = unsafe { libc::fork() };
        if pid == 0 {
            let code = match build_list(&shmbuf, worker) {
                Ok(head) => worker_end.write_all(&head.to_ne_bytes()).map_or(2, |_| 0),
                Err(e) => {
                    eprintln!("worker {worker}: {e}");
                    1
                }
            };
            unsafe { libc::_exit(code) };
        }
        let mut buf = [0u8; 8];
        owner_end.read_exact(&mut buf)?;
        streams.push(u64::from_ne_bytes(buf));
        pids.push(pid);
    }

    for pid in pids {
        let mut status = 0;
        unsafe { libc::waitpid(pid, &mut status, 0) };
    }

    println!("\nafter workers:");
    for report in shmbuf.segment_diagnostics()? {
        println!("  {report}");
    }

    for (worker, head) in streams.into_iter().enumerate() {
        let mut cursor = head;
        let mut count = 0;
        while let Some(node) = NonNull::new(cursor as *mut Node) {
            let Node { next, worker: owner, .. } = unsafe { node.as_ptr().read() };
            assert_eq!(owner, worker as u32);
            unsafe { shmbuf.free(node.cast())? };
            cursor = next;
            count += 1;
        }
        println!("worker {worker}: walked and freed {count} nodes");
    }

    let stats = shmbuf.stats()?;
    println!(
        "\ncreated {} segments, destroyed {}, {} allocations, {} live chunks",
        stats.segments_created, stats.segments_destroyed, stats.allocations, stats.live_chunks
    );
    Ok(())
}
