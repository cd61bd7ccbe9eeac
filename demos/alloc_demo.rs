//! Walks through a handful of allocations and deallocations against an
//! in-memory block array, printing the resulting segments and stats.
//! Mirrors the shape of the allocator's own unit tests but as a runnable
//! narrative instead of assertions.

use xoz_alloc::alloc::segment_allocator::SegmentAllocator;
use xoz_alloc::block_array::VecBlockArray;
use xoz_alloc::config::AllocatorConfig;

fn main() {
    env_logger::init();

    let blkarr = VecBlockArray::new(12); // 4096-byte blocks
    let mut allocator = SegmentAllocator::new_empty(blkarr, AllocatorConfig::default()).unwrap();

    let a = allocator.alloc(4096 * 4).unwrap();
    println!("alloc(16384) -> {:?}", a.extents());

    let b = allocator.alloc(100).unwrap();
    println!("alloc(100)   -> {:?} inline={:?}", b.extents(), b.inline_data());

    allocator.dealloc(&a).unwrap();
    println!("dealloc(a)");

    let c = allocator.alloc(4096 * 2).unwrap();
    println!("alloc(8192)  -> {:?} (reuses freed space from a)", c.extents());

    println!("stats: {:?}", allocator.stats().current());
}
