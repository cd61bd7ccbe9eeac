//! Block and segment allocation for a content-addressable block array.
//!
//! The block array only ever grows or shrinks at its tail; everything in
//! between is carved up by the types in this crate. [`alloc::extent::Extent`]
//! is the unit of allocation, [`alloc::segment::Segment`] groups extents
//! (plus a small inline tail) into what a caller actually gets back, and
//! [`alloc::segment_allocator::SegmentAllocator`] is the entry point that
//! ties free-space tracking to a [`block_array::BlockArray`].
//!
//! ```no_run
//! use xoz_alloc::alloc::segment_allocator::SegmentAllocator;
//! use xoz_alloc::block_array::VecBlockArray;
//! use xoz_alloc::config::AllocatorConfig;
//!
//! let blkarr = VecBlockArray::new(12); // 4096-byte blocks
//! let mut allocator = SegmentAllocator::new_empty(blkarr, AllocatorConfig::default()).unwrap();
//!
//! let segm = allocator.alloc(10_000).unwrap();
//! allocator.dealloc(&segm).unwrap();
//! ```
//!
//! This crate does not persist its free-space metadata and is not safe
//! for concurrent mutation: a [`SegmentAllocator`](alloc::segment_allocator::SegmentAllocator)
//! is a single-threaded, non-reentrant accounting structure, not a
//! database.

pub mod alloc;
pub mod block_array;
pub mod config;
pub mod error;
