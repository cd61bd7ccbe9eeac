//! Allocator components: the [`extent::Extent`] and [`segment::Segment`]
//! data model, and the four allocators that operate on them.

pub mod extent;
pub mod free_map;
pub mod segment;
pub mod segment_allocator;
pub mod stats;
pub mod subblock_free_map;
pub mod tail;
