//! Tunables for a [`crate::alloc::segment_allocator::SegmentAllocator`].

use serde::{Deserialize, Serialize};

/// Per-call allocation requirements. Controls how aggressively a request
/// fragments a segment in exchange for denser packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocRequirements {
    /// How many whole-block extents a segment may use before the
    /// allocator prefers growing the tail over further fragmenting it.
    pub segm_frag_threshold: u16,
    /// Largest request, in bytes, that may be satisfied by inline data
    /// instead of an extent.
    pub max_inline_sz: u8,
    /// Whether sub-block allocation is allowed for the tail end of a
    /// request smaller than a full block.
    pub allow_suballoc: bool,
    /// When set, every allocation must be satisfiable by a single extent:
    /// `segm_frag_threshold` must be 1, `max_inline_sz` must be 0 and
    /// `allow_suballoc` must be false. A request too large for one extent
    /// is rejected instead of being fragmented.
    pub single_extent: bool,
}

impl Default for AllocRequirements {
    fn default() -> Self {
        Self { segm_frag_threshold: 2, max_inline_sz: 8, allow_suballoc: true, single_extent: false }
    }
}

impl AllocRequirements {
    pub fn single_extent() -> Self {
        Self { segm_frag_threshold: 1, max_inline_sz: 0, allow_suballoc: false, single_extent: true }
    }

    pub(crate) fn validate(&self) -> crate::error::Result<()> {
        if self.single_extent
            && (self.segm_frag_threshold != 1 || self.max_inline_sz != 0 || self.allow_suballoc)
        {
            crate::error::return_errno_with_msg!(
                crate::error::Errno::InvalidArgs,
                "single_extent requires segm_frag_threshold=1, max_inline_sz=0, allow_suballoc=false"
            );
        }
        Ok(())
    }
}

/// Top-level allocator configuration, set once at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Whether adjacent freed whole-block extents are merged in
    /// [`crate::alloc::free_map::FreeMap`].
    pub coalescing_enabled: bool,
    /// Free chunks within this many blocks of an exact fit are used as-is
    /// instead of being split, to avoid leaving unusable slivers.
    pub split_above_threshold: u16,
    pub default_req: AllocRequirements,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self { coalescing_enabled: true, split_above_threshold: 0, default_req: AllocRequirements::default() }
    }
}
