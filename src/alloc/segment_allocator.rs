//! [`SegmentAllocator`]: the front door of this crate.
//!
//! Composes [`TailAllocator`], [`FreeMap`] and [`SubBlockFreeMap`] into a
//! single `alloc`/`dealloc`/`realloc` surface over a [`BlockArray`],
//! preferring free space before growing the tail, and carving sub-block
//! extents or inline data out of whatever is left over below one block.

use std::cell::Cell;

use log::debug;

use crate::alloc::extent::Extent;
use crate::alloc::free_map::FreeMap;
use crate::alloc::segment::Segment;
use crate::alloc::stats::Stats;
use crate::alloc::subblock_free_map::SubBlockFreeMap;
use crate::alloc::tail::TailAllocator;
use crate::block_array::BlockArray;
use crate::config::{AllocRequirements, AllocatorConfig};
use crate::error::{return_errno_with_msg, Errno, Result};

pub struct SegmentAllocator<B: BlockArray> {
    blkarr: B,
    tail: TailAllocator,
    free_map: FreeMap,
    subfree_map: SubBlockFreeMap,
    stats: Stats,
    default_req: AllocRequirements,
    blocked_depth: Cell<u32>,
}

impl<B: BlockArray> SegmentAllocator<B> {
    /// Takes ownership of `blkarr`, starting with nothing allocated: every
    /// block currently in `blkarr` is immediately free.
    pub fn new_empty(blkarr: B, config: AllocatorConfig) -> Result<Self> {
        config.default_req.validate()?;
        let tail = TailAllocator::new(blkarr.begin_blk_nr(), blkarr.past_end_blk_nr());
        Ok(Self {
            blkarr,
            tail,
            free_map: FreeMap::new(config.coalescing_enabled, config.split_above_threshold),
            subfree_map: SubBlockFreeMap::new(),
            stats: Stats::new(),
            default_req: config.default_req,
            blocked_depth: Cell::new(0),
        })
    }

    /// Takes ownership of `blkarr`, reconstructing the free-space maps as
    /// the complement of `allocated`. Every block in `blkarr` not covered
    /// by one of `allocated`'s extents is free.
    pub fn new_from_allocated(blkarr: B, config: AllocatorConfig, allocated: &[Segment]) -> Result<Self> {
        let mut this = Self::new_empty(blkarr, config)?;

        let mut used_whole: Vec<(u32, u32)> = Vec::new(); // [blk_nr, past_end)
        let mut used_bitmap: std::collections::BTreeMap<u32, u16> = std::collections::BTreeMap::new();

        let blk_sz = this.blkarr.blk_sz();
        let subblk_sz = this.blkarr.subblk_sz();
        let blk_sz_order = this.blkarr.blk_sz_order();

        for segm in allocated {
            this.stats.record_alloc(segm.extents().iter().filter(|e| !e.is_suballoc()).map(|e| e.blk_cnt()).sum());
            this.stats.record_segment_ext_cnt(segm.extents().len());
            this.stats.record_user_bytes(segm.calc_usable_space_size(blk_sz_order));
            if let Some(data) = segm.inline_data() {
                this.stats.record_inline(data.len() as u32);
            }

            for ext in segm.extents() {
                if !ext.is_null() && !this.blkarr.is_extent_within_boundaries(ext) {
                    return_errno_with_msg!(
                        Errno::ExtentOutOfBounds,
                        "pre-allocated extent [{}, {}) falls outside the block array",
                        ext.blk_nr(),
                        ext.past_end_blk_nr()
                    );
                }
                match ext {
                    Extent::Whole { blk_nr, blk_cnt } => {
                        used_whole.push((*blk_nr, *blk_nr + *blk_cnt as u32));
                        this.stats.record_alloc_extent(Stats::internal_frag_avg_blk(blk_sz));
                    }
                    Extent::Suballoc { blk_nr, bitmap } => {
                        this.stats.record_alloc_suballoc(bitmap.count_ones() as u8);
                        this.stats.record_alloc_extent(Stats::internal_frag_avg_subblk(subblk_sz));
                        let entry = used_bitmap.entry(*blk_nr).or_insert(0);
                        if *entry & bitmap != 0 {
                            return_errno_with_msg!(
                                Errno::ExtentOverlap,
                                "sub-block bitmaps on blk {} collide",
                                blk_nr
                            );
                        }
                        *entry |= bitmap;
                    }
                    Extent::Null => {}
                }
            }
        }
        for (&blk_nr, &bitmap) in &used_bitmap {
            let free_bits = !bitmap;
            if free_bits != 0 {
                this.subfree_map.dealloc(Extent::suballoc(blk_nr, free_bits))?;
            }
            // the block itself is accounted for by a suballoc extent, not
            // free-map whole-block space; nothing more to record here. But
            // it must still block off the gap walk below, so it doesn't get
            // handed to FreeMap as if it were fully free.
            used_whole.push((blk_nr, blk_nr + 1));
            this.stats.record_new_suballoc_block();
        }
        used_whole.sort_unstable();

        let mut cursor = this.tail.begin_blk();
        let mut free_gap = |map: &mut FreeMap, start: u32, end: u32| -> Result<()> {
            let mut pos = start;
            while pos < end {
                let cnt = (end - pos).min(0xffff);
                map.dealloc(Extent::whole(pos, cnt as u16))?;
                pos += cnt;
            }
            Ok(())
        };
        for (start, end) in used_whole {
            if start > cursor {
                free_gap(&mut this.free_map, cursor, start)?;
            }
            cursor = cursor.max(end);
        }
        if cursor < this.tail.past_end_blk() {
            free_gap(&mut this.free_map, cursor, this.tail.past_end_blk())?;
        }

        Ok(this)
    }

    pub fn blkarr(&self) -> &B {
        &self.blkarr
    }

    pub fn blkarr_mut(&mut self) -> &mut B {
        &mut self.blkarr
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn default_alloc_requirements(&self) -> AllocRequirements {
        self.default_req
    }

    pub fn set_default_alloc_requirements(&mut self, req: AllocRequirements) -> Result<()> {
        req.validate()?;
        self.default_req = req;
        Ok(())
    }

    fn fail_if_blocked(&self) -> Result<()> {
        if self.blocked_depth.get() > 0 {
            return_errno_with_msg!(Errno::Blocked, "allocation/deallocation is currently blocked");
        }
        Ok(())
    }

    /// Suspends `alloc`/`dealloc`/`realloc` until the returned guard drops.
    /// Nested calls stack LIFO; the allocator stays blocked until every
    /// outstanding guard is gone.
    pub fn block_all_alloc_dealloc_guard(&self) -> BlockGuard<'_> {
        self.block_all_alloc_dealloc();
        BlockGuard { depth: &self.blocked_depth, released: false }
    }

    pub fn block_all_alloc_dealloc(&self) {
        self.blocked_depth.set(self.blocked_depth.get() + 1);
    }

    pub fn unblock_all_alloc_dealloc(&self) -> Result<()> {
        let d = self.blocked_depth.get();
        if d == 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "unblock called without a matching block");
        }
        self.blocked_depth.set(d - 1);
        Ok(())
    }

    /// Allocates a segment able to hold `sz` bytes, using the allocator's
    /// default requirements.
    pub fn alloc(&mut self, sz: u32) -> Result<Segment> {
        let req = self.default_req;
        self.alloc_with_req(sz, req)
    }

    pub fn alloc_with_req(&mut self, sz: u32, req: AllocRequirements) -> Result<Segment> {
        self.fail_if_blocked()?;
        req.validate()?;

        if req.single_extent {
            return self.alloc_single_extent_inner(sz).map(|ext| {
                let mut segm = Segment::new();
                segm.add_extent(ext);
                segm
            });
        }

        let blk_sz = self.blkarr.blk_sz();
        let subblk_sz = self.blkarr.subblk_sz();

        let mut blk_rem = sz / blk_sz;
        let rem = sz % blk_sz;
        let mut sub_rem: u32 = if req.allow_suballoc { rem / subblk_sz } else { 0 };
        let rem = if req.allow_suballoc { rem % subblk_sz } else { rem };
        let mut inline_sz = rem;

        if inline_sz > req.max_inline_sz as u32 {
            // backpressure upward: the spill doesn't fit inline, so it
            // needs a (sub)block of its own.
            if req.allow_suballoc {
                sub_rem += 1;
            } else {
                blk_rem += 1;
            }
            inline_sz = 0;
        }
        if sub_rem == 16 {
            // a full block's worth of subblocks is just a whole block.
            blk_rem += 1;
            sub_rem = 0;
        }

        let mut segm = Segment::new();

        while blk_rem > 0 {
            if segm.extents().len() as u16 >= req.segm_frag_threshold.max(1) && blk_rem <= 0xffff {
                let ext = self.alloc_whole(blk_rem as u16)?;
                segm.add_extent(ext);
                break;
            }
            let want = blk_rem.min(0xffff) as u16;
            let ext = self.alloc_whole(want)?;
            blk_rem -= ext.blk_cnt() as u32;
            segm.add_extent(ext);
        }

        if sub_rem > 0 {
            let ext = self.alloc_suballoc(sub_rem as u8)?;
            segm.add_extent(ext);
        }

        if inline_sz > 0 {
            segm.set_inline_data(vec![0u8; inline_sz as usize])?;
        }

        self.finish_alloc(&segm);
        Ok(segm)
    }

    fn finish_alloc(&mut self, segm: &Segment) {
        let blk_sz = self.blkarr.blk_sz();
        let subblk_sz = self.blkarr.subblk_sz();

        self.stats.record_alloc(segm.extents().iter().filter(|e| !e.is_suballoc()).map(|e| e.blk_cnt()).sum());
        for ext in segm.extents() {
            if ext.is_suballoc() {
                self.stats.record_alloc_suballoc(ext.bitmap().count_ones() as u8);
                self.stats.record_alloc_extent(Stats::internal_frag_avg_subblk(subblk_sz));
            } else {
                self.stats.record_alloc_extent(Stats::internal_frag_avg_blk(blk_sz));
            }
        }
        self.stats.record_segment_ext_cnt(segm.extents().len());
        if let Some(data) = segm.inline_data() {
            self.stats.record_inline(data.len() as u32);
        }
        self.stats.record_user_bytes(segm.calc_usable_space_size(self.blkarr.blk_sz_order()));
    }

    /// Allocates a single extent of exactly `sz` bytes, rounded up to a
    /// whole number of blocks. Fails if `sz` needs more blocks than a
    /// single extent can address.
    pub fn alloc_single_extent(&mut self, sz: u32) -> Result<Extent> {
        self.fail_if_blocked()?;
        self.alloc_single_extent_inner(sz)
    }

    fn alloc_single_extent_inner(&mut self, sz: u32) -> Result<Extent> {
        let blk_sz = self.blkarr.blk_sz();
        let blk_cnt = sz.div_ceil(blk_sz);
        if blk_cnt > 0xffff {
            return_errno_with_msg!(
                Errno::InvalidArgs,
                "{} bytes need {} blocks, more than a single extent can address",
                sz,
                blk_cnt
            );
        }
        let blk_cnt = blk_cnt.max(1) as u16;
        let ext = self.alloc_whole(blk_cnt)?;
        self.stats.record_alloc(blk_cnt);
        self.stats.record_segment_ext_cnt(1);
        self.stats.record_alloc_extent(Stats::internal_frag_avg_blk(blk_sz));
        self.stats.record_user_bytes(blk_cnt as u32 * blk_sz);
        Ok(ext)
    }

    fn alloc_whole(&mut self, blk_cnt: u16) -> Result<Extent> {
        let r = self.free_map.alloc(blk_cnt)?;
        if r.success {
            return Ok(r.ext);
        }
        let blk_nr = self.blkarr.grow_by_blocks(blk_cnt)?;
        let r = self.tail.alloc(blk_cnt)?;
        debug_assert_eq!(r.ext.blk_nr(), blk_nr, "tail and block array drifted apart");
        debug!("free_map exhausted, grew tail by {} block(s) at {}", blk_cnt, blk_nr);
        Ok(r.ext)
    }

    fn alloc_suballoc(&mut self, subblk_cnt: u8) -> Result<Extent> {
        let r = self.subfree_map.alloc(subblk_cnt)?;
        if r.success {
            return Ok(r.ext);
        }
        // No block has enough free sub-blocks: carve a fresh one out of
        // whole-block space and retry.
        let fresh = self.alloc_whole(1)?;
        self.subfree_map.dealloc(Extent::suballoc(fresh.blk_nr(), 0xffff))?;
        self.stats.record_new_suballoc_block();
        let r = self.subfree_map.alloc(subblk_cnt)?;
        debug_assert!(r.success);
        Ok(r.ext)
    }

    /// Frees every extent and any inline data in `segm`. `segm` must not be
    /// reused afterwards.
    pub fn dealloc(&mut self, segm: &Segment) -> Result<()> {
        self.fail_if_blocked()?;

        let blk_sz = self.blkarr.blk_sz();
        let subblk_sz = self.blkarr.subblk_sz();

        for ext in segm.extents() {
            match ext {
                Extent::Whole { .. } => {
                    if self.tail.dealloc(ext)? {
                        self.blkarr.shrink_by_blocks(ext.blk_cnt())?;
                    } else {
                        self.free_map.dealloc(*ext)?;
                    }
                    self.stats.record_dealloc(ext.blk_cnt());
                    self.stats.record_dealloc_extent(Stats::internal_frag_avg_blk(blk_sz));
                }
                Extent::Suballoc { .. } => {
                    self.subfree_map.dealloc(*ext)?;
                    self.stats.record_dealloc_suballoc(ext.bitmap().count_ones() as u8);
                    self.stats.record_dealloc_extent(Stats::internal_frag_avg_subblk(subblk_sz));
                }
                Extent::Null => {}
            }
        }

        if let Some(data) = segm.inline_data() {
            self.stats.record_remove_inline(data.len() as u32);
        }
        self.stats.record_freed_user_bytes(segm.calc_usable_space_size(self.blkarr.blk_sz_order()));

        self.reclaim_full_subblocks()?;
        Ok(())
    }

    /// Frees a single bare extent allocated via [`SegmentAllocator::alloc_single_extent`].
    pub fn dealloc_single_extent(&mut self, ext: &Extent) -> Result<()> {
        self.fail_if_blocked()?;
        self.free_whole_blocks(ext)?;
        self.stats.record_dealloc_extent(Stats::internal_frag_avg_blk(self.blkarr.blk_sz()));
        Ok(())
    }

    /// Returns `ext`'s blocks to the tail or the free map, recording the
    /// block-count and user-byte bookkeeping that applies whether `ext` is
    /// an entire extent being dropped or just a trailing slice shed from a
    /// larger one still in use (see [`SegmentAllocator::realloc_with_req`]'s
    /// shrink path). Does not touch `in_use_ext_cnt`/the fragmentation
    /// gauge: callers that are removing a whole extent account for those
    /// themselves.
    fn free_whole_blocks(&mut self, ext: &Extent) -> Result<()> {
        let blk_sz = self.blkarr.blk_sz();
        if self.tail.dealloc(ext)? {
            self.blkarr.shrink_by_blocks(ext.blk_cnt())?;
        } else {
            self.free_map.dealloc(*ext)?;
        }
        self.stats.record_dealloc(ext.blk_cnt());
        self.stats.record_freed_user_bytes(ext.blk_cnt() as u32 * blk_sz);
        Ok(())
    }

    fn reclaim_full_subblocks(&mut self) -> Result<()> {
        let full = self.subfree_map.release_full_blocks();
        for blk_nr in full {
            self.free_map.dealloc(Extent::whole(blk_nr, 1))?;
            self.stats.record_reclaimed_suballoc_block();
        }
        Ok(())
    }

    /// Resizes `segm` in place to `new_sz` bytes, best-effort: tries to
    /// avoid moving data, at the cost of leaving the segment more
    /// fragmented than a fresh `alloc` would. Do not use this to compact a
    /// segment. Existing data is preserved; newly allocated space has
    /// undefined contents.
    pub fn realloc(&mut self, segm: &mut Segment, new_sz: u32) -> Result<()> {
        self.realloc_with_req(segm, new_sz, self.default_req)
    }

    pub fn realloc_with_req(&mut self, segm: &mut Segment, new_sz: u32, req: AllocRequirements) -> Result<()> {
        self.fail_if_blocked()?;
        req.validate()?;

        let blk_sz = self.blkarr.blk_sz();
        let old_sz = segm.calc_usable_space_size(self.blkarr.blk_sz_order());

        if new_sz == old_sz {
            return Ok(());
        }

        if new_sz < old_sz {
            let mut to_shed = old_sz - new_sz;
            while to_shed > 0 {
                match segm.extents().last().copied() {
                    Some(ext @ Extent::Whole { blk_cnt, .. }) if (blk_cnt as u32) * blk_sz <= to_shed => {
                        segm.extents_mut().pop();
                        self.dealloc_single_extent(&ext)?;
                        to_shed -= (blk_cnt as u32) * blk_sz;
                    }
                    Some(Extent::Whole { .. }) => {
                        let drop_blks = (to_shed / blk_sz) as u16;
                        if drop_blks == 0 {
                            break;
                        }
                        let last = segm.extents_mut().last_mut().unwrap();
                        last.shrink_by(drop_blks);
                        let freed_nr = last.past_end_blk_nr();
                        self.free_whole_blocks(&Extent::whole(freed_nr, drop_blks))?;
                        to_shed -= drop_blks as u32 * blk_sz;
                    }
                    _ => break,
                }
            }
            if to_shed > 0 {
                if let Some(data) = segm.inline_data() {
                    let orig_len = data.len();
                    let keep = orig_len.saturating_sub(to_shed as usize);
                    let trimmed = data[..keep].to_vec();
                    segm.set_inline_data(trimmed)?;
                    let freed = (orig_len - keep) as u32;
                    if freed > 0 {
                        self.stats.record_remove_inline(freed);
                        self.stats.record_freed_user_bytes(freed);
                    }
                }
            }
            self.stats.record_realloc();
            return Ok(());
        }

        let mut to_grow = new_sz - old_sz;
        self.stats.record_realloc();

        let mut extra = Segment::new();
        while to_grow > 0 {
            let want_blk = to_grow.div_ceil(blk_sz).min(0xffff);
            let ext = self.alloc_whole(want_blk as u16)?;
            let got = ext.blk_cnt() as u32 * blk_sz;
            self.stats.record_alloc(ext.blk_cnt());
            self.stats.record_alloc_extent(Stats::internal_frag_avg_blk(blk_sz));
            self.stats.record_user_bytes(got);
            extra.add_extent(ext);
            to_grow = to_grow.saturating_sub(got);
        }
        for ext in extra.extents() {
            segm.add_extent(*ext);
        }

        Ok(())
    }

    /// Releases any pending-to-free space: pulls fully-free sub-blocks into
    /// the whole-block free map, then walks the free map's highest extents
    /// back to the tail allocator for as long as they abut the current
    /// high-water mark, shrinking the block array to match.
    pub fn release(&mut self) -> Result<()> {
        self.fail_if_blocked()?;
        self.reclaim_full_subblocks()?;

        while let Some(ext) = self.free_map.highest() {
            if !self.tail.is_at_the_end(&ext) {
                break;
            }
            self.free_map.release(&ext)?;
            self.tail.dealloc(&ext)?;
            self.blkarr.shrink_by_blocks(ext.blk_cnt())?;
            debug!("handed {} block(s) at {} back to the tail", ext.blk_cnt(), ext.blk_nr());
        }
        Ok(())
    }

    /// Wipes every bit of free-space bookkeeping and rewinds the block
    /// array to its starting mark, snapshotting the statistics in the
    /// process. Unlike [`SegmentAllocator::release`], this discards free
    /// extents that don't abut the tail instead of leaving them tracked:
    /// callers must have already deallocated every live segment, since
    /// shrinking the array back to its start abandons whatever blocks
    /// were still outstanding.
    pub fn reset(&mut self) -> Result<()> {
        self.fail_if_blocked()?;
        self.free_map.clear();
        self.subfree_map.clear();

        let begin = self.tail.begin_blk();
        let mut remaining = self.blkarr.past_end_blk_nr() - begin;
        while remaining > 0 {
            let chunk = remaining.min(0xffff) as u16;
            self.blkarr.shrink_by_blocks(chunk)?;
            remaining -= chunk as u32;
        }
        self.tail = TailAllocator::new(begin, begin);

        self.stats.reset();
        Ok(())
    }
}

/// RAII guard returned by [`SegmentAllocator::block_all_alloc_dealloc_guard`].
/// Unblocks on drop unless already released.
pub struct BlockGuard<'a> {
    depth: &'a Cell<u32>,
    released: bool,
}

impl<'a> BlockGuard<'a> {
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if !self.released {
            self.depth.set(self.depth.get() - 1);
            self.released = true;
        }
    }
}

impl<'a> Drop for BlockGuard<'a> {
    fn drop(&mut self) {
        self.do_release();
    }
}
