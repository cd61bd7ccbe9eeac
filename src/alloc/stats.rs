//! Allocator statistics: monotonic counters plus a few derived
//! fragmentation estimators, snapshotted across [`Stats::reset`] calls the
//! way a long-lived process periodically wants "since last checkpoint"
//! numbers without losing the lifetime totals.

use serde::{Deserialize, Serialize};

/// Histogram of how many in-use extents a segment carries. Bucket `i` for
/// `i < 5` counts segments with exactly `i` extents; the remaining three
/// buckets cover `[5, 8]`, `[9, 16]` and `17+`.
pub const IN_USE_EXT_PER_SEGM_BUCKETS: usize = 8;

fn bucket_for_ext_cnt(cnt: usize) -> usize {
    match cnt {
        0..=4 => cnt,
        5..=8 => 5,
        9..=16 => 6,
        _ => 7,
    }
}

/// A point-in-time snapshot of the counters below, used both as the
/// "current" view and as the `before_reset` baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub alloc_call_cnt: u64,
    pub dealloc_call_cnt: u64,
    pub realloc_call_cnt: u64,
    pub alloc_blk_cnt: u64,
    pub dealloc_blk_cnt: u64,
    pub alloc_suballoc_cnt: u64,
    pub dealloc_suballoc_cnt: u64,
    pub in_use_ext_per_segm: [u64; IN_USE_EXT_PER_SEGM_BUCKETS],
    pub in_use_segm_cnt: u64,
    pub in_use_blk_cnt: u64,
    pub in_use_subblk_cnt: u64,
    /// Bytes of addressable capacity currently backing live segments.
    pub in_use_by_user_sz: u64,
    /// Whole blocks currently lent out to sub-block service (tracked by
    /// the sub-block free map, not yet fully free and reclaimed).
    pub in_use_blk_for_suballoc_cnt: u64,
    /// Total extents across every currently live segment.
    pub in_use_ext_cnt: u64,
    /// Bytes currently stored inline across live segments.
    pub in_use_inlined_sz: u64,
    /// Running estimate of internal fragmentation currently outstanding:
    /// half a block per live whole-block extent, half a sub-block per live
    /// sub-alloc extent, added on allocation and subtracted on
    /// deallocation rather than recomputed from scratch each time.
    pub internal_frag_avg_sz: u64,
}

/// Live counters plus the snapshot taken at the last [`Stats::reset`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    current: Snapshot,
    before_reset: Snapshot,
    reset_cnt: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &Snapshot {
        &self.current
    }

    pub fn before_reset(&self) -> &Snapshot {
        &self.before_reset
    }

    pub fn reset_cnt(&self) -> u64 {
        self.reset_cnt
    }

    pub fn record_alloc(&mut self, blk_cnt: u16) {
        self.current.alloc_call_cnt += 1;
        self.current.alloc_blk_cnt += blk_cnt as u64;
        self.current.in_use_blk_cnt += blk_cnt as u64;
    }

    pub fn record_alloc_suballoc(&mut self, subblk_cnt: u8) {
        self.current.alloc_call_cnt += 1;
        self.current.alloc_suballoc_cnt += 1;
        self.current.in_use_subblk_cnt += subblk_cnt as u64;
    }

    pub fn record_dealloc(&mut self, blk_cnt: u16) {
        self.current.dealloc_call_cnt += 1;
        self.current.dealloc_blk_cnt += blk_cnt as u64;
        self.current.in_use_blk_cnt = self.current.in_use_blk_cnt.saturating_sub(blk_cnt as u64);
    }

    pub fn record_dealloc_suballoc(&mut self, subblk_cnt: u8) {
        self.current.dealloc_call_cnt += 1;
        self.current.dealloc_suballoc_cnt += 1;
        self.current.in_use_subblk_cnt = self.current.in_use_subblk_cnt.saturating_sub(subblk_cnt as u64);
    }

    pub fn record_realloc(&mut self) {
        self.current.realloc_call_cnt += 1;
    }

    /// Records that a segment, once the allocator finished with it, ended
    /// up with `ext_cnt` in-use extents.
    pub fn record_segment_ext_cnt(&mut self, ext_cnt: usize) {
        self.current.in_use_ext_per_segm[bucket_for_ext_cnt(ext_cnt)] += 1;
        self.current.in_use_segm_cnt += 1;
    }

    /// Fraction of a block wasted, on average, by a sub-block extent:
    /// half a sub-block, since on average half of the last partially-used
    /// block is unusable.
    pub fn internal_frag_avg_subblk(subblk_sz: u32) -> u32 {
        subblk_sz / 2
    }

    pub fn internal_frag_avg_blk(blk_sz: u32) -> u32 {
        blk_sz / 2
    }

    /// Records one extent entering live service, adding `frag_estimate` to
    /// the running internal-fragmentation gauge (see
    /// [`Stats::internal_frag_avg_blk`]/[`Stats::internal_frag_avg_subblk`]).
    pub fn record_alloc_extent(&mut self, frag_estimate: u32) {
        self.current.in_use_ext_cnt += 1;
        self.current.internal_frag_avg_sz += frag_estimate as u64;
    }

    /// Records one extent leaving live service, the inverse of
    /// [`Stats::record_alloc_extent`].
    pub fn record_dealloc_extent(&mut self, frag_estimate: u32) {
        self.current.in_use_ext_cnt = self.current.in_use_ext_cnt.saturating_sub(1);
        self.current.internal_frag_avg_sz = self.current.internal_frag_avg_sz.saturating_sub(frag_estimate as u64);
    }

    pub fn record_inline(&mut self, sz: u32) {
        self.current.in_use_inlined_sz += sz as u64;
    }

    pub fn record_remove_inline(&mut self, sz: u32) {
        self.current.in_use_inlined_sz = self.current.in_use_inlined_sz.saturating_sub(sz as u64);
    }

    pub fn record_user_bytes(&mut self, sz: u32) {
        self.current.in_use_by_user_sz += sz as u64;
    }

    pub fn record_freed_user_bytes(&mut self, sz: u32) {
        self.current.in_use_by_user_sz = self.current.in_use_by_user_sz.saturating_sub(sz as u64);
    }

    /// Records that a whole block just started serving as sub-block
    /// storage (the sub-block free map now tracks it).
    pub fn record_new_suballoc_block(&mut self) {
        self.current.in_use_blk_for_suballoc_cnt += 1;
    }

    /// Records that a block fully reclaimed from the sub-block free map
    /// went back to whole-block service.
    pub fn record_reclaimed_suballoc_block(&mut self) {
        self.current.in_use_blk_for_suballoc_cnt = self.current.in_use_blk_for_suballoc_cnt.saturating_sub(1);
    }

    /// Snapshots `current` into `before_reset`, zeroes `current`, and bumps
    /// `reset_cnt`. `in_use_*` counters reflect live state rather than
    /// activity since the last reset, so they carry over instead of
    /// zeroing with the rest.
    pub fn reset(&mut self) {
        self.before_reset = self.current;
        let carry = Snapshot {
            in_use_ext_per_segm: self.current.in_use_ext_per_segm,
            in_use_segm_cnt: self.current.in_use_segm_cnt,
            in_use_blk_cnt: self.current.in_use_blk_cnt,
            in_use_subblk_cnt: self.current.in_use_subblk_cnt,
            in_use_by_user_sz: self.current.in_use_by_user_sz,
            in_use_blk_for_suballoc_cnt: self.current.in_use_blk_for_suballoc_cnt,
            in_use_ext_cnt: self.current.in_use_ext_cnt,
            in_use_inlined_sz: self.current.in_use_inlined_sz,
            internal_frag_avg_sz: self.current.internal_frag_avg_sz,
            ..Snapshot::default()
        };
        self.current = carry;
        self.reset_cnt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_boundaries() {
        assert_eq!(bucket_for_ext_cnt(0), 0);
        assert_eq!(bucket_for_ext_cnt(4), 4);
        assert_eq!(bucket_for_ext_cnt(5), 5);
        assert_eq!(bucket_for_ext_cnt(8), 5);
        assert_eq!(bucket_for_ext_cnt(9), 6);
        assert_eq!(bucket_for_ext_cnt(16), 6);
        assert_eq!(bucket_for_ext_cnt(17), 7);
        assert_eq!(bucket_for_ext_cnt(1000), 7);
    }

    #[test]
    fn alloc_dealloc_track_in_use_blocks() {
        let mut s = Stats::new();
        s.record_alloc(5);
        s.record_alloc(3);
        s.record_dealloc(5);
        assert_eq!(s.current().in_use_blk_cnt, 3);
        assert_eq!(s.current().alloc_call_cnt, 2);
        assert_eq!(s.current().dealloc_call_cnt, 1);
    }

    #[test]
    fn extent_and_user_byte_tracking_round_trips() {
        let mut s = Stats::new();
        s.record_alloc_extent(Stats::internal_frag_avg_blk(4096));
        s.record_user_bytes(4096);
        s.record_inline(5);
        assert_eq!(s.current().in_use_ext_cnt, 1);
        assert_eq!(s.current().internal_frag_avg_sz, 2048);
        assert_eq!(s.current().in_use_by_user_sz, 4096);
        assert_eq!(s.current().in_use_inlined_sz, 5);

        s.record_dealloc_extent(Stats::internal_frag_avg_blk(4096));
        s.record_freed_user_bytes(4096);
        s.record_remove_inline(5);
        assert_eq!(s.current().in_use_ext_cnt, 0);
        assert_eq!(s.current().internal_frag_avg_sz, 0);
        assert_eq!(s.current().in_use_by_user_sz, 0);
        assert_eq!(s.current().in_use_inlined_sz, 0);
    }

    #[test]
    fn suballoc_block_lending_is_tracked() {
        let mut s = Stats::new();
        s.record_new_suballoc_block();
        s.record_new_suballoc_block();
        assert_eq!(s.current().in_use_blk_for_suballoc_cnt, 2);
        s.record_reclaimed_suballoc_block();
        assert_eq!(s.current().in_use_blk_for_suballoc_cnt, 1);
    }

    #[test]
    fn reset_zeroes_activity_counters_but_keeps_in_use_state() {
        let mut s = Stats::new();
        s.record_alloc(5);
        s.reset();
        assert_eq!(s.reset_cnt(), 1);
        assert_eq!(s.before_reset().alloc_call_cnt, 1);
        assert_eq!(s.current().alloc_call_cnt, 0);
        assert_eq!(s.current().in_use_blk_cnt, 5);
        s.record_alloc(2);
        assert_eq!(s.current().alloc_call_cnt, 1);
        assert_eq!(s.before_reset().alloc_call_cnt, 1);
    }
}
