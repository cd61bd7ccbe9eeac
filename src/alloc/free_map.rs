//! [`FreeMap`]: tracks whole free blocks available for reuse.
//!
//! Two cross-indexed maps back the same set of free extents: `by_nr`
//! (block number to count, used for neighbor lookups and coalescing) and
//! `by_cnt` (count to block number, used for best-fit search). Keeping
//! them in lockstep is this module's whole job.

use std::collections::{BTreeMap, BTreeSet};

use crate::alloc::extent::Extent;
use crate::alloc::tail::AllocResult;
use crate::error::{return_errno_with_msg, Errno, Result};

#[derive(Debug, Default)]
pub struct FreeMap {
    coalescing_enabled: bool,
    split_above_threshold: u16,
    by_nr: BTreeMap<u32, u16>,
    by_cnt: BTreeSet<(u16, u32)>,
}

impl FreeMap {
    pub fn new(coalescing_enabled: bool, split_above_threshold: u16) -> Self {
        Self {
            coalescing_enabled,
            split_above_threshold,
            by_nr: BTreeMap::new(),
            by_cnt: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_nr.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_nr.clear();
        self.by_cnt.clear();
    }

    fn fail_if_suballoc_or_zero_cnt(ext: &Extent) -> Result<()> {
        if ext.is_suballoc() {
            return_errno_with_msg!(Errno::InvalidArgs, "FreeMap only tracks whole-block extents");
        }
        if ext.blk_cnt() == 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "cannot free an extent of 0 blocks");
        }
        Ok(())
    }

    /// Checks `ext` against its would-be neighbors in `by_nr` and fails if
    /// it overlaps either of them. This is the allocator's main defense
    /// against double frees.
    fn fail_if_overlap(&self, ext: &Extent) -> Result<()> {
        let mut candidates = Vec::new();
        if let Some((&nr, &cnt)) = self.by_nr.range(..=ext.blk_nr()).next_back() {
            candidates.push(Extent::whole(nr, cnt));
        }
        if let Some((&nr, &cnt)) = self.by_nr.range(ext.blk_nr()..).next() {
            candidates.push(Extent::whole(nr, cnt));
        }
        for other in candidates {
            if other.blk_nr() == ext.blk_nr() {
                return_errno_with_msg!(
                    Errno::ExtentOverlap,
                    "possible double free detected: blk {} already freed",
                    ext.blk_nr()
                );
            }
            if Extent::distance_in_blks(&other, ext).is_err() {
                return_errno_with_msg!(
                    Errno::ExtentOverlap,
                    "possible double free detected: extent [{}, {}) overlaps an already-freed extent [{}, {})",
                    ext.blk_nr(),
                    ext.past_end_blk_nr(),
                    other.blk_nr(),
                    other.past_end_blk_nr()
                );
            }
        }
        Ok(())
    }

    fn insert(&mut self, blk_nr: u32, blk_cnt: u16) {
        self.by_nr.insert(blk_nr, blk_cnt);
        self.by_cnt.insert((blk_cnt, blk_nr));
    }

    fn remove(&mut self, blk_nr: u32, blk_cnt: u16) {
        self.by_nr.remove(&blk_nr);
        self.by_cnt.remove(&(blk_cnt, blk_nr));
    }

    /// Marks every extent in `exts` as free. Equivalent to calling
    /// [`FreeMap::dealloc`] for each one.
    pub fn assign_as_freed<'a>(&mut self, exts: impl IntoIterator<Item = &'a Extent>) -> Result<()> {
        for ext in exts {
            self.dealloc(*ext)?;
        }
        Ok(())
    }

    /// Best-fit allocation of `blk_cnt` blocks.
    ///
    /// Looks up the smallest free extent at least `blk_cnt` blocks long. If
    /// using it would leave a splinter smaller than
    /// `split_above_threshold + 1` blocks, the search is retried against a
    /// larger candidate to avoid fragmenting the map with unusable slivers.
    /// On failure, `ext.blk_cnt()` in the result names the largest free
    /// extent strictly smaller than `blk_cnt`, as a hint the caller could
    /// retry with (0 if no such extent exists).
    pub fn alloc(&mut self, blk_cnt: u16) -> Result<AllocResult> {
        if blk_cnt == 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "cannot allocate an extent of 0 blocks");
        }

        let retry_hint = self.by_cnt.range(..(blk_cnt, 0)).next_back().map(|&(cnt, _)| cnt).unwrap_or(0);

        let mut search_from = blk_cnt;
        loop {
            let found = self.by_cnt.range((search_from, 0)..).next().copied();
            let Some((found_cnt, found_nr)) = found else {
                return Ok(AllocResult {
                    ext: Extent::Whole { blk_nr: 0, blk_cnt: retry_hint },
                    success: false,
                });
            };

            if found_cnt == blk_cnt {
                self.remove(found_nr, found_cnt);
                return Ok(AllocResult { ext: Extent::whole(found_nr, blk_cnt), success: true });
            }

            let remain = found_cnt - blk_cnt;
            if remain <= self.split_above_threshold {
                match search_from.checked_add(self.split_above_threshold + 1) {
                    Some(next) if next > blk_cnt => {
                        search_from = next;
                        continue;
                    }
                    _ => {
                        return Ok(AllocResult {
                            ext: Extent::Whole { blk_nr: 0, blk_cnt: retry_hint },
                            success: false,
                        });
                    }
                }
            }

            self.remove(found_nr, found_cnt);
            let new_nr = found_nr + blk_cnt as u32;
            self.insert(new_nr, remain);
            return Ok(AllocResult { ext: Extent::whole(found_nr, blk_cnt), success: true });
        }
    }

    /// Frees `ext`, coalescing with adjacent free extents when enabled.
    pub fn dealloc(&mut self, ext: Extent) -> Result<()> {
        Self::fail_if_suballoc_or_zero_cnt(&ext)?;
        self.fail_if_overlap(&ext)?;

        if !self.coalescing_enabled {
            self.insert(ext.blk_nr(), ext.blk_cnt());
            return Ok(());
        }

        let mut blk_nr = ext.blk_nr();
        let mut blk_cnt = ext.blk_cnt();

        if let Some((&next_nr, &next_cnt)) = self.by_nr.range((blk_nr + blk_cnt as u32)..).next() {
            if next_nr == blk_nr + blk_cnt as u32 {
                self.remove(next_nr, next_cnt);
                blk_cnt += next_cnt;
            }
        }

        if let Some((&prev_nr, &prev_cnt)) = self.by_nr.range(..blk_nr).next_back() {
            if prev_nr + prev_cnt as u32 == blk_nr {
                self.remove(prev_nr, prev_cnt);
                blk_nr = prev_nr;
                blk_cnt += prev_cnt;
            }
        }

        self.insert(blk_nr, blk_cnt);
        Ok(())
    }

    /// Removes `ext` from the map. Unlike [`FreeMap::dealloc`], this
    /// expects an exact match (same block number and count) and is used
    /// to take back space previously handed over via `assign_as_freed`.
    pub fn release(&mut self, ext: &Extent) -> Result<()> {
        match self.by_nr.get(&ext.blk_nr()) {
            Some(&cnt) if cnt == ext.blk_cnt() => {
                self.remove(ext.blk_nr(), cnt);
                Ok(())
            }
            _ => return_errno_with_msg!(
                Errno::InconsistentState,
                "no such free extent at blk {} with count {}",
                ext.blk_nr(),
                ext.blk_cnt()
            ),
        }
    }

    pub fn iter_by_blk_nr(&self) -> impl Iterator<Item = Extent> + '_ {
        self.by_nr.iter().map(|(&nr, &cnt)| Extent::whole(nr, cnt))
    }

    /// The highest-numbered free extent, if any. Used to find extents that
    /// abut the tail and can be handed back to it.
    pub fn highest(&self) -> Option<Extent> {
        self.by_nr.iter().next_back().map(|(&nr, &cnt)| Extent::whole(nr, cnt))
    }

    pub fn iter_by_blk_cnt(&self) -> impl Iterator<Item = Extent> + '_ {
        self.by_cnt.iter().map(|&(cnt, nr)| Extent::whole(nr, cnt))
    }

    pub fn largest_free_cnt(&self) -> u16 {
        self.by_cnt.iter().next_back().map(|&(cnt, _)| cnt).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_exact_match() {
        let mut fm = FreeMap::new(true, 0);
        fm.dealloc(Extent::whole(10, 4)).unwrap();
        let r = fm.alloc(4).unwrap();
        assert!(r.success);
        assert_eq!(r.ext, Extent::whole(10, 4));
        assert!(fm.is_empty());
    }

    #[test]
    fn alloc_splits_larger_extent() {
        let mut fm = FreeMap::new(true, 0);
        fm.dealloc(Extent::whole(10, 10)).unwrap();
        let r = fm.alloc(4).unwrap();
        assert!(r.success);
        assert_eq!(r.ext, Extent::whole(10, 4));
        let remaining: Vec<_> = fm.iter_by_blk_nr().collect();
        assert_eq!(remaining, vec![Extent::whole(14, 6)]);
    }

    #[test]
    fn alloc_skips_splinter_below_threshold() {
        let mut fm = FreeMap::new(true, 2);
        // An exact-fit-plus-1 chunk would leave a 1-block splinter, below
        // the threshold of 2, so it must be skipped in favor of a bigger one.
        fm.dealloc(Extent::whole(10, 5)).unwrap();
        fm.dealloc(Extent::whole(100, 20)).unwrap();
        let r = fm.alloc(4).unwrap();
        assert!(r.success);
        assert_eq!(r.ext.blk_nr(), 100);
    }

    #[test]
    fn alloc_failure_hints_the_largest_extent_smaller_than_the_request() {
        let mut fm = FreeMap::new(true, 1);
        fm.dealloc(Extent::whole(4, 1)).unwrap();
        fm.dealloc(Extent::whole(8, 3)).unwrap();
        // The 3-block extent would leave a 1-block splinter, at the
        // threshold, so it's rejected; the 1-block extent is too small to
        // satisfy the request outright. Failure hints the caller could
        // retry with 1 block, the best they could actually get.
        let r = fm.alloc(2).unwrap();
        assert!(!r.success);
        assert_eq!(r.ext.blk_cnt(), 1);

        fm.alloc(1).unwrap(); // consumes the (4,1) extent entirely
        let r = fm.alloc(2).unwrap();
        assert!(!r.success);
        assert_eq!(r.ext.blk_cnt(), 0);
    }

    #[test]
    fn alloc_fails_on_empty_map() {
        let mut fm = FreeMap::new(true, 0);
        let r = fm.alloc(4).unwrap();
        assert!(!r.success);
    }

    #[test]
    fn dealloc_coalesces_both_neighbors() {
        let mut fm = FreeMap::new(true, 0);
        fm.dealloc(Extent::whole(1, 5)).unwrap();
        fm.dealloc(Extent::whole(11, 5)).unwrap();
        fm.dealloc(Extent::whole(6, 5)).unwrap();
        let merged: Vec<_> = fm.iter_by_blk_nr().collect();
        assert_eq!(merged, vec![Extent::whole(1, 15)]);
    }

    #[test]
    fn freed_extents_match_an_independently_built_index() {
        // Cross-checks iter_by_blk_nr() against a plain map built the same
        // way a caller inspecting free space from the outside would.
        let mut fm = FreeMap::new(false, 0);
        let mut expected: hashbrown::HashMap<u32, u16> = hashbrown::HashMap::new();
        for (blk_nr, blk_cnt) in [(10u32, 4u16), (50, 8), (100, 1)] {
            fm.dealloc(Extent::whole(blk_nr, blk_cnt)).unwrap();
            expected.insert(blk_nr, blk_cnt);
        }
        for ext in fm.iter_by_blk_nr() {
            assert_eq!(expected.get(&ext.blk_nr()), Some(&ext.blk_cnt()));
        }
        assert_eq!(fm.iter_by_blk_nr().count(), expected.len());
    }

    #[test]
    fn dealloc_double_free_is_rejected() {
        let mut fm = FreeMap::new(true, 0);
        fm.dealloc(Extent::whole(10, 5)).unwrap();
        let err = fm.dealloc(Extent::whole(10, 5)).unwrap_err();
        assert_eq!(err.errno(), Errno::ExtentOverlap);
    }

    #[test]
    fn dealloc_overlap_is_rejected() {
        let mut fm = FreeMap::new(true, 0);
        fm.dealloc(Extent::whole(10, 5)).unwrap();
        let err = fm.dealloc(Extent::whole(12, 5)).unwrap_err();
        assert_eq!(err.errno(), Errno::ExtentOverlap);
    }
}
