//! [`SubBlockFreeMap`]: tracks blocks that are only partially free, as
//! 16-bit sub-block bitmaps.
//!
//! Free bitmaps are bucketed into 16 bins by popcount (bin `i` holds
//! bitmaps with `i + 1` free sub-blocks). Allocation takes the
//! most-recently-freed entry of the smallest bin that can satisfy the
//! request (LIFO within a bin), which keeps the common case O(1) at the
//! cost of not load-balancing wear across same-sized candidates.

use std::collections::BTreeMap;

use crate::alloc::extent::{Extent, SUBBLK_CNT_PER_BLK};
use crate::alloc::tail::AllocResult;
use crate::error::{return_errno_with_msg, Errno, Result};

const BIN_CNT: usize = SUBBLK_CNT_PER_BLK as usize;

#[derive(Debug, Default)]
pub struct SubBlockFreeMap {
    // bin[i] holds the blk_nr of blocks with i + 1 free sub-blocks,
    // most-recently-freed last.
    bins: [Vec<u32>; 16],
    by_nr: BTreeMap<u32, u16>,
}

impl SubBlockFreeMap {
    pub fn new() -> Self {
        Self { bins: Default::default(), by_nr: BTreeMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.by_nr.is_empty()
    }

    pub fn clear(&mut self) {
        for bin in &mut self.bins {
            bin.clear();
        }
        self.by_nr.clear();
    }

    fn fail_if_not_subblk_or_zero_cnt(ext: &Extent) -> Result<()> {
        if !ext.is_suballoc() {
            return_errno_with_msg!(Errno::InvalidArgs, "SubBlockFreeMap only tracks suballoc extents");
        }
        if ext.bitmap() == 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "cannot free a suballoc extent with an empty bitmap");
        }
        Ok(())
    }

    fn bin_of(bitmap: u16) -> usize {
        (bitmap.count_ones() - 1) as usize
    }

    /// Marks every extent in `exts` as free.
    pub fn assign_as_freed<'a>(&mut self, exts: impl IntoIterator<Item = &'a Extent>) -> Result<()> {
        for ext in exts {
            self.dealloc(*ext)?;
        }
        Ok(())
    }

    /// Allocates `subblk_cnt` sub-blocks out of a single shared block.
    ///
    /// Scans bins from `subblk_cnt - 1` up to 15 and takes the last
    /// (most-recently-pushed) entry of the first non-empty bin. This
    /// intentionally favors reuse of recently-freed blocks over spreading
    /// load across same-sized candidates.
    pub fn alloc(&mut self, subblk_cnt: u8) -> Result<AllocResult> {
        if subblk_cnt == 0 || subblk_cnt as u32 > SUBBLK_CNT_PER_BLK {
            return_errno_with_msg!(
                Errno::InvalidArgs,
                "subblock count out of range: given {} but max is {} subblocks",
                subblk_cnt,
                SUBBLK_CNT_PER_BLK
            );
        }

        for bin in (subblk_cnt as usize - 1)..BIN_CNT {
            let Some(blk_nr) = self.bins[bin].pop() else { continue };
            let free_bitmap = *self.by_nr.get(&blk_nr).expect("bin/by_nr out of sync");

            let mut allocated: u16 = 0;
            let mut remaining = free_bitmap;
            let mut need = subblk_cnt;
            for i in (0..16).rev() {
                if need == 0 {
                    break;
                }
                let bit = 1u16 << i;
                if remaining & bit != 0 {
                    remaining &= !bit;
                    allocated |= bit;
                    need -= 1;
                }
            }
            debug_assert_eq!(need, 0);

            if remaining == 0 {
                self.by_nr.remove(&blk_nr);
            } else {
                self.by_nr.insert(blk_nr, remaining);
                self.bins[Self::bin_of(remaining)].push(blk_nr);
            }

            return Ok(AllocResult { ext: Extent::suballoc(blk_nr, allocated), success: true });
        }

        Ok(AllocResult { ext: Extent::Null, success: false })
    }

    /// Frees the sub-blocks described by `ext`. Does not reclaim blocks
    /// that become entirely free; call [`SubBlockFreeMap::release_full_blocks`]
    /// for that.
    pub fn dealloc(&mut self, ext: Extent) -> Result<()> {
        Self::fail_if_not_subblk_or_zero_cnt(&ext)?;

        let blk_nr = ext.blk_nr();
        let freed_bits = ext.bitmap();

        let current = self.by_nr.get(&blk_nr).copied();
        if let Some(free_bitmap) = current {
            if freed_bits & free_bitmap != 0 {
                return_errno_with_msg!(
                    Errno::ExtentOverlap,
                    "possible double free detected: blk {} bitmap {:#06x} overlaps free bits {:#06x}",
                    blk_nr,
                    freed_bits,
                    free_bitmap
                );
            }
            let old_bin = Self::bin_of(free_bitmap);
            let pos = self.bins[old_bin]
                .iter()
                .rposition(|&nr| nr == blk_nr)
                .expect("by_nr entry missing from its bin");
            self.bins[old_bin].remove(pos);

            let new_bitmap = free_bitmap | freed_bits;
            self.by_nr.insert(blk_nr, new_bitmap);
            self.bins[Self::bin_of(new_bitmap)].push(blk_nr);
        } else {
            self.by_nr.insert(blk_nr, freed_bits);
            self.bins[Self::bin_of(freed_bits)].push(blk_nr);
        }

        Ok(())
    }

    /// Pulls every block whose bitmap is now entirely free (bin 15) out of
    /// this map, for the caller to hand over to [`super::free_map::FreeMap`].
    pub fn release_full_blocks(&mut self) -> Vec<u32> {
        let full = std::mem::take(&mut self.bins[15]);
        for &nr in &full {
            self.by_nr.remove(&nr);
        }
        full
    }

    pub fn iter_by_blk_nr(&self) -> impl Iterator<Item = Extent> + '_ {
        self.by_nr.iter().map(|(&nr, &bitmap)| Extent::suballoc(nr, bitmap))
    }

    #[cfg(test)]
    fn count_entries_in_bins(&self) -> usize {
        self.bins.iter().map(|b| b.len()).sum()
    }

    #[cfg(test)]
    fn check_invariant(&self) {
        assert_eq!(self.by_nr.len(), self.count_entries_in_bins());
    }
}
