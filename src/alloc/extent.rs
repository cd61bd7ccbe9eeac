//! The [`Extent`] type: the unit of allocation handed out by every
//! allocator in this crate.
//!
//! The on-disk format packs an extent into a 32-bit block number with a
//! flag bit borrowed from its high bits plus a dual-purpose 16-bit word
//! (block count, or a sub-block bitmap). In memory we keep those two
//! meanings apart with a tagged enum instead, and only pack/unpack at the
//! wire boundary ([`super::segment`]).

use crate::error::{return_errno_with_msg, Errno, Result};

/// log2 of how many sub-blocks fit in one block.
pub const SUBBLK_SIZE_ORDER: u32 = 4;
/// How many sub-blocks fit in one block (16).
pub const SUBBLK_CNT_PER_BLK: u32 = 1 << SUBBLK_SIZE_ORDER;

/// A contiguous run of whole blocks, a set of sub-blocks carved out of a
/// single shared block, or nothing at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    /// `blk_cnt` contiguous blocks starting at `blk_nr`. `blk_cnt` is never
    /// zero for a constructed `Whole` extent.
    Whole { blk_nr: u32, blk_cnt: u16 },
    /// A single shared block at `blk_nr`; `bitmap` has one bit set per
    /// sub-block that belongs to this extent (bit 0 = sub-block 0, the
    /// lowest address).
    Suballoc { blk_nr: u32, bitmap: u16 },
    /// The absence of an extent (`blk_nr` would be 0).
    Null,
}

// Keeps this the size of two machine words, not a boxed/indirect value:
// iterators over free maps hand these out by copy.
static_assertions::const_assert!(std::mem::size_of::<Extent>() <= 8);

impl Extent {
    pub fn whole(blk_nr: u32, blk_cnt: u16) -> Self {
        debug_assert_ne!(blk_nr, 0);
        debug_assert_ne!(blk_cnt, 0);
        Extent::Whole { blk_nr, blk_cnt }
    }

    pub fn suballoc(blk_nr: u32, bitmap: u16) -> Self {
        debug_assert_ne!(blk_nr, 0);
        debug_assert_ne!(bitmap, 0);
        Extent::Suballoc { blk_nr, bitmap }
    }

    pub fn is_suballoc(&self) -> bool {
        matches!(self, Extent::Suballoc { .. })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Extent::Null)
    }

    pub fn blk_nr(&self) -> u32 {
        match self {
            Extent::Whole { blk_nr, .. } | Extent::Suballoc { blk_nr, .. } => *blk_nr,
            Extent::Null => 0,
        }
    }

    /// Number of whole blocks. Panics on a `Suballoc` or `Null` extent.
    pub fn blk_cnt(&self) -> u16 {
        match self {
            Extent::Whole { blk_cnt, .. } => *blk_cnt,
            _ => panic!("blk_cnt() called on a non-whole extent"),
        }
    }

    /// The sub-block bitmap. Panics on a non-`Suballoc` extent.
    pub fn bitmap(&self) -> u16 {
        match self {
            Extent::Suballoc { bitmap, .. } => *bitmap,
            _ => panic!("bitmap() called on a non-suballoc extent"),
        }
    }

    /// Number of "slots" consumed for the purposes of distance/near-jump
    /// calculations: one for a sub-alloc extent (it occupies one block
    /// regardless of how many sub-blocks are set), `blk_cnt` for a whole
    /// extent.
    fn slot_cnt(&self) -> u32 {
        match self {
            Extent::Whole { blk_cnt, .. } => *blk_cnt as u32,
            Extent::Suballoc { .. } => 1,
            Extent::Null => 0,
        }
    }

    pub fn past_end_blk_nr(&self) -> u32 {
        self.blk_nr() + self.slot_cnt()
    }

    /// Shrinks a whole-block extent in place, dropping blocks from its tail.
    pub fn shrink_by(&mut self, cnt: u16) {
        match self {
            Extent::Whole { blk_cnt, .. } => {
                debug_assert!(cnt <= *blk_cnt);
                *blk_cnt -= cnt;
            }
            _ => panic!("shrink_by() called on a non-whole extent"),
        }
    }

    /// Bytes of real, addressable data this extent provides.
    pub fn calc_usable_space_size(&self, blk_sz_order: u32) -> u32 {
        match self {
            Extent::Null => 0,
            Extent::Suballoc { bitmap, .. } => {
                bitmap.count_ones() << (blk_sz_order - SUBBLK_SIZE_ORDER)
            }
            Extent::Whole { blk_cnt, .. } => (*blk_cnt as u32) << blk_sz_order,
        }
    }

    /// Computes how far `target` sits from `ref_`, for the purposes of the
    /// segment wire codec's near-jump encoding. Fails if the two extents
    /// overlap or start at the same block.
    pub fn distance_in_blks(ref_: &Extent, target: &Extent) -> Result<BlkDistance> {
        let ref_cnt = ref_.slot_cnt();
        let target_cnt = target.slot_cnt();

        if ref_.blk_nr() < target.blk_nr() {
            let forward = target.blk_nr() - ref_.blk_nr();
            if forward < ref_cnt {
                return_errno_with_msg!(
                    Errno::ExtentOverlap,
                    "extent at blk {} overlaps reference at blk {} (ext start is ahead ref)",
                    target.blk_nr(),
                    ref_.blk_nr()
                );
            }
            let blk_cnt = forward - ref_cnt;
            Ok(BlkDistance { blk_cnt, is_backwards: false, is_near: blk_cnt <= 0x1ff })
        } else if target.blk_nr() < ref_.blk_nr() {
            let backward = ref_.blk_nr() - target.blk_nr();
            if backward < target_cnt {
                return_errno_with_msg!(
                    Errno::ExtentOverlap,
                    "extent at blk {} overlaps reference at blk {} (ext start is behind ref)",
                    target.blk_nr(),
                    ref_.blk_nr()
                );
            }
            let blk_cnt = backward - target_cnt;
            Ok(BlkDistance { blk_cnt, is_backwards: true, is_near: blk_cnt <= 0x1ff })
        } else {
            return_errno_with_msg!(
                Errno::ExtentOverlap,
                "extent and reference both start at blk {} (at same start)",
                ref_.blk_nr()
            );
        }
    }
}

/// Distance between two extents, as computed by [`Extent::distance_in_blks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlkDistance {
    pub blk_cnt: u32,
    pub is_backwards: bool,
    /// True when `blk_cnt` fits the 9-bit jump-offset field used by the
    /// segment codec's near encoding.
    pub is_near: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_extent_basics() {
        let e = Extent::whole(10, 5);
        assert_eq!(e.blk_nr(), 10);
        assert_eq!(e.blk_cnt(), 5);
        assert_eq!(e.past_end_blk_nr(), 15);
        assert!(!e.is_suballoc());
    }

    #[test]
    fn suballoc_extent_basics() {
        let e = Extent::suballoc(7, 0b1010_0000_0000_0001);
        assert_eq!(e.blk_nr(), 7);
        assert_eq!(e.bitmap(), 0b1010_0000_0000_0001);
        assert_eq!(e.past_end_blk_nr(), 8);
        assert!(e.is_suballoc());
    }

    #[test]
    fn shrink_whole_extent() {
        let mut e = Extent::whole(100, 10);
        e.shrink_by(4);
        assert_eq!(e.blk_cnt(), 6);
    }

    #[test]
    fn distance_forward_is_near() {
        let a = Extent::whole(10, 5);
        let b = Extent::whole(20, 3);
        let d = Extent::distance_in_blks(&a, &b).unwrap();
        assert_eq!(d.blk_cnt, 5);
        assert!(!d.is_backwards);
        assert!(d.is_near);
    }

    #[test]
    fn distance_backward() {
        let a = Extent::whole(100, 5);
        let b = Extent::whole(10, 3);
        let d = Extent::distance_in_blks(&a, &b).unwrap();
        assert_eq!(d.blk_cnt, 100 - 10 - 3);
        assert!(d.is_backwards);
    }

    #[test]
    fn distance_far_is_not_near() {
        let a = Extent::whole(10, 1);
        let b = Extent::whole(10 + 0x1ff + 1 + 1, 1);
        let d = Extent::distance_in_blks(&a, &b).unwrap();
        assert!(!d.is_near);
    }

    #[test]
    fn overlap_same_start_errors() {
        let a = Extent::whole(10, 5);
        let b = Extent::whole(10, 2);
        let err = Extent::distance_in_blks(&a, &b).unwrap_err();
        assert_eq!(err.errno(), Errno::ExtentOverlap);
    }

    #[test]
    fn overlap_ahead_errors() {
        let a = Extent::whole(10, 5);
        let b = Extent::whole(12, 2);
        let err = Extent::distance_in_blks(&a, &b).unwrap_err();
        assert_eq!(err.errno(), Errno::ExtentOverlap);
    }

    #[test]
    fn usable_space_whole_and_suballoc() {
        let whole = Extent::whole(1, 3);
        assert_eq!(whole.calc_usable_space_size(12), 3 << 12);

        let sub = Extent::suballoc(1, 0b0000_0000_0000_0111);
        assert_eq!(sub.calc_usable_space_size(12), 3 << (12 - SUBBLK_SIZE_ORDER));
    }
}
