//! [`TailAllocator`]: grows or shrinks the high-water mark of the block
//! array. This is the allocator of last resort, used once the free-space
//! maps have nothing usable to offer.

use crate::alloc::extent::Extent;
use crate::error::{return_errno_with_msg, Errno, Result};

/// Result of an allocation attempt, mirroring the allocators this one is
/// paired with: a constructed extent plus whether it actually succeeded.
#[derive(Debug, Clone, Copy)]
pub struct AllocResult {
    pub ext: Extent,
    pub success: bool,
}

/// Tracks `[begin_blk, past_end_blk)`, the live range of the block array.
/// Allocating grows `past_end_blk`; deallocating an extent that sits
/// exactly at the tail shrinks it back.
#[derive(Debug, Clone, Copy)]
pub struct TailAllocator {
    begin_blk: u32,
    past_end_blk: u32,
}

impl TailAllocator {
    pub fn new(begin_blk: u32, past_end_blk: u32) -> Self {
        debug_assert!(begin_blk <= past_end_blk);
        Self { begin_blk, past_end_blk }
    }

    pub fn begin_blk(&self) -> u32 {
        self.begin_blk
    }

    pub fn past_end_blk(&self) -> u32 {
        self.past_end_blk
    }

    pub fn blk_cnt(&self) -> u32 {
        self.past_end_blk - self.begin_blk
    }

    /// Grows the tail by `blk_cnt` blocks and returns the fresh extent.
    /// Always succeeds: there is no upper bound on the tail short of the
    /// block number space itself.
    pub fn alloc(&mut self, blk_cnt: u16) -> Result<AllocResult> {
        if blk_cnt == 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "cannot allocate an extent of 0 blocks");
        }
        let blk_nr = self.past_end_blk;
        self.past_end_blk += blk_cnt as u32;
        Ok(AllocResult { ext: Extent::whole(blk_nr, blk_cnt), success: true })
    }

    /// Shrinks the tail if, and only if, `ext` sits exactly at the end of
    /// the live range. Returns `false` (not an error) when it doesn't: the
    /// extent is simply not this allocator's concern, and the caller
    /// should hand it to the free-space maps instead.
    pub fn dealloc(&mut self, ext: &Extent) -> Result<bool> {
        if ext.is_suballoc() || ext.blk_cnt() == 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "cannot deallocate a suballoc or zero-sized extent here");
        }
        if ext.blk_nr() < self.begin_blk || ext.past_end_blk_nr() > self.past_end_blk {
            return_errno_with_msg!(
                Errno::ExtentOutOfBounds,
                "extent [{}, {}) falls outside [{}, {}) (detected on TailAllocator::dealloc)",
                ext.blk_nr(),
                ext.past_end_blk_nr(),
                self.begin_blk,
                self.past_end_blk
            );
        }

        if ext.past_end_blk_nr() == self.past_end_blk {
            self.past_end_blk -= ext.blk_cnt() as u32;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn is_at_the_end(&self, ext: &Extent) -> bool {
        ext.past_end_blk_nr() == self.past_end_blk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_grows_tail() {
        let mut t = TailAllocator::new(0, 10);
        let r = t.alloc(4).unwrap();
        assert!(r.success);
        assert_eq!(r.ext, Extent::whole(10, 4));
        assert_eq!(t.past_end_blk(), 14);
    }

    #[test]
    fn dealloc_at_tail_shrinks() {
        let mut t = TailAllocator::new(0, 14);
        let ext = Extent::whole(10, 4);
        assert!(t.dealloc(&ext).unwrap());
        assert_eq!(t.past_end_blk(), 10);
    }

    #[test]
    fn dealloc_not_at_tail_returns_false_not_error() {
        let mut t = TailAllocator::new(0, 14);
        let ext = Extent::whole(2, 4);
        assert_eq!(t.dealloc(&ext).unwrap(), false);
        assert_eq!(t.past_end_blk(), 14);
    }

    #[test]
    fn dealloc_out_of_bounds_errors() {
        let mut t = TailAllocator::new(0, 14);
        let ext = Extent::whole(20, 4);
        let err = t.dealloc(&ext).unwrap_err();
        assert_eq!(err.errno(), Errno::ExtentOutOfBounds);
    }
}
