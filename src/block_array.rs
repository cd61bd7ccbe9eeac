//! [`BlockArray`]: the storage collaborator this crate allocates space on
//! top of.
//!
//! The allocator never reads or writes bytes itself; it only hands out and
//! takes back extents. Growing or shrinking the array, and reading or
//! writing the bytes an extent covers, is this trait's job. [`VecBlockArray`]
//! is a minimal in-memory implementation used by this crate's own tests and
//! demos.

use crate::alloc::extent::{Extent, SUBBLK_SIZE_ORDER};
use crate::error::{return_errno_with_msg, Errno, Result};

/// A byte-addressable array of fixed-size blocks that only grows or
/// shrinks at its tail.
pub trait BlockArray {
    /// log2 of the block size in bytes.
    fn blk_sz_order(&self) -> u32;

    fn blk_sz(&self) -> u32 {
        1 << self.blk_sz_order()
    }

    fn subblk_sz(&self) -> u32 {
        1 << (self.blk_sz_order() - SUBBLK_SIZE_ORDER)
    }

    fn begin_blk_nr(&self) -> u32;
    fn past_end_blk_nr(&self) -> u32;

    fn blk_cnt(&self) -> u32 {
        self.past_end_blk_nr() - self.begin_blk_nr()
    }

    /// Grows the array by `blk_cnt` blocks and returns the number of the
    /// first newly-available block.
    fn grow_by_blocks(&mut self, blk_cnt: u16) -> Result<u32>;

    /// Shrinks the array by `blk_cnt` blocks from the tail.
    fn shrink_by_blocks(&mut self, blk_cnt: u16) -> Result<()>;

    /// Reads up to `max` bytes of `ext`'s usable space, starting `start`
    /// bytes into it, into `out`. Returns the number of bytes actually read.
    fn read_extent(&self, ext: &Extent, out: &mut [u8], max: usize, start: usize) -> Result<usize>;
    /// Writes up to `max` bytes from `data` into `ext`'s usable space,
    /// starting `start` bytes into it. Returns the number of bytes written.
    fn write_extent(&mut self, ext: &Extent, data: &[u8], max: usize, start: usize) -> Result<usize>;

    fn is_extent_within_boundaries(&self, ext: &Extent) -> bool {
        ext.blk_nr() >= self.begin_blk_nr()
            && ext.blk_nr() < self.past_end_blk_nr()
            && ext.past_end_blk_nr() <= self.past_end_blk_nr()
    }

    fn fail_if_out_of_boundaries(&self, ext: &Extent, context: &str) -> Result<()> {
        if !self.is_extent_within_boundaries(ext) {
            return_errno_with_msg!(
                Errno::ExtentOutOfBounds,
                "extent [{}, {}) falls outside [{}, {}). {}",
                ext.blk_nr(),
                ext.past_end_blk_nr(),
                self.begin_blk_nr(),
                self.past_end_blk_nr(),
                context
            );
        }
        Ok(())
    }
}

/// A plain `Vec<u8>`-backed block array, for tests and the demo binary.
pub struct VecBlockArray {
    blk_sz_order: u32,
    data: Vec<u8>,
}

impl VecBlockArray {
    pub fn new(blk_sz_order: u32) -> Self {
        Self { blk_sz_order, data: Vec::new() }
    }
}

impl BlockArray for VecBlockArray {
    fn blk_sz_order(&self) -> u32 {
        self.blk_sz_order
    }

    fn begin_blk_nr(&self) -> u32 {
        // block 0 is reserved as the null extent sentinel, so the array's
        // first real block is numbered 1.
        1
    }

    fn past_end_blk_nr(&self) -> u32 {
        self.begin_blk_nr() + ((self.data.len() as u32) >> self.blk_sz_order)
    }

    fn grow_by_blocks(&mut self, blk_cnt: u16) -> Result<u32> {
        let first = self.past_end_blk_nr();
        self.data.resize(self.data.len() + (blk_cnt as usize) * self.blk_sz() as usize, 0);
        Ok(first)
    }

    fn shrink_by_blocks(&mut self, blk_cnt: u16) -> Result<()> {
        let shrink_by = (blk_cnt as usize) * self.blk_sz() as usize;
        if shrink_by > self.data.len() {
            return_errno_with_msg!(Errno::InvalidArgs, "cannot shrink by more blocks than exist");
        }
        let new_len = self.data.len() - shrink_by;
        self.data.truncate(new_len);
        Ok(())
    }

    fn read_extent(&self, ext: &Extent, out: &mut [u8], max: usize, start: usize) -> Result<usize> {
        self.fail_if_out_of_boundaries(ext, "VecBlockArray::read_extent")?;
        let ext_base = (ext.blk_nr() - self.begin_blk_nr()) as usize * self.blk_sz() as usize;
        let usable = ext.calc_usable_space_size(self.blk_sz_order) as usize;
        if start > usable {
            return_errno_with_msg!(Errno::InvalidArgs, "read start {} is past the extent's {} usable bytes", start, usable);
        }
        let len = (usable - start).min(max).min(out.len());
        let from = ext_base + start;
        out[..len].copy_from_slice(&self.data[from..from + len]);
        Ok(len)
    }

    fn write_extent(&mut self, ext: &Extent, data: &[u8], max: usize, start: usize) -> Result<usize> {
        self.fail_if_out_of_boundaries(ext, "VecBlockArray::write_extent")?;
        let ext_base = (ext.blk_nr() - self.begin_blk_nr()) as usize * self.blk_sz() as usize;
        let usable = ext.calc_usable_space_size(self.blk_sz_order) as usize;
        if start > usable {
            return_errno_with_msg!(Errno::InvalidArgs, "write start {} is past the extent's {} usable bytes", start, usable);
        }
        let len = (usable - start).min(max).min(data.len());
        let from = ext_base + start;
        self.data[from..from + len].copy_from_slice(&data[..len]);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_and_shrink_tail() {
        let mut arr = VecBlockArray::new(12);
        let first = arr.grow_by_blocks(4).unwrap();
        assert_eq!(first, 1);
        assert_eq!(arr.past_end_blk_nr(), 5);
        arr.shrink_by_blocks(2).unwrap();
        assert_eq!(arr.past_end_blk_nr(), 3);
    }

    #[test]
    fn write_then_read_extent() {
        let mut arr = VecBlockArray::new(9); // 512-byte blocks
        arr.grow_by_blocks(2).unwrap();
        let ext = Extent::whole(1, 2);
        arr.write_extent(&ext, &[42u8; 1024], 1024, 0).unwrap();
        let mut out = [0u8; 1024];
        arr.read_extent(&ext, &mut out, 1024, 0).unwrap();
        assert_eq!(&out[..], &[42u8; 1024][..]);
    }

    #[test]
    fn read_extent_honors_start_offset() {
        let mut arr = VecBlockArray::new(9); // 512-byte blocks
        arr.grow_by_blocks(1).unwrap();
        let ext = Extent::whole(1, 1);
        let mut payload = [0u8; 512];
        payload[100] = 7;
        arr.write_extent(&ext, &payload, 512, 0).unwrap();
        let mut out = [0u8; 4];
        let n = arr.read_extent(&ext, &mut out, 4, 100).unwrap();
        assert_eq!(n, 4);
        assert_eq!(out[0], 7);
    }

    #[test]
    fn out_of_bounds_extent_is_rejected() {
        let mut arr = VecBlockArray::new(9);
        arr.grow_by_blocks(1).unwrap();
        let ext = Extent::whole(6, 1);
        let mut out = [0u8; 512];
        let err = arr.read_extent(&ext, &mut out, 512, 0).unwrap_err();
        assert_eq!(err.errno(), Errno::ExtentOutOfBounds);
    }
}
