//! [`Segment`]: an ordered list of [`Extent`]s plus an optional inline data
//! tail, and its on-the-wire codec.
//!
//! A segment's wire format packs each extent into a 16-bit header followed
//! by zero, one or two 16-bit words, and finishes with an optional inline
//! payload that is always the logical last element. This module is the one
//! place in the crate where bit-exact layout matters: get it wrong and
//! every other component that stores segments goes corrupt.

use crate::alloc::extent::Extent;
use crate::error::{return_errno_with_msg, Errno, Result};

const SUBALLOC_BIT: u16 = 1 << 15;
const INLINE_BIT: u16 = 1 << 14;
const NEAR_BIT: u16 = 1 << 10;
const BACKWARD_BIT: u16 = 1 << 9;

/// Largest blk_cnt that fits in the header's 4-bit `smallcnt` field (bits
/// 14-11). Anything bigger needs a separate 16-bit word.
const SMALLCNT_MAX: u16 = 0xf;
/// Largest inline payload a segment may carry.
pub const INLINE_SZ_MAX: usize = 63;

/// An ordered run of extents describing where a piece of data lives,
/// optionally terminated by a small inline payload stored directly in the
/// segment instead of in its own extent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segment {
    extents: Vec<Extent>,
    inline: Option<Vec<u8>>,
}

impl Segment {
    pub fn new() -> Self {
        Self { extents: Vec::new(), inline: None }
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    pub(crate) fn extents_mut(&mut self) -> &mut Vec<Extent> {
        &mut self.extents
    }

    pub fn add_extent(&mut self, ext: Extent) {
        self.extents.push(ext);
    }

    pub fn clear_extents(&mut self) {
        self.extents.clear();
    }

    pub fn inline_data(&self) -> Option<&[u8]> {
        self.inline.as_deref()
    }

    pub fn has_inline_data(&self) -> bool {
        self.inline.is_some()
    }

    pub fn set_inline_data(&mut self, data: Vec<u8>) -> Result<()> {
        if data.len() > INLINE_SZ_MAX {
            return_errno_with_msg!(
                Errno::WouldBecomeInconsistent,
                "inline data of {} bytes exceeds the {} byte maximum",
                data.len(),
                INLINE_SZ_MAX
            );
        }
        self.inline = Some(data);
        Ok(())
    }

    pub fn remove_inline_data(&mut self) {
        self.inline = None;
    }

    /// Bytes this segment occupies once encoded on the wire.
    pub fn calc_footprint_disk_size(&self) -> u32 {
        let mut sz = 0u32;
        let mut prev: Option<&Extent> = None;
        for ext in &self.extents {
            sz += 2; // header
            let near = prev
                .map(|p| Extent::distance_in_blks(p, ext).map(|d| d.is_near).unwrap_or(false))
                .unwrap_or(false);
            if !near {
                sz += 2; // lo_blk_nr word
            }
            let smallcnt_applies = !ext.is_suballoc()
                && ext.blk_cnt() >= 1
                && ext.blk_cnt() as u16 <= SMALLCNT_MAX;
            if ext.is_suballoc() || !smallcnt_applies {
                sz += 2; // wide blk_cnt/bitmap word
            }
            prev = Some(ext);
        }
        if let Some(data) = &self.inline {
            sz += 2; // header
            sz += (data.len() as u32 / 2) * 2; // rounded down to even
        }
        sz
    }

    /// Bytes of real, addressable data this segment provides.
    pub fn calc_usable_space_size(&self, blk_sz_order: u32) -> u32 {
        let mut sz: u32 = self.extents.iter().map(|e| e.calc_usable_space_size(blk_sz_order)).sum();
        if let Some(data) = &self.inline {
            sz += data.len() as u32;
        }
        sz
    }

    /// Encodes this segment to its wire format.
    ///
    /// The first extent in a segment is always written with a full block
    /// number: there is no real predecessor to jump from, so near-encoding
    /// never applies to it.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.calc_footprint_disk_size() as usize);
        let mut prev: Option<&Extent> = None;
        for ext in &self.extents {
            let is_suballoc = ext.is_suballoc();
            let blk_nr = ext.blk_nr();

            let near = match prev {
                Some(p) => Extent::distance_in_blks(p, ext)?,
                None => crate::alloc::extent::BlkDistance { blk_cnt: 0, is_backwards: false, is_near: false },
            };

            let smallcnt: u16 = if !is_suballoc && ext.blk_cnt() >= 1 && ext.blk_cnt() <= SMALLCNT_MAX {
                ext.blk_cnt()
            } else {
                0
            };

            let mut header: u16 = 0;
            if is_suballoc {
                header |= SUBALLOC_BIT;
            }
            header |= smallcnt << 11;

            if near.is_near {
                header |= NEAR_BIT;
                if near.is_backwards {
                    header |= BACKWARD_BIT;
                }
                header |= (near.blk_cnt as u16) & 0x1ff;
            } else {
                let hi = ((blk_nr >> 16) & 0x3ff) as u16;
                header |= hi;
            }

            out.extend_from_slice(&header.to_le_bytes());

            if !near.is_near {
                let lo = (blk_nr & 0xffff) as u16;
                out.extend_from_slice(&lo.to_le_bytes());
            }

            if is_suballoc || smallcnt == 0 {
                let word = if is_suballoc { ext.bitmap() } else { ext.blk_cnt() };
                out.extend_from_slice(&word.to_le_bytes());
            }

            prev = Some(ext);
        }

        if let Some(data) = &self.inline {
            let inline_sz = data.len();
            debug_assert!(inline_sz <= INLINE_SZ_MAX);
            let odd = inline_sz % 2 == 1;
            let last = if odd { data[inline_sz - 1] } else { 0 };
            let write_len = if odd { inline_sz - 1 } else { inline_sz };

            let mut header: u16 = SUBALLOC_BIT | INLINE_BIT;
            header |= ((inline_sz as u16) << 8) & 0x3f00;
            header |= last as u16;

            out.extend_from_slice(&header.to_le_bytes());
            out.extend_from_slice(&data[..write_len]);
        }

        Ok(out)
    }

    /// Decodes a segment from its wire format. Consumes the whole slice.
    pub fn decode(bytes: &[u8]) -> Result<Segment> {
        let mut segm = Segment::new();
        let mut pos = 0usize;

        while pos < bytes.len() {
            if bytes.len() - pos < 2 {
                return_errno_with_msg!(
                    Errno::InconsistentState,
                    "{} trailing byte(s) left, cannot read an extent header",
                    bytes.len() - pos
                );
            }
            let header = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
            pos += 2;

            let is_suballoc = header & SUBALLOC_BIT != 0;
            let is_inline = header & INLINE_BIT != 0;

            if is_suballoc && is_inline {
                let inline_sz = ((header >> 8) & 0x3f) as usize;
                let odd = inline_sz % 2 == 1;
                let last = (header & 0xff) as u8;
                let read_len = if odd { inline_sz - 1 } else { inline_sz };

                if bytes.len() - pos < read_len {
                    return_errno_with_msg!(
                        Errno::InconsistentState,
                        "inline data is partially readable: need {} bytes, {} left",
                        read_len,
                        bytes.len() - pos
                    );
                }
                let mut data = bytes[pos..pos + read_len].to_vec();
                pos += read_len;
                if odd {
                    data.push(last);
                }
                segm.inline = Some(data);
                break;
            }

            let smallcnt = (header >> 11) & 0xf;
            let is_near = header & NEAR_BIT != 0;
            let is_backwards = header & BACKWARD_BIT != 0;

            let ext = if is_near {
                let prev = segm.extents.last().cloned().ok_or_else(|| {
                    crate::error::Error::with_msg(
                        Errno::InconsistentState,
                        "near-encoded extent with no previous extent to jump from",
                    )
                })?;
                let jmp_offset = (header & 0x1ff) as u32;

                let (blk_cnt_or_bitmap, need_wide) = if is_suballoc || smallcnt == 0 {
                    if bytes.len() - pos < 2 {
                        return_errno_with_msg!(
                            Errno::InconsistentState,
                            "cannot read block count/bitmap word"
                        );
                    }
                    let w = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
                    pos += 2;
                    (w, true)
                } else {
                    (smallcnt, false)
                };
                let _ = need_wide;

                let target_cnt: u32 = if is_suballoc { 1 } else { blk_cnt_or_bitmap as u32 };
                let ref_cnt = if prev.is_suballoc() { 1u32 } else { prev.blk_cnt() as u32 };

                let blk_nr = if is_backwards {
                    prev.blk_nr()
                        .checked_sub(target_cnt)
                        .and_then(|v| v.checked_sub(jmp_offset))
                        .ok_or_else(|| {
                            crate::error::Error::with_msg(
                                Errno::InconsistentState,
                                "backward jump underflows block number",
                            )
                        })?
                } else {
                    prev.blk_nr() + ref_cnt + jmp_offset
                };
                if blk_nr == 0 {
                    return_errno_with_msg!(Errno::InconsistentState, "decoded a null block number");
                }

                if is_suballoc {
                    Extent::suballoc(blk_nr, blk_cnt_or_bitmap)
                } else {
                    Extent::whole(blk_nr, blk_cnt_or_bitmap)
                }
            } else {
                let hi_blk_nr = (header & 0x3ff) as u32;
                if bytes.len() - pos < 2 {
                    return_errno_with_msg!(Errno::InconsistentState, "cannot read low block number word");
                }
                let lo = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]) as u32;
                pos += 2;
                let blk_nr = (hi_blk_nr << 16) | lo;
                if blk_nr == 0 {
                    return_errno_with_msg!(Errno::InconsistentState, "decoded a null block number");
                }

                let blk_cnt_or_bitmap = if is_suballoc || smallcnt == 0 {
                    if bytes.len() - pos < 2 {
                        return_errno_with_msg!(Errno::InconsistentState, "cannot read block count/bitmap word");
                    }
                    let w = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
                    pos += 2;
                    w
                } else {
                    smallcnt
                };

                if is_suballoc {
                    Extent::suballoc(blk_nr, blk_cnt_or_bitmap)
                } else {
                    Extent::whole(blk_nr, blk_cnt_or_bitmap)
                }
            };

            segm.extents.push(ext);
        }

        Ok(segm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_whole_extent() {
        let mut segm = Segment::new();
        segm.add_extent(Extent::whole(1, 3));
        let bytes = segm.encode().unwrap();
        let back = Segment::decode(&bytes).unwrap();
        assert_eq!(back, segm);
    }

    #[test]
    fn single_whole_extent_matches_documented_header_bits() {
        // One whole-block extent at blk 1, count 3, no inline: SUBALLOC=0,
        // INLINE=0, NEAR=0, smallcnt=3 (bits 14-11 = 0011), HI_BLK_NR=0,
        // lo_blk_nr=1.
        let mut segm = Segment::new();
        segm.add_extent(Extent::whole(1, 3));
        let bytes = segm.encode().unwrap();
        assert_eq!(bytes, vec![0x00, 0x18, 0x01, 0x00]);
        let back = Segment::decode(&bytes).unwrap();
        assert_eq!(back, segm);
    }

    #[test]
    fn smallcnt_covers_the_full_four_bit_range() {
        // blk_cnt=10 only fits the header's smallcnt field if it's 4 bits
        // wide (bits 14-11), not 3 (bits 13-11, max 7). smallcnt=10 =
        // 0b1010, shifted into place gives header 0x5000.
        let mut segm = Segment::new();
        segm.add_extent(Extent::whole(1, 10));
        let bytes = segm.encode().unwrap();
        assert_eq!(bytes, vec![0x00, 0x50, 0x01, 0x00]);
        assert_eq!(bytes.len() as u32, segm.calc_footprint_disk_size());

        let back = Segment::decode(&bytes).unwrap();
        assert_eq!(back, segm);
        assert_eq!(back.extents()[0].blk_cnt(), 10);
    }

    #[test]
    fn round_trip_inline_only() {
        let mut segm = Segment::new();
        segm.set_inline_data(b"ABCD".to_vec()).unwrap();
        let bytes = segm.encode().unwrap();
        // header bits decode exactly as the wire format documents: bit15
        // SUBALLOC, bit14 INLINE, bits13-8 inline_sz, bits7-0 inline_last.
        let header = u16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(header & SUBALLOC_BIT, SUBALLOC_BIT);
        assert_eq!(header & INLINE_BIT, INLINE_BIT);
        assert_eq!((header >> 8) & 0x3f, 4);
        assert_eq!(header & 0xff, 0); // even length, no trailing byte stashed
        assert_eq!(&bytes[2..], b"ABCD");

        let back = Segment::decode(&bytes).unwrap();
        assert_eq!(back.inline_data(), Some(&b"ABCD"[..]));
    }

    #[test]
    fn round_trip_odd_length_inline() {
        let mut segm = Segment::new();
        segm.set_inline_data(b"ABC".to_vec()).unwrap();
        let bytes = segm.encode().unwrap();
        assert_eq!(bytes.len(), 2 + 2); // header + 2 even bytes, 3rd stashed in header
        let back = Segment::decode(&bytes).unwrap();
        assert_eq!(back.inline_data(), Some(&b"ABC"[..]));
    }

    #[test]
    fn round_trip_multi_extent_with_near_encoding() {
        let mut segm = Segment::new();
        segm.add_extent(Extent::whole(10, 5));
        segm.add_extent(Extent::whole(20, 3)); // near-encodable: forward, dist 5
        segm.add_extent(Extent::suballoc(23, 0b1010));
        let bytes = segm.encode().unwrap();
        let back = Segment::decode(&bytes).unwrap();
        assert_eq!(back, segm);
        assert_eq!(bytes.len() as u32, segm.calc_footprint_disk_size());
    }

    #[test]
    fn round_trip_far_backward_jump() {
        let mut segm = Segment::new();
        segm.add_extent(Extent::whole(100_000, 2));
        segm.add_extent(Extent::whole(10, 4));
        let bytes = segm.encode().unwrap();
        let back = Segment::decode(&bytes).unwrap();
        assert_eq!(back, segm);
    }

    #[test]
    fn inline_data_too_large_is_rejected() {
        let mut segm = Segment::new();
        let data = vec![0u8; INLINE_SZ_MAX + 1];
        assert!(segm.set_inline_data(data).is_err());
    }

    #[test]
    fn usable_space_counts_inline_bytes_unrounded() {
        let mut segm = Segment::new();
        segm.add_extent(Extent::whole(1, 2));
        segm.set_inline_data(b"xyz".to_vec()).unwrap();
        assert_eq!(segm.calc_usable_space_size(12), (2 << 12) + 3);
    }
}
