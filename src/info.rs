//! Expanded and compact block descriptors.
//!
//! [`BlockInfo`] is the working form: a base address plus the region sizes,
//! from which every sub-region offset is derived arithmetically. Access to
//! the underlying bytes goes through the range accessors plus
//! [`checked_slice`] / [`checked_slice_mut`], keeping a hard line between
//! "where a region is" and "may I touch it".
//!
//! [`CompactBlockInfo`] is the bulk-storage form (quarantine lists hold
//! thousands): address, total size, and one packed word. Expansion
//! recomputes everything else, so the two forms cannot drift apart.

use crate::error::{BlockError, Result};
use crate::header::BLOCK_HEADER_SIZE;
use crate::layout::{align_up, implicit_trailer_padding, BlockLayout};
use crate::trailer::BLOCK_TRAILER_SIZE;
use std::ops::Range;

/// Page granularity used when computing the protectable pages of a block.
pub const PAGE_SIZE: usize = 4096;

/// Fully resolved description of a block in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the block header (start of the block).
    pub base: usize,
    /// Size of the entire allocation, redzones included.
    pub block_size: usize,
    pub header_padding_size: usize,
    pub body_size: usize,
    pub trailer_padding_size: usize,
    pub is_nested: bool,
}

impl BlockInfo {
    /// Resolve a planned layout against the memory it will occupy.
    pub fn from_layout(layout: &BlockLayout, base: usize) -> Self {
        BlockInfo {
            base,
            block_size: layout.block_size,
            header_padding_size: layout.header_padding_size,
            body_size: layout.body_size,
            trailer_padding_size: layout.trailer_padding_size,
            is_nested: false,
        }
    }

    pub fn header_size(&self) -> usize {
        BLOCK_HEADER_SIZE + self.header_padding_size
    }

    pub fn trailer_size(&self) -> usize {
        BLOCK_TRAILER_SIZE + self.trailer_padding_size
    }

    pub fn has_header_padding(&self) -> bool {
        self.header_padding_size > 0
    }

    /// Whether the trailer padding length is self-encoded rather than
    /// implicit. Recomputed from the sizes, never cached.
    pub fn has_excess_trailer_padding(&self) -> bool {
        self.trailer_padding_size != implicit_trailer_padding(self.body_size)
    }

    pub fn body_offset(&self) -> usize {
        self.header_size()
    }

    pub fn trailer_padding_offset(&self) -> usize {
        self.body_offset() + self.body_size
    }

    pub fn trailer_offset(&self) -> usize {
        self.trailer_padding_offset() + self.trailer_padding_size
    }

    // Sub-region ranges, as offsets into the block. Together these
    // partition `0..block_size`.

    pub fn header_range(&self) -> Range<usize> {
        0..BLOCK_HEADER_SIZE
    }

    pub fn header_padding_range(&self) -> Range<usize> {
        BLOCK_HEADER_SIZE..self.body_offset()
    }

    pub fn body_range(&self) -> Range<usize> {
        self.body_offset()..self.trailer_padding_offset()
    }

    pub fn trailer_padding_range(&self) -> Range<usize> {
        self.trailer_padding_offset()..self.trailer_offset()
    }

    pub fn trailer_range(&self) -> Range<usize> {
        self.trailer_offset()..self.block_size
    }

    // Absolute addresses of the interesting boundaries.

    pub fn body_addr(&self) -> usize {
        self.base + self.body_offset()
    }

    pub fn trailer_addr(&self) -> usize {
        self.base + self.trailer_offset()
    }

    pub fn end_addr(&self) -> usize {
        self.base + self.block_size
    }

    /// Whole pages lying entirely within the block. These are the pages
    /// whose protections may be toggled as the block changes state; they
    /// are contiguous by construction.
    pub fn block_pages(&self) -> Option<Range<usize>> {
        pages_within(self.base, self.end_addr())
    }

    /// Whole pages entirely within the left redzone.
    pub fn left_redzone_pages(&self) -> Option<Range<usize>> {
        pages_within(self.base, self.body_addr())
    }

    /// Whole pages entirely within the right redzone.
    pub fn right_redzone_pages(&self) -> Option<Range<usize>> {
        pages_within(self.base + self.trailer_padding_offset(), self.end_addr())
    }
}

fn pages_within(start: usize, end: usize) -> Option<Range<usize>> {
    let first = align_up(start, PAGE_SIZE);
    let last = end & !(PAGE_SIZE - 1);
    if first < last {
        Some(first..last)
    } else {
        None
    }
}

/// Borrow `range` out of `block`, or report exactly what was out of bounds.
pub fn checked_slice<'a>(block: &'a [u8], range: Range<usize>) -> Result<&'a [u8]> {
    if range.end > block.len() || range.start > range.end {
        return Err(BlockError::OutOfBounds {
            start: range.start,
            end: range.end,
            len: block.len(),
        });
    }
    Ok(&block[range])
}

pub fn checked_slice_mut<'a>(block: &'a mut [u8], range: Range<usize>) -> Result<&'a mut [u8]> {
    if range.end > block.len() || range.start > range.end {
        return Err(BlockError::OutOfBounds {
            start: range.start,
            end: range.end,
            len: block.len(),
        });
    }
    Ok(&mut block[range])
}

const COMPACT_SIZE_BITS: u32 = 15;
const COMPACT_SIZE_MASK: u32 = (1 << COMPACT_SIZE_BITS) - 1;
const COMPACT_TRAILER_SHIFT: u32 = 15;
const COMPACT_NESTED_SHIFT: u32 = 30;

/// Minimum descriptor of a block: header address, total size, and a packed
/// word of `header_size:15 | trailer_size:15 | is_nested:1`. Suitable for
/// bulk storage such as a quarantine list; upgrade with [`expand`] before
/// navigating a block thoroughly.
///
/// [`expand`]: CompactBlockInfo::expand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactBlockInfo {
    /// Address of the block header.
    pub header: usize,
    /// Size of the entire allocation.
    pub block_size: u32,
    packed: u32,
}

impl CompactBlockInfo {
    pub fn new(
        header: usize,
        block_size: u32,
        header_size: u32,
        trailer_size: u32,
        is_nested: bool,
    ) -> Self {
        let mut packed = header_size & COMPACT_SIZE_MASK;
        packed |= (trailer_size & COMPACT_SIZE_MASK) << COMPACT_TRAILER_SHIFT;
        packed |= (is_nested as u32) << COMPACT_NESTED_SHIFT;
        CompactBlockInfo {
            header,
            block_size,
            packed,
        }
    }

    /// Total header size, padding included.
    pub fn header_size(&self) -> usize {
        (self.packed & COMPACT_SIZE_MASK) as usize
    }

    /// Total trailer size, padding included.
    pub fn trailer_size(&self) -> usize {
        ((self.packed >> COMPACT_TRAILER_SHIFT) & COMPACT_SIZE_MASK) as usize
    }

    pub fn is_nested(&self) -> bool {
        self.packed & (1 << COMPACT_NESTED_SHIFT) != 0
    }

    /// Recompute the expanded descriptor. Offsets and the body size are
    /// derived from the three stored sizes; nothing else is carried over,
    /// so compact and expanded forms cannot diverge.
    pub fn expand(&self) -> BlockInfo {
        let block_size = self.block_size as usize;
        let header_size = self.header_size();
        let trailer_size = self.trailer_size();
        let body_size = block_size
            .saturating_sub(header_size)
            .saturating_sub(trailer_size);

        BlockInfo {
            base: self.header,
            block_size,
            header_padding_size: header_size.saturating_sub(BLOCK_HEADER_SIZE),
            body_size,
            trailer_padding_size: trailer_size.saturating_sub(BLOCK_TRAILER_SIZE),
            is_nested: self.is_nested(),
        }
    }
}

impl From<&BlockInfo> for CompactBlockInfo {
    fn from(info: &BlockInfo) -> Self {
        CompactBlockInfo::new(
            info.base,
            info.block_size as u32,
            info.header_size() as u32,
            info.trailer_size() as u32,
            info.is_nested,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::plan_layout;

    fn sample_info() -> BlockInfo {
        let layout = plan_layout(8, 8, 100, 32, 8).unwrap();
        let mut info = BlockInfo::from_layout(&layout, 0x7000_0000);
        info.is_nested = true;
        info
    }

    #[test]
    fn test_ranges_partition_block() {
        let info = sample_info();
        let h = info.header_range();
        let hp = info.header_padding_range();
        let b = info.body_range();
        let tp = info.trailer_padding_range();
        let t = info.trailer_range();

        assert_eq!(h.start, 0);
        assert_eq!(h.end, hp.start);
        assert_eq!(hp.end, b.start);
        assert_eq!(b.end, tp.start);
        assert_eq!(tp.end, t.start);
        assert_eq!(t.end, info.block_size);
        assert_eq!(b.len(), info.body_size);
    }

    #[test]
    fn test_compact_round_trip() {
        let info = sample_info();
        let compact = CompactBlockInfo::from(&info);
        assert_eq!(compact.expand(), info);
    }

    #[test]
    fn test_compact_packs_fields() {
        let compact = CompactBlockInfo::new(0x1000, 4096, 48, 28, true);
        assert_eq!(compact.header_size(), 48);
        assert_eq!(compact.trailer_size(), 28);
        assert!(compact.is_nested());

        let compact = CompactBlockInfo::new(0x1000, 4096, 48, 28, false);
        assert!(!compact.is_nested());
    }

    #[test]
    fn test_excess_trailer_padding_recomputed() {
        // body 16 with implicit padding 4: no excess.
        let layout = plan_layout(8, 8, 16, 8, 8).unwrap();
        let info = BlockInfo::from_layout(&layout, 0);
        assert!(!info.has_excess_trailer_padding());
        assert_eq!(
            info.has_excess_trailer_padding(),
            layout.has_excess_trailer_padding
        );

        // body 20 forces rounding growth: excess.
        let layout = plan_layout(8, 8, 20, 8, 8).unwrap();
        let info = BlockInfo::from_layout(&layout, 0);
        assert!(info.has_excess_trailer_padding());
        assert_eq!(
            info.has_excess_trailer_padding(),
            layout.has_excess_trailer_padding
        );
    }

    #[test]
    fn test_checked_slice_bounds() {
        let bytes = [0u8; 16];
        assert!(checked_slice(&bytes, 0..16).is_ok());
        assert!(checked_slice(&bytes, 8..12).is_ok());
        assert!(matches!(
            checked_slice(&bytes, 8..17),
            Err(BlockError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_page_computation() {
        // A block spanning several pages, starting mid-page.
        let info = BlockInfo {
            base: 0x10800,
            block_size: 0x3000,
            header_padding_size: 0,
            body_size: 0x2f00 - BLOCK_HEADER_SIZE - BLOCK_TRAILER_SIZE,
            trailer_padding_size: 0x100,
            is_nested: false,
        };
        let pages = info.block_pages().unwrap();
        assert_eq!(pages.start, 0x11000);
        assert_eq!(pages.end, 0x13000);
        assert_eq!(pages.start % PAGE_SIZE, 0);
        assert_eq!(pages.end % PAGE_SIZE, 0);

        // A small block owns no whole page.
        let layout = plan_layout(8, 8, 64, 8, 8).unwrap();
        let small = BlockInfo::from_layout(&layout, 0x10000);
        assert!(small.block_pages().is_none());
    }

    #[test]
    fn test_page_aligned_block_owns_its_pages() {
        let info = BlockInfo {
            base: 0x20000,
            block_size: 2 * PAGE_SIZE,
            header_padding_size: PAGE_SIZE - BLOCK_HEADER_SIZE,
            body_size: PAGE_SIZE - BLOCK_TRAILER_SIZE - 4,
            trailer_padding_size: 4,
            is_nested: false,
        };
        assert_eq!(info.block_pages(), Some(0x20000..0x22000));
        // Left redzone is exactly the first page.
        assert_eq!(info.left_redzone_pages(), Some(0x20000..0x21000));
        assert!(info.right_redzone_pages().is_none());
    }
}
