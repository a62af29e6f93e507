//! Corruption triage for blocks in possibly-damaged memory.
//!
//! The analyzer inspects a block region by region and assigns each a
//! [`DataState`] verdict. The header and both paddings are checked against
//! their in-band encoding and sentinel fill; the trailer against its
//! self-encoded padding length; the body only indirectly, through the
//! whole-block checksum. All reads go through a [`GuardedReader`], so an
//! unreadable page degrades the affected verdicts to `Unknown` instead of
//! faulting. Analysis always returns a complete result, no matter what the
//! bytes contain.

use crate::error::Result;
use crate::header::{
    BlockState, RawHeaderBits, BLOCK_HEADER_SIZE, HEADER_PADDING_BYTE, TRAILER_PADDING_BYTE,
};
use crate::info::BlockInfo;
use crate::runtime::{GuardedReader, StackId};
use crate::checksum;
use crate::trailer::BlockTrailer;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Verdict on the bytes of one block region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataState {
    /// Could not be inspected (an unreadable page, or context required for
    /// the verdict was itself unreadable). Never guessed as corrupt.
    Unknown,
    /// Internally consistent.
    Clean,
    /// Provably inconsistent with how the block was written.
    Corrupt,
}

impl DataState {
    /// Corrupt dominates, then unknown, then clean.
    pub fn worst(self, other: DataState) -> DataState {
        use DataState::*;
        match (self, other) {
            (Corrupt, _) | (_, Corrupt) => Corrupt,
            (Unknown, _) | (_, Unknown) => Unknown,
            (Clean, Clean) => Clean,
        }
    }
}

/// The block regions the analyzer distinguishes when reporting an
/// unreadable range to the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockRegion {
    Header,
    HeaderPadding,
    Body,
    TrailerPadding,
    Trailer,
}

/// Notified when the analyzer hits an unreadable range. Useful for
/// diagnostics and for exercising fault paths in tests.
pub trait AnalysisObserver {
    fn on_unreadable(&self, info: &BlockInfo, region: BlockRegion);
}

/// Complete triage result for one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAnalysis {
    /// Worst of the three region verdicts.
    pub overall: DataState,
    pub header: DataState,
    pub body: DataState,
    pub trailer: DataState,
    /// Lifecycle state read from the header, when readable and well formed.
    pub block_state: Option<BlockState>,
    pub alloc_tid: Option<u32>,
    pub free_tid: Option<u32>,
    pub alloc_stack: Option<StackId>,
    pub free_stack: Option<StackId>,
}

/// Region-by-region corruption analyzer.
///
/// Stateless between calls; safe to share across threads analyzing distinct
/// blocks. The observer is injected at construction, there is no global
/// registration.
pub struct BlockAnalyzer<'a> {
    reader: &'a dyn GuardedReader,
    observer: Option<&'a dyn AnalysisObserver>,
}

impl<'a> BlockAnalyzer<'a> {
    pub fn new(reader: &'a dyn GuardedReader) -> Self {
        BlockAnalyzer {
            reader,
            observer: None,
        }
    }

    pub fn with_observer(reader: &'a dyn GuardedReader, observer: &'a dyn AnalysisObserver) -> Self {
        BlockAnalyzer {
            reader,
            observer: Some(observer),
        }
    }

    fn read_bytes(&self, addr: usize, len: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; len];
        if self.reader.try_read(addr, &mut buf) {
            Some(buf)
        } else {
            None
        }
    }

    fn notify(&self, info: &BlockInfo, region: BlockRegion) {
        if let Some(observer) = self.observer {
            observer.on_unreadable(info, region);
        }
    }

    /// Analyze the block described by `info`.
    ///
    /// The descriptor itself is trusted (it came from the caller's records
    /// or from navigation); the bytes in memory are not.
    pub fn analyze(&self, info: &BlockInfo) -> BlockAnalysis {
        let mut analysis = BlockAnalysis {
            overall: DataState::Unknown,
            header: DataState::Clean,
            body: DataState::Unknown,
            trailer: DataState::Clean,
            block_state: None,
            alloc_tid: None,
            free_tid: None,
            alloc_stack: None,
            free_stack: None,
        };

        let raw = self.analyze_header(info, &mut analysis);
        self.analyze_trailer(info, &mut analysis);
        self.analyze_body(info, raw, &mut analysis);

        analysis.overall = analysis.header.worst(analysis.body).worst(analysis.trailer);
        if analysis.overall == DataState::Corrupt {
            warn!(
                base = format_args!("{:#x}", info.base),
                header = ?analysis.header,
                body = ?analysis.body,
                trailer = ?analysis.trailer,
                "block corruption detected"
            );
        }
        analysis
    }

    fn analyze_header(&self, info: &BlockInfo, analysis: &mut BlockAnalysis) -> Option<RawHeaderBits> {
        let Some(word) = self.reader.try_read_u64(info.base) else {
            self.notify(info, BlockRegion::Header);
            analysis.header = DataState::Unknown;
            self.analyze_header_padding(info, analysis);
            return None;
        };
        let raw = RawHeaderBits::unpack(word);

        let mut verdict = DataState::Clean;
        if !raw.magic_is_valid() {
            verdict = DataState::Corrupt;
        }
        match BlockState::from_u8(raw.state) {
            Ok(state) => analysis.block_state = Some(state),
            Err(_) => verdict = DataState::Corrupt,
        }
        // The encoding must agree with the descriptor's geometry.
        if raw.body_size as usize != info.body_size
            || raw.has_header_padding != (info.header_padding_size > 0)
            || raw.has_excess_trailer_padding != info.has_excess_trailer_padding()
        {
            verdict = DataState::Corrupt;
        }

        // The header region is all 16 bytes; it can straddle a page
        // boundary, so the stack-handle half may fault on its own.
        match self.read_bytes(info.base + 8, 8) {
            Some(stacks) => {
                let alloc = u32::from_le_bytes(stacks[0..4].try_into().expect("sliced to 4 bytes"));
                let free = u32::from_le_bytes(stacks[4..8].try_into().expect("sliced to 4 bytes"));
                analysis.alloc_stack = Some(StackId(alloc));
                analysis.free_stack = Some(StackId(free));
            }
            None => {
                self.notify(info, BlockRegion::Header);
                verdict = verdict.worst(DataState::Unknown);
            }
        }

        analysis.header = verdict;
        self.analyze_header_padding(info, analysis);
        Some(raw)
    }

    /// Header padding carries its length in its first and last 4 bytes with
    /// sentinel fill in between; it counts toward the header verdict.
    fn analyze_header_padding(&self, info: &BlockInfo, analysis: &mut BlockAnalysis) {
        let len = info.header_padding_size;
        if len == 0 {
            return;
        }
        // Non-zero padding holds two non-overlapping 4-byte length fields;
        // a shorter length can only come from a damaged descriptor.
        if len < 8 {
            analysis.header = DataState::Corrupt;
            return;
        }
        let Some(pad) = self.read_bytes(info.base + BLOCK_HEADER_SIZE, len) else {
            self.notify(info, BlockRegion::HeaderPadding);
            analysis.header = analysis.header.worst(DataState::Unknown);
            return;
        };
        let head = u32::from_le_bytes(pad[0..4].try_into().expect("sliced to 4 bytes"));
        let tail = u32::from_le_bytes(pad[len - 4..].try_into().expect("sliced to 4 bytes"));
        let lengths_ok = head as usize == len && tail as usize == len;
        let fill_ok = pad[4..len - 4].iter().all(|&b| b == HEADER_PADDING_BYTE);
        if !lengths_ok || !fill_ok {
            analysis.header = DataState::Corrupt;
        }
    }

    fn analyze_trailer(&self, info: &BlockInfo, analysis: &mut BlockAnalysis) {
        let mut verdict = DataState::Clean;

        let pad_len = info.trailer_padding_size;
        if info.has_excess_trailer_padding() && pad_len < 4 {
            // Excess padding must hold its 4-byte length field; a shorter
            // length can only come from a damaged descriptor.
            verdict = DataState::Corrupt;
        } else if pad_len > 0 {
            match self.read_bytes(info.base + info.trailer_padding_offset(), pad_len) {
                Some(pad) => {
                    // Excess padding self-encodes its length up front;
                    // implicit padding is pure sentinel fill.
                    let sentinel_from = if info.has_excess_trailer_padding() {
                        let encoded =
                            u32::from_le_bytes(pad[0..4].try_into().expect("sliced to 4 bytes"));
                        if encoded as usize != pad_len {
                            verdict = DataState::Corrupt;
                        }
                        4
                    } else {
                        0
                    };
                    if !pad[sentinel_from..].iter().all(|&b| b == TRAILER_PADDING_BYTE) {
                        verdict = DataState::Corrupt;
                    }
                }
                None => {
                    self.notify(info, BlockRegion::TrailerPadding);
                    verdict = verdict.worst(DataState::Unknown);
                }
            }
        }

        match self.read_bytes(info.trailer_addr(), crate::trailer::BLOCK_TRAILER_SIZE) {
            Some(bytes) => {
                if let Ok(trailer) = BlockTrailer::from_bytes(&bytes) {
                    analysis.alloc_tid = Some(trailer.alloc_tid);
                    analysis.free_tid = Some(trailer.free_tid);
                }
            }
            None => {
                self.notify(info, BlockRegion::Trailer);
                verdict = verdict.worst(DataState::Unknown);
            }
        }

        analysis.trailer = verdict;
    }

    /// The body has no structure of its own; it is judged through the
    /// whole-block checksum, and only when the header and trailer are
    /// independently clean enough to trust it.
    fn analyze_body(&self, info: &BlockInfo, raw: Option<RawHeaderBits>, analysis: &mut BlockAnalysis) {
        let Some(raw) = raw else {
            analysis.body = DataState::Unknown;
            return;
        };
        let Some(block) = self.read_bytes(info.base, info.block_size) else {
            // The checksum is unknowable. Only blame the body region itself
            // if it was the part we could not read.
            if self.read_bytes(info.base + info.body_offset(), info.body_size).is_none() {
                self.notify(info, BlockRegion::Body);
            }
            analysis.body = DataState::Unknown;
            return;
        };
        let valid = match self.checksum_matches(info, raw, &block) {
            Ok(valid) => valid,
            Err(_) => {
                analysis.body = DataState::Unknown;
                return;
            }
        };
        analysis.body = if valid {
            DataState::Clean
        } else if analysis.header == DataState::Clean && analysis.trailer == DataState::Clean {
            DataState::Corrupt
        } else {
            // Some other region already explains the mismatch.
            DataState::Unknown
        };
    }

    fn checksum_matches(&self, info: &BlockInfo, raw: RawHeaderBits, block: &[u8]) -> Result<bool> {
        let computed = checksum::block_checksum(info, block)?;
        Ok(raw.checksum == computed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::set_checksum;
    use crate::info::CompactBlockInfo;
    use crate::init::{initialize_block, mark_quarantined, set_alloc_stack};
    use crate::layout::plan_layout;
    use crate::runtime::{MaskedReader, SliceReader, SystemContext};
    use std::cell::RefCell;

    fn checksummed_block() -> (BlockInfo, Vec<u8>) {
        // Wide redzones so both paddings exist and the excess trailer
        // padding is explicitly encoded.
        let layout = plan_layout(8, 8, 24, 32, 48).unwrap();
        let mut block = vec![0u8; layout.block_size];
        let ctx = SystemContext::new(3);
        let info = initialize_block(&layout, &mut block, false, &ctx).unwrap();
        set_alloc_stack(&info, &mut block, StackId(42)).unwrap();
        set_checksum(&info, &mut block).unwrap();
        (info, block)
    }

    #[test]
    fn test_fresh_block_is_clean() {
        let (info, block) = checksummed_block();
        let reader = SliceReader::new(info.base, &block);
        let analysis = BlockAnalyzer::new(&reader).analyze(&info);

        assert_eq!(analysis.overall, DataState::Clean);
        assert_eq!(analysis.header, DataState::Clean);
        assert_eq!(analysis.body, DataState::Clean);
        assert_eq!(analysis.trailer, DataState::Clean);
        assert_eq!(analysis.block_state, Some(BlockState::Allocated));
        assert_eq!(analysis.alloc_stack, Some(StackId(42)));
        assert_eq!(analysis.free_stack, Some(StackId::NULL));
        assert!(analysis.alloc_tid.is_some());
        assert_eq!(analysis.free_tid, Some(0));
    }

    #[test]
    fn test_quarantined_block_reports_free_records() {
        let (info, mut block) = checksummed_block();
        let ctx = SystemContext::new(3);
        mark_quarantined(&info, &mut block, &ctx, StackId(77)).unwrap();

        let reader = SliceReader::new(info.base, &block);
        let analysis = BlockAnalyzer::new(&reader).analyze(&info);
        assert_eq!(analysis.overall, DataState::Clean);
        assert_eq!(analysis.block_state, Some(BlockState::Quarantined));
        assert_eq!(analysis.free_stack, Some(StackId(77)));
        assert_ne!(analysis.free_tid, Some(0));
    }

    #[test]
    fn test_bad_magic_marks_header_corrupt() {
        let (info, mut block) = checksummed_block();
        block[1] ^= 0x10;

        let reader = SliceReader::new(info.base, &block);
        let analysis = BlockAnalyzer::new(&reader).analyze(&info);
        assert_eq!(analysis.header, DataState::Corrupt);
        assert_eq!(analysis.overall, DataState::Corrupt);
        // The trailer is assessed independently.
        assert_eq!(analysis.trailer, DataState::Clean);
    }

    #[test]
    fn test_header_padding_sentinel_damage() {
        let (info, mut block) = checksummed_block();
        let pad = info.header_padding_range();
        assert!(pad.len() > 8);
        block[pad.start + 5] = 0x00;

        let reader = SliceReader::new(info.base, &block);
        let analysis = BlockAnalyzer::new(&reader).analyze(&info);
        assert_eq!(analysis.header, DataState::Corrupt);
        assert_eq!(analysis.trailer, DataState::Clean);
        assert_eq!(analysis.overall, DataState::Corrupt);
    }

    #[test]
    fn test_trailer_padding_sentinel_damage() {
        let (info, mut block) = checksummed_block();
        let pad = info.trailer_padding_range();
        block[pad.end - 1] = 0x00;

        let reader = SliceReader::new(info.base, &block);
        let analysis = BlockAnalyzer::new(&reader).analyze(&info);
        assert_eq!(analysis.trailer, DataState::Corrupt);
        assert_eq!(analysis.header, DataState::Clean);
        assert_eq!(analysis.overall, DataState::Corrupt);
    }

    #[test]
    fn test_body_corruption_presumed_from_checksum() {
        let (info, mut block) = checksummed_block();
        let body = info.body_range();
        block[body.start + 7] ^= 0x40;

        let reader = SliceReader::new(info.base, &block);
        let analysis = BlockAnalyzer::new(&reader).analyze(&info);
        assert_eq!(analysis.header, DataState::Clean);
        assert_eq!(analysis.trailer, DataState::Clean);
        assert_eq!(analysis.body, DataState::Corrupt);
        assert_eq!(analysis.overall, DataState::Corrupt);
    }

    struct Recorder(RefCell<Vec<BlockRegion>>);

    impl AnalysisObserver for Recorder {
        fn on_unreadable(&self, _info: &BlockInfo, region: BlockRegion) {
            self.0.borrow_mut().push(region);
        }
    }

    #[test]
    fn test_unreadable_trailer_is_unknown_not_corrupt() {
        let (info, block) = checksummed_block();
        let reader = MaskedReader::new(SliceReader::new(info.base, &block))
            .mask(info.trailer_addr()..info.base + info.block_size);

        let recorder = Recorder(RefCell::new(Vec::new()));
        let analysis = BlockAnalyzer::with_observer(&reader, &recorder).analyze(&info);
        assert_eq!(analysis.trailer, DataState::Unknown);
        assert_eq!(analysis.header, DataState::Clean);
        assert_eq!(analysis.body, DataState::Unknown);
        assert_eq!(analysis.overall, DataState::Unknown);
        assert!(recorder.0.borrow().contains(&BlockRegion::Trailer));
        assert!(!recorder.0.borrow().contains(&BlockRegion::Body));
    }

    #[test]
    fn test_unreadable_body_reported_to_observer() {
        let (info, block) = checksummed_block();
        let body = info.body_range();
        let reader = MaskedReader::new(SliceReader::new(info.base, &block))
            .mask(info.base + body.start..info.base + body.end);

        let recorder = Recorder(RefCell::new(Vec::new()));
        let analysis = BlockAnalyzer::with_observer(&reader, &recorder).analyze(&info);
        assert_eq!(analysis.body, DataState::Unknown);
        assert_eq!(analysis.overall, DataState::Unknown);
        assert_eq!(recorder.0.borrow().as_slice(), &[BlockRegion::Body]);
    }

    #[test]
    fn test_unreadable_stack_handles_make_header_unknown() {
        // The header region is all 16 bytes; mask only its second half, as
        // a page boundary through the header would.
        let (info, block) = checksummed_block();
        let reader = MaskedReader::new(SliceReader::new(info.base, &block))
            .mask(info.base + 8..info.base + 16);

        let recorder = Recorder(RefCell::new(Vec::new()));
        let analysis = BlockAnalyzer::with_observer(&reader, &recorder).analyze(&info);
        assert_eq!(analysis.header, DataState::Unknown);
        assert_eq!(analysis.overall, DataState::Unknown);
        assert_eq!(analysis.alloc_stack, None);
        assert_eq!(analysis.free_stack, None);
        assert!(recorder.0.borrow().contains(&BlockRegion::Header));
        // The trailer is assessed independently.
        assert_eq!(analysis.trailer, DataState::Clean);
    }

    #[test]
    fn test_malformed_descriptor_completes_without_panic() {
        // A damaged compact descriptor can claim a header too small to
        // hold the padding length fields and a trailer with no room for
        // the excess length; analysis must still return a verdict.
        let bytes = vec![0u8; 64];
        let reader = SliceReader::new(0x9000, &bytes);
        let info = CompactBlockInfo::new(0x9000, 64, 17, 20, false).expand();
        assert_eq!(info.header_padding_size, 1);
        assert_eq!(info.trailer_padding_size, 0);

        let analysis = BlockAnalyzer::new(&reader).analyze(&info);
        assert_eq!(analysis.header, DataState::Corrupt);
        assert_eq!(analysis.trailer, DataState::Corrupt);
        assert_eq!(analysis.overall, DataState::Corrupt);
    }

    #[test]
    fn test_fully_unreadable_block() {
        let (info, block) = checksummed_block();
        let reader = MaskedReader::new(SliceReader::new(info.base, &block))
            .mask(info.base..info.base + info.block_size);

        let analysis = BlockAnalyzer::new(&reader).analyze(&info);
        assert_eq!(analysis.header, DataState::Unknown);
        assert_eq!(analysis.body, DataState::Unknown);
        assert_eq!(analysis.trailer, DataState::Unknown);
        assert_eq!(analysis.overall, DataState::Unknown);
        assert_eq!(analysis.block_state, None);
    }

    #[test]
    fn test_worst_ordering() {
        use DataState::*;
        assert_eq!(Clean.worst(Clean), Clean);
        assert_eq!(Clean.worst(Unknown), Unknown);
        assert_eq!(Unknown.worst(Corrupt), Corrupt);
        assert_eq!(Corrupt.worst(Clean), Corrupt);
    }
}
