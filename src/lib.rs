//! # Blockguard - Instrumented Heap Block Layout and Triage
//!
//! `blockguard` is the block-format core of an instrumented heap: it plans,
//! stamps, navigates and triages the redzone-wrapped blocks an instrumented
//! allocator hands out. Every allocation becomes one contiguous region:
//!
//! ```text
//!   +------------------+  <-- chunk-size aligned \
//!   |      header      |                         |
//!   +------------------+                         |- left redzone
//!   |  header padding  |                         |
//!   +------------------+  <-- body alignment     /
//!   |       body       |      (the usable bytes)
//!   +------------------+
//!   | trailer padding  |                         \
//!   +------------------+                         |- right redzone
//!   |     trailer      |                         |
//!   +------------------+  <-- chunk-size aligned /
//! ```
//!
//! The format is self-describing: a 16-byte bit-packed header (magic,
//! 13-bit checksum, flags, state, body size, stack handles) and a 20-byte
//! trailer (thread ids, tick counts, heap id) bracket the body, with
//! sentinel-filled padding in between. That is enough to recover the whole
//! descriptor from a raw header or body pointer, validate integrity with a
//! folded CRC32, and classify damage region by region.
//!
//! ## Quick start
//!
//! ```rust
//! use blockguard::{
//!     initialize_block, plan_layout, set_alloc_stack, set_checksum,
//!     BlockAnalyzer, DataState, Result, SliceReader, StackId, SystemContext,
//! };
//!
//! # fn main() -> Result<()> {
//! // Plan: 24 usable bytes, 8-byte aligned, at least 16 bytes of redzone
//! // on each side.
//! let layout = plan_layout(8, 8, 24, 16, 16)?;
//!
//! // Stamp the format onto backing memory.
//! let mut memory = vec![0u8; layout.block_size];
//! let ctx = SystemContext::new(1);
//! let info = initialize_block(&layout, &mut memory, false, &ctx)?;
//! set_alloc_stack(&info, &mut memory, StackId(7))?;
//! set_checksum(&info, &mut memory)?;
//!
//! // Triage: everything still clean.
//! let reader = SliceReader::new(info.base, &memory);
//! let analysis = BlockAnalyzer::new(&reader).analyze(&info);
//! assert_eq!(analysis.overall, DataState::Clean);
//! # Ok(())
//! # }
//! ```
//!
//! ## Offline use
//!
//! Nothing here owns memory or holds locks. Navigation
//! ([`block_info_from_header`], [`header_from_body`]) and analysis read
//! through the [`GuardedReader`] trait, so the same code runs live against
//! process memory or offline against a captured dump, and an unreadable
//! page is an ordinary `Unknown` verdict rather than a crash.

pub mod analyze;
pub mod checksum;
pub mod error;
pub mod header;
pub mod info;
pub mod init;
pub mod layout;
pub mod navigate;
pub mod runtime;
pub mod trailer;

pub use crate::analyze::{AnalysisObserver, BlockAnalysis, BlockAnalyzer, BlockRegion, DataState};
pub use crate::checksum::{block_checksum, checksum_is_valid, set_checksum};
pub use crate::error::{BlockError, Result};
pub use crate::header::{
    BlockHeader, BlockState, BLOCK_HEADER_MAGIC, BLOCK_HEADER_SIZE, HEADER_PADDING_BYTE,
    SHADOW_RATIO, TRAILER_PADDING_BYTE,
};
pub use crate::info::{BlockInfo, CompactBlockInfo};
pub use crate::init::{initialize_block, mark_freed, mark_quarantined, set_alloc_stack};
pub use crate::layout::{implicit_trailer_padding, plan_layout, BlockLayout, MAX_REDZONE_SIZE};
pub use crate::navigate::{block_info_from_header, header_from_body};
pub use crate::runtime::{
    GuardedReader, MaskedReader, RuntimeContext, SliceReader, StackId, SystemContext,
};
pub use crate::trailer::{BlockTrailer, BLOCK_TRAILER_SIZE};

/// Library version, exposed for diagnostics embedded in crash reports.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
