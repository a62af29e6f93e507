//! Block initialization and lifecycle transitions.
//!
//! [`initialize_block`] turns a planned layout plus fresh memory into a live
//! `Allocated` block. It deliberately leaves two things to the caller: the
//! allocation stack handle (so the capture excludes initializer frames) and
//! the checksum (which must be computed after the handle is stored). The
//! expected sequence is:
//!
//! ```text
//! initialize_block -> set_alloc_stack -> set_checksum
//! ```
//!
//! State transitions are monotonic for a given memory instance:
//! `Allocated -> Quarantined -> Freed`, with the quarantine hop optional.
//! Returning to `Allocated` means reinitializing reused memory as a brand
//! new block.

use crate::checksum::set_checksum;
use crate::error::{BlockError, Result};
use crate::header::{
    BlockHeader, BlockState, BLOCK_HEADER_SIZE, HEADER_PADDING_BYTE, TRAILER_PADDING_BYTE,
};
use crate::info::BlockInfo;
use crate::layout::BlockLayout;
use crate::runtime::{RuntimeContext, StackId};
use crate::trailer::BlockTrailer;
use tracing::debug;

/// Lay out and initialize a fresh block.
///
/// `block` must be exactly `layout.block_size` bytes and its address must
/// satisfy `layout.block_alignment`. The body bytes are left untouched.
/// The returned descriptor is fully resolved; the checksum field is zero
/// and both stack handles are null.
pub fn initialize_block(
    layout: &BlockLayout,
    block: &mut [u8],
    is_nested: bool,
    ctx: &dyn RuntimeContext,
) -> Result<BlockInfo> {
    if block.len() != layout.block_size {
        return Err(BlockError::BadRegion(format!(
            "region is {} bytes, layout wants {}",
            block.len(),
            layout.block_size
        )));
    }
    let base = block.as_ptr() as usize;
    if base % layout.block_alignment != 0 {
        return Err(BlockError::BadRegion(format!(
            "region at {:#x} is not {}-byte aligned",
            base, layout.block_alignment
        )));
    }

    let mut info = BlockInfo::from_layout(layout, base);
    info.is_nested = is_nested;

    let header = BlockHeader::allocated(
        layout.body_size as u32,
        is_nested,
        layout.header_padding_size > 0,
        layout.has_excess_trailer_padding,
    );
    block[0..BLOCK_HEADER_SIZE].copy_from_slice(&header.to_bytes());

    // Header padding carries its length at both ends so the body and the
    // header can find each other in O(1); everything between is sentinel.
    let pad = info.header_padding_range();
    if !pad.is_empty() {
        let len = pad.len() as u32;
        block[pad.clone()].fill(HEADER_PADDING_BYTE);
        block[pad.start..pad.start + 4].copy_from_slice(&len.to_le_bytes());
        block[pad.end - 4..pad.end].copy_from_slice(&len.to_le_bytes());
    }

    // Trailer padding encodes its length up front only when it exceeds the
    // implicit amount; otherwise it is pure sentinel.
    let pad = info.trailer_padding_range();
    if !pad.is_empty() {
        let len = pad.len() as u32;
        block[pad.clone()].fill(TRAILER_PADDING_BYTE);
        if layout.has_excess_trailer_padding {
            block[pad.start..pad.start + 4].copy_from_slice(&len.to_le_bytes());
        }
    }

    let trailer = BlockTrailer {
        alloc_tid: ctx.thread_id(),
        free_tid: 0,
        alloc_ticks: ctx.ticks(),
        free_ticks: 0,
        heap_id: ctx.heap_id(),
    };
    block[info.trailer_range()].copy_from_slice(&trailer.to_bytes());

    debug!(
        base = format_args!("{:#x}", base),
        block_size = layout.block_size,
        body_size = layout.body_size,
        is_nested,
        "initialized block"
    );
    Ok(info)
}

/// Store the allocation stack handle. Call [`set_checksum`] afterwards.
pub fn set_alloc_stack(info: &BlockInfo, block: &mut [u8], stack: StackId) -> Result<()> {
    check_block(info, block)?;
    block[8..12].copy_from_slice(&stack.0.to_le_bytes());
    Ok(())
}

/// Transition the block to `Quarantined`, recording the freeing thread.
pub fn mark_quarantined(
    info: &BlockInfo,
    block: &mut [u8],
    ctx: &dyn RuntimeContext,
    free_stack: StackId,
) -> Result<()> {
    transition(info, block, ctx, free_stack, BlockState::Quarantined)
}

/// Transition the block to `Freed`. Coming straight from `Allocated` this
/// records the freeing thread; coming from `Quarantined` the free records
/// set at quarantine time are kept.
pub fn mark_freed(
    info: &BlockInfo,
    block: &mut [u8],
    ctx: &dyn RuntimeContext,
    free_stack: StackId,
) -> Result<()> {
    transition(info, block, ctx, free_stack, BlockState::Freed)
}

fn transition(
    info: &BlockInfo,
    block: &mut [u8],
    ctx: &dyn RuntimeContext,
    free_stack: StackId,
    to: BlockState,
) -> Result<()> {
    check_block(info, block)?;

    let mut header = BlockHeader::from_bytes(&block[..BLOCK_HEADER_SIZE])?;
    let from = header.state;
    if from >= to {
        return Err(BlockError::InvalidStateTransition { from, to });
    }

    header.state = to;
    if from == BlockState::Allocated {
        header.free_stack = free_stack;

        let trailer_range = info.trailer_range();
        let mut trailer = BlockTrailer::from_bytes(&block[trailer_range.clone()])?;
        trailer.free_tid = ctx.thread_id();
        trailer.free_ticks = ctx.ticks();
        block[trailer_range].copy_from_slice(&trailer.to_bytes());
    }
    block[0..BLOCK_HEADER_SIZE].copy_from_slice(&header.to_bytes());

    set_checksum(info, block)?;
    debug!(
        base = format_args!("{:#x}", info.base),
        ?from,
        ?to,
        "block state transition"
    );
    Ok(())
}

fn check_block(info: &BlockInfo, block: &[u8]) -> Result<()> {
    if block.len() != info.block_size {
        return Err(BlockError::BadRegion(format!(
            "region is {} bytes, descriptor says {}",
            block.len(),
            info.block_size
        )));
    }
    Ok(())
}
