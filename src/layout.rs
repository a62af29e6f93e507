//! Layout planning for instrumented allocation blocks.
//!
//! A block is one contiguous region:
//!
//! ```text
//!   +------------------+  <-- chunk-size aligned \
//!   |      header      |                         |
//!   +------------------+                         |- left redzone
//!   |  header padding  |                         |  (mod 8 in size)
//!   |    (optional)    |                         /
//!   +------------------+  <-- `alignment` aligned
//!   |       body       |
//!   +------------------+
//!   | trailer padding  |                         \
//!   |    (optional)    |                         |- right redzone
//!   +------------------+                         |
//!   |     trailer      |                         /
//!   +------------------+  <-- chunk-size aligned
//! ```
//!
//! The planner produces the minimum-size layout that respects the requested
//! body alignment and redzone minimums. Padding is placed strictly between
//! the body and the fixed header/trailer, so an overflowing write chews
//! through sentinel bytes before it can reach any metadata.

use crate::error::{BlockError, Result};
use crate::header::{BLOCK_HEADER_SIZE, MAX_BODY_SIZE, SHADOW_RATIO};
use crate::trailer::BLOCK_TRAILER_SIZE;
use serde::{Deserialize, Serialize};

/// Widest header or trailer (padding included) representable in the 15-bit
/// compact descriptor fields.
pub const MAX_REDZONE_SIZE: usize = (1 << 15) - 1;

/// Planned byte layout for a block. Pure value, no identity; resolved
/// against an actual memory region by the initializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLayout {
    /// Alignment of the whole block (the chunk size it was planned for).
    pub block_alignment: usize,
    /// Total size of the block, a multiple of `block_alignment`.
    pub block_size: usize,
    pub header_padding_size: usize,
    pub body_size: usize,
    pub trailer_padding_size: usize,
    /// True when `trailer_padding_size` differs from the implicit amount
    /// and is therefore self-encoded in the padding's first 4 bytes.
    pub has_excess_trailer_padding: bool,
}

impl BlockLayout {
    /// Total header size, padding included.
    pub fn header_size(&self) -> usize {
        BLOCK_HEADER_SIZE + self.header_padding_size
    }

    /// Total trailer size, padding included.
    pub fn trailer_size(&self) -> usize {
        BLOCK_TRAILER_SIZE + self.trailer_padding_size
    }

    /// Offset of the body within the block.
    pub fn body_offset(&self) -> usize {
        self.header_size()
    }
}

/// Trailer padding needed to carry the body to the next half-shadow-unit
/// boundary. Always in `1..=SHADOW_RATIO/2`; a block whose actual trailer
/// padding equals this amount does not encode the length explicitly.
pub fn implicit_trailer_padding(body_size: usize) -> usize {
    let half = SHADOW_RATIO / 2;
    half - (body_size % half)
}

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Plan the layout of a block.
///
/// * `chunk_size`: the allocation is assumed made with this alignment and
///   will be a multiple of it in length. Power of two, >= `SHADOW_RATIO`.
/// * `alignment`: minimum alignment of the body. Power of two with
///   `SHADOW_RATIO <= alignment <= chunk_size`.
/// * `body_size`: usable bytes requested; may be zero.
/// * `min_left_redzone` / `min_right_redzone`: guard-region minimums,
///   fixed header/trailer included.
///
/// Fails with a constraint violation before any memory is touched; planning
/// has no side effects.
pub fn plan_layout(
    chunk_size: usize,
    alignment: usize,
    body_size: usize,
    min_left_redzone: usize,
    min_right_redzone: usize,
) -> Result<BlockLayout> {
    if !chunk_size.is_power_of_two() || chunk_size < SHADOW_RATIO {
        return Err(BlockError::InvalidChunkSize(chunk_size));
    }
    if !alignment.is_power_of_two() || alignment < SHADOW_RATIO || alignment > chunk_size {
        return Err(BlockError::InvalidAlignment {
            alignment,
            chunk_size,
        });
    }
    if body_size > MAX_BODY_SIZE {
        return Err(BlockError::BodyTooLarge(body_size));
    }
    if min_left_redzone > MAX_REDZONE_SIZE {
        return Err(BlockError::RedzoneTooLarge {
            size: min_left_redzone,
        });
    }
    if min_right_redzone > MAX_REDZONE_SIZE {
        return Err(BlockError::RedzoneTooLarge {
            size: min_right_redzone,
        });
    }

    // Left redzone: the fixed header, grown to meet the minimum and land
    // the body on its requested alignment. Non-zero padding comes out as a
    // multiple of SHADOW_RATIO, so it is always at least 8 bytes and can
    // hold its two 4-byte length fields without overlap.
    let header_size = align_up(min_left_redzone.max(BLOCK_HEADER_SIZE), alignment);
    let header_padding_size = header_size - BLOCK_HEADER_SIZE;
    if header_size > MAX_REDZONE_SIZE {
        return Err(BlockError::RedzoneTooLarge { size: header_size });
    }

    // Right redzone: start from the implicit padding, grow for the minimum,
    // then absorb the rounding of the whole block up to a chunk multiple.
    let implicit = implicit_trailer_padding(body_size);
    let min_trailer = (BLOCK_TRAILER_SIZE + implicit).max(min_right_redzone);
    let block_size = align_up(header_size + body_size + min_trailer, chunk_size);
    let trailer_size = block_size - header_size - body_size;
    let trailer_padding_size = trailer_size - BLOCK_TRAILER_SIZE;
    if trailer_size > MAX_REDZONE_SIZE {
        return Err(BlockError::RedzoneTooLarge { size: trailer_size });
    }

    let has_excess_trailer_padding = trailer_padding_size != implicit;
    // Excess padding is self-encoded; the construction above can only
    // deviate from the implicit amount by growing, never below 4 bytes.
    debug_assert!(!has_excess_trailer_padding || trailer_padding_size >= 4);

    Ok(BlockLayout {
        block_alignment: chunk_size,
        block_size,
        header_padding_size,
        body_size,
        trailer_padding_size,
        has_excess_trailer_padding,
    })
}
