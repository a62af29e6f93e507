//! Defensive navigation of blocks from raw pointers.
//!
//! A non-corrupt block is self-describing: the header says whether padding
//! is present, non-zero header padding encodes its length in its first and
//! last 4 bytes, and excess trailer padding encodes its length up front.
//! That is enough to recover the whole descriptor from a header pointer, or
//! the header from a body pointer, in O(1).
//!
//! Nothing here dereferences memory directly. Every read goes through the
//! [`GuardedReader`] collaborator, so a protected page or garbage bytes
//! produce [`BlockError::NotABlock`], never a crash. Success only means the
//! bytes are internally consistent; run the analyzer for a real verdict.

use crate::error::{BlockError, Result};
use crate::header::{BlockState, RawHeaderBits, BLOCK_HEADER_SIZE, SHADOW_RATIO};
use crate::info::BlockInfo;
use crate::layout::{implicit_trailer_padding, MAX_REDZONE_SIZE};
use crate::runtime::GuardedReader;
use crate::trailer::BLOCK_TRAILER_SIZE;
use tracing::debug;

fn not_a_block<T>(why: &str, addr: usize) -> Result<T> {
    debug!(addr = format_args!("{:#x}", addr), why, "navigation rejected");
    Err(BlockError::NotABlock)
}

/// Recover the full descriptor of the block whose header is at
/// `header_addr`, using only in-band bits.
pub fn block_info_from_header(
    header_addr: usize,
    reader: &dyn GuardedReader,
) -> Result<BlockInfo> {
    let Some(word) = reader.try_read_u64(header_addr) else {
        return not_a_block("header unreadable", header_addr);
    };
    let raw = RawHeaderBits::unpack(word);
    if !raw.magic_is_valid() {
        return not_a_block("bad magic", header_addr);
    }
    if BlockState::from_u8(raw.state).is_err() {
        return not_a_block("undefined state", header_addr);
    }
    let body_size = raw.body_size as usize;

    let header_padding_size = if raw.has_header_padding {
        let pad_at = checked(header_addr.checked_add(BLOCK_HEADER_SIZE))?;
        let Some(len) = reader.try_read_u32(pad_at) else {
            return not_a_block("header padding unreadable", header_addr);
        };
        let len = len as usize;
        // Non-zero padding is at least 8 bytes (two non-overlapping length
        // fields) and keeps the header a multiple of the shadow ratio.
        if len < 8 || len % SHADOW_RATIO != 0 || len > MAX_REDZONE_SIZE {
            return not_a_block("implausible header padding length", header_addr);
        }
        let tail_at = checked(pad_at.checked_add(len - 4))?;
        let Some(tail_len) = reader.try_read_u32(tail_at) else {
            return not_a_block("header padding tail unreadable", header_addr);
        };
        if tail_len as usize != len {
            return not_a_block("header padding length copies disagree", header_addr);
        }
        len
    } else {
        0
    };

    let header_size = BLOCK_HEADER_SIZE + header_padding_size;
    let body_addr = checked(header_addr.checked_add(header_size))?;

    let trailer_padding_size = if raw.has_excess_trailer_padding {
        let pad_at = checked(body_addr.checked_add(body_size))?;
        let Some(len) = reader.try_read_u32(pad_at) else {
            return not_a_block("trailer padding unreadable", header_addr);
        };
        let len = len as usize;
        if len < 4 || len > MAX_REDZONE_SIZE {
            return not_a_block("implausible trailer padding length", header_addr);
        }
        len
    } else {
        implicit_trailer_padding(body_size)
    };

    let trailer_size = BLOCK_TRAILER_SIZE + trailer_padding_size;
    if header_size > MAX_REDZONE_SIZE || trailer_size > MAX_REDZONE_SIZE {
        return not_a_block("redzone exceeds descriptor width", header_addr);
    }
    let block_size = header_size + body_size + trailer_size;
    if block_size % SHADOW_RATIO != 0 || block_size > u32::MAX as usize {
        return not_a_block("implausible block size", header_addr);
    }
    checked(header_addr.checked_add(block_size))?;

    Ok(BlockInfo {
        base: header_addr,
        block_size,
        header_padding_size,
        body_size,
        trailer_padding_size,
        is_nested: raw.is_nested,
    })
}

/// Find the header of the block whose body starts at `body_addr`.
///
/// To navigate the rest of the block, follow up with
/// [`block_info_from_header`].
pub fn header_from_body(body_addr: usize, reader: &dyn GuardedReader) -> Result<usize> {
    // Unpadded case: the header immediately precedes the body.
    if let Some(header_addr) = body_addr.checked_sub(BLOCK_HEADER_SIZE) {
        if let Some(word) = reader.try_read_u64(header_addr) {
            let raw = RawHeaderBits::unpack(word);
            if raw.magic_is_valid() && !raw.has_header_padding {
                return Ok(header_addr);
            }
        }
    }

    // Padded case: the 4 bytes before the body are the trailing copy of
    // the padding length.
    let Some(tail_at) = body_addr.checked_sub(4) else {
        return not_a_block("body address too low", body_addr);
    };
    let Some(len) = reader.try_read_u32(tail_at) else {
        return not_a_block("padding length unreadable", body_addr);
    };
    let len = len as usize;
    if len < 8 || len % SHADOW_RATIO != 0 || len > MAX_REDZONE_SIZE {
        return not_a_block("implausible header padding length", body_addr);
    }
    let Some(header_addr) = body_addr.checked_sub(BLOCK_HEADER_SIZE + len) else {
        return not_a_block("body address too low", body_addr);
    };

    let Some(word) = reader.try_read_u64(header_addr) else {
        return not_a_block("header unreadable", body_addr);
    };
    let raw = RawHeaderBits::unpack(word);
    if !raw.magic_is_valid() || !raw.has_header_padding {
        return not_a_block("no padded header behind body", body_addr);
    }
    // Both length copies must agree before we trust the walk back.
    let Some(head_len) = reader.try_read_u32(header_addr + BLOCK_HEADER_SIZE) else {
        return not_a_block("header padding unreadable", body_addr);
    };
    if head_len as usize != len {
        return not_a_block("header padding length copies disagree", body_addr);
    }
    Ok(header_addr)
}

fn checked(addr: Option<usize>) -> Result<usize> {
    addr.ok_or(BlockError::NotABlock)
}
