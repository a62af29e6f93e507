//! Whole-block integrity checksum.
//!
//! A CRC32 is taken over the entire block (header, both paddings, body,
//! trailer) and XOR-folded down to the 13-bit header field. The stored
//! checksum never feeds its own computation: the packed header word is
//! copied to the stack with the checksum bits cleared and hashed from the
//! copy. Nothing is mutated in place during computation, so a concurrent
//! reader can never observe a transiently-zeroed field; callers still need
//! exclusive write access for [`set_checksum`] itself.

use crate::error::{BlockError, Result};
use crate::header::{self, RawHeaderBits, CHECKSUM_BITS, CHECKSUM_MASK};
use crate::info::BlockInfo;

fn fold(crc: u32) -> u16 {
    ((crc ^ (crc >> CHECKSUM_BITS) ^ (crc >> (2 * CHECKSUM_BITS))) as u16) & CHECKSUM_MASK
}

fn check_region(info: &BlockInfo, block: &[u8]) -> Result<()> {
    if block.len() != info.block_size {
        return Err(BlockError::BadRegion(format!(
            "checksum over {} bytes, block_size is {}",
            block.len(),
            info.block_size
        )));
    }
    Ok(())
}

/// Calculate the checksum of the block. The stored checksum value does not
/// participate; all other bytes do.
pub fn block_checksum(info: &BlockInfo, block: &[u8]) -> Result<u16> {
    check_region(info, block)?;

    let word = u64::from_le_bytes(block[0..8].try_into().expect("sliced to 8 bytes"));
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header::word_without_checksum(word).to_le_bytes());
    hasher.update(&block[8..]);
    Ok(fold(hasher.finalize()))
}

/// Recompute the checksum and compare against the stored header field.
pub fn checksum_is_valid(info: &BlockInfo, block: &[u8]) -> Result<bool> {
    let computed = block_checksum(info, block)?;
    let word = u64::from_le_bytes(block[0..8].try_into().expect("sliced to 8 bytes"));
    Ok(RawHeaderBits::unpack(word).checksum == computed)
}

/// Calculate the checksum and store it in the header.
///
/// Requires exclusive access to the block for the duration; the core does
/// not lock (see the crate-level concurrency contract).
pub fn set_checksum(info: &BlockInfo, block: &mut [u8]) -> Result<()> {
    let computed = block_checksum(info, block)?;
    header::store_checksum(block, computed);
    Ok(())
}
