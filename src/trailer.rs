//! The 20-byte block trailer found at the end of every right redzone.

use crate::error::{BlockError, Result};

/// Size of the fixed trailer, excluding padding.
///
/// Deliberately congruent to `SHADOW_RATIO / 2` modulo `SHADOW_RATIO`: the
/// body leaves half a shadow unit of slack on average, and the trailer
/// soaks it up without growing the block.
pub const BLOCK_TRAILER_SIZE: usize = 20;

/// Block trailer: five little-endian u32 fields.
///
/// `free_tid` and `free_ticks` are zero until the block leaves the
/// `Allocated` state. `alloc_ticks` combined with the block address acts as
/// a serial number for the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTrailer {
    pub alloc_tid: u32,
    pub free_tid: u32,
    pub alloc_ticks: u32,
    pub free_ticks: u32,
    pub heap_id: u32,
}

impl BlockTrailer {
    pub fn to_bytes(&self) -> [u8; BLOCK_TRAILER_SIZE] {
        let mut bytes = [0u8; BLOCK_TRAILER_SIZE];
        bytes[0..4].copy_from_slice(&self.alloc_tid.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.free_tid.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.alloc_ticks.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.free_ticks.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.heap_id.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BLOCK_TRAILER_SIZE {
            return Err(BlockError::BadRegion(format!(
                "trailer needs {} bytes, got {}",
                BLOCK_TRAILER_SIZE,
                bytes.len()
            )));
        }

        let word = |at: usize| {
            u32::from_le_bytes(bytes[at..at + 4].try_into().expect("sliced to 4 bytes"))
        };

        Ok(BlockTrailer {
            alloc_tid: word(0),
            free_tid: word(4),
            alloc_ticks: word(8),
            free_ticks: word(12),
            heap_id: word(16),
        })
    }
}
