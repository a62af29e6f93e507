//! The 16-byte block header found at the start of every left redzone.
//!
//! The first 8 bytes are a single little-endian packed word; the remaining
//! 8 bytes hold two stack-capture handles. The packed word layout is fixed
//! and must be reproduced byte-for-byte for interoperability with tools that
//! parse captured memory:
//!
//! ```text
//! bit  0..16   magic                        (0xCA80)
//! bit 16..29   checksum                     (13 bits, XOR-folded CRC32)
//! bit 29       is_nested
//! bit 30       has_header_padding
//! bit 31       has_excess_trailer_padding
//! bit 32..34   state                        (BlockState)
//! bit 34..64   body_size                    (30 bits)
//! ```
//!
//! A serialized header therefore always begins with the bytes `80 CA`.

use crate::error::{BlockError, Result};
use crate::runtime::StackId;
use serde::{Deserialize, Serialize};

/// Magic constant identifying a block header in memory.
pub const BLOCK_HEADER_MAGIC: u16 = 0xCA80;

/// Fill byte for header padding (left redzone).
pub const HEADER_PADDING_BYTE: u8 = 0x1C;

/// Fill byte for trailer padding (right redzone).
pub const TRAILER_PADDING_BYTE: u8 = 0xC3;

/// Width of the header checksum field.
pub const CHECKSUM_BITS: u32 = 13;

/// Mask of a folded checksum value.
pub const CHECKSUM_MASK: u16 = (1 << CHECKSUM_BITS) - 1;

/// Bytes of main memory per bookkeeping unit; base alignment granularity
/// for blocks.
pub const SHADOW_RATIO: usize = 8;

/// Size of the fixed header, excluding padding. A multiple of SHADOW_RATIO.
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Largest body size representable in the 30-bit header field.
pub const MAX_BODY_SIZE: usize = (1 << 30) - 1;

const MAGIC_SHIFT: u32 = 0;
const CHECKSUM_SHIFT: u32 = 16;
const NESTED_SHIFT: u32 = 29;
const HEADER_PADDING_SHIFT: u32 = 30;
const EXCESS_TRAILER_SHIFT: u32 = 31;
const STATE_SHIFT: u32 = 32;
const BODY_SIZE_SHIFT: u32 = 34;

const STATE_MASK: u64 = 0x3;
const BODY_SIZE_MASK: u64 = (1 << 30) - 1;

/// Lifecycle state of a block, in the order an allocation moves through
/// them. Transitions are monotonic: the state of a given memory instance
/// never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockState {
    /// Allocated and valid for reading and writing.
    Allocated = 0,
    /// Quarantined: still owned by the heap, not valid for access.
    Quarantined = 1,
    /// Returned to the heap, eligible for reuse, not valid for access.
    Freed = 2,
}

impl BlockState {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(BlockState::Allocated),
            1 => Ok(BlockState::Quarantined),
            2 => Ok(BlockState::Freed),
            _ => Err(BlockError::InvalidBlockState(value)),
        }
    }
}

/// Unvalidated view of the packed first word.
///
/// This is the raw half of the raw-vs-checked split: the analyzer uses it to
/// look at arbitrary bytes without tripping over a bad magic or state value.
/// [`BlockHeader`] is the checked half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeaderBits {
    pub magic: u16,
    pub checksum: u16,
    pub is_nested: bool,
    pub has_header_padding: bool,
    pub has_excess_trailer_padding: bool,
    pub state: u8,
    pub body_size: u32,
}

impl RawHeaderBits {
    pub fn unpack(word: u64) -> Self {
        RawHeaderBits {
            magic: (word >> MAGIC_SHIFT) as u16,
            checksum: ((word >> CHECKSUM_SHIFT) as u16) & CHECKSUM_MASK,
            is_nested: word & (1 << NESTED_SHIFT) != 0,
            has_header_padding: word & (1 << HEADER_PADDING_SHIFT) != 0,
            has_excess_trailer_padding: word & (1 << EXCESS_TRAILER_SHIFT) != 0,
            state: ((word >> STATE_SHIFT) & STATE_MASK) as u8,
            body_size: ((word >> BODY_SIZE_SHIFT) & BODY_SIZE_MASK) as u32,
        }
    }

    pub fn pack(&self) -> u64 {
        let mut word = 0u64;
        word |= (self.magic as u64) << MAGIC_SHIFT;
        word |= ((self.checksum & CHECKSUM_MASK) as u64) << CHECKSUM_SHIFT;
        word |= (self.is_nested as u64) << NESTED_SHIFT;
        word |= (self.has_header_padding as u64) << HEADER_PADDING_SHIFT;
        word |= (self.has_excess_trailer_padding as u64) << EXCESS_TRAILER_SHIFT;
        word |= ((self.state as u64) & STATE_MASK) << STATE_SHIFT;
        word |= ((self.body_size as u64) & BODY_SIZE_MASK) << BODY_SIZE_SHIFT;
        word
    }

    pub fn magic_is_valid(&self) -> bool {
        self.magic == BLOCK_HEADER_MAGIC
    }
}

/// Validated block header.
///
/// The magic field is implicit: it is always written as
/// [`BLOCK_HEADER_MAGIC`] and verified on every parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub checksum: u16,
    pub is_nested: bool,
    pub has_header_padding: bool,
    pub has_excess_trailer_padding: bool,
    pub state: BlockState,
    pub body_size: u32,
    pub alloc_stack: StackId,
    pub free_stack: StackId,
}

impl BlockHeader {
    /// Header for a freshly allocated block. The checksum is left at zero
    /// and both stack handles null; the caller fills those in afterwards.
    pub fn allocated(
        body_size: u32,
        is_nested: bool,
        has_header_padding: bool,
        has_excess_trailer_padding: bool,
    ) -> Self {
        BlockHeader {
            checksum: 0,
            is_nested,
            has_header_padding,
            has_excess_trailer_padding,
            state: BlockState::Allocated,
            body_size,
            alloc_stack: StackId::NULL,
            free_stack: StackId::NULL,
        }
    }

    fn bits(&self) -> RawHeaderBits {
        RawHeaderBits {
            magic: BLOCK_HEADER_MAGIC,
            checksum: self.checksum,
            is_nested: self.is_nested,
            has_header_padding: self.has_header_padding,
            has_excess_trailer_padding: self.has_excess_trailer_padding,
            state: self.state as u8,
            body_size: self.body_size,
        }
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut bytes = [0u8; BLOCK_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.bits().pack().to_le_bytes());
        bytes[8..12].copy_from_slice(&self.alloc_stack.0.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.free_stack.0.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BLOCK_HEADER_SIZE {
            return Err(BlockError::BadRegion(format!(
                "header needs {} bytes, got {}",
                BLOCK_HEADER_SIZE,
                bytes.len()
            )));
        }

        let word = u64::from_le_bytes(bytes[0..8].try_into().expect("sliced to 8 bytes"));
        let raw = RawHeaderBits::unpack(word);
        if !raw.magic_is_valid() {
            return Err(BlockError::NotABlock);
        }
        let state = BlockState::from_u8(raw.state)?;

        Ok(BlockHeader {
            checksum: raw.checksum,
            is_nested: raw.is_nested,
            has_header_padding: raw.has_header_padding,
            has_excess_trailer_padding: raw.has_excess_trailer_padding,
            state,
            body_size: raw.body_size,
            alloc_stack: StackId(u32::from_le_bytes(
                bytes[8..12].try_into().expect("sliced to 4 bytes"),
            )),
            free_stack: StackId(u32::from_le_bytes(
                bytes[12..16].try_into().expect("sliced to 4 bytes"),
            )),
        })
    }
}

/// Clear the checksum bits of a packed word. The checksum engine hashes
/// this form so the stored value never feeds into its own computation.
#[inline]
pub(crate) fn word_without_checksum(word: u64) -> u64 {
    word & !((CHECKSUM_MASK as u64) << CHECKSUM_SHIFT)
}

/// Overwrite the checksum bits in the packed word at the start of `block`.
pub(crate) fn store_checksum(block: &mut [u8], checksum: u16) {
    let mut word = u64::from_le_bytes(block[0..8].try_into().expect("sliced to 8 bytes"));
    word = word_without_checksum(word);
    word |= ((checksum & CHECKSUM_MASK) as u64) << CHECKSUM_SHIFT;
    block[0..8].copy_from_slice(&word.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_round_trip() {
        let raw = RawHeaderBits {
            magic: BLOCK_HEADER_MAGIC,
            checksum: 0x1234 & CHECKSUM_MASK,
            is_nested: true,
            has_header_padding: false,
            has_excess_trailer_padding: true,
            state: BlockState::Quarantined as u8,
            body_size: 0x3FFF_FFFF,
        };
        assert_eq!(RawHeaderBits::unpack(raw.pack()), raw);
    }

    #[test]
    fn test_serialized_header_starts_with_magic_bytes() {
        let header = BlockHeader::allocated(16, false, false, false);
        let bytes = header.to_bytes();
        // 0xCA80 little-endian.
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], 0xCA);
    }

    #[test]
    fn test_field_isolation() {
        // Each field lands in its own bits; flipping one leaves the rest.
        let base = BlockHeader::allocated(123, false, true, false);
        let mut nested = base;
        nested.is_nested = true;

        let a = RawHeaderBits::unpack(u64::from_le_bytes(
            base.to_bytes()[0..8].try_into().unwrap(),
        ));
        let b = RawHeaderBits::unpack(u64::from_le_bytes(
            nested.to_bytes()[0..8].try_into().unwrap(),
        ));
        assert!(!a.is_nested);
        assert!(b.is_nested);
        assert_eq!(a.body_size, b.body_size);
        assert_eq!(a.has_header_padding, b.has_header_padding);
        assert_eq!(a.magic, b.magic);
    }

    #[test]
    fn test_header_bytes_round_trip() {
        let mut header = BlockHeader::allocated(4096, true, true, true);
        header.checksum = 0x0ABC;
        header.alloc_stack = StackId(0xDEAD_BEEF);

        let parsed = BlockHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed.checksum, 0x0ABC);
        assert!(parsed.is_nested);
        assert!(parsed.has_header_padding);
        assert!(parsed.has_excess_trailer_padding);
        assert_eq!(parsed.state, BlockState::Allocated);
        assert_eq!(parsed.body_size, 4096);
        assert_eq!(parsed.alloc_stack, StackId(0xDEAD_BEEF));
    }

    #[test]
    fn test_from_bytes_rejects_bad_magic() {
        let header = BlockHeader::allocated(8, false, false, false);
        let mut bytes = header.to_bytes();
        bytes[1] ^= 0x01;
        assert!(matches!(
            BlockHeader::from_bytes(&bytes),
            Err(BlockError::NotABlock)
        ));
    }

    #[test]
    fn test_from_bytes_rejects_undefined_state() {
        let raw = RawHeaderBits {
            magic: BLOCK_HEADER_MAGIC,
            checksum: 0,
            is_nested: false,
            has_header_padding: false,
            has_excess_trailer_padding: false,
            state: 3,
            body_size: 0,
        };
        let mut bytes = [0u8; BLOCK_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&raw.pack().to_le_bytes());
        assert!(matches!(
            BlockHeader::from_bytes(&bytes),
            Err(BlockError::InvalidBlockState(3))
        ));
    }

    #[test]
    fn test_block_state_from_u8() {
        assert_eq!(BlockState::from_u8(0).unwrap(), BlockState::Allocated);
        assert_eq!(BlockState::from_u8(1).unwrap(), BlockState::Quarantined);
        assert_eq!(BlockState::from_u8(2).unwrap(), BlockState::Freed);
        assert!(BlockState::from_u8(3).is_err());
    }

    #[test]
    fn test_store_checksum_touches_only_checksum_bits() {
        let mut header = BlockHeader::allocated(999, true, false, true);
        header.checksum = 0;
        let mut bytes = header.to_bytes().to_vec();

        store_checksum(&mut bytes, 0x1FFF);
        let parsed = BlockHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.checksum, 0x1FFF);
        assert_eq!(parsed.body_size, 999);
        assert!(parsed.is_nested);
        assert!(parsed.has_excess_trailer_padding);

        store_checksum(&mut bytes, 0);
        let parsed = BlockHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.checksum, 0);
        assert_eq!(parsed.body_size, 999);
    }
}
