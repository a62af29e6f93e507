use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlockError {
    #[error("Invalid chunk size: {0} (must be a power of two >= the shadow ratio)")]
    InvalidChunkSize(usize),

    #[error("Invalid alignment: {alignment} (must be a power of two between the shadow ratio and chunk size {chunk_size})")]
    InvalidAlignment { alignment: usize, chunk_size: usize },

    #[error("Body size {0} exceeds the 30-bit header field")]
    BodyTooLarge(usize),

    #[error("Redzone of {size} bytes exceeds the 15-bit descriptor field")]
    RedzoneTooLarge { size: usize },

    #[error("Bad memory region: {0}")]
    BadRegion(String),

    #[error("Invalid block state value: {0}")]
    InvalidBlockState(u8),

    #[error("Invalid block state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: crate::header::BlockState,
        to: crate::header::BlockState,
    },

    #[error("Memory does not contain a valid block")]
    NotABlock,

    #[error("Range {start}..{end} is out of bounds for a region of {len} bytes")]
    OutOfBounds {
        start: usize,
        end: usize,
        len: usize,
    },
}

pub type Result<T> = std::result::Result<T, BlockError>;
