//! Collaborator seams consumed by the block core.
//!
//! The core never talks to the operating system directly. Thread ids, tick
//! counts, heap ids and raw memory reads all arrive through the traits in
//! this module, so the same code serves both a live instrumented runtime and
//! offline tooling walking a captured dump.

use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Opaque handle into an external call-stack capture store.
///
/// The block core never dereferences these; it only stores and compares
/// them. Zero is the null handle. Two handles fit the eight header bytes
/// after the packed word, keeping the header at its fixed 16-byte size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackId(pub u32);

impl StackId {
    pub const NULL: StackId = StackId(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Ambient facts a block records at allocation and free time.
pub trait RuntimeContext {
    /// Identifier of the calling thread.
    fn thread_id(&self) -> u32;

    /// Monotonic tick count. Combined with the block address this acts as a
    /// serial number for the allocation.
    fn ticks(&self) -> u32;

    /// Identifier of the heap that owns the block.
    fn heap_id(&self) -> u32;
}

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_ID: u32 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Process-backed context for live instrumentation.
///
/// Thread ids are serial numbers handed out on first use per thread, so a
/// recycled OS thread id can never alias an older block's records.
pub struct SystemContext {
    heap_id: u32,
    epoch: Instant,
}

impl SystemContext {
    pub fn new(heap_id: u32) -> Self {
        SystemContext {
            heap_id,
            epoch: Instant::now(),
        }
    }
}

impl RuntimeContext for SystemContext {
    fn thread_id(&self) -> u32 {
        THREAD_ID.with(|id| *id)
    }

    fn ticks(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    fn heap_id(&self) -> u32 {
        self.heap_id
    }
}

/// Fault-intercepting memory access.
///
/// Implementations translate hardware faults (protected or unmapped pages)
/// into an ordinary `false`, never a crash. The runtime supplies the actual
/// trap mechanism; this crate contains no platform fault handling of its own.
pub trait GuardedReader {
    /// Attempt to fill `buf` from `addr`. Returns `false` if any byte of the
    /// range is unreadable; `buf` contents are then unspecified.
    fn try_read(&self, addr: usize, buf: &mut [u8]) -> bool;

    fn try_read_u32(&self, addr: usize) -> Option<u32> {
        let mut buf = [0u8; 4];
        if !self.try_read(addr, &mut buf) {
            return None;
        }
        Some(u32::from_le_bytes(buf))
    }

    fn try_read_u64(&self, addr: usize) -> Option<u64> {
        let mut buf = [0u8; 8];
        if !self.try_read(addr, &mut buf) {
            return None;
        }
        Some(u64::from_le_bytes(buf))
    }
}

/// Reader over an in-memory byte range, addressed as if it lived at `base`.
///
/// This is the reference implementation used by tests and by offline tools
/// that have the captured bytes in hand. Reads outside the range fault.
pub struct SliceReader<'a> {
    base: usize,
    bytes: &'a [u8],
}

impl<'a> SliceReader<'a> {
    pub fn new(base: usize, bytes: &'a [u8]) -> Self {
        SliceReader { base, bytes }
    }

    /// Address the slice at its own location in memory.
    pub fn for_slice(bytes: &'a [u8]) -> Self {
        SliceReader {
            base: bytes.as_ptr() as usize,
            bytes,
        }
    }
}

impl GuardedReader for SliceReader<'_> {
    fn try_read(&self, addr: usize, buf: &mut [u8]) -> bool {
        let Some(offset) = addr.checked_sub(self.base) else {
            return false;
        };
        let Some(end) = offset.checked_add(buf.len()) else {
            return false;
        };
        if end > self.bytes.len() {
            return false;
        }
        buf.copy_from_slice(&self.bytes[offset..end]);
        true
    }
}

/// Wraps a reader and faults on configured address ranges.
///
/// Models protected pages: analysis of a quarantined block whose redzones
/// are access-protected sees exactly this shape of reader.
pub struct MaskedReader<R> {
    inner: R,
    masked: Vec<Range<usize>>,
}

impl<R: GuardedReader> MaskedReader<R> {
    pub fn new(inner: R) -> Self {
        MaskedReader {
            inner,
            masked: Vec::new(),
        }
    }

    pub fn mask(mut self, range: Range<usize>) -> Self {
        self.masked.push(range);
        self
    }
}

impl<R: GuardedReader> GuardedReader for MaskedReader<R> {
    fn try_read(&self, addr: usize, buf: &mut [u8]) -> bool {
        let end = match addr.checked_add(buf.len()) {
            Some(end) => end,
            None => return false,
        };
        for m in &self.masked {
            if addr < m.end && end > m.start {
                return false;
            }
        }
        self.inner.try_read(addr, buf)
    }
}
