//! Tree-Bitmap Buddy Allocator
//!
//! This crate implements a fixed-arena buddy allocator that tracks the state
//! of every power-of-two block in a complete binary tree of FREE/USED bits,
//! featuring:
//! - Pure index arithmetic over the implicit complete binary tree
//! - A packed per-node bit-state store, one bit per tree node
//! - O(log n) allocate/free with implicit splitting and buddy coalescing
//! - Heap walking and heap-integrity verification
//!
//! The allocator owns no memory: the caller supplies the arena and a
//! bookkeeping block sized by [`BuddyTreeAllocator::bookkeeping_size`], and
//! keeps both alive for the allocator's lifetime. All operations are
//! single-threaded; multi-threaded use requires an external lock.

#![no_std]

extern crate alloc;

use core::alloc::Layout;
use core::ptr::NonNull;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid configuration (e.g. non-power-of-two size, misaligned arena).
    InvalidParam,
    /// No free block large enough for the request.
    NoMemory,
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// Byte-granularity allocator.
pub trait ByteAllocator {
    /// Allocate memory with the given size (in bytes) and alignment.
    fn alloc(&mut self, layout: Layout) -> AllocResult<NonNull<u8>>;

    /// Deallocate memory at the given position, size, and alignment.
    fn dealloc(&mut self, pos: NonNull<u8>, layout: Layout);

    /// Returns total memory size in bytes.
    fn total_bytes(&self) -> usize;

    /// Returns allocated memory size in bytes.
    fn used_bytes(&self) -> usize;

    /// Returns available memory size in bytes.
    fn available_bytes(&self) -> usize;
}

#[inline]
pub(crate) const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
pub(crate) const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod tree_index;
pub use tree_index::{NodeIndex, TreeMetrics};

pub mod buddy;
pub use buddy::heap::BuddyTreeAllocator;
pub use buddy::node_bitmap::NodeBitmap;
#[cfg(feature = "tracking")]
pub use buddy::stats::HeapStats;
pub use buddy::stats::MAX_LEVELS;
