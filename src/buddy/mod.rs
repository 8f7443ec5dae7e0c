//! Tree-bitmap buddy heap module
//!
//! This module provides a complete buddy heap implementation with:
//! - A packed bit-state store, one FREE/USED bit per tree node
//! - Recursive allocate with implicit splitting and left-first placement
//! - Free with buddy coalescing
//! - Heap walking, statistics and integrity checking

pub mod heap;
pub mod node_bitmap;
pub mod stats;

pub use heap::BuddyTreeAllocator;
pub use node_bitmap::NodeBitmap;
#[cfg(feature = "tracking")]
pub use stats::HeapStats;
pub use stats::MAX_LEVELS;
