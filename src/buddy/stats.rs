//! Statistics for the buddy tree heap
//!
//! Aggregated free/used accounting and per-level free-block counts, computed
//! by walking the heap's maximal blocks.

/// Maximum number of tree levels a heap can have with `u32` node indices.
pub const MAX_LEVELS: usize = 32;

/// Buddy heap statistics
#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    pub total_bytes: usize,
    pub free_bytes: usize,
    pub used_bytes: usize,
    /// Number of maximal free blocks per tree level; level 0 is the root
    /// (whole-arena) level.
    pub free_blocks_by_level: [usize; MAX_LEVELS],
}

impl Default for HeapStats {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapStats {
    pub const fn new() -> Self {
        Self {
            total_bytes: 0,
            free_bytes: 0,
            used_bytes: 0,
            free_blocks_by_level: [0; MAX_LEVELS],
        }
    }

    /// Add statistics from another heap (for callers managing several arenas).
    pub fn add(&mut self, other: &HeapStats) {
        self.total_bytes += other.total_bytes;
        self.free_bytes += other.free_bytes;
        self.used_bytes += other.used_bytes;
        for (i, &count) in other.free_blocks_by_level.iter().enumerate() {
            self.free_blocks_by_level[i] += count;
        }
    }
}
