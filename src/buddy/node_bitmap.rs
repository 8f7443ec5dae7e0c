//! Bit-state store for tree nodes
//!
//! Maps a node index to a (word, bit) location in the caller-provided
//! bookkeeping words and tests/updates its FREE/USED flag. A set bit means
//! USED. Words fill from the most-significant bit down: node 0 occupies the
//! top bit of word 0.

use crate::tree_index::NodeIndex;

/// Number of state bits held by one bookkeeping word.
pub const WORD_BITS: u32 = usize::BITS;

/// View over the packed node-state words of one heap.
///
/// The view does not own the words and performs no bounds checks; the heap
/// guarantees every node index it passes is below its node count.
pub struct NodeBitmap {
    words: *mut usize,
}

impl NodeBitmap {
    /// Create a view over the state words starting at `words`.
    ///
    /// # Safety
    ///
    /// `words` must point to enough initialized words to hold one bit per
    /// node of the tree, and the region must stay valid and exclusively
    /// reachable through views derived from the same heap for as long as the
    /// view is used.
    pub unsafe fn new(words: *mut usize) -> Self {
        Self { words }
    }

    /// (word index, bit mask) for a node.
    const fn locate(node: NodeIndex) -> (usize, usize) {
        let raw = node.get();
        let word = (raw / WORD_BITS) as usize;
        let mask = 1usize << (WORD_BITS - 1 - (raw % WORD_BITS));
        (word, mask)
    }

    /// Whether the node is FREE (no live allocation anywhere in its range).
    pub fn is_free(&self, node: NodeIndex) -> bool {
        let (word, mask) = Self::locate(node);
        unsafe { *self.words.add(word) & mask == 0 }
    }

    /// Mark the node USED.
    pub fn set_used(&mut self, node: NodeIndex) {
        let (word, mask) = Self::locate(node);
        unsafe { *self.words.add(word) |= mask };
    }

    /// Mark the node FREE.
    pub fn set_free(&mut self, node: NodeIndex) {
        let (word, mask) = Self::locate(node);
        unsafe { *self.words.add(word) &= !mask };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msb_first_layout() {
        let mut words = [0usize; 2];
        let mut bm = unsafe { NodeBitmap::new(words.as_mut_ptr()) };

        bm.set_used(NodeIndex::new(0));
        assert_eq!(words[0], 1usize << (WORD_BITS - 1));

        bm.set_used(NodeIndex::new(1));
        assert_eq!(words[0], 0b11usize << (WORD_BITS - 2));

        // First node of the second word lands on that word's top bit
        bm.set_used(NodeIndex::new(WORD_BITS));
        assert_eq!(words[1], 1usize << (WORD_BITS - 1));
    }

    #[test]
    fn test_set_and_clear() {
        let mut words = [0usize; 4];
        let mut bm = unsafe { NodeBitmap::new(words.as_mut_ptr()) };

        for raw in 0..(4 * WORD_BITS) {
            assert!(bm.is_free(NodeIndex::new(raw)));
        }

        bm.set_used(NodeIndex::new(7));
        bm.set_used(NodeIndex::new(130));
        assert!(!bm.is_free(NodeIndex::new(7)));
        assert!(!bm.is_free(NodeIndex::new(130)));
        assert!(bm.is_free(NodeIndex::new(6)));
        assert!(bm.is_free(NodeIndex::new(131)));

        bm.set_free(NodeIndex::new(7));
        assert!(bm.is_free(NodeIndex::new(7)));
        assert!(!bm.is_free(NodeIndex::new(130)));

        // Clearing an already-free node changes nothing
        bm.set_free(NodeIndex::new(7));
        assert!(bm.is_free(NodeIndex::new(7)));
    }
}
