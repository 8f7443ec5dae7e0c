//! Complete-binary-tree index arithmetic
//!
//! Pure index math over the implicit complete binary tree used by the buddy
//! heap. The root is index 1; index 0 is padding and never represents a real
//! node. A node at depth `d` has its children at `2n` and `2n + 1`, its
//! parent at `n / 2`, and its buddy (the sibling sharing the same parent) at
//! `n ^ 1`. No bit storage lives here; this module only computes indices.

/// Maximum number of leaves a tree may have so that every index, including
/// the children of leaves probed by leaf checks, fits in a `u32`.
pub const MAX_LEAVES: usize = 1 << 30;

/// Index of one node in the complete binary tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIndex(u32);

impl NodeIndex {
    /// The unused padding slot before the root. It carries a bit in the
    /// bit-state store (kept permanently USED) but has no tree position.
    pub const PADDING: NodeIndex = NodeIndex(0);

    /// The root node, representing the whole arena.
    pub const ROOT: NodeIndex = NodeIndex(1);

    /// Create a node index from its raw value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw index value.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Left child of this node.
    pub const fn left_child(self) -> Self {
        Self(self.0 << 1)
    }

    /// Right child of this node.
    pub const fn right_child(self) -> Self {
        Self((self.0 << 1) + 1)
    }

    /// Parent of this node. The root's parent is the padding slot.
    pub const fn parent(self) -> Self {
        Self(self.0 >> 1)
    }

    /// The buddy occupying the other half of this node's parent range.
    /// The root's buddy is the padding slot, which is never FREE.
    pub const fn buddy(self) -> Self {
        Self(self.0 ^ 1)
    }

    /// Whether this node is its parent's left child.
    pub const fn is_left_child(self) -> bool {
        self.0 & 1 == 0
    }

    /// Tree depth of this node; the root is at depth 0.
    /// Not defined for [`NodeIndex::PADDING`].
    pub const fn depth(self) -> u32 {
        31 - self.0.leading_zeros()
    }

    /// Offset of this node within its tree level, counted from the left.
    pub const fn offset_in_level(self) -> u32 {
        self.0 - (1 << self.depth())
    }

    /// The leaf node covering the given leaf-granule offset, in a tree with
    /// `num_nodes` node slots (leaves occupy the second half of the index
    /// space).
    pub const fn from_leaf_offset(leaf_offset: u32, num_nodes: u32) -> Self {
        Self((num_nodes >> 1) + leaf_offset)
    }
}

/// Size metrics of a complete binary tree with a given leaf count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeMetrics {
    /// Number of node slots, including the padding slot at index 0.
    pub num_nodes: u32,
    /// Number of tree levels (root level included).
    pub num_levels: u32,
}

impl TreeMetrics {
    /// Compute the metrics for a tree with `leaf_count` leaves.
    ///
    /// Returns `None` when the leaf count is zero, not a power of two, or
    /// too large for `u32` node indices.
    pub fn for_leaves(leaf_count: usize) -> Option<Self> {
        if leaf_count == 0 || !leaf_count.is_power_of_two() || leaf_count > MAX_LEAVES {
            return None;
        }
        Some(Self {
            num_nodes: (leaf_count * 2) as u32,
            num_levels: leaf_count.trailing_zeros() + 1,
        })
    }
}
