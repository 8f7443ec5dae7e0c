//! Buddy tree heap over a caller-owned arena
//!
//! Implements the core buddy algorithm on top of the node bitmap: allocate
//! with implicit splitting, free with buddy coalescing, in-place resize, and
//! read-only heap introspection.
//!
//! Every tree node carries one FREE/USED bit. FREE means "no live allocation
//! anywhere in this node's range", not "this exact node is unallocated": a
//! node is USED either because it is itself the block handed back by an
//! allocation, or because an allocation lives somewhere below it. It follows
//! that every descendant of a FREE node is FREE, so walks may stop the moment
//! they see a FREE bit. A USED node whose two children are both FREE is an
//! atomic allocation and is never subdivided.

use core::alloc::Layout;
use core::mem;
use core::ptr::NonNull;

use crate::tree_index::{NodeIndex, TreeMetrics};
use crate::{AllocError, AllocResult, ByteAllocator};

use super::node_bitmap::{NodeBitmap, WORD_BITS};
#[cfg(feature = "tracking")]
use super::stats::HeapStats;

#[cfg(feature = "log")]
use log::{debug, error, info};

/// Bookkeeping header placed at the start of the caller's bookkeeping block.
/// The bit-state words follow immediately after, word-aligned. This block is
/// the heap's sole persistent state; the handle is just a pointer to it.
#[repr(C)]
struct HeapHeader {
    arena: NonNull<u8>,
    arena_bytes: usize,
    min_block_size: usize,
    min_block_log2: u32,
    num_nodes: u32,
}

const BITMAP_OFFSET: usize =
    crate::align_up(mem::size_of::<HeapHeader>(), mem::align_of::<usize>());

/// Buddy heap handle.
///
/// Created over a caller-owned arena and bookkeeping block by
/// [`BuddyTreeAllocator::create`]; the heap itself never allocates or frees
/// backing memory. Operations are synchronous tree walks bounded by
/// `O(log(arena_bytes / min_block_size))`.
pub struct BuddyTreeAllocator {
    hdr: NonNull<HeapHeader>,
}

impl BuddyTreeAllocator {
    /// Bytes of bookkeeping memory needed for an arena of `arena_bytes`
    /// managed at `min_block_size` granularity (header plus bit-state words).
    ///
    /// Both sizes must be powers of two with `min_block_size <= arena_bytes`,
    /// and the resulting node count must fit the `u32` index type.
    pub fn bookkeeping_size(arena_bytes: usize, min_block_size: usize) -> AllocResult<usize> {
        let metrics = Self::metrics_for(arena_bytes, min_block_size)?;
        Ok(BITMAP_OFFSET + bitmap_words(metrics.num_nodes) * mem::size_of::<usize>())
    }

    fn metrics_for(arena_bytes: usize, min_block_size: usize) -> AllocResult<TreeMetrics> {
        if !arena_bytes.is_power_of_two()
            || !min_block_size.is_power_of_two()
            || min_block_size > arena_bytes
        {
            error!(
                "buddy heap: invalid configuration: arena {:#x}, min block {:#x}",
                arena_bytes, min_block_size
            );
            return Err(AllocError::InvalidParam);
        }
        let leaf_count = arena_bytes / min_block_size;
        match TreeMetrics::for_leaves(leaf_count) {
            Some(metrics) => Ok(metrics),
            None => {
                error!(
                    "buddy heap: {} leaves do not fit the node index type",
                    leaf_count
                );
                Err(AllocError::InvalidParam)
            }
        }
    }

    /// Create a heap over `arena`, storing all state in `bookkeeping`.
    ///
    /// The arena must be aligned to `min_block_size`. Every node starts FREE
    /// except the padding slot before the root, which is marked USED once and
    /// never touched again.
    ///
    /// # Safety
    ///
    /// `arena` must be valid for reads and writes of `arena_bytes` bytes and
    /// `bookkeeping` for [`Self::bookkeeping_size`] bytes, both exclusively
    /// owned by the returned handle (and any [`Self::from_raw`] aliases the
    /// caller derives from it) until the caller reclaims them.
    pub unsafe fn create(
        arena: NonNull<u8>,
        arena_bytes: usize,
        min_block_size: usize,
        bookkeeping: NonNull<u8>,
    ) -> AllocResult<Self> {
        let metrics = Self::metrics_for(arena_bytes, min_block_size)?;
        if !crate::is_aligned(arena.as_ptr() as usize, min_block_size) {
            error!(
                "buddy heap: arena {:p} not aligned to min block size {:#x}",
                arena, min_block_size
            );
            return Err(AllocError::InvalidParam);
        }
        if !crate::is_aligned(bookkeeping.as_ptr() as usize, mem::align_of::<HeapHeader>()) {
            error!("buddy heap: bookkeeping block {:p} misaligned", bookkeeping);
            return Err(AllocError::InvalidParam);
        }

        let hdr = bookkeeping.cast::<HeapHeader>();
        hdr.as_ptr().write(HeapHeader {
            arena,
            arena_bytes,
            min_block_size,
            min_block_log2: min_block_size.trailing_zeros(),
            num_nodes: metrics.num_nodes,
        });

        let heap = Self { hdr };
        core::ptr::write_bytes(heap.bitmap_ptr(), 0, bitmap_words(metrics.num_nodes));
        heap.bitmap().set_used(NodeIndex::PADDING);
        Ok(heap)
    }

    /// Reattach a handle to a bookkeeping block previously initialized by
    /// [`Self::create`].
    ///
    /// # Safety
    ///
    /// `bookkeeping` must point to a live header written by `create`, and the
    /// exclusivity contract of `create` carries over to the new handle.
    pub unsafe fn from_raw(bookkeeping: NonNull<u8>) -> Self {
        Self {
            hdr: bookkeeping.cast(),
        }
    }

    /// The bookkeeping block this handle operates on.
    pub fn as_raw(&self) -> NonNull<u8> {
        self.hdr.cast()
    }

    /// Tear down the handle. The heap holds no destructible resources; the
    /// caller owns and frees the arena and bookkeeping memory.
    pub fn destroy(self) {}

    fn header(&self) -> &HeapHeader {
        unsafe { self.hdr.as_ref() }
    }

    fn bitmap_ptr(&self) -> *mut usize {
        unsafe { self.hdr.as_ptr().cast::<u8>().add(BITMAP_OFFSET) as *mut usize }
    }

    fn bitmap(&self) -> NodeBitmap {
        unsafe { NodeBitmap::new(self.bitmap_ptr()) }
    }

    /// Base address of the managed arena.
    pub fn arena(&self) -> NonNull<u8> {
        self.header().arena
    }

    /// Size of the managed arena in bytes.
    pub fn arena_bytes(&self) -> usize {
        self.header().arena_bytes
    }

    /// Finest allocation granularity in bytes.
    pub fn min_block_size(&self) -> usize {
        self.header().min_block_size
    }

    /// Bytes of bookkeeping memory this heap occupies.
    pub fn overhead(&self) -> usize {
        BITMAP_OFFSET + bitmap_words(self.header().num_nodes) * mem::size_of::<usize>()
    }

    /// Block size represented by a node at this node's tree level.
    fn level_size(&self, node: NodeIndex) -> usize {
        self.header().arena_bytes >> node.depth()
    }

    /// Address of the range a node represents.
    fn node_ptr(&self, node: NodeIndex) -> NonNull<u8> {
        let offset = node.offset_in_level() as usize * self.level_size(node);
        unsafe { NonNull::new_unchecked(self.header().arena.as_ptr().add(offset)) }
    }

    fn is_leaf(&self, node: NodeIndex) -> bool {
        node.left_child().get() >= self.header().num_nodes
    }

    /// Leaf node covering `ptr`. Panics when `ptr` lies outside the arena:
    /// that is caller memory corruption, not a recoverable condition.
    fn leaf_for_ptr(&self, ptr: NonNull<u8>) -> NodeIndex {
        let hdr = self.header();
        let base = hdr.arena.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        assert!(
            addr >= base && addr < base + hdr.arena_bytes,
            "buddy heap: pointer {:#x} outside arena [{:#x}, {:#x})",
            addr,
            base,
            base + hdr.arena_bytes
        );
        let leaf_offset = ((addr - base) >> hdr.min_block_log2) as u32;
        NodeIndex::from_leaf_offset(leaf_offset, hdr.num_nodes)
    }

    /// First USED node on the path from `ptr`'s leaf to the root. For any
    /// pointer into a live block this is exactly the node handed back by the
    /// original allocation; `None` means the range holds no allocation.
    fn live_node_for(&self, ptr: NonNull<u8>) -> Option<NodeIndex> {
        let bm = self.bitmap();
        let mut node = self.leaf_for_ptr(ptr);
        loop {
            if !bm.is_free(node) {
                return Some(node);
            }
            if node == NodeIndex::ROOT {
                return None;
            }
            node = node.parent();
        }
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// The block size is `size` rounded up to a power of two, floored at the
    /// minimum block size and raised to `align`. Placement prefers the left
    /// child at every level; only natural power-of-two placement within the
    /// arena is guaranteed, so absolute alignment beyond `min_block_size`
    /// additionally depends on the arena base address.
    pub fn memalign(&mut self, align: usize, size: usize) -> AllocResult<NonNull<u8>> {
        let align = align.max(1);
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidParam);
        }
        let arena_bytes = self.header().arena_bytes;
        let block_size = size
            .next_power_of_two()
            .max(self.header().min_block_size)
            .max(align);
        if block_size > arena_bytes {
            debug!(
                "buddy heap: allocation failure: {} bytes rounds to {:#x}, arena is {:#x}",
                size, block_size, arena_bytes
            );
            return Err(AllocError::NoMemory);
        }

        let mut bm = self.bitmap();
        match Self::alloc_node(&mut bm, NodeIndex::ROOT, arena_bytes, block_size) {
            Some(node) => Ok(self.node_ptr(node)),
            None => {
                debug!(
                    "buddy heap: allocation failure: no free block of {:#x} bytes",
                    block_size
                );
                Err(AllocError::NoMemory)
            }
        }
    }

    /// Allocate a block of at least `size` bytes at natural alignment.
    pub fn malloc(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        self.memalign(1, size)
    }

    fn alloc_node(
        bm: &mut NodeBitmap,
        node: NodeIndex,
        level_size: usize,
        block_size: usize,
    ) -> Option<NodeIndex> {
        if level_size == block_size {
            if bm.is_free(node) {
                bm.set_used(node);
                return Some(node);
            }
            return None;
        }

        let left = node.left_child();
        let right = node.right_child();
        // A USED node with two FREE children is an atomic allocation; its
        // range is spoken for as a whole and cannot be split.
        if !bm.is_free(node) && bm.is_free(left) && bm.is_free(right) {
            return None;
        }

        let half = level_size >> 1;
        let hit = match Self::alloc_node(bm, left, half, block_size) {
            Some(hit) => hit,
            None => Self::alloc_node(bm, right, half, block_size)?,
        };
        // The node now has an allocation below it and is no longer a whole
        // free unit.
        if bm.is_free(node) {
            bm.set_used(node);
        }
        Some(hit)
    }

    /// Free the allocation containing `ptr`.
    ///
    /// Panics when `ptr` lies outside the arena or its range holds no live
    /// allocation; both indicate caller corruption.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let Some(mut node) = self.live_node_for(ptr) else {
            panic!(
                "buddy heap: free of {:p} with no live allocation in range",
                ptr
            );
        };
        let mut bm = self.bitmap();
        bm.set_free(node);
        // Coalesce: while the buddy is also free the parent range holds no
        // allocation either. The root's buddy is the padding slot, which is
        // permanently USED, so the climb cannot pass the root.
        while node != NodeIndex::ROOT && bm.is_free(node.buddy()) {
            node = node.parent();
            bm.set_free(node);
        }
    }

    /// Resize the allocation containing `ptr` to at least `new_size` bytes.
    ///
    /// Same rounded size is a no-op. A shrink always succeeds in place, a
    /// grow succeeds in place when the block can absorb free buddies without
    /// moving; otherwise the data is copied into a fresh block and the old
    /// one freed. On failure the original allocation is untouched.
    ///
    /// Panics when `ptr` lies outside the arena or holds no live allocation.
    pub fn realloc(&mut self, ptr: NonNull<u8>, new_size: usize) -> AllocResult<NonNull<u8>> {
        let arena_bytes = self.header().arena_bytes;
        let new_block = new_size
            .next_power_of_two()
            .max(self.header().min_block_size);
        if new_block > arena_bytes {
            debug!(
                "buddy heap: realloc failure: {} bytes rounds to {:#x}, arena is {:#x}",
                new_size, new_block, arena_bytes
            );
            return Err(AllocError::NoMemory);
        }

        let Some(node) = self.live_node_for(ptr) else {
            panic!(
                "buddy heap: realloc of {:p} with no live allocation in range",
                ptr
            );
        };
        let old_block = self.level_size(node);
        if new_block == old_block {
            return Ok(ptr);
        }

        let mut bm = self.bitmap();
        if new_block < old_block {
            // Shrink in place: the leftmost part keeps the address. The node
            // stays USED as a subdivided ancestor and the chain of left
            // children down to the new exact node becomes USED; every right
            // sibling on the way stays FREE.
            let mut cur = node;
            let mut size = old_block;
            while size > new_block {
                cur = cur.left_child();
                size >>= 1;
                bm.set_used(cur);
            }
            return Ok(ptr);
        }

        // Grow in place only while the block keeps its address: the node must
        // be a left child with a FREE buddy at every level up to the target.
        let mut target = node;
        let mut size = old_block;
        let mut in_place = true;
        while size < new_block {
            if target == NodeIndex::ROOT
                || !target.is_left_child()
                || !bm.is_free(target.buddy())
            {
                in_place = false;
                break;
            }
            target = target.parent();
            size <<= 1;
        }
        if in_place {
            // The target is already USED as an ancestor of the old block.
            // Clearing the old path below it leaves the target an atomic
            // allocation of the new size with both children FREE.
            let mut cur = node;
            while cur != target {
                bm.set_free(cur);
                cur = cur.parent();
            }
            return Ok(ptr);
        }

        // Relocate: allocate first so a failure leaves the old block intact.
        let new_ptr = self.memalign(1, new_size)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                new_ptr.as_ptr(),
                old_block.min(new_block),
            );
        }
        self.free(ptr);
        Ok(new_ptr)
    }

    /// Block size of the allocation containing `ptr`, or 0 when the climb
    /// reaches a FREE root (corrupt state).
    ///
    /// Panics when `ptr` lies outside the arena.
    pub fn block_size(&self, ptr: NonNull<u8>) -> usize {
        match self.live_node_for(ptr) {
            Some(node) => self.level_size(node),
            None => 0,
        }
    }

    /// Size of the largest currently free block in bytes.
    pub fn max_free_block_size(&self) -> usize {
        let bm = self.bitmap();
        self.max_free_in(&bm, NodeIndex::ROOT, self.header().arena_bytes)
    }

    fn max_free_in(&self, bm: &NodeBitmap, node: NodeIndex, level_size: usize) -> usize {
        if bm.is_free(node) {
            return level_size;
        }
        if self.is_leaf(node) {
            return 0;
        }
        let half = level_size >> 1;
        let left = self.max_free_in(bm, node.left_child(), half);
        let right = self.max_free_in(bm, node.right_child(), half);
        left.max(right)
    }

    /// Number of maximal free blocks. A FREE node counts as one free unit;
    /// nothing below it is independently free.
    pub fn num_free_blocks(&self) -> usize {
        let bm = self.bitmap();
        self.free_blocks_in(&bm, NodeIndex::ROOT)
    }

    fn free_blocks_in(&self, bm: &NodeBitmap, node: NodeIndex) -> usize {
        if bm.is_free(node) {
            return 1;
        }
        if self.is_leaf(node) {
            return 0;
        }
        self.free_blocks_in(bm, node.left_child()) + self.free_blocks_in(bm, node.right_child())
    }

    /// Visit every maximal block: each FREE node, and each USED node that is
    /// an atomic allocation (a leaf, or a node whose two children are both
    /// FREE). The callback receives the block address, its size, and whether
    /// it is used. Never mutates heap state.
    pub fn walk_heap<F>(&self, mut callback: F)
    where
        F: FnMut(NonNull<u8>, usize, bool),
    {
        let bm = self.bitmap();
        self.walk_node(&bm, NodeIndex::ROOT, self.header().arena_bytes, &mut callback);
    }

    fn walk_node<F>(&self, bm: &NodeBitmap, node: NodeIndex, level_size: usize, callback: &mut F)
    where
        F: FnMut(NonNull<u8>, usize, bool),
    {
        if bm.is_free(node) {
            callback(self.node_ptr(node), level_size, false);
            return;
        }
        if self.is_leaf(node) {
            callback(self.node_ptr(node), level_size, true);
            return;
        }
        let left = node.left_child();
        let right = node.right_child();
        if bm.is_free(left) && bm.is_free(right) {
            callback(self.node_ptr(node), level_size, true);
            return;
        }
        let half = level_size >> 1;
        self.walk_node(bm, left, half, callback);
        self.walk_node(bm, right, half, callback);
    }

    /// Verify the heap invariants everywhere: the padding bit is USED, and no
    /// FREE node has a USED descendant. Intended for debug and test builds;
    /// normal operation never reports through this.
    pub fn check_heap(&self) -> bool {
        let bm = self.bitmap();
        if bm.is_free(NodeIndex::PADDING) {
            return false;
        }
        self.check_node(&bm, NodeIndex::ROOT)
    }

    fn check_node(&self, bm: &NodeBitmap, node: NodeIndex) -> bool {
        if self.is_leaf(node) {
            return true;
        }
        let left = node.left_child();
        let right = node.right_child();
        if bm.is_free(node) && !(bm.is_free(left) && bm.is_free(right)) {
            return false;
        }
        self.check_node(bm, left) && self.check_node(bm, right)
    }

    /// Gather heap statistics from a walk over the maximal blocks.
    #[cfg(feature = "tracking")]
    pub fn stats(&self) -> HeapStats {
        let arena_bytes = self.header().arena_bytes;
        let mut stats = HeapStats::new();
        stats.total_bytes = arena_bytes;
        self.walk_heap(|_, size, used| {
            if !used {
                stats.free_bytes += size;
                let level = (arena_bytes / size).trailing_zeros() as usize;
                stats.free_blocks_by_level[level] += 1;
            }
        });
        stats.used_bytes = stats.total_bytes - stats.free_bytes;
        stats
    }

    /// Print the heap layout and free-space summary.
    pub fn print_heap_info(&self) {
        info!("========== Buddy Tree Heap Info ==========");
        info!(
            "Arena: {:p}, {:#x} bytes, min block {:#x}",
            self.arena(),
            self.arena_bytes(),
            self.min_block_size()
        );
        info!("Bookkeeping overhead: {} bytes", self.overhead());
        info!(
            "Free blocks: {}, largest {:#x} bytes",
            self.num_free_blocks(),
            self.max_free_block_size()
        );
        self.walk_heap(|_ptr, _size, _used| {
            info!(
                "  {:p}: {:#x} bytes {}",
                _ptr,
                _size,
                if _used { "used" } else { "free" }
            );
        });
        info!("==========================================");
    }
}

const fn bitmap_words(num_nodes: u32) -> usize {
    ((num_nodes + WORD_BITS - 1) / WORD_BITS) as usize
}

impl ByteAllocator for BuddyTreeAllocator {
    fn alloc(&mut self, layout: Layout) -> AllocResult<NonNull<u8>> {
        self.memalign(layout.align(), layout.size())
    }

    fn dealloc(&mut self, pos: NonNull<u8>, _layout: Layout) {
        self.free(pos);
    }

    fn total_bytes(&self) -> usize {
        self.arena_bytes()
    }

    fn used_bytes(&self) -> usize {
        self.arena_bytes() - self.available_bytes()
    }

    fn available_bytes(&self) -> usize {
        let mut free = 0;
        self.walk_heap(|_, size, used| {
            if !used {
                free += size;
            }
        });
        free
    }
}
