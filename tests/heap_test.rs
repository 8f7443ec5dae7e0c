//! Integration tests for the buddy tree heap
//!
//! Exercises the public heap API end to end: rounding, placement,
//! coalescing, exhaustion, introspection and the byte-allocator trait.

#![no_std]

extern crate alloc;
extern crate buddy_tree_allocator;

use alloc::vec::Vec;
use buddy_tree_allocator::{AllocError, BuddyTreeAllocator, ByteAllocator};
use core::alloc::Layout;
use core::ptr::NonNull;

const ARENA_BYTES: usize = 1024;
const MIN_BLOCK: usize = 64;

/// Allocate test memory using the system allocator
fn alloc_region(size: usize, align: usize) -> (*mut u8, Layout) {
    let layout = Layout::from_size_align(size, align).unwrap();
    let ptr = unsafe { alloc::alloc::alloc(layout) };
    assert!(!ptr.is_null(), "Failed to allocate test region");
    (ptr, layout)
}

/// Deallocate test memory
fn dealloc_region(ptr: *mut u8, layout: Layout) {
    unsafe { alloc::alloc::dealloc(ptr, layout) };
}

/// Set up a heap over a fresh arena aligned to its full size, so natural
/// block alignment is also absolute alignment.
fn new_test_heap() -> (BuddyTreeAllocator, (*mut u8, Layout), (*mut u8, Layout)) {
    let arena = alloc_region(ARENA_BYTES, ARENA_BYTES);
    let book_size = BuddyTreeAllocator::bookkeeping_size(ARENA_BYTES, MIN_BLOCK).unwrap();
    let book = alloc_region(book_size, core::mem::align_of::<usize>());
    let heap = unsafe {
        BuddyTreeAllocator::create(
            NonNull::new(arena.0).unwrap(),
            ARENA_BYTES,
            MIN_BLOCK,
            NonNull::new(book.0).unwrap(),
        )
    }
    .unwrap();
    (heap, arena, book)
}

fn drop_test_heap(arena: (*mut u8, Layout), book: (*mut u8, Layout)) {
    dealloc_region(arena.0, arena.1);
    dealloc_region(book.0, book.1);
}

#[test]
fn test_buddy_pair_scenario() {
    // 1024-byte arena with 64-byte blocks: 16 leaves
    let (mut heap, arena, book) = new_test_heap();

    let a = heap.malloc(64).unwrap();
    let b = heap.malloc(64).unwrap();
    assert_ne!(a, b);
    // Left-first placement hands out the two buddies of the leftmost pair
    assert_eq!(a.as_ptr() as usize, arena.0 as usize);
    assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + 64);

    heap.free(a);
    heap.free(b);
    assert_eq!(heap.max_free_block_size(), 1024);
    assert_eq!(heap.num_free_blocks(), 1);
    assert!(heap.check_heap());

    drop_test_heap(arena, book);
}

#[test]
fn test_power_of_two_rounding() {
    let (mut heap, arena, book) = new_test_heap();

    let ptr = heap.malloc(100).unwrap();
    assert_eq!(heap.block_size(ptr), 128);
    heap.free(ptr);

    for size in [0usize, 1, 63, 64, 65, 100, 128, 500, 512, 1024] {
        let expected = size.next_power_of_two().max(MIN_BLOCK);
        let ptr = heap.malloc(size).unwrap();
        assert_eq!(heap.block_size(ptr), expected, "size {}", size);
        heap.free(ptr);
        assert!(heap.check_heap());
    }

    drop_test_heap(arena, book);
}

#[test]
fn test_live_allocations_never_overlap() {
    let (mut heap, arena, book) = new_test_heap();

    let mut live = Vec::new();
    for size in [64usize, 100, 64, 256, 64] {
        let ptr = heap.malloc(size).unwrap();
        live.push((ptr.as_ptr() as usize, heap.block_size(ptr)));
    }

    for (i, &(start_a, len_a)) in live.iter().enumerate() {
        for &(start_b, len_b) in live.iter().skip(i + 1) {
            let disjoint = start_a + len_a <= start_b || start_b + len_b <= start_a;
            assert!(
                disjoint,
                "[{:#x}, {:#x}) overlaps [{:#x}, {:#x})",
                start_a,
                start_a + len_a,
                start_b,
                start_b + len_b
            );
        }
    }
    assert!(heap.check_heap());

    for (addr, _) in live {
        heap.free(NonNull::new(addr as *mut u8).unwrap());
    }
    assert_eq!(heap.num_free_blocks(), 1);

    drop_test_heap(arena, book);
}

#[test]
fn test_alloc_free_round_trip() {
    let (mut heap, arena, book) = new_test_heap();

    // Perturb the heap first so the round trip starts from a non-trivial state
    let held = heap.malloc(128).unwrap();
    let free_blocks_before = heap.num_free_blocks();
    let max_free_before = heap.max_free_block_size();

    let ptr = heap.malloc(100).unwrap();
    heap.free(ptr);

    assert!(heap.check_heap());
    assert_eq!(heap.num_free_blocks(), free_blocks_before);
    assert_eq!(heap.max_free_block_size(), max_free_before);

    heap.free(held);
    drop_test_heap(arena, book);
}

#[test]
fn test_coalescing_restores_parent_block() {
    let (mut heap, arena, book) = new_test_heap();

    let a = heap.malloc(64).unwrap();
    let b = heap.malloc(64).unwrap();
    assert!(heap.max_free_block_size() < 1024);

    heap.free(a);
    // One buddy still used: no merge past its parent level
    assert!(heap.max_free_block_size() < 1024);
    heap.free(b);
    // Both buddies free: merges all the way back to a single root block
    assert!(heap.max_free_block_size() >= 128);
    assert_eq!(heap.max_free_block_size(), 1024);
    assert!(heap.check_heap());

    drop_test_heap(arena, book);
}

#[test]
fn test_exhaustion_returns_no_memory() {
    let (mut heap, arena, book) = new_test_heap();

    let mut live = Vec::new();
    for _ in 0..(ARENA_BYTES / MIN_BLOCK) {
        live.push(heap.malloc(1).unwrap());
    }
    assert_eq!(heap.malloc(1), Err(AllocError::NoMemory));
    assert_eq!(heap.num_free_blocks(), 0);
    assert_eq!(heap.max_free_block_size(), 0);
    assert!(heap.check_heap());

    while let Some(ptr) = live.pop() {
        heap.free(ptr);
    }
    assert_eq!(heap.num_free_blocks(), 1);
    assert_eq!(heap.max_free_block_size(), ARENA_BYTES);

    drop_test_heap(arena, book);
}

#[test]
fn test_oversized_request_fails_cleanly() {
    let (mut heap, arena, book) = new_test_heap();

    assert_eq!(heap.malloc(ARENA_BYTES + 1), Err(AllocError::NoMemory));
    assert!(heap.check_heap());
    assert_eq!(heap.num_free_blocks(), 1);

    drop_test_heap(arena, book);
}

#[test]
fn test_introspection_never_mutates_state() {
    let (mut heap, arena, book) = new_test_heap();

    let a = heap.malloc(64).unwrap();
    let _b = heap.malloc(200).unwrap();

    let overhead = heap.overhead();
    let raw = heap.as_raw().as_ptr() as *const u8;
    let mut snapshot = Vec::new();
    snapshot.extend_from_slice(unsafe { core::slice::from_raw_parts(raw, overhead) });

    heap.walk_heap(|_, _, _| {});
    let _ = heap.max_free_block_size();
    let _ = heap.num_free_blocks();
    let _ = heap.check_heap();
    let _ = heap.block_size(a);
    heap.print_heap_info();

    let after = unsafe { core::slice::from_raw_parts(raw, overhead) };
    assert_eq!(&snapshot[..], after);

    drop_test_heap(arena, book);
}

#[test]
fn test_memalign_natural_alignment() {
    let (mut heap, arena, book) = new_test_heap();

    // The arena base is aligned to the full arena size, so natural placement
    // gives absolute alignment too
    let ptr = heap.memalign(256, 1).unwrap();
    assert!(heap.block_size(ptr) >= 256);
    assert_eq!(ptr.as_ptr() as usize & (256 - 1), 0);

    let ptr2 = heap.memalign(128, 64).unwrap();
    assert_eq!(ptr2.as_ptr() as usize & (128 - 1), 0);

    heap.free(ptr);
    heap.free(ptr2);
    assert_eq!(heap.num_free_blocks(), 1);

    drop_test_heap(arena, book);
}

#[test]
fn test_walk_heap_reports_maximal_blocks() {
    let (mut heap, arena, book) = new_test_heap();

    let ptr = heap.malloc(64).unwrap();

    let mut entries = Vec::new();
    heap.walk_heap(|block, size, used| entries.push((block.as_ptr() as usize, size, used)));

    // One 64-byte allocation splits the arena into the used block plus one
    // free buddy per level
    assert_eq!(entries.len(), 5);
    let total: usize = entries.iter().map(|&(_, size, _)| size).sum();
    assert_eq!(total, ARENA_BYTES);
    let used: Vec<_> = entries.iter().filter(|&&(_, _, used)| used).collect();
    assert_eq!(used.len(), 1);
    assert_eq!(used[0].0, ptr.as_ptr() as usize);
    assert_eq!(used[0].1, 64);

    heap.free(ptr);
    drop_test_heap(arena, book);
}

#[test]
fn test_byte_allocator_trait() {
    let (mut heap, arena, book) = new_test_heap();

    assert_eq!(heap.total_bytes(), ARENA_BYTES);
    assert_eq!(heap.used_bytes(), 0);
    assert_eq!(heap.available_bytes(), ARENA_BYTES);

    let layout = Layout::from_size_align(100, 64).unwrap();
    let ptr = ByteAllocator::alloc(&mut heap, layout).unwrap();
    assert_eq!(heap.used_bytes(), 128);
    assert_eq!(heap.available_bytes(), ARENA_BYTES - 128);

    heap.dealloc(ptr, layout);
    assert_eq!(heap.used_bytes(), 0);
    assert!(heap.check_heap());

    drop_test_heap(arena, book);
}

#[test]
fn test_fragmentation_pattern() {
    let (mut heap, arena, book) = new_test_heap();

    let mut addrs = Vec::new();
    for _ in 0..(ARENA_BYTES / MIN_BLOCK) {
        addrs.push(heap.malloc(64).unwrap());
    }

    // Free every other allocation: only 64-byte holes remain
    for i in (0..addrs.len()).step_by(2) {
        heap.free(addrs[i]);
    }
    assert!(heap.check_heap());
    assert_eq!(heap.malloc(128), Err(AllocError::NoMemory));
    let small = heap.malloc(64).unwrap();

    heap.free(small);
    for i in (1..addrs.len()).step_by(2) {
        heap.free(addrs[i]);
    }
    assert_eq!(heap.num_free_blocks(), 1);

    drop_test_heap(arena, book);
}

#[test]
fn test_stress_allocation_deallocation() {
    let (mut heap, arena, book) = new_test_heap();

    for round in 0..5 {
        let mut live = Vec::new();
        for i in 0..16 {
            let size = match (i + round) % 4 {
                0 => 1,
                1 => 64,
                2 => 100,
                _ => 200,
            };
            if let Ok(ptr) = heap.malloc(size) {
                live.push(ptr);
            }
        }
        assert!(heap.check_heap());

        while let Some(ptr) = live.pop() {
            heap.free(ptr);
        }
        assert_eq!(heap.num_free_blocks(), 1);
        assert_eq!(heap.max_free_block_size(), ARENA_BYTES);
    }

    drop_test_heap(arena, book);
}

#[cfg(feature = "tracking")]
#[test]
fn test_statistics_tracking() {
    let (mut heap, arena, book) = new_test_heap();

    let stats = heap.stats();
    assert_eq!(stats.total_bytes, ARENA_BYTES);
    assert_eq!(stats.free_bytes, ARENA_BYTES);
    assert_eq!(stats.used_bytes, 0);
    assert_eq!(stats.free_blocks_by_level[0], 1);

    let ptr = heap.malloc(64).unwrap();
    let stats = heap.stats();
    assert_eq!(stats.used_bytes, 64);
    assert_eq!(stats.free_bytes, ARENA_BYTES - 64);
    // One free buddy per split level, none at the root level
    assert_eq!(stats.free_blocks_by_level[0], 0);
    for level in 1..=4 {
        assert_eq!(stats.free_blocks_by_level[level], 1, "level {}", level);
    }

    heap.free(ptr);
    drop_test_heap(arena, book);
}
