//! Property-based tests for the allocators.
//!
//! Uses proptest to generate randomised allocate/deallocate workloads and
//! verify the allocator postconditions hold.

use proptest::prelude::*;
use std::ptr::NonNull;
use strata::{Allocator, GeneralAllocator, LinearAllocator, PoolAllocator};

/// Power-of-two alignments the facade must honour.
fn alignment() -> impl Strategy<Value = usize> {
    prop_oneof![Just(8usize), Just(16), Just(32), Just(64), Just(256), Just(4096)]
}

/// 8-aligned header offsets.
fn offset() -> impl Strategy<Value = usize> {
    (0usize..4).prop_map(|w| w * 8)
}

proptest! {
    /// Every returned pointer satisfies the offset equation and covers the
    /// requested size.
    #[test]
    fn general_allocate_postconditions(
        size in 1usize..6000,
        align in alignment(),
        offset in offset(),
    ) {
        let alloc = GeneralAllocator::new();
        let p = alloc.allocate(size, align, offset, None).expect("allocation failed");
        prop_assert_eq!((p.as_ptr() as usize + offset) % align, 0);
        // Safety: p is live with at least `size` usable bytes.
        unsafe {
            prop_assert!(alloc.alloc_size(p) >= size);
            std::ptr::write_bytes(p.as_ptr(), 0xCD, size);
            alloc.deallocate(p);
        }
        prop_assert_eq!(alloc.total_allocated(), 0);
    }

    /// A workload whose allocations and frees sum to zero leaves the heap
    /// with no footprint at all: the final space is destroyed.
    #[test]
    fn general_zero_sum_workload_drains(
        ops in proptest::collection::vec((0u8..4u8, 1usize..3000), 1..250),
    ) {
        let alloc = GeneralAllocator::new();
        let mut live: Vec<(usize, usize)> = Vec::new();
        for (kind, size) in ops {
            if kind != 0 || live.is_empty() {
                if let Some(p) = alloc.allocate(size, 8, 0, None) {
                    // Safety: p is live; scribble over the payload.
                    unsafe { std::ptr::write_bytes(p.as_ptr(), 0xCD, size) };
                    live.push((p.as_ptr() as usize, size));
                }
            } else {
                let victim = size % live.len();
                let (addr, _) = live.swap_remove(victim);
                // Safety: addr is live and removed from the list.
                unsafe { alloc.deallocate(NonNull::new(addr as *mut u8).unwrap()) };
            }
        }
        for (addr, _) in live {
            // Safety: every remaining address is live.
            unsafe { alloc.deallocate(NonNull::new(addr as *mut u8).unwrap()) };
        }
        prop_assert_eq!(alloc.total_allocated(), 0);
    }

    /// Payloads never overlap while live.
    #[test]
    fn general_live_payloads_disjoint(
        sizes in proptest::collection::vec(1usize..1500, 2..40),
    ) {
        let alloc = GeneralAllocator::new();
        let mut live: Vec<(usize, usize)> = Vec::new();
        for size in sizes {
            let p = alloc.allocate(size, 8, 0, None).expect("allocation failed");
            let start = p.as_ptr() as usize;
            // Safety: p is live.
            let len = unsafe { alloc.alloc_size(p) };
            for &(other_start, other_len) in &live {
                prop_assert!(
                    start + len <= other_start || other_start + other_len <= start,
                    "allocations overlap: {start:#x}+{len} vs {other_start:#x}+{other_len}"
                );
            }
            live.push((start, len));
        }
        for (addr, _) in live {
            // Safety: addr is live.
            unsafe { alloc.deallocate(NonNull::new(addr as *mut u8).unwrap()) };
        }
        prop_assert_eq!(alloc.total_allocated(), 0);
    }

    /// callocate covers the whole array or fails cleanly on overflow.
    #[test]
    fn general_callocate_covers_array(n in 1usize..200, elem in 1usize..300) {
        let alloc = GeneralAllocator::new();
        let p = alloc.callocate(n, elem, None).expect("callocate failed");
        // Safety: n * elem bytes are usable.
        unsafe {
            prop_assert!(alloc.alloc_size(p) >= n * elem);
            alloc.deallocate(p);
        }
        prop_assert_eq!(alloc.total_allocated(), 0);
    }

    /// A reset bump arena replays the same allocation trace to bit-identical
    /// pointers.
    #[test]
    fn linear_reset_replays_identically(
        trace in proptest::collection::vec((1usize..400, 0usize..3, offset()), 1..30),
    ) {
        let arena = LinearAllocator::new(1 << 20);
        prop_assert!(arena.init());
        let run = |arena: &LinearAllocator| -> Vec<usize> {
            trace
                .iter()
                .map(|&(size, align_shift, offset)| {
                    let align = 8usize << align_shift;
                    let p = arena.allocate(size, align, offset, None).expect("bump alloc");
                    assert_eq!((p.as_ptr() as usize + offset) % align, 0);
                    p.as_ptr() as usize
                })
                .collect()
        };
        let first = run(&arena);
        arena.reset();
        let second = run(&arena);
        prop_assert_eq!(first, second);
        arena.reset();
    }

    /// Pool slots are distinct while live and the pool refuses the
    /// (capacity + 1)-th acquire.
    #[test]
    fn pool_distinct_slots_and_exhaustion(count in 1usize..64) {
        let parent: std::sync::Arc<dyn Allocator> =
            std::sync::Arc::new(GeneralAllocator::new());
        let pool = PoolAllocator::new(parent, 48, count, 8, 0).expect("pool");
        let mut seen = std::collections::HashSet::new();
        let mut taken = Vec::new();
        for _ in 0..count {
            let slot = pool.allocate(48, 8, 0, None).expect("slot");
            prop_assert!(seen.insert(slot.as_ptr() as usize), "slot handed out twice");
            taken.push(slot);
        }
        prop_assert!(pool.allocate(48, 8, 0, None).is_none());
        for slot in taken {
            // Safety: slot is live.
            unsafe { pool.deallocate(slot) };
        }
        prop_assert_eq!(pool.total_allocated(), 0);
    }
}

#[test]
fn callocate_overflow_is_rejected() {
    let alloc = GeneralAllocator::new();
    assert!(alloc.callocate(usize::MAX / 8, 32, None).is_none());
    assert!(alloc.callocate(usize::MAX, usize::MAX, None).is_none());
}

/// Sizes straddling the small/large boundary and the segment threshold all
/// route somewhere that satisfies the contract.
#[test]
fn boundary_sizes_allocate_and_free() {
    let alloc = GeneralAllocator::new();
    let boundaries = [
        1usize,
        231,
        232, // largest small-bin request
        233,
        255,
        256, // first tree-bin size class
        257,
        8191,
        8192, // small-space segment threshold
        8193,
        (8 << 20) - 1,
        8 << 20, // large-space segment threshold
        (8 << 20) + 1,
    ];
    for &size in &boundaries {
        let p = alloc
            .allocate(size, 8, 0, None)
            .unwrap_or_else(|| panic!("allocation of {size} bytes failed"));
        // Safety: p is live with `size` usable bytes.
        unsafe {
            assert!(alloc.alloc_size(p) >= size, "short allocation at {size}");
            p.as_ptr().write(0xEE);
            p.as_ptr().add(size - 1).write(0xEE);
            alloc.deallocate(p);
        }
    }
    assert_eq!(alloc.total_allocated(), 0);
}
