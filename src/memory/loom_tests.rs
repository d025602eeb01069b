//! Loom-based concurrency tests for the allocator side.
//!
//! Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
//!
//! Under loom the VM layer is a heap-backed mock, so these tests exercise
//! the *synchronization* of the allocators (per-space mutexes, the pool's
//! free-list mutex, the stats counters), not page-table behaviour.
#[cfg(loom)]
mod tests {
    use crate::memory::allocator::Allocator;
    use crate::memory::general::GeneralAllocator;
    use crate::memory::pool::PoolAllocator;
    use crate::sync::Arc;

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    // =====================================================================
    // 1. stats::Counter
    // =====================================================================

    #[test]
    fn loom_counter_concurrent_add_sub() {
        use crate::memory::stats::Counter;

        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = Arc::clone(&counter);
            let c2 = Arc::clone(&counter);

            let t1 = loom::thread::spawn(move || {
                c1.add(10);
                c1.add(5);
            });
            let t2 = loom::thread::spawn(move || {
                c2.sub(3);
                c2.add(8);
            });

            t1.join().unwrap();
            t2.join().unwrap();

            // 10 + 5 - 3 + 8 = 20
            assert_eq!(counter.get(), 20);
        });
    }

    // =====================================================================
    // 2. GeneralAllocator — racing threads on one size class
    // =====================================================================

    #[test]
    fn loom_general_allocator_same_class_contention() {
        bounded(2).check(|| {
            let alloc = Arc::new(GeneralAllocator::new());

            let other = {
                let alloc = Arc::clone(&alloc);
                loom::thread::spawn(move || {
                    let p = alloc.allocate(24, 8, 0, None).expect("alloc");
                    // Safety: p is live and ours.
                    unsafe { alloc.deallocate(p) };
                })
            };

            let p = alloc.allocate(24, 8, 0, None).expect("alloc");
            // Safety: p is live and ours.
            unsafe { alloc.deallocate(p) };

            other.join().unwrap();
            assert_eq!(alloc.total_allocated(), 0);
        });
    }

    // =====================================================================
    // 3. PoolAllocator — cross-thread release
    // =====================================================================

    #[test]
    fn loom_pool_cross_thread_release() {
        bounded(2).check(|| {
            let parent: std::sync::Arc<dyn Allocator> =
                std::sync::Arc::new(GeneralAllocator::new());
            let pool = Arc::new(PoolAllocator::new(parent, 16, 4, 8, 0).expect("pool"));

            let a = pool.allocate(16, 8, 0, None).expect("slot a");
            let b = pool.allocate(16, 8, 0, None).expect("slot b");
            assert_ne!(a, b);
            let a_addr = a.as_ptr() as usize;

            let releaser = {
                let pool = Arc::clone(&pool);
                loom::thread::spawn(move || {
                    let a = std::ptr::NonNull::new(a_addr as *mut u8).unwrap();
                    // Safety: a is live and released exactly once.
                    unsafe { pool.deallocate(a) };
                })
            };

            // Safety: b is live and released exactly once.
            unsafe { pool.deallocate(b) };
            // The racing release and a fresh acquire interleave safely.
            let c = pool.allocate(16, 8, 0, None).expect("slot c");
            // Safety: c is live.
            unsafe { pool.deallocate(c) };

            releaser.join().unwrap();
            assert_eq!(pool.live(), 0);
        });
    }
}
