//! End-to-end scheduler tests against the public API: the scheduler and the
//! caller share one general allocator, tasks fan out and join, and every
//! pool drains back to empty.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strata::{Allocator, GeneralAllocator, Scheduler, SchedulerConfig, TaskData};

fn count_kernel(data: &mut TaskData) {
    // Safety: kernel_data points at the test's counter, alive for the run.
    let counter = unsafe { &*data.kernel_data.cast::<AtomicUsize>() };
    counter.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn fan_out_many_tasks_and_drain() {
    const TASKS: usize = 2_000;
    let alloc: Arc<dyn Allocator> = Arc::new(GeneralAllocator::new());
    let sched = Scheduler::with_config(Arc::clone(&alloc), SchedulerConfig { num_workers: 4 })
        .expect("scheduler");
    let counter = AtomicUsize::new(0);
    let counter_ptr = std::ptr::addr_of!(counter) as *mut u8;

    for _ in 0..TASKS {
        let id = loop {
            match sched.create_task(count_kernel, TaskData::new(counter_ptr), None, 1) {
                Some(id) => break id,
                None => sched.help_run(),
            }
        };
        while !sched.submit(id) {
            sched.help_run();
        }
    }

    while sched.live_tasks() != 0 {
        sched.help_run();
    }
    assert_eq!(counter.load(Ordering::SeqCst), TASKS);

    // The scheduler's own structures all came from this allocator; after it
    // goes away the caller's heap drains completely.
    drop(sched);
    assert_eq!(alloc.total_allocated(), 0);
}

#[test]
fn two_level_join_returns_every_slot() {
    let alloc: Arc<dyn Allocator> = Arc::new(GeneralAllocator::new());
    let sched = Scheduler::with_config(alloc, SchedulerConfig { num_workers: 3 })
        .expect("scheduler");
    let counter = AtomicUsize::new(0);
    let counter_ptr = std::ptr::addr_of!(counter) as *mut u8;

    let root = sched
        .create_task(count_kernel, TaskData::new(counter_ptr), None, 1 + 4)
        .expect("root");
    let mut ids = vec![root];
    for _ in 0..4 {
        let child = sched
            .create_task(count_kernel, TaskData::new(counter_ptr), Some(root), 1 + 4)
            .expect("child");
        ids.push(child);
        for _ in 0..4 {
            let leaf = sched
                .create_task(count_kernel, TaskData::new(counter_ptr), Some(child), 1)
                .expect("leaf");
            ids.push(leaf);
        }
    }
    for id in ids {
        assert!(sched.submit(id));
    }

    while sched.live_tasks() != 0 {
        sched.help_run();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 21);
}

#[test]
fn allocator_shared_between_scheduler_and_caller() {
    // The scheduler's internal allocations and direct caller allocations
    // interleave on the same heap without stepping on each other.
    let alloc: Arc<dyn Allocator> = Arc::new(GeneralAllocator::new());
    let sched = Scheduler::with_config(Arc::clone(&alloc), SchedulerConfig { num_workers: 2 })
        .expect("scheduler");
    let counter = AtomicUsize::new(0);
    let counter_ptr = std::ptr::addr_of!(counter) as *mut u8;

    let mut blocks = Vec::new();
    for round in 0..200 {
        let p = alloc
            .allocate(16 + round % 900, 8, 0, None)
            .expect("caller allocation");
        blocks.push(p);
        let id = loop {
            match sched.create_task(count_kernel, TaskData::new(counter_ptr), None, 1) {
                Some(id) => break id,
                None => sched.help_run(),
            }
        };
        while !sched.submit(id) {
            sched.help_run();
        }
    }

    while sched.live_tasks() != 0 {
        sched.help_run();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 200);

    for p in blocks {
        // Safety: every block is a live caller allocation.
        unsafe { alloc.deallocate(p) };
    }
    drop(sched);
    assert_eq!(alloc.total_allocated(), 0);
}
