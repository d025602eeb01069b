//! Work-stealing deque and the global inbox.
//!
//! [`WorkStealQueue`] is a bounded Chase–Lev deque: the owning worker pushes
//! and pops at the bottom, thieves take from the top.  [`GlobalWorkQueue`]
//! is the bounded single-producer / multi-consumer inbox external submitters
//! publish into.
//!
//! Both queues move `*mut Task` only and never own task memory.  Their slot
//! buffers come from the [`Allocator`] facade and go back to it on drop.
//! Indices grow monotonically; the slot for index `i` is `i & (capacity-1)`.

use crate::memory::allocator::{AllocSite, Allocator};
use crate::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};
use crate::task::Task;
use std::ptr::NonNull;
// Allocator handles are refcount plumbing, not modelled state; std's Arc
// works under loom too.
use std::sync::Arc;

/// Capacity of each worker's local deque.
pub const WORK_QUEUE_SIZE: usize = 1024;
/// Capacity of the global inbox (and of the global task pool).
pub const GLOBAL_QUEUE_SIZE: usize = 128;

struct SlotBuffer {
    alloc: Arc<dyn Allocator>,
    slots: NonNull<AtomicPtr<Task>>,
    capacity: usize,
}

impl SlotBuffer {
    fn new(alloc: Arc<dyn Allocator>, capacity: usize) -> Option<Self> {
        debug_assert!(capacity.is_power_of_two());
        let bytes = capacity * std::mem::size_of::<AtomicPtr<Task>>();
        let align = std::mem::align_of::<AtomicPtr<Task>>().max(8);
        let slots = alloc
            .allocate(bytes, align, 0, Some(AllocSite::here()))?
            .cast::<AtomicPtr<Task>>();
        // Slots must be constructed in place; the backing bytes are raw.
        // Safety: `bytes` at `slots` belong to this buffer.
        unsafe {
            for i in 0..capacity {
                slots.as_ptr().add(i).write(AtomicPtr::new(std::ptr::null_mut()));
            }
        }
        Some(Self {
            alloc,
            slots,
            capacity,
        })
    }

    #[inline]
    fn slot(&self, index: usize) -> &AtomicPtr<Task> {
        // Safety: masked index is always in bounds.
        unsafe { &*self.slots.as_ptr().add(index & (self.capacity - 1)) }
    }
}

impl Drop for SlotBuffer {
    fn drop(&mut self) {
        // Safety: tearing down the slots constructed in new().
        unsafe {
            for i in 0..self.capacity {
                std::ptr::drop_in_place(self.slots.as_ptr().add(i));
            }
            self.alloc.deallocate(self.slots.cast::<u8>());
        }
    }
}

// Safety: the buffer owns its slots; all slot access is atomic.
unsafe impl Send for SlotBuffer {}
unsafe impl Sync for SlotBuffer {}

/// Chase–Lev work-stealing deque.
///
/// `push` and `pop` may only be called by the owning worker; `steal` from
/// any thread.
pub(crate) struct WorkStealQueue {
    buffer: SlotBuffer,
    top: AtomicUsize,
    bottom: AtomicUsize,
}

impl WorkStealQueue {
    pub fn new(alloc: Arc<dyn Allocator>, capacity: usize) -> Option<Self> {
        Some(Self {
            buffer: SlotBuffer::new(alloc, capacity)?,
            top: AtomicUsize::new(0),
            bottom: AtomicUsize::new(0),
        })
    }

    /// Owner-only.  Returns false (and reports) when the deque is full; the
    /// caller decides whether to retry later or fail the submission.
    pub fn push(&self, task: *mut Task) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        if b.wrapping_sub(t) > self.buffer.capacity - 1 {
            log::error!(
                "deque: push beyond capacity {} rejected",
                self.buffer.capacity
            );
            return false;
        }
        self.buffer.slot(b).store(task, Ordering::Relaxed);
        // Publish the slot before the new bottom becomes visible to thieves.
        fence(Ordering::Release);
        self.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
        true
    }

    /// Owner-only.
    pub fn pop(&self) -> Option<NonNull<Task>> {
        let b = self.bottom.load(Ordering::Relaxed).wrapping_sub(1);
        self.bottom.store(b, Ordering::Relaxed);
        // The store of bottom must be ordered before the load of top, or a
        // concurrent thief and the owner could both take the last task.
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if (b.wrapping_sub(t) as isize) >= 0 {
            let mut task = self.buffer.slot(b).load(Ordering::Relaxed);
            if t == b {
                // Last element: race the thieves on top.
                if self
                    .top
                    .compare_exchange(
                        t,
                        t.wrapping_add(1),
                        Ordering::SeqCst,
                        Ordering::Relaxed,
                    )
                    .is_err()
                {
                    task = std::ptr::null_mut();
                }
                self.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
            }
            NonNull::new(task)
        } else {
            self.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
            None
        }
    }

    /// Thief side; any thread.  A lost race returns `None` and the caller
    /// retries elsewhere.
    pub fn steal(&self) -> Option<NonNull<Task>> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);
        if (b.wrapping_sub(t) as isize) > 0 {
            let task = self.buffer.slot(t).load(Ordering::Relaxed);
            if self
                .top
                .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                return None;
            }
            NonNull::new(task)
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        let t = self.top.load(Ordering::Acquire);
        let b = self.bottom.load(Ordering::Acquire);
        b.wrapping_sub(t)
    }
}

/// The global inbox: a bounded queue with one producer side (serialised by
/// the scheduler's submit lock) and racing consumers.
pub(crate) struct GlobalWorkQueue {
    buffer: SlotBuffer,
    top: AtomicUsize,
    bottom: AtomicUsize,
}

impl GlobalWorkQueue {
    pub fn new(alloc: Arc<dyn Allocator>) -> Option<Self> {
        Some(Self {
            buffer: SlotBuffer::new(alloc, GLOBAL_QUEUE_SIZE)?,
            top: AtomicUsize::new(0),
            bottom: AtomicUsize::new(0),
        })
    }

    /// Publish a task.  Must be executed by one thread at a time (the
    /// scheduler holds its submit mutex around this).  Returns false when
    /// the inbox is full.
    pub fn push(&self, task: *mut Task) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        if b.wrapping_sub(t) >= self.buffer.capacity {
            log::error!(
                "inbox: push beyond capacity {} rejected",
                self.buffer.capacity
            );
            return false;
        }
        self.buffer.slot(b).store(task, Ordering::Relaxed);
        self.bottom.store(b.wrapping_add(1), Ordering::Release);
        true
    }

    /// Take the oldest task.  Consumers race on `top`; the loser retries
    /// until the inbox goes empty.
    pub fn pop(&self) -> Option<NonNull<Task>> {
        loop {
            let t = self.top.load(Ordering::Acquire);
            let b = self.bottom.load(Ordering::Acquire);
            if (b.wrapping_sub(t) as isize) <= 0 {
                return None;
            }
            let task = self.buffer.slot(t).load(Ordering::Relaxed);
            if self
                .top
                .compare_exchange(t, t.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return NonNull::new(task);
            }
            // Lost the race; another consumer advanced top.
        }
    }

    pub fn is_empty(&self) -> bool {
        let t = self.top.load(Ordering::Acquire);
        let b = self.bottom.load(Ordering::Acquire);
        t == b
    }
}
