//! A fixed-size pool: equal slots carved from one parent allocation, chained
//! through an intrusive singly-linked free list.  Acquire and release are
//! O(1) pops and pushes on the list head.
//!
//! The free list is mutex-guarded because slots are released from arbitrary
//! threads (the scheduler returns task records to their originating pool
//! from whichever worker finished them).

use super::allocator::{align_up, AllocSite, Allocator, DEFAULT_ALIGNMENT};
use crate::sync::Mutex;
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;
// Allocator handles are plain refcount plumbing, never a modelled
// synchronization point, so they stay on std's Arc even under loom.
use std::sync::Arc;

struct PoolState {
    head: *mut u8,
    live: usize,
    /// Set bit = slot is live.  Catches double frees.
    #[cfg(debug_assertions)]
    live_map: FixedBitSet,
}

// Safety: the raw list head is guarded by the mutex around PoolState.
unsafe impl Send for PoolState {}

pub struct PoolAllocator {
    parent: Arc<dyn Allocator>,
    base: NonNull<u8>,
    element_size: usize,
    element_count: usize,
    alignment: usize,
    offset: usize,
    stride: usize,
    state: Mutex<PoolState>,
}

// Safety: the slab is owned by the pool; mutation goes through the mutex.
unsafe impl Send for PoolAllocator {}
unsafe impl Sync for PoolAllocator {}

impl PoolAllocator {
    /// Carve `element_count` slots of `element_size` bytes out of a single
    /// parent allocation.  Each returned slot `p` satisfies
    /// `(p + offset) % alignment == 0`.  Returns `None` when the parent
    /// cannot supply the slab.
    pub fn new(
        parent: Arc<dyn Allocator>,
        element_size: usize,
        element_count: usize,
        alignment: usize,
        offset: usize,
    ) -> Option<Self> {
        debug_assert!(
            element_size >= std::mem::size_of::<usize>(),
            "pool elements must hold a free-list link"
        );
        debug_assert!(alignment.is_power_of_two());
        debug_assert!(element_count > 0);

        // Guard bytes on both sides of the payload, rounded so every slot
        // keeps the alignment of the first.
        let stride = align_up(
            element_size + 2 * offset,
            alignment.max(DEFAULT_ALIGNMENT),
        );
        let total = stride.checked_mul(element_count)?;
        let base = parent.allocate(total, alignment, offset, Some(AllocSite::here()))?;

        // Thread the intrusive free list: the first word of each free slot
        // points at the next free slot.
        // Safety: total bytes at base are ours; each write lands inside one
        // slot.
        unsafe {
            for i in 0..element_count - 1 {
                let slot = base.as_ptr().add(i * stride);
                slot.cast::<*mut u8>().write(base.as_ptr().add((i + 1) * stride));
            }
            base.as_ptr()
                .add((element_count - 1) * stride)
                .cast::<*mut u8>()
                .write(std::ptr::null_mut());
        }

        Some(Self {
            parent,
            base,
            element_size,
            element_count,
            alignment,
            offset,
            stride,
            state: Mutex::new(PoolState {
                head: base.as_ptr(),
                live: 0,
                #[cfg(debug_assertions)]
                live_map: FixedBitSet::with_capacity(element_count),
            }),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.element_count
    }

    /// Number of slots currently handed out.
    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live
    }

    /// Base address of the slab; slot `i` lives at `base + i * stride`.
    #[inline]
    pub(crate) fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Index of a slot previously returned by `allocate`.
    #[inline]
    pub(crate) fn slot_index(&self, ptr: NonNull<u8>) -> usize {
        let off = ptr.as_ptr() as usize - self.base_addr();
        debug_assert!(off % self.stride == 0, "pointer is not a slot base");
        off / self.stride
    }

    /// Address of slot `index`.
    ///
    /// # Safety
    /// `index` must be below `capacity()`.
    #[inline]
    pub(crate) unsafe fn slot_at(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.element_count);
        // Safety: index checked against the slab bounds.
        unsafe { self.base.as_ptr().add(index * self.stride) }
    }
}

impl Allocator for PoolAllocator {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        offset: usize,
        _site: Option<AllocSite>,
    ) -> Option<NonNull<u8>> {
        debug_assert_eq!(size, self.element_size, "pool slot size mismatch");
        debug_assert_eq!(alignment, self.alignment, "pool alignment mismatch");
        debug_assert_eq!(offset, self.offset, "pool offset mismatch");

        let mut state = self.state.lock().unwrap();
        let slot = state.head;
        if slot.is_null() {
            return None;
        }
        // Safety: slot is a free-list node inside the slab; its first word
        // is the next link.
        unsafe {
            state.head = slot.cast::<*mut u8>().read();
        }
        state.live += 1;
        #[cfg(debug_assertions)]
        {
            let index = (slot as usize - self.base_addr()) / self.stride;
            debug_assert!(!state.live_map.contains(index), "slot handed out twice");
            state.live_map.insert(index);
        }
        NonNull::new(slot)
    }

    fn callocate(
        &self,
        _num_elements: usize,
        _elem_size: usize,
        _site: Option<AllocSite>,
    ) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        debug_assert!(
            addr >= self.base_addr()
                && addr < self.base_addr() + self.stride * self.element_count,
            "pointer {ptr:p} does not belong to this pool"
        );

        let mut state = self.state.lock().unwrap();
        #[cfg(debug_assertions)]
        {
            let index = (addr - self.base_addr()) / self.stride;
            debug_assert!(
                state.live_map.contains(index),
                "double free of pool slot {index}"
            );
            state.live_map.set(index, false);
        }
        // Safety: the slot is dead; reuse its first word as the link.
        unsafe {
            ptr.as_ptr().cast::<*mut u8>().write(state.head);
        }
        state.head = ptr.as_ptr();
        state.live -= 1;
    }

    unsafe fn alloc_size(&self, _ptr: NonNull<u8>) -> usize {
        self.element_size
    }

    fn total_allocated(&self) -> usize {
        (self.element_size + 2 * self.offset) * self.live()
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.state.lock().unwrap().live,
            0,
            "pool allocator dropped with live slots"
        );
        // Safety: the slab came from the parent in new().
        unsafe { self.parent.deallocate(self.base) };
    }
}
