//! A monotonic bump allocator over a single reserve+commit region.
//!
//! Each allocation stores its size in the word immediately preceding the
//! returned pointer; `deallocate` is a no-op and `reset` rewinds the cursor
//! to the start of the region.  The region is committed in full at `init`
//! and released on drop.

use super::allocator::{AllocSite, Allocator, DEFAULT_ALIGNMENT};
use super::stats;
use super::vm::{PlatformVmOps, VmOps};
use crate::sync::Mutex;
use std::ptr::NonNull;

/// Reservation granularity for the backing region.
const REGION_GRANULARITY: usize = 65536;

/// Word prepended to every allocation to record its size.
const SIZE_WORD: usize = std::mem::size_of::<usize>();

struct LinearCore {
    start: *mut u8,
    current: *mut u8,
    size: usize,
}

// Safety: the core owns its region; access is serialised by the mutex.
unsafe impl Send for LinearCore {}

pub struct LinearAllocator {
    core: Mutex<LinearCore>,
}

impl LinearAllocator {
    /// Create an allocator that will reserve and commit `size` bytes
    /// (rounded up to the region granularity) on [`init`](Self::init).
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            core: Mutex::new(LinearCore {
                start: std::ptr::null_mut(),
                current: std::ptr::null_mut(),
                size,
            }),
        }
    }

    /// Reserve and commit the backing region.  Returns false on VM failure.
    pub fn init(&self) -> bool {
        let mut core = self.core.lock().unwrap();
        if !core.start.is_null() {
            return true;
        }
        let size = (core.size + (REGION_GRANULARITY - 1)) & !(REGION_GRANULARITY - 1);
        // Safety: fresh one-step reservation.
        match unsafe { PlatformVmOps::reserve_commit(size) } {
            Ok(ptr) => {
                stats::TOTAL_RESERVED.add(size);
                stats::TOTAL_COMMITTED.add(size);
                stats::LINEAR_ALLOCATOR_COMMITTED.add(size);
                core.start = ptr.as_ptr();
                core.current = ptr.as_ptr();
                core.size = size;
                true
            }
            Err(e) => {
                log::error!("linear: backing region of {size} bytes unavailable: {e}");
                false
            }
        }
    }

    /// Rewind the cursor to the start of the region, logically freeing every
    /// allocation at once.
    pub fn reset(&self) {
        let mut core = self.core.lock().unwrap();
        core.current = core.start;
    }
}

impl Allocator for LinearAllocator {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        offset: usize,
        site: Option<AllocSite>,
    ) -> Option<NonNull<u8>> {
        debug_assert!(
            alignment == 0 || alignment.is_power_of_two(),
            "alignment {alignment} is not a power of two"
        );
        let alignment = alignment.max(DEFAULT_ALIGNMENT);
        if let Some(site) = site {
            log::trace!("linear: allocate {size} bytes from {}:{}", site.file, site.line);
        }

        let mut core = self.core.lock().unwrap();
        if core.start.is_null() {
            return None;
        }

        // The stored size word rides just before the user pointer, so it
        // joins the caller's offset: advance by the combined offset, align,
        // then back off again.
        let offset = offset + SIZE_WORD;
        let mut cursor = core.current as usize;
        cursor += offset;
        cursor = (cursor + (alignment - 1)) & !(alignment - 1);
        cursor -= offset;

        let size_word = cursor;
        let user = size_word + SIZE_WORD;
        let end = user + size;
        if end > core.start as usize + core.size {
            return None;
        }

        // Safety: size_word..end lies inside the committed region.
        unsafe {
            (size_word as *mut usize).write(size);
        }
        core.current = end as *mut u8;

        debug_assert_eq!((user + offset - SIZE_WORD) % alignment, 0);
        NonNull::new(user as *mut u8)
    }

    fn callocate(
        &self,
        _num_elements: usize,
        _elem_size: usize,
        _site: Option<AllocSite>,
    ) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>) {
        // Individual frees do not exist; reset() reclaims the region.
    }

    unsafe fn alloc_size(&self, ptr: NonNull<u8>) -> usize {
        // Safety: every allocation carries its size word just before it.
        unsafe { ptr.as_ptr().sub(SIZE_WORD).cast::<usize>().read() }
    }

    fn total_allocated(&self) -> usize {
        let core = self.core.lock().unwrap();
        core.current as usize - core.start as usize
    }
}

impl Drop for LinearAllocator {
    fn drop(&mut self) {
        let core = self.core.lock().unwrap();
        debug_assert!(
            core.current == core.start,
            "linear allocator dropped with {} live bytes",
            core.current as usize - core.start as usize
        );
        if !core.start.is_null() {
            // Safety: releasing the region reserved in init().
            unsafe {
                drop(PlatformVmOps::release(
                    NonNull::new_unchecked(core.start),
                    core.size,
                ));
            }
            stats::TOTAL_RESERVED.sub(core.size);
            stats::TOTAL_COMMITTED.sub(core.size);
            stats::LINEAR_ALLOCATOR_COMMITTED.sub(core.size);
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_bump_alignment_scenario() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let arena = LinearAllocator::new(65536);
        assert!(arena.init());

        let a1 = arena.allocate(1, 8, 0, None).unwrap();
        let a2 = arena.allocate(17, 32, 0, None).unwrap();
        let a3 = arena.allocate(1000, 4096, 0, None).unwrap();

        assert_eq!(a1.as_ptr() as usize % 8, 0);
        assert_eq!(a2.as_ptr() as usize % 32, 0);
        assert_eq!(a3.as_ptr() as usize % 4096, 0);

        // Safety: all three are live.
        unsafe {
            assert_eq!(arena.alloc_size(a2), 17);
            assert_eq!(arena.alloc_size(a1), 1);
            assert_eq!(arena.alloc_size(a3), 1000);
        }

        // The cursor sits at the end of a3's payload; a1 starts one size
        // word into the region.
        let expected =
            a3.as_ptr() as usize + 1000 - (a1.as_ptr() as usize - SIZE_WORD);
        assert_eq!(arena.total_allocated(), expected);

        arena.reset();
        assert_eq!(arena.total_allocated(), 0);
    }

    #[test]
    fn test_reset_replays_identical_pointers() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let arena = LinearAllocator::new(65536);
        assert!(arena.init());

        let trace: Vec<(usize, usize, usize)> =
            vec![(8, 8, 0), (40, 16, 0), (100, 64, 8), (1, 8, 0)];
        let first: Vec<usize> = trace
            .iter()
            .map(|&(s, a, o)| arena.allocate(s, a, o, None).unwrap().as_ptr() as usize)
            .collect();
        arena.reset();
        let second: Vec<usize> = trace
            .iter()
            .map(|&(s, a, o)| arena.allocate(s, a, o, None).unwrap().as_ptr() as usize)
            .collect();
        assert_eq!(first, second, "reset must replay bit-identical pointers");
        arena.reset();
    }

    #[test]
    fn test_offset_equation() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let arena = LinearAllocator::new(65536);
        assert!(arena.init());
        for &(align, offset) in &[(8usize, 0usize), (32, 8), (1024, 24), (4096, 16)] {
            let p = arena.allocate(64, align, offset, None).unwrap();
            assert_eq!((p.as_ptr() as usize + offset) % align, 0);
        }
        arena.reset();
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let arena = LinearAllocator::new(65536);
        assert!(arena.init());
        assert!(arena.allocate(60000, 8, 0, None).is_some());
        assert!(arena.allocate(60000, 8, 0, None).is_none());
        // Failure leaves the arena usable.
        assert!(arena.allocate(16, 8, 0, None).is_some());
        arena.reset();
    }

    #[test]
    fn test_callocate_unsupported() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let arena = LinearAllocator::new(4096);
        assert!(arena.init());
        assert!(arena.callocate(4, 16, None).is_none());
        arena.reset();
    }
}
