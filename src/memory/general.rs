//! The general-purpose segregated allocator.
//!
//! Twenty-one independent [`Space`]s keyed by request size: one per 8-byte
//! interval below 64 bytes, one per 16-byte interval from 64 to 255 bytes,
//! and a single large space for everything at 256 bytes and above.  Spaces
//! are created on first demand and destroyed as soon as their last
//! allocation is freed, so an idle allocator holds no memory at all.
//!
//! Frees are routed by the owner footer every pooled chunk carries: the word
//! past the chunk holds the owning space's header address.  The footer is
//! only trusted after it matches one of the live space bases recorded here;
//! a null footer marks a standalone OS region.

use super::allocator::{AllocSite, Allocator, DEFAULT_ALIGNMENT};
use super::space::{self, Space};
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::Mutex;
use std::ptr::NonNull;

/// Number of independent spaces: indices 0..=19 for the small classes,
/// index 20 for everything else.
pub(crate) const NUM_SPACES: usize = 21;

/// Configuration of one space family.
#[derive(Clone, Copy, Debug)]
pub struct SpaceConfig {
    /// Bytes reserved when a space is (re)created.
    pub initial_size: usize,
    /// Commit/decommit granularity inside a segment.
    pub page_size: usize,
    /// Unit in which trailing free space is returned to the OS.
    pub segment_granularity: usize,
    /// Request size at which segment growth stops and allocations are
    /// served as standalone OS regions instead.
    pub segment_threshold: usize,
}

impl SpaceConfig {
    /// Configuration of the twenty small-class spaces: 64 KiB segments with
    /// 64 KiB pages.
    #[must_use]
    pub fn small() -> Self {
        Self {
            initial_size: 65536,
            page_size: 65536,
            segment_granularity: 65536,
            segment_threshold: 8192,
        }
    }

    /// Configuration of the large space: 32 MiB growth granularity and an
    /// 8 MiB threshold beyond which requests go straight to the OS.
    #[must_use]
    pub fn large() -> Self {
        Self {
            initial_size: 65536,
            page_size: 65536,
            segment_granularity: 32 * 1024 * 1024,
            segment_threshold: 8 * 1024 * 1024,
        }
    }
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self::small()
    }
}

pub struct GeneralAllocator {
    spaces: [Mutex<Option<Space>>; NUM_SPACES],
    /// Live space header addresses, readable without the space locks.  A
    /// zero entry means the slot holds no space.
    space_addrs: [AtomicUsize; NUM_SPACES],
    small_config: SpaceConfig,
    large_config: SpaceConfig,
}

impl Default for GeneralAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl GeneralAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::with_configs(SpaceConfig::small(), SpaceConfig::large())
    }

    #[must_use]
    pub fn with_configs(small_config: SpaceConfig, large_config: SpaceConfig) -> Self {
        Self {
            spaces: std::array::from_fn(|_| Mutex::new(None)),
            space_addrs: std::array::from_fn(|_| AtomicUsize::new(0)),
            small_config,
            large_config,
        }
    }

    /// Space index for a request size: `size >> 3` below 64, `(size >> 4) + 4`
    /// from 64 to 255, and the large space above that.
    #[inline]
    pub(crate) fn space_index(size: usize) -> usize {
        if size < 64 {
            size >> 3
        } else if size < 256 {
            (size >> 4) + 4
        } else {
            20
        }
    }

    fn config_for(&self, index: usize) -> &SpaceConfig {
        if index == 20 {
            &self.large_config
        } else {
            &self.small_config
        }
    }

    /// Run `f` against the (lazily created) space for `index`.  Returns
    /// `None` when the space cannot be created.
    fn with_space<R>(&self, index: usize, f: impl FnOnce(&mut Space) -> Option<R>) -> Option<R> {
        let mut guard = self.spaces[index].lock().unwrap();
        if guard.is_none() {
            let cfg = self.config_for(index);
            let space = Space::create(
                cfg.initial_size,
                cfg.page_size,
                cfg.segment_granularity,
                cfg.segment_threshold,
            )?;
            self.space_addrs[index].store(space.header_addr(), Ordering::Release);
            *guard = Some(space);
        }
        f(guard.as_mut().expect("space was just created"))
    }

    /// Sum of the live spaces' high-water footprints.  Spaces that emptied
    /// and were destroyed no longer contribute.
    #[must_use]
    pub fn max_allocated(&self) -> usize {
        self.spaces
            .iter()
            .map(|slot| slot.lock().unwrap().as_ref().map_or(0, Space::max_footprint))
            .sum()
    }

    /// Debug-only integrity validation of every live space.
    #[cfg(debug_assertions)]
    pub fn validate(&self) {
        for slot in &self.spaces {
            if let Some(space) = slot.lock().unwrap().as_ref() {
                space.validate();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn space_exists(&self, index: usize) -> bool {
        self.space_addrs[index].load(Ordering::Acquire) != 0
    }
}

impl Allocator for GeneralAllocator {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        offset: usize,
        site: Option<AllocSite>,
    ) -> Option<NonNull<u8>> {
        let alignment = if alignment == 0 {
            DEFAULT_ALIGNMENT
        } else {
            alignment
        };
        debug_assert!(
            alignment.is_power_of_two(),
            "alignment {alignment} is not a power of two"
        );
        if let Some(site) = site {
            log::trace!("general: allocate {size} bytes from {}:{}", site.file, site.line);
        }

        let index = Self::space_index(size);
        self.with_space(index, |space| space.alloc_aligned(alignment, size, offset))
    }

    fn callocate(
        &self,
        num_elements: usize,
        elem_size: usize,
        site: Option<AllocSite>,
    ) -> Option<NonNull<u8>> {
        debug_assert!(elem_size != 0, "callocate with zero element size");
        if let Some(site) = site {
            log::trace!(
                "general: callocate {num_elements} x {elem_size} bytes from {}:{}",
                site.file,
                site.line
            );
        }

        let req = match num_elements.checked_mul(elem_size) {
            Some(req) => req,
            None => {
                log::error!("general: callocate {num_elements} x {elem_size} overflows");
                return None;
            }
        };

        // Dispatch by element size, like every other sized request.
        let index = Self::space_index(elem_size);
        self.with_space(index, |space| space.alloc(req))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        // Safety: ptr is a live allocation per the trait contract.
        let owner = unsafe { space::owner_from_footer(ptr.as_ptr()) };

        if owner == 0 {
            // Standalone OS region.
            // Safety: null-footer regions come from the direct path.
            unsafe { space::release_direct(ptr.as_ptr()) };
            return;
        }

        // Trust the footer only once it matches a live space base.  The
        // chunk being live keeps its space alive, so a matching entry cannot
        // be destroyed concurrently.
        for index in 0..NUM_SPACES {
            if self.space_addrs[index].load(Ordering::Acquire) != owner {
                continue;
            }
            let mut guard = self.spaces[index].lock().unwrap();
            let matches = guard
                .as_ref()
                .is_some_and(|space| space.header_addr() == owner);
            if !matches {
                break; // footer raced a destroy: fall through to the error
            }
            let space = guard.as_mut().expect("matched space");
            debug_assert!(
                space.contains(ptr.as_ptr() as usize),
                "footer owner does not cover {:p}",
                ptr.as_ptr()
            );
            // Safety: ownership established via the footer table.
            let drained = unsafe { space.free(ptr.as_ptr()) };
            if drained {
                self.space_addrs[index].store(0, Ordering::Release);
                if let Some(space) = guard.take() {
                    space.destroy();
                }
            }
            return;
        }

        log::error!("general: deallocate of foreign pointer {:p}", ptr.as_ptr());
        debug_assert!(false, "deallocate of foreign pointer {:p}", ptr.as_ptr());
    }

    unsafe fn alloc_size(&self, ptr: NonNull<u8>) -> usize {
        // Safety: ptr is a live allocation per the trait contract.
        unsafe { space::usable_size(ptr.as_ptr()) }
    }

    fn total_allocated(&self) -> usize {
        self.spaces
            .iter()
            .map(|slot| slot.lock().unwrap().as_ref().map_or(0, Space::footprint))
            .sum()
    }
}

impl Drop for GeneralAllocator {
    fn drop(&mut self) {
        for (index, slot) in self.spaces.iter().enumerate() {
            if let Some(space) = slot.lock().unwrap().take() {
                self.space_addrs[index].store(0, Ordering::Release);
                space.destroy();
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_space_index_dispatch() {
        assert_eq!(GeneralAllocator::space_index(0), 0);
        assert_eq!(GeneralAllocator::space_index(24), 3);
        assert_eq!(GeneralAllocator::space_index(63), 7);
        assert_eq!(GeneralAllocator::space_index(64), 8);
        assert_eq!(GeneralAllocator::space_index(128), 12);
        assert_eq!(GeneralAllocator::space_index(255), 19);
        assert_eq!(GeneralAllocator::space_index(256), 20);
        assert_eq!(GeneralAllocator::space_index(4096), 20);
    }

    #[test]
    fn test_segregated_dispatch_creates_and_destroys_spaces() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let alloc = GeneralAllocator::new();

        let a1 = alloc.allocate(24, 8, 0, None).unwrap();
        let a2 = alloc.allocate(24, 8, 0, None).unwrap();
        let b1 = alloc.allocate(128, 8, 0, None).unwrap();
        let b2 = alloc.allocate(128, 8, 0, None).unwrap();
        let c1 = alloc.allocate(4096, 8, 0, None).unwrap();

        // Exactly three spaces exist: 3, 12 and 20.
        for index in 0..NUM_SPACES {
            assert_eq!(
                alloc.space_exists(index),
                matches!(index, 3 | 12 | 20),
                "unexpected space population at index {index}"
            );
        }
        // The total footprint is the sum of the three segments.
        assert_eq!(alloc.total_allocated(), 3 * 65536);

        // Safety: all pointers are live allocations of `alloc`.
        unsafe {
            alloc.deallocate(a1);
            alloc.deallocate(a2);
            alloc.deallocate(b1);
            alloc.deallocate(b2);
        }
        assert!(!alloc.space_exists(3), "space 3 should die when emptied");
        assert!(!alloc.space_exists(12), "space 12 should die when emptied");
        assert!(alloc.space_exists(20), "space 20 still holds an allocation");
        assert_eq!(alloc.total_allocated(), 65536);

        // Safety: c1 is still live.
        unsafe { alloc.deallocate(c1) };
        assert_eq!(alloc.total_allocated(), 0);
    }

    #[test]
    fn test_allocate_alignment_and_size_postconditions() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = GeneralAllocator::new();
        for &(size, align, offset) in &[
            (1usize, 8usize, 0usize),
            (17, 32, 0),
            (100, 16, 8),
            (300, 4096, 0),
            (5000, 64, 16),
        ] {
            let mem = alloc
                .allocate(size, align, offset, Some(AllocSite::here()))
                .unwrap();
            assert_eq!((mem.as_ptr() as usize + offset) % align, 0);
            // Safety: mem is live with at least `size` usable bytes.
            unsafe {
                assert!(alloc.alloc_size(mem) >= size);
                std::ptr::write_bytes(mem.as_ptr(), 0x5A, size);
                alloc.deallocate(mem);
            }
        }
        assert_eq!(alloc.total_allocated(), 0);
    }

    #[test]
    fn test_callocate_overflow_fails() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = GeneralAllocator::new();
        assert!(alloc.callocate(usize::MAX / 2, 16, None).is_none());
    }

    #[test]
    fn test_callocate_array() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = GeneralAllocator::new();
        let mem = alloc.callocate(64, 24, None).unwrap();
        // Safety: 64 * 24 bytes are usable.
        unsafe {
            assert!(alloc.alloc_size(mem) >= 64 * 24);
            alloc.deallocate(mem);
        }
        assert_eq!(alloc.total_allocated(), 0);
    }

    #[test]
    fn test_boundary_sizes_route_to_intended_spaces() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = GeneralAllocator::new();
        // 255 is the last small class, 256 the first large one.
        let small = alloc.allocate(255, 8, 0, None).unwrap();
        let large = alloc.allocate(256, 8, 0, None).unwrap();
        assert!(alloc.space_exists(19));
        assert!(alloc.space_exists(20));
        // Safety: both are live.
        unsafe {
            alloc.deallocate(small);
            alloc.deallocate(large);
        }
        assert_eq!(alloc.total_allocated(), 0);
    }

    #[test]
    fn test_very_large_request_is_standalone() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = GeneralAllocator::new();
        // Past the large space's 8 MiB threshold: served directly from the
        // OS and not accounted in any footprint.
        let mem = alloc.allocate(9 * 1024 * 1024, 8, 0, None).unwrap();
        // Safety: mem is live.
        unsafe {
            assert!(alloc.alloc_size(mem) >= 9 * 1024 * 1024);
            std::ptr::write_bytes(mem.as_ptr(), 1, 9 * 1024 * 1024);
            alloc.deallocate(mem);
        }
    }

    #[test]
    fn test_zero_sum_workload_drains_everything() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let alloc = GeneralAllocator::new();
        let mut live = Vec::new();
        let mut state = 0xC0FFEEu32;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };
        for _ in 0..600 {
            let r = next();
            if r % 4 != 0 || live.is_empty() {
                let size = 1 + (r as usize % 2000);
                if let Some(mem) = alloc.allocate(size, 8, 0, None) {
                    live.push(mem);
                }
            } else {
                let idx = next() as usize % live.len();
                let mem = live.swap_remove(idx);
                // Safety: mem is live and removed from the list.
                unsafe { alloc.deallocate(mem) };
            }
        }
        #[cfg(debug_assertions)]
        alloc.validate();
        for mem in live.drain(..) {
            // Safety: all remaining pointers are live.
            unsafe { alloc.deallocate(mem) };
        }
        assert_eq!(alloc.total_allocated(), 0, "all spaces should be destroyed");
    }
}
