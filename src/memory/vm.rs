use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    ReservationFailed(std::io::Error),
    /// A hinted reservation could not be placed at the requested address.
    HintUnavailable,
    CommitFailed(std::io::Error),
    DecommitFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    InitializationFailed(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::HintUnavailable => write!(f, "VM reservation hint could not be honoured"),
            VmError::CommitFailed(e) => write!(f, "VM commit failed: {e}"),
            VmError::DecommitFailed(e) => write!(f, "VM decommit failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::InitializationFailed(msg) => write!(f, "VM initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e)
            | VmError::CommitFailed(e)
            | VmError::DecommitFailed(e)
            | VmError::ReleaseFailed(e) => Some(e),
            VmError::HintUnavailable | VmError::InitializationFailed(_) => None,
        }
    }
}

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    ///
    /// With a `hint`, the reservation must start at exactly the hinted
    /// address; if the kernel places it anywhere else the mapping is undone
    /// and `HintUnavailable` is returned so the caller can escalate.
    unsafe fn reserve(size: usize, hint: Option<NonNull<u8>>) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Decommit (return physical pages, keep address range reserved).
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    ///
    /// A trailing sub-range of a reservation may be released on its own.
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Reserve and commit in one step, bypassing the page-at-a-time path.
    unsafe fn reserve_commit(size: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: forwarded preconditions.
        let ptr = unsafe { Self::reserve(size, None)? };
        // Safety: ptr covers exactly the reserved range.
        unsafe { Self::commit(ptr, size)? };
        Ok(ptr)
    }

    /// OS page size (default/minimum).
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize, hint: Option<NonNull<u8>>) -> Result<NonNull<u8>, VmError> {
            let addr = hint.map_or(std::ptr::null_mut(), |h| h.as_ptr().cast::<libc::c_void>());
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    addr,
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            // mmap treats the address as a hint only; a mapping that landed
            // elsewhere is useless to callers growing a segment in place.
            if let Some(h) = hint {
                if ptr.cast::<u8>() != h.as_ptr() {
                    // Safety: undoing the mapping we just created.
                    unsafe { libc::munmap(ptr, size) };
                    log::trace!("vm: hinted reservation at {:p} refused", h.as_ptr());
                    return Err(VmError::HintUnavailable);
                }
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            {
                // Pages are committed shortly before first use; ask for
                // immediate physical backing to avoid a burst of minor faults.
                // Safety: FFI call to madvise.
                unsafe {
                    libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_WILLNEED)
                };
            }

            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // MADV_FREE marks pages for lazy reclamation, then
            // mprotect(PROT_NONE) removes access.  Recommitted pages may hold
            // stale data; callers must not rely on zero-fill after a
            // decommit/commit cycle.
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // This crate supports only 64-bit targets; page size fits.
                #[allow(clippy::cast_sign_loss)]
                {
                    raw as usize
                }
            })
        }
    }
}

#[cfg(all(target_os = "windows", not(any(loom, miri))))]
mod windows {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use libc;
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize, hint: Option<NonNull<u8>>) -> Result<NonNull<u8>, VmError> {
            let addr = hint.map_or(std::ptr::null_mut(), |h| {
                h.as_ptr().cast::<libc::c_void>()
            });
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe { libc::VirtualAlloc(addr, size, libc::MEM_RESERVE, libc::PAGE_NOACCESS) };

            // A hinted base gets rounded down to the allocation granularity;
            // anything but the exact address is useless for in-place growth.
            if let Some(h) = hint {
                if !ptr.is_null() && ptr.cast::<u8>() != h.as_ptr() {
                    // Safety: undoing the reservation just made.
                    unsafe { libc::VirtualFree(ptr, 0, libc::MEM_RELEASE) };
                    return Err(VmError::HintUnavailable);
                }
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None if hint.is_some() => Err(VmError::HintUnavailable),
                None => Err(VmError::ReservationFailed(io::Error::last_os_error())),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to VirtualAlloc.
            let result = unsafe {
                libc::VirtualAlloc(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::MEM_COMMIT,
                    libc::PAGE_READWRITE,
                )
            };
            if result.is_null() {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to VirtualFree.
            if unsafe {
                libc::VirtualFree(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MEM_DECOMMIT)
            } == 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            // MEM_RELEASE requires size 0 and the base of the reservation.
            // Safety: FFI call to VirtualFree.
            if unsafe {
                libc::VirtualFree(ptr.as_ptr().cast::<libc::c_void>(), 0, libc::MEM_RELEASE)
            } == 0
            {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            // Safety: FFI call to GetSystemInfo.
            *CACHED.get_or_init(|| unsafe {
                let mut info: libc::SYSTEM_INFO = std::mem::zeroed();
                libc::GetSystemInfo(&mut info);
                info.dwPageSize as usize
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap/VirtualAlloc)
//
// Under `cfg(loom)` and Miri we cannot issue real VM syscalls.  Every
// "reservation" is backed by a zeroed heap allocation, recorded in a registry
// so `release` can recover the layout.  `commit`/`decommit` are no-ops.
// Hinted reservations always fail, which exercises the callers' escalation
// path (adjacent segment growth falls through to a standalone region).
// Releasing a trailing sub-range is tolerated as a no-op; the pages are
// reclaimed when the base reservation is released.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
mod mock {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::collections::HashMap;
    use std::sync::Mutex;

    // A std Mutex even under loom: the registry is test plumbing, not a
    // synchronization point the model should explore.
    static RESERVATIONS: Mutex<Option<HashMap<usize, usize>>> = Mutex::new(None);

    fn with_registry<R>(f: impl FnOnce(&mut HashMap<usize, usize>) -> R) -> R {
        let mut guard = RESERVATIONS.lock().unwrap();
        f(guard.get_or_insert_with(HashMap::new))
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize, hint: Option<NonNull<u8>>) -> Result<NonNull<u8>, VmError> {
            if hint.is_some() {
                return Err(VmError::HintUnavailable);
            }
            if size == 0 {
                return Err(VmError::ReservationFailed(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "zero-size reservation",
                )));
            }
            let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
                .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
            // Safety: layout has non-zero size.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            let nn = NonNull::new(ptr).ok_or_else(|| {
                VmError::ReservationFailed(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    "alloc returned null",
                ))
            })?;
            with_registry(|r| r.insert(nn.as_ptr() as usize, size));
            Ok(nn)
        }

        unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            Ok(()) // heap memory is always accessible
        }

        unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            Ok(()) // no-op; memory remains accessible
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            let recorded = with_registry(|r| r.remove(&(ptr.as_ptr() as usize)));
            if let Some(size) = recorded {
                let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
                    .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
                // Safety: ptr was allocated with this layout via `reserve`.
                unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
            }
            // Unknown base: a partial release of a larger reservation.
            Ok(())
        }

        fn page_size() -> usize {
            4096
        }
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let size = PlatformVmOps::page_size();
        // Safety: test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size, None).expect("reserve failed");
            PlatformVmOps::commit(ptr, size).expect("commit failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            assert_eq!(slice[0], 42);

            PlatformVmOps::decommit(ptr, size).expect("decommit failed");
            PlatformVmOps::release(ptr, size).expect("release failed");
        }
    }

    #[test]
    fn test_reserve_zero_size() {
        // mmap with 0 size fails with EINVAL.
        // Safety: test code.
        let result = unsafe { PlatformVmOps::reserve(0, None) };
        assert!(result.is_err(), "reserving 0 bytes should fail");
    }

    #[test]
    fn test_commit_idempotent() {
        let size = PlatformVmOps::page_size();
        // Safety: test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size, None).expect("reserve failed");
            PlatformVmOps::commit(ptr, size).expect("first commit failed");
            PlatformVmOps::commit(ptr, size).expect("second commit failed");
            *(ptr.as_ptr()) = 123;
            PlatformVmOps::release(ptr, size).expect("release failed");
        }
    }

    #[test]
    fn test_decommit_then_recommit() {
        let size = PlatformVmOps::page_size();
        // Safety: test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size, None).expect("reserve failed");

            PlatformVmOps::commit(ptr, size).expect("commit failed");
            *(ptr.as_ptr()) = 42;
            assert_eq!(*(ptr.as_ptr().cast_const()), 42);

            PlatformVmOps::decommit(ptr, size).expect("decommit failed");
            PlatformVmOps::commit(ptr, size).expect("recommit failed");

            // Content is undefined after decommit; write fresh.
            *(ptr.as_ptr()) = 84;
            assert_eq!(*(ptr.as_ptr().cast_const()), 84);

            PlatformVmOps::release(ptr, size).expect("release failed");
        }
    }

    #[test]
    fn test_partial_commit() {
        let page_size = PlatformVmOps::page_size();
        let total_size = page_size * 4;
        let commit_size = page_size * 2;

        // Safety: test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(total_size, None).expect("reserve failed");
            let commit_ptr = NonNull::new(ptr.as_ptr().add(page_size)).unwrap();

            PlatformVmOps::commit(commit_ptr, commit_size).expect("partial commit failed");

            let slice = std::slice::from_raw_parts_mut(commit_ptr.as_ptr(), commit_size);
            slice[0] = 10;
            slice[commit_size - 1] = 20;
            assert_eq!(slice[0], 10);
            assert_eq!(slice[commit_size - 1], 20);

            PlatformVmOps::release(ptr, total_size).expect("release failed");
        }
    }

    #[test]
    fn test_hinted_reservation_adjacent() {
        // Reserve a range, release its tail, then re-reserve the tail by hint.
        let page_size = PlatformVmOps::page_size();
        let size = page_size * 2;
        // Safety: test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size, None).expect("reserve failed");
            let tail = NonNull::new(ptr.as_ptr().add(page_size)).unwrap();
            PlatformVmOps::release(tail, page_size).expect("tail release failed");

            let again = PlatformVmOps::reserve(page_size, Some(tail));
            match again {
                Ok(p) => {
                    assert_eq!(p, tail, "hinted reservation landed elsewhere");
                    PlatformVmOps::release(ptr, size).expect("release failed");
                }
                Err(VmError::HintUnavailable) => {
                    // Another mapping raced us in; acceptable.
                    PlatformVmOps::release(ptr, page_size).expect("release failed");
                }
                Err(e) => panic!("unexpected hinted-reserve error: {e}"),
            }
        }
    }

    #[test]
    fn test_hinted_reservation_occupied_fails() {
        // A hint pointing into a live mapping cannot be honoured.
        let page_size = PlatformVmOps::page_size();
        // Safety: test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(page_size * 2, None).expect("reserve failed");
            let inside = NonNull::new(ptr.as_ptr().add(page_size)).unwrap();
            let result = PlatformVmOps::reserve(page_size, Some(inside));
            assert!(matches!(result, Err(VmError::HintUnavailable)));
            PlatformVmOps::release(ptr, page_size * 2).expect("release failed");
        }
    }

    #[test]
    fn test_reserve_commit_one_step() {
        let size = PlatformVmOps::page_size();
        // Safety: test code.
        unsafe {
            let ptr = PlatformVmOps::reserve_commit(size).expect("reserve_commit failed");
            *(ptr.as_ptr()) = 7;
            assert_eq!(*(ptr.as_ptr().cast_const()), 7);
            PlatformVmOps::release(ptr, size).expect("release failed");
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVmOps::page_size();
        assert!(size > 0);
        assert_eq!(size & (size - 1), 0, "page size {size} is not a power of two");
    }

    #[test]
    fn test_multiple_reservations() {
        let page_size = PlatformVmOps::page_size();
        // Safety: test code.
        unsafe {
            let ptr1 = PlatformVmOps::reserve(page_size, None).expect("reserve 1 failed");
            let ptr2 = PlatformVmOps::reserve(page_size, None).expect("reserve 2 failed");
            assert_ne!(ptr1, ptr2);

            PlatformVmOps::commit(ptr1, page_size).expect("commit 1 failed");
            PlatformVmOps::commit(ptr2, page_size).expect("commit 2 failed");

            *(ptr1.as_ptr()) = 1;
            *(ptr2.as_ptr()) = 2;

            PlatformVmOps::release(ptr1, page_size).expect("release 1 failed");
            assert_eq!(*(ptr2.as_ptr()), 2);
            PlatformVmOps::release(ptr2, page_size).expect("release 2 failed");
        }
    }
}
