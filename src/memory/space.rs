//! A boundary-tagged heap over a single virtual-memory reservation.
//!
//! Each [`Space`] owns one segment: a header written at the base of the
//! segment, followed by chunks, with the `top` chunk covering the free tail.
//! Small free chunks live in 32 exact-size ring bins; large free chunks live
//! in 32 size-keyed binary tree bins whose equal-sized nodes form rings.  A
//! designated-victim chunk (`dv`) caches the most recent split remainder and
//! is served ahead of `top`.
//!
//! Pages are committed on demand as `top` advances and decommitted one page
//! at a time as it retreats.  A segment can grow in place by a hinted
//! reservation at its current end; requests past the segment threshold are
//! served as standalone OS regions carrying a null owner footer.
//!
//! Callers serialise access externally (one mutex per space); nothing here
//! locks.

use super::chunk::*;
use super::stats;
use super::vm::{PlatformVmOps, VmOps};
use crate::memory::allocator::align_up;
use std::ptr::{self, NonNull};

/// Per-segment bookkeeping, written in place at the segment base.
///
/// The small-bin array stores only `fd`/`bk` pairs; a bin "header" is a fake
/// chunk overlaid on the array so that its `fd`/`bk` fields land on the
/// elements `2i + 2` and `2i + 3`.  That is why the array holds
/// `(NUM_SMALL_BINS + 1) * 2` slots.
#[repr(C)]
pub(crate) struct SpaceHeader {
    small_map: u32,
    tree_map: u32,
    dv: *mut Chunk,
    top: *mut Chunk,
    dv_size: usize,
    top_size: usize,
    small_bins: [*mut Chunk; (NUM_SMALL_BINS as usize + 1) * 2],
    tree_bins: [*mut TreeChunk; NUM_TREE_BINS as usize],
    least_addr: *mut u8,
    curr_page_index: usize,
    page_size: usize,
    segment_granularity: usize,
    segment_threshold: usize,
    footprint: usize,
    max_footprint: usize,
}

/// Owning handle to a space.  The header lives inside the segment itself;
/// dropping the handle does not release the segment — call
/// [`Space::destroy`].
pub(crate) struct Space {
    hdr: NonNull<SpaceHeader>,
}

// Safety: Space owns its segment; the raw pointers never alias another
// space.  All access is serialised by the caller's per-space mutex.
unsafe impl Send for Space {}

impl Space {
    /// Reserve a fresh segment, commit its first page and initialise the
    /// in-segment header.
    ///
    /// `page_size` is the granularity at which the committed prefix grows
    /// and shrinks; `segment_granularity` is the unit in which trailing free
    /// space is returned to the OS; requests of `segment_threshold` bytes or
    /// more bypass the segment entirely.
    pub fn create(
        initial_size: usize,
        page_size: usize,
        segment_granularity: usize,
        segment_threshold: usize,
    ) -> Option<Space> {
        let size = if initial_size == 0 {
            segment_granularity
        } else {
            initial_size
        };
        debug_assert!(page_size.is_power_of_two());
        debug_assert!(size % page_size == 0 && segment_granularity % page_size == 0);

        // Safety: plain reservation, no hint.
        let base = unsafe { PlatformVmOps::reserve(size, None) }.ok()?;
        let first_commit = page_size.min(size);
        // Safety: committing the first page of the reservation just made.
        if unsafe { PlatformVmOps::commit(base, first_commit) }.is_err() {
            // Safety: releasing the reservation just made.
            unsafe { drop(PlatformVmOps::release(base, size)) };
            return None;
        }

        stats::TOTAL_RESERVED.add(size);
        stats::TOTAL_COMMITTED.add(first_commit);
        stats::GENERAL_ALLOCATOR_COMMITTED.add(first_commit);

        // Safety: base points at `size` reserved bytes with the first page
        // committed and zeroed by the OS.
        let hdr = unsafe {
            init_space(
                base.as_ptr(),
                size,
                page_size,
                segment_granularity,
                segment_threshold,
            )
        };
        log::debug!("space: created segment at {:p} ({} bytes)", base.as_ptr(), size);
        Some(Space { hdr })
    }

    /// Address of the in-segment header; this is the value written into
    /// in-use footers and validated on free.
    #[inline]
    pub fn header_addr(&self) -> usize {
        self.hdr.as_ptr() as usize
    }

    #[inline]
    pub fn footprint(&self) -> usize {
        // Safety: header is live for the lifetime of the handle.
        unsafe { (*self.hdr.as_ptr()).footprint }
    }

    #[inline]
    pub fn max_footprint(&self) -> usize {
        // Safety: header is live for the lifetime of the handle.
        unsafe { (*self.hdr.as_ptr()).max_footprint }
    }

    /// Whether `addr` falls inside this segment's reserved window.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        // Safety: header is live for the lifetime of the handle.
        unsafe {
            let msp = self.hdr.as_ptr();
            let least = (*msp).least_addr as usize;
            addr >= least && addr < least + (*msp).footprint
        }
    }

    /// Allocate `bytes` with the default 8-byte alignment.
    pub fn alloc(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        // Safety: exclusive access via &mut self.
        unsafe { alloc_impl(self.hdr.as_ptr(), bytes) }
    }

    /// Allocate `bytes` such that the returned pointer plus `offset` is a
    /// multiple of `alignment`.
    pub fn alloc_aligned(
        &mut self,
        alignment: usize,
        bytes: usize,
        offset: usize,
    ) -> Option<NonNull<u8>> {
        // Safety: exclusive access via &mut self.
        unsafe { alloc_aligned_impl(self.hdr.as_ptr(), alignment, bytes, offset) }
    }

    /// Release an allocation.  Returns `true` when the whole segment has
    /// coalesced back into `top` and the space should be destroyed by its
    /// owner.
    ///
    /// # Safety
    /// `mem` must be a live allocation obtained from this space.
    pub unsafe fn free(&mut self, mem: *mut u8) -> bool {
        // Safety: forwarded contract.
        unsafe { free_impl(self.hdr.as_ptr(), mem) }
    }

    /// Release the entire segment back to the OS.
    pub fn destroy(self) {
        // Safety: consuming self; no further access possible.
        unsafe {
            let msp = self.hdr.as_ptr();
            let least = (*msp).least_addr;
            let fp = (*msp).footprint;
            let committed = ((*msp).curr_page_index * (*msp).page_size).min(fp);
            log::debug!("space: destroying segment at {least:p} ({fp} bytes)");
            drop(PlatformVmOps::release(NonNull::new_unchecked(least), fp));
            stats::TOTAL_RESERVED.sub(fp);
            stats::TOTAL_COMMITTED.sub(committed);
            stats::GENERAL_ALLOCATOR_COMMITTED.sub(committed);
        }
    }

    /// Walk the chunk list from the first allocatable chunk to `top`,
    /// returning `(in_use, free)` chunk counts.  Adjacent free chunks are a
    /// coalescing violation and panic.
    #[cfg(any(test, debug_assertions))]
    pub fn walk(&self) -> (usize, usize) {
        // Safety: exclusive access guaranteed by caller's lock.
        unsafe { walk_chunks(self.hdr.as_ptr()) }
    }

    /// Full integrity check of bins, maps, dv/top and the chunk walk.
    #[cfg(debug_assertions)]
    pub fn validate(&self) {
        // Safety: exclusive access guaranteed by caller's lock.
        unsafe { validate_space(self.hdr.as_ptr()) }
    }
}

/// Usable bytes of an in-use chunk (its size minus the header overhead).
///
/// # Safety
/// `mem` must point at a live allocation from some space or a standalone
/// region.
pub(crate) unsafe fn usable_size(mem: *mut u8) -> usize {
    // Safety: upheld by caller.
    unsafe {
        let p = mem_to_chunk(mem);
        if is_inuse(p) {
            chunk_size(p) - CHUNK_OVERHEAD
        } else {
            0
        }
    }
}

/// Read the owner slot from an in-use chunk's footer.  Zero marks a
/// standalone OS region.
///
/// # Safety
/// `mem` must point at a live allocation.
pub(crate) unsafe fn owner_from_footer(mem: *mut u8) -> usize {
    // Safety: upheld by caller.
    unsafe {
        let p = mem_to_chunk(mem);
        (*chunk_plus_offset(p, chunk_size(p))).prev_foot
    }
}

/// Release a standalone OS region created by the direct-allocation path.
/// The chunk's own `prev_foot` holds its distance from the mapping base
/// (non-zero when the chunk was placed for alignment inside the mapping).
///
/// # Safety
/// `mem` must be a live allocation whose owner footer is null.
pub(crate) unsafe fn release_direct(mem: *mut u8) {
    // Safety: upheld by caller.
    unsafe {
        let p = mem_to_chunk(mem);
        let front = (*p).prev_foot;
        let base = p.cast::<u8>().sub(front);
        let size = front + chunk_size(p) + CHUNK_OVERHEAD;
        stats::TOTAL_RESERVED.sub(size);
        stats::TOTAL_COMMITTED.sub(size);
        stats::GENERAL_ALLOCATOR_COMMITTED.sub(size);
        drop(PlatformVmOps::release(NonNull::new_unchecked(base), size));
    }
}

// ---------------------------------------------------------------------------
// Header initialisation
// ---------------------------------------------------------------------------

/// # Safety
/// `base` must point at `size` reserved bytes whose first page is committed
/// and zeroed.
unsafe fn init_space(
    base: *mut u8,
    size: usize,
    page_size: usize,
    segment_granularity: usize,
    segment_threshold: usize,
) -> NonNull<SpaceHeader> {
    // Safety: the first committed page comfortably holds the header chunk.
    unsafe {
        debug_assert!(is_aligned(base as usize));
        let msp_size = pad_request(std::mem::size_of::<SpaceHeader>());
        debug_assert!(msp_size + MIN_CHUNK_SIZE < page_size.min(size));

        let hdr_chunk = base.cast::<Chunk>();
        // PINUSE is set so frees never walk before the first chunk.
        (*hdr_chunk).head = msp_size | INUSE_BITS;

        let msp = chunk_to_mem(hdr_chunk).cast::<SpaceHeader>();
        ptr::write(
            msp,
            SpaceHeader {
                small_map: 0,
                tree_map: 0,
                dv: ptr::null_mut(),
                top: ptr::null_mut(),
                dv_size: 0,
                top_size: 0,
                small_bins: [ptr::null_mut(); (NUM_SMALL_BINS as usize + 1) * 2],
                tree_bins: [ptr::null_mut(); NUM_TREE_BINS as usize],
                least_addr: base,
                curr_page_index: 1,
                page_size,
                segment_granularity,
                segment_threshold,
                footprint: size,
                max_footprint: size,
            },
        );

        // Establish circular links for the small bins.
        for i in 0..NUM_SMALL_BINS {
            let bin = small_bin_at(msp, i);
            (*bin).fd = bin;
            (*bin).bk = bin;
        }

        // Everything past the header chunk is top.
        let top = next_chunk(hdr_chunk);
        let top_size = base as usize + size - top as usize;
        (*msp).top = top;
        (*msp).top_size = top_size;
        (*top).head = top_size | PINUSE;

        NonNull::new_unchecked(msp)
    }
}

// ---------------------------------------------------------------------------
// Bin addressing and bitmap operations
// ---------------------------------------------------------------------------

#[inline]
unsafe fn small_bin_at(msp: *mut SpaceHeader, index: u32) -> *mut Chunk {
    // Safety: index < NUM_SMALL_BINS; the fake chunk's fd/bk land inside
    // the array (see the field comment on `small_bins`).
    unsafe {
        ptr::addr_of_mut!((*msp).small_bins)
            .cast::<*mut Chunk>()
            .add((index as usize) << 1)
            .cast::<Chunk>()
    }
}

#[inline]
unsafe fn tree_bin_at(msp: *mut SpaceHeader, index: u32) -> *mut *mut TreeChunk {
    // Safety: index < NUM_TREE_BINS.
    unsafe {
        ptr::addr_of_mut!((*msp).tree_bins)
            .cast::<*mut TreeChunk>()
            .add(index as usize)
    }
}

#[inline]
unsafe fn mark_small_map(msp: *mut SpaceHeader, index: u32) {
    // Safety: msp valid.
    unsafe { (*msp).small_map |= index_to_bit(index) };
}

#[inline]
unsafe fn clear_small_map(msp: *mut SpaceHeader, index: u32) {
    // Safety: msp valid.
    unsafe { (*msp).small_map &= !index_to_bit(index) };
}

#[inline]
unsafe fn small_map_marked(msp: *mut SpaceHeader, index: u32) -> bool {
    // Safety: msp valid.
    unsafe { (*msp).small_map & index_to_bit(index) != 0 }
}

#[inline]
unsafe fn mark_tree_map(msp: *mut SpaceHeader, index: u32) {
    // Safety: msp valid.
    unsafe { (*msp).tree_map |= index_to_bit(index) };
}

#[inline]
unsafe fn clear_tree_map(msp: *mut SpaceHeader, index: u32) {
    // Safety: msp valid.
    unsafe { (*msp).tree_map &= !index_to_bit(index) };
}

#[inline]
unsafe fn tree_map_marked(msp: *mut SpaceHeader, index: u32) -> bool {
    // Safety: msp valid.
    unsafe { (*msp).tree_map & index_to_bit(index) != 0 }
}

// ---------------------------------------------------------------------------
// Flag/footer writers
// ---------------------------------------------------------------------------

/// Write the owning space's address into the word past the chunk.
#[inline]
unsafe fn mark_inuse_foot(msp: *mut SpaceHeader, p: *mut Chunk, size: usize) {
    // Safety: the footer slot is the next chunk's prev_foot, always within
    // the committed region for pooled chunks.
    unsafe { (*chunk_plus_offset(p, size)).prev_foot = msp as usize };
}

/// Mark in-use preserving the current PINUSE bit; sets the next chunk's
/// PINUSE and the owner footer.
#[inline]
unsafe fn set_inuse(msp: *mut SpaceHeader, p: *mut Chunk, size: usize) {
    // Safety: upheld by caller.
    unsafe {
        (*p).head = ((*p).head & PINUSE) | size | CINUSE;
        (*chunk_plus_offset(p, size)).head |= PINUSE;
        mark_inuse_foot(msp, p, size);
    }
}

/// Mark in-use with PINUSE known set; sets the next chunk's PINUSE and the
/// owner footer.
#[inline]
unsafe fn set_inuse_and_pinuse(msp: *mut SpaceHeader, p: *mut Chunk, size: usize) {
    // Safety: upheld by caller.
    unsafe {
        (*p).head = size | PINUSE | CINUSE;
        (*chunk_plus_offset(p, size)).head |= PINUSE;
        mark_inuse_foot(msp, p, size);
    }
}

/// Mark in-use without touching the next chunk's head (the caller sets the
/// free remainder up itself).
#[inline]
unsafe fn set_size_and_pinuse_of_inuse_chunk(msp: *mut SpaceHeader, p: *mut Chunk, size: usize) {
    // Safety: upheld by caller.
    unsafe {
        (*p).head = size | PINUSE | CINUSE;
        mark_inuse_foot(msp, p, size);
    }
}

/// Write a free chunk's head and its size into the next chunk's prev_foot.
#[inline]
unsafe fn set_size_and_pinuse_of_free_chunk(p: *mut Chunk, size: usize) {
    // Safety: upheld by caller.
    unsafe {
        (*p).head = size | PINUSE;
        (*chunk_plus_offset(p, size)).prev_foot = size;
    }
}

/// Mark `p` free where `next` is its successor: clears the successor's
/// PINUSE and writes the free head/foot.
#[inline]
unsafe fn set_free_with_pinuse(p: *mut Chunk, size: usize, next: *mut Chunk) {
    // Safety: upheld by caller.
    unsafe {
        (*next).head &= !PINUSE;
        set_size_and_pinuse_of_free_chunk(p, size);
    }
}

// ---------------------------------------------------------------------------
// Linking and unlinking chunks
// ---------------------------------------------------------------------------

unsafe fn insert_small_chunk(msp: *mut SpaceHeader, p: *mut Chunk, size: usize) {
    // Safety: p is a free chunk of `size` bytes; exclusive access.
    unsafe {
        debug_assert!(size >= MIN_CHUNK_SIZE);
        let index = small_bin_index(size);
        let back = small_bin_at(msp, index);

        if !small_map_marked(msp, index) {
            mark_small_map(msp, index);
        }

        let forward = (*back).fd;
        (*back).fd = p;
        (*forward).bk = p;
        (*p).fd = forward;
        (*p).bk = back;
    }
}

unsafe fn unlink_small_chunk(msp: *mut SpaceHeader, p: *mut Chunk, size: usize) {
    // Safety: p is linked into the small bin for `size`; exclusive access.
    unsafe {
        let forward = (*p).fd;
        let back = (*p).bk;
        let index = small_bin_index(size);

        debug_assert!(p != forward);
        debug_assert!(p != back);
        debug_assert_eq!(chunk_size(p), small_index_to_size(index));

        if forward == back {
            clear_small_map(msp, index);
        }
        (*forward).bk = back;
        (*back).fd = forward;
    }
}

/// Unlink the first chunk of a known non-empty small bin.
unsafe fn unlink_first_small_chunk(msp: *mut SpaceHeader, p: *mut Chunk, index: u32) {
    // Safety: p is the bin's fd; exclusive access.
    unsafe {
        let forward = (*p).fd;
        let back = small_bin_at(msp, index);

        debug_assert!(p != forward);
        debug_assert!(p != back);
        debug_assert_eq!(chunk_size(p), small_index_to_size(index));

        if forward == back {
            clear_small_map(msp, index);
        }
        (*forward).bk = back;
        (*back).fd = forward;
    }
}

unsafe fn insert_large_chunk(msp: *mut SpaceHeader, x: *mut TreeChunk, size: usize) {
    // Safety: x is a free chunk of `size` >= MIN_LARGE_SIZE bytes, so the
    // tree fields fit inside it; exclusive access.
    unsafe {
        let index = tree_bin_index(size);
        let bin = tree_bin_at(msp, index);
        (*x).index = index;
        (*x).child[0] = ptr::null_mut();
        (*x).child[1] = ptr::null_mut();

        if !tree_map_marked(msp, index) {
            // First node for this index.
            mark_tree_map(msp, index);
            *bin = x;
            // The bin slot acts as the root's parent.
            (*x).parent = bin.cast::<TreeChunk>();
            (*x).chunk.fd = x.cast::<Chunk>();
            (*x).chunk.bk = x.cast::<Chunk>();
            return;
        }

        let mut t = *bin;
        let mut size_bits = size << leftshift_for_tree_index(index);
        loop {
            if chunk_size(t.cast::<Chunk>()) != size {
                // Descend along the size-bit path.
                let side = (size_bits >> (usize::BITS - 1)) & 1;
                size_bits <<= 1;
                let slot = ptr::addr_of_mut!((*t).child[side]);
                if (*slot).is_null() {
                    *slot = x;
                    (*x).parent = t;
                    (*x).chunk.fd = x.cast::<Chunk>();
                    (*x).chunk.bk = x.cast::<Chunk>();
                    return;
                }
                t = *slot;
            } else {
                // Chain onto the ring of equal-sized nodes.
                let front = (*t).chunk.fd;
                (*t).chunk.fd = x.cast::<Chunk>();
                (*front).bk = x.cast::<Chunk>();
                (*x).chunk.fd = front;
                (*x).chunk.bk = t.cast::<Chunk>();
                (*x).parent = ptr::null_mut();
                return;
            }
        }
    }
}

unsafe fn unlink_large_chunk(msp: *mut SpaceHeader, x: *mut TreeChunk) {
    // Safety: x is linked into a tree bin; exclusive access.
    unsafe {
        let xp = (*x).parent;
        let mut r: *mut TreeChunk;

        if (*x).chunk.bk != x.cast::<Chunk>() {
            // Part of a ring: splice out, promoting the previous node.
            let f = (*x).chunk.fd;
            r = (*x).chunk.bk.cast::<TreeChunk>();
            (*f).bk = r.cast::<Chunk>();
            (*r).chunk.fd = f;
        } else {
            // Sole node of its size: replace with the rightmost descendant.
            let mut rp = ptr::addr_of_mut!((*x).child[1]);
            r = *rp;
            if r.is_null() {
                rp = ptr::addr_of_mut!((*x).child[0]);
                r = *rp;
            }
            if !r.is_null() {
                loop {
                    let c1 = ptr::addr_of_mut!((*r).child[1]);
                    if !(*c1).is_null() {
                        rp = c1;
                        r = *c1;
                        continue;
                    }
                    let c0 = ptr::addr_of_mut!((*r).child[0]);
                    if !(*c0).is_null() {
                        rp = c0;
                        r = *c0;
                        continue;
                    }
                    break;
                }
                *rp = ptr::null_mut();
            }
        }

        if !xp.is_null() {
            let bin = tree_bin_at(msp, (*x).index);
            if x == *bin {
                *bin = r;
                if r.is_null() {
                    clear_tree_map(msp, (*x).index);
                }
            } else if (*xp).child[0] == x {
                (*xp).child[0] = r;
            } else {
                (*xp).child[1] = r;
            }
            if !r.is_null() {
                (*r).parent = xp;
                let c0 = (*x).child[0];
                if !c0.is_null() {
                    (*r).child[0] = c0;
                    (*c0).parent = r;
                }
                let c1 = (*x).child[1];
                if !c1.is_null() {
                    (*r).child[1] = c1;
                    (*c1).parent = r;
                }
            }
        }
    }
}

#[inline]
unsafe fn insert_chunk(msp: *mut SpaceHeader, p: *mut Chunk, size: usize) {
    // Safety: forwarded.
    unsafe {
        if is_small(size) {
            insert_small_chunk(msp, p, size);
        } else {
            insert_large_chunk(msp, p.cast::<TreeChunk>(), size);
        }
    }
}

#[inline]
unsafe fn unlink_chunk(msp: *mut SpaceHeader, p: *mut Chunk, size: usize) {
    // Safety: forwarded.
    unsafe {
        if is_small(size) {
            unlink_small_chunk(msp, p, size);
        } else {
            unlink_large_chunk(msp, p.cast::<TreeChunk>());
        }
    }
}

/// Install a new designated victim, binning the previous one.
unsafe fn replace_dv(msp: *mut SpaceHeader, p: *mut Chunk, size: usize) {
    // Safety: p is a free chunk of `size` bytes; exclusive access.
    unsafe {
        let dv_size = (*msp).dv_size;
        if dv_size != 0 {
            let dv = (*msp).dv;
            debug_assert!(is_small(dv_size));
            insert_small_chunk(msp, dv, dv_size);
        }
        (*msp).dv_size = size;
        (*msp).dv = p;
    }
}

// ---------------------------------------------------------------------------
// Tree allocation
// ---------------------------------------------------------------------------

/// Best-fit allocation of a small request from the tree bins; the remainder
/// becomes the new dv.
unsafe fn tree_alloc_small(msp: *mut SpaceHeader, nb: usize) -> Option<NonNull<u8>> {
    // Safety: tree_map is non-empty; exclusive access.
    unsafe {
        let index = bit_to_index(least_bit((*msp).tree_map));
        let first = *tree_bin_at(msp, index);
        let mut v = first;
        let mut rsize = chunk_size(first.cast::<Chunk>()) - nb;

        let mut t = first;
        loop {
            t = leftmost_child(t);
            if t.is_null() {
                break;
            }
            let trem = chunk_size(t.cast::<Chunk>()).wrapping_sub(nb);
            if trem < rsize {
                rsize = trem;
                v = t;
            }
        }

        unlink_large_chunk(msp, v);
        let p = v.cast::<Chunk>();
        debug_assert_eq!(chunk_size(p), rsize + nb);
        if rsize < MIN_CHUNK_SIZE {
            set_inuse_and_pinuse(msp, p, rsize + nb);
        } else {
            set_size_and_pinuse_of_inuse_chunk(msp, p, nb);
            let r = chunk_plus_offset(p, nb);
            set_size_and_pinuse_of_free_chunk(r, rsize);
            replace_dv(msp, r, rsize);
        }
        NonNull::new(chunk_to_mem(p))
    }
}

/// Best-fit allocation of a large request.  Returns `None` either when no
/// tree chunk fits or when dv would leave a smaller remainder (the caller
/// then serves the request from dv).
unsafe fn tree_alloc_large(msp: *mut SpaceHeader, nb: usize) -> Option<NonNull<u8>> {
    // Safety: exclusive access.
    unsafe {
        let mut v: *mut TreeChunk = ptr::null_mut();
        let mut rsize = nb.wrapping_neg();
        let index = tree_bin_index(nb);

        let mut t = *tree_bin_at(msp, index);
        if !t.is_null() {
            // Walk down the tree along the MSB-first size-bit path, tracking
            // the smallest remainder and the deepest untaken right subtree.
            let mut size_bits = nb << leftshift_for_tree_index(index);
            let mut rst: *mut TreeChunk = ptr::null_mut();
            loop {
                let trem = chunk_size(t.cast::<Chunk>()).wrapping_sub(nb);
                if trem < rsize {
                    v = t;
                    rsize = trem;
                    if trem == 0 {
                        break;
                    }
                }
                let rt = (*t).child[1];
                t = (*t).child[(size_bits >> (usize::BITS - 1)) & 1];
                if !rt.is_null() && rt != t {
                    rst = rt;
                }
                if t.is_null() {
                    t = rst;
                    break;
                }
                size_bits <<= 1;
            }
        }

        if t.is_null() && v.is_null() {
            // Jump to the smallest non-empty tree bin above this one.
            let leftbits = left_bits(index_to_bit(index)) & (*msp).tree_map;
            if leftbits != 0 {
                t = *tree_bin_at(msp, bit_to_index(least_bit(leftbits)));
            }
        }

        // Descend to the smallest chunk in the chosen subtree.
        while !t.is_null() {
            let trem = chunk_size(t.cast::<Chunk>()).wrapping_sub(nb);
            if trem < rsize {
                rsize = trem;
                v = t;
            }
            t = leftmost_child(t);
        }

        // Prefer dv when it would leave a smaller remainder.
        if !v.is_null() && rsize < (*msp).dv_size.wrapping_sub(nb) {
            unlink_large_chunk(msp, v);
            let p = v.cast::<Chunk>();
            debug_assert_eq!(chunk_size(p), rsize + nb);
            if rsize < MIN_CHUNK_SIZE {
                set_inuse_and_pinuse(msp, p, rsize + nb);
            } else {
                set_size_and_pinuse_of_inuse_chunk(msp, p, nb);
                let r = chunk_plus_offset(p, nb);
                set_size_and_pinuse_of_free_chunk(r, rsize);
                insert_chunk(msp, r, rsize);
            }
            return NonNull::new(chunk_to_mem(p));
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Page commit bookkeeping
// ---------------------------------------------------------------------------

/// Grow the committed prefix until it covers addresses below `end_addr`.
unsafe fn ensure_committed_through(msp: *mut SpaceHeader, end_addr: usize) -> bool {
    // Safety: exclusive access; commits stay within the reservation.
    unsafe {
        let least = (*msp).least_addr as usize;
        let page = (*msp).page_size;
        loop {
            let committed_end = least + (*msp).curr_page_index * page;
            if end_addr <= committed_end {
                return true;
            }
            if committed_end >= least + (*msp).footprint {
                return false;
            }
            let page_ptr = NonNull::new_unchecked(committed_end as *mut u8);
            if PlatformVmOps::commit(page_ptr, page).is_err() {
                return false;
            }
            (*msp).curr_page_index += 1;
            stats::TOTAL_COMMITTED.add(page);
            stats::GENERAL_ALLOCATOR_COMMITTED.add(page);
        }
    }
}

/// Split `nb` bytes off the low end of top, committing pages the new top
/// header needs.
unsafe fn split_top(msp: *mut SpaceHeader, nb: usize) -> Option<NonNull<u8>> {
    // Safety: exclusive access; caller checked nb + MIN_CHUNK_SIZE <= top_size.
    unsafe {
        debug_assert!(nb + MIN_CHUNK_SIZE <= (*msp).top_size);
        let p = (*msp).top;
        let r = chunk_plus_offset(p, nb);
        if !ensure_committed_through(msp, r as usize + CHUNK_OVERHEAD) {
            return None;
        }
        (*msp).top = r;
        (*msp).top_size -= nb;
        (*r).head = (*msp).top_size | PINUSE;
        set_size_and_pinuse_of_inuse_chunk(msp, p, nb);
        NonNull::new(chunk_to_mem(p))
    }
}

/// Extend the segment in place with a hinted reservation at its end, then
/// split top.  The single hinted attempt is a layout optimisation; refusal
/// escalates to a standalone region.
unsafe fn grow_segment_and_split(msp: *mut SpaceHeader, nb: usize) -> Option<NonNull<u8>> {
    // Safety: exclusive access.
    unsafe {
        let page = (*msp).page_size;
        let grow = align_up(nb + MIN_CHUNK_SIZE, page);
        let hint = NonNull::new_unchecked((*msp).least_addr.add((*msp).footprint));
        PlatformVmOps::reserve(grow, Some(hint)).ok()?;
        stats::TOTAL_RESERVED.add(grow);
        log::trace!("space: grew segment at {:p} by {grow} bytes", hint.as_ptr());

        (*msp).footprint += grow;
        if (*msp).footprint > (*msp).max_footprint {
            (*msp).max_footprint = (*msp).footprint;
        }
        (*msp).top_size += grow;
        (*(*msp).top).head = (*msp).top_size | PINUSE;
        split_top(msp, nb)
    }
}

/// Reserve and commit a standalone region straight from the OS.  The
/// trailing footer is null, marking the chunk as unowned on free, and the
/// chunk's own `prev_foot` records its distance from the mapping base so
/// the release can recover the full mapping.  The chunk is placed so that
/// `(user + offset) % alignment == 0`; these regions are returned whole and
/// are never carved.
unsafe fn alloc_direct(bytes: usize, alignment: usize, offset: usize) -> Option<NonNull<u8>> {
    // Safety: fresh mapping.
    unsafe {
        let slack = if alignment > ALIGNMENT { alignment } else { 0 };
        let total = pad_request(bytes + CHUNK_OVERHEAD + slack);
        let base = PlatformVmOps::reserve_commit(total).ok()?;
        stats::TOTAL_RESERVED.add(total);
        stats::TOTAL_COMMITTED.add(total);
        stats::GENERAL_ALLOCATOR_COMMITTED.add(total);
        log::debug!("space: direct OS region of {total} bytes at {:p}", base.as_ptr());

        let user = if alignment <= ALIGNMENT {
            base.as_ptr() as usize + CHUNK_OVERHEAD
        } else {
            align_up(
                base.as_ptr() as usize + CHUNK_OVERHEAD + offset,
                alignment,
            ) - offset
        };
        let p = (user - CHUNK_OVERHEAD) as *mut Chunk;
        let front = p as usize - base.as_ptr() as usize;
        let psize = total - front - CHUNK_OVERHEAD;
        (*p).prev_foot = front;
        (*p).head = psize | PINUSE | CINUSE;
        // The trailing fake chunk: a null owner slot marking the region as
        // standalone, with flag bits keeping the integrity checks honest.
        let foot = chunk_plus_offset(p, psize);
        (*foot).prev_foot = 0;
        (*foot).head = PINUSE | CINUSE;
        NonNull::new(chunk_to_mem(p))
    }
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

unsafe fn alloc_impl(msp: *mut SpaceHeader, bytes: usize) -> Option<NonNull<u8>> {
    // Safety: forwarded.
    unsafe { alloc_with_direct_placement(msp, bytes, ALIGNMENT, 0) }
}

/// The main allocation path.  `direct_alignment`/`direct_offset` shape only
/// a standalone OS region, should the request end up there; pooled chunks
/// always come back 8-aligned and are carved by the aligned wrapper.
unsafe fn alloc_with_direct_placement(
    msp: *mut SpaceHeader,
    bytes: usize,
    direct_alignment: usize,
    direct_offset: usize,
) -> Option<NonNull<u8>> {
    // Safety: exclusive access to a live header.
    unsafe {
        let nb: usize;
        if bytes <= MAX_SMALL_REQUEST {
            nb = request_to_size(bytes);
            let index = small_bin_index(nb);
            let smallbits = (*msp).small_map >> index;

            if smallbits & 0b11 != 0 {
                // Remainderless fit in the exact or the next bin.
                let i = index + (!smallbits & 1);
                let bin = small_bin_at(msp, i);
                let p = (*bin).fd;
                debug_assert_eq!(chunk_size(p), small_index_to_size(i));
                unlink_first_small_chunk(msp, p, i);
                set_inuse_and_pinuse(msp, p, small_index_to_size(i));
                let mem = chunk_to_mem(p);
                check_alloced_chunk(mem, nb);
                return NonNull::new(mem);
            }

            if nb > (*msp).dv_size {
                if smallbits != 0 {
                    // Split a chunk from the next non-empty small bin.
                    let leftbits = (smallbits << index) & left_bits(index_to_bit(index));
                    let i = bit_to_index(least_bit(leftbits));
                    let bin = small_bin_at(msp, i);
                    let p = (*bin).fd;
                    debug_assert_eq!(chunk_size(p), small_index_to_size(i));
                    unlink_first_small_chunk(msp, p, i);
                    let rsize = small_index_to_size(i) - nb;
                    if rsize < MIN_CHUNK_SIZE {
                        set_inuse_and_pinuse(msp, p, small_index_to_size(i));
                    } else {
                        set_size_and_pinuse_of_inuse_chunk(msp, p, nb);
                        let r = chunk_plus_offset(p, nb);
                        set_size_and_pinuse_of_free_chunk(r, rsize);
                        replace_dv(msp, r, rsize);
                    }
                    let mem = chunk_to_mem(p);
                    check_alloced_chunk(mem, nb);
                    return NonNull::new(mem);
                }
                if (*msp).tree_map != 0 {
                    if let Some(mem) = tree_alloc_small(msp, nb) {
                        check_alloced_chunk(mem.as_ptr(), nb);
                        return Some(mem);
                    }
                }
            }
        } else if bytes >= MAX_REQUEST {
            return None;
        } else {
            nb = pad_request(bytes);
            if (*msp).tree_map != 0 {
                if let Some(mem) = tree_alloc_large(msp, nb) {
                    check_alloced_chunk(mem.as_ptr(), nb);
                    return Some(mem);
                }
            }
        }

        // Designated victim.
        if nb <= (*msp).dv_size {
            let rsize = (*msp).dv_size - nb;
            let p = (*msp).dv;
            if rsize >= MIN_CHUNK_SIZE {
                // Split dv.
                let r = chunk_plus_offset(p, nb);
                (*msp).dv = r;
                (*msp).dv_size = rsize;
                set_size_and_pinuse_of_free_chunk(r, rsize);
                set_size_and_pinuse_of_inuse_chunk(msp, p, nb);
            } else {
                // Exhaust dv.
                let dv_size = (*msp).dv_size;
                (*msp).dv_size = 0;
                (*msp).dv = ptr::null_mut();
                set_inuse_and_pinuse(msp, p, dv_size);
            }
            let mem = chunk_to_mem(p);
            check_alloced_chunk(mem, nb);
            return NonNull::new(mem);
        }

        // Top.
        if nb + MIN_CHUNK_SIZE <= (*msp).top_size {
            let mem = split_top(msp, nb);
            if let Some(m) = mem {
                check_alloced_chunk(m.as_ptr(), nb);
                return mem;
            }
        }

        // Grow the segment in place, page-granular, at its current end.
        if bytes < (*msp).segment_threshold {
            if let Some(mem) = grow_segment_and_split(msp, nb) {
                check_alloced_chunk(mem.as_ptr(), nb);
                return Some(mem);
            }
        }

        // Serve the request as a standalone region.
        alloc_direct(bytes, direct_alignment, direct_offset)
    }
}

unsafe fn alloc_aligned_impl(
    msp: *mut SpaceHeader,
    alignment: usize,
    bytes: usize,
    offset: usize,
) -> Option<NonNull<u8>> {
    // Safety: exclusive access.
    unsafe {
        if alignment <= ALIGNMENT {
            return alloc_impl(msp, bytes);
        }
        let mut alignment = alignment.max(MIN_CHUNK_SIZE);
        if !alignment.is_power_of_two() {
            debug_assert!(false, "alignment {alignment} is not a power of two");
            let mut a = ALIGNMENT << 1;
            while a < alignment {
                a <<= 1;
            }
            alignment = a;
        }
        debug_assert!(offset % ALIGNMENT == 0, "offset {offset} is not 8-aligned");

        if bytes >= MAX_REQUEST - alignment {
            log::error!("space: aligned request of {bytes} bytes exceeds the maximum");
            return None;
        }

        let nb = request_to_size(bytes);
        let req = nb + alignment + offset + MIN_CHUNK_SIZE - CHUNK_OVERHEAD;
        let mem = alloc_with_direct_placement(msp, req, alignment, offset)?.as_ptr();

        // A standalone region was already placed for this alignment and
        // must be returned whole; only pooled chunks get carved.
        if owner_from_footer(mem) == 0 {
            debug_assert_eq!((mem as usize + offset) % alignment, 0);
            return NonNull::new(mem);
        }

        let mut p = mem_to_chunk(mem);
        let mut leader: *mut u8 = ptr::null_mut();

        if (mem as usize + offset) % alignment != 0 {
            // Find an aligned point inside the chunk.  The leading chunk
            // handed back must itself be at least MIN_CHUNK_SIZE, so when
            // the first aligned spot is too close we take the next one; the
            // request above left enough room for that.
            let aligned_user = (mem as usize + offset + alignment - 1) & alignment.wrapping_neg();
            let candidate = (aligned_user as *mut u8).sub(CHUNK_OVERHEAD + offset);
            let pos = if candidate as usize - p as usize >= MIN_CHUNK_SIZE {
                candidate
            } else {
                candidate.add(alignment)
            };

            let new_p = pos.cast::<Chunk>();
            let lead_size = pos as usize - p as usize;
            let new_size = chunk_size(p) - lead_size;

            set_inuse(msp, new_p, new_size);
            set_inuse(msp, p, lead_size);
            leader = chunk_to_mem(p);
            p = new_p;
        }

        // Give back spare room past the payload.
        let size = chunk_size(p);
        let mut trailer: *mut u8 = ptr::null_mut();
        if size > nb + MIN_CHUNK_SIZE {
            let rsize = size - nb;
            let r = chunk_plus_offset(p, nb);
            set_inuse(msp, p, nb);
            set_inuse(msp, r, rsize);
            trailer = chunk_to_mem(r);
        }

        debug_assert!(chunk_size(p) >= nb);
        debug_assert_eq!((chunk_to_mem(p) as usize + offset) % alignment, 0);

        if !leader.is_null() {
            free_impl(msp, leader);
        }
        if !trailer.is_null() {
            free_impl(msp, trailer);
        }

        NonNull::new(chunk_to_mem(p))
    }
}

// ---------------------------------------------------------------------------
// Free
// ---------------------------------------------------------------------------

unsafe fn free_impl(msp: *mut SpaceHeader, mem: *mut u8) -> bool {
    // Safety: exclusive access; mem is a live allocation of this space.
    unsafe {
        if mem.is_null() {
            return false;
        }
        let mut p = mem_to_chunk(mem);
        check_inuse_chunk(msp, p);
        if !is_inuse(p) {
            debug_assert!(false, "freeing a chunk that is not in use: {p:p}");
            return false;
        }

        // A chunk outside the segment window can only be a standalone OS
        // region that was re-dispatched here; hand it straight back to the
        // OS.  Anything else is a foreign pointer.
        let least = (*msp).least_addr;
        let addr = p.cast::<u8>();
        if addr < least || addr > least.add((*msp).footprint) {
            if owner_from_footer(mem) == 0 {
                release_direct(mem);
            } else {
                log::error!("space: free of foreign pointer {mem:p}");
                debug_assert!(false, "free of foreign pointer {mem:p}");
            }
            return false;
        }

        let mut psize = chunk_size(p);
        let next = chunk_plus_offset(p, psize);

        // Consolidate backwards.
        if !pinuse(p) {
            let prev_size = (*p).prev_foot;
            let prev = chunk_minus_offset(p, prev_size);
            psize += prev_size;
            p = prev;
            if p != (*msp).dv {
                unlink_chunk(msp, p, prev_size);
            } else if ((*next).head & INUSE_BITS) == INUSE_BITS {
                // Merged into dv with the successor still in use.
                (*msp).dv_size = psize;
                set_free_with_pinuse(p, psize, next);
                return false;
            }
        }

        if !pinuse(next) {
            debug_assert!(false, "corrupt heap: successor lost its PINUSE bit");
            return false;
        }

        if !cinuse(next) {
            // Consolidate forwards.
            if next == (*msp).top {
                return free_into_top(msp, p, psize);
            }
            if next == (*msp).dv {
                let dsize = (*msp).dv_size + psize;
                (*msp).dv_size = dsize;
                (*msp).dv = p;
                set_size_and_pinuse_of_free_chunk(p, dsize);
                return false;
            }
            let next_size = chunk_size(next);
            psize += next_size;
            unlink_chunk(msp, next, next_size);
            set_size_and_pinuse_of_free_chunk(p, psize);
            if p == (*msp).dv {
                (*msp).dv_size = psize;
                return false;
            }
        } else {
            set_free_with_pinuse(p, psize, next);
        }

        insert_chunk(msp, p, psize);
        check_free_chunk(msp, p);
        false
    }
}

/// Merge a freed run into top, retreating the committed prefix and the
/// segment itself where possible.  Returns `true` when the whole segment has
/// become top.
unsafe fn free_into_top(msp: *mut SpaceHeader, p: *mut Chunk, psize: usize) -> bool {
    // Safety: exclusive access; p is adjacent below top.
    unsafe {
        let mut tsize = (*msp).top_size + psize;
        (*msp).top_size = tsize;
        (*msp).top = p;
        (*p).head = tsize | PINUSE;
        if p == (*msp).dv {
            (*msp).dv = ptr::null_mut();
            (*msp).dv_size = 0;
        }

        let least = (*msp).least_addr;
        let page = (*msp).page_size;

        // Decommit a single trailing page when top has retreated below the
        // previous page boundary; never on every small free.
        if (*msp).curr_page_index > 1 {
            let boundary = least.add(((*msp).curr_page_index - 1) * page);
            if p.cast::<u8>().add(CHUNK_OVERHEAD) <= boundary {
                let page_ptr = NonNull::new_unchecked(boundary);
                if PlatformVmOps::decommit(page_ptr, page).is_ok() {
                    (*msp).curr_page_index -= 1;
                    stats::TOTAL_COMMITTED.sub(page);
                    stats::GENERAL_ALLOCATOR_COMMITTED.sub(page);
                }
            }
        }

        // Release whole trailing granules beyond one segment_granularity.
        let gran = (*msp).segment_granularity;
        if tsize > gran {
            let releasable = (tsize - gran) & !(gran - 1);
            if releasable > 0 {
                let new_footprint = (*msp).footprint - releasable;
                let rel_base = NonNull::new_unchecked(least.add(new_footprint));
                if PlatformVmOps::release(rel_base, releasable).is_ok() {
                    let committed_end = (*msp).curr_page_index * page;
                    if committed_end > new_footprint {
                        let overlap = committed_end - new_footprint;
                        stats::TOTAL_COMMITTED.sub(overlap);
                        stats::GENERAL_ALLOCATOR_COMMITTED.sub(overlap);
                        (*msp).curr_page_index = new_footprint / page;
                    }
                    stats::TOTAL_RESERVED.sub(releasable);
                    (*msp).footprint = new_footprint;
                    tsize -= releasable;
                    (*msp).top_size = tsize;
                    (*p).head = tsize | PINUSE;
                    log::trace!("space: released {releasable} trailing bytes at {:p}", least);
                }
            }
        }

        // The segment is empty when the chunk right after the header is top.
        let first = next_chunk(mem_to_chunk(msp.cast::<u8>()));
        first == (*msp).top
    }
}

// ---------------------------------------------------------------------------
// Debug integrity checks
// ---------------------------------------------------------------------------

#[cfg(debug_assertions)]
unsafe fn check_inuse_chunk(msp: *mut SpaceHeader, p: *mut Chunk) {
    // Safety: exclusive access.
    unsafe {
        let _ = msp;
        debug_assert!(is_aligned(chunk_to_mem(p) as usize), "chunk is not aligned");
        debug_assert!(is_inuse(p), "CINUSE bit is not set for this chunk");
        debug_assert!(
            pinuse(next_chunk(p)),
            "PINUSE bit of next chunk is not set"
        );
        debug_assert!(
            pinuse(p) || next_chunk(prev_chunk(p)) == p,
            "previous chunk offset is not correct"
        );
    }
}

#[cfg(not(debug_assertions))]
unsafe fn check_inuse_chunk(_msp: *mut SpaceHeader, _p: *mut Chunk) {}

#[cfg(debug_assertions)]
unsafe fn check_free_chunk(msp: *mut SpaceHeader, p: *mut Chunk) {
    // Safety: exclusive access.
    unsafe {
        let size = chunk_size(p);
        let next = chunk_plus_offset(p, size);
        debug_assert!(is_aligned(p as usize), "free chunk is not aligned");
        debug_assert!(!is_inuse(p), "CINUSE bit is set for a free chunk");
        debug_assert!(!pinuse(next), "PINUSE set on the chunk after a free chunk");
        if p != (*msp).dv && p != (*msp).top {
            debug_assert!(size >= MIN_CHUNK_SIZE);
            debug_assert!(size & ALIGN_MASK == 0, "free chunk size is not aligned");
            debug_assert_eq!(
                (*next).prev_foot,
                size,
                "prev_foot of successor disagrees with free chunk size"
            );
            debug_assert!(pinuse(p), "free chunk follows another free chunk");
            debug_assert!(
                next == (*msp).top || is_inuse(next),
                "two consecutive free chunks"
            );
            debug_assert_eq!((*(*p).fd).bk, p, "fd/bk pointer error");
            debug_assert_eq!((*(*p).bk).fd, p, "fd/bk pointer error");
        }
    }
}

#[cfg(not(debug_assertions))]
unsafe fn check_free_chunk(_msp: *mut SpaceHeader, _p: *mut Chunk) {}

#[cfg(debug_assertions)]
unsafe fn check_alloced_chunk(mem: *mut u8, nb: usize) {
    // Safety: exclusive access.
    unsafe {
        if mem.is_null() {
            return;
        }
        let p = mem_to_chunk(mem);
        let size = chunk_size(p);
        debug_assert!(is_aligned(mem as usize), "returned memory is not aligned");
        debug_assert!(size & ALIGN_MASK == 0, "chunk size is not aligned");
        debug_assert!(size >= MIN_CHUNK_SIZE);
        debug_assert!(size >= nb, "chunk smaller than the padded request");
    }
}

#[cfg(not(debug_assertions))]
unsafe fn check_alloced_chunk(_mem: *mut u8, _nb: usize) {}

/// Walk the chunk list from the first allocatable chunk to top.
#[cfg(any(test, debug_assertions))]
unsafe fn walk_chunks(msp: *mut SpaceHeader) -> (usize, usize) {
    // Safety: exclusive access.
    unsafe {
        let mut in_use = 0usize;
        let mut free = 0usize;
        let mut prev_free = false;
        let mut p = next_chunk(mem_to_chunk(msp.cast::<u8>()));
        let least = (*msp).least_addr;
        let end = least.add((*msp).footprint);
        while (p.cast::<u8>()) >= least && (p.cast::<u8>()) < end && p != (*msp).top {
            if is_inuse(p) {
                debug_assert_eq!(
                    (*next_chunk(p)).prev_foot,
                    msp as usize,
                    "in-use footer does not point at the owning space"
                );
                in_use += 1;
                prev_free = false;
            } else {
                assert!(!prev_free, "two adjacent free chunks at {p:p}");
                free += 1;
                prev_free = true;
            }
            p = next_chunk(p);
        }
        (in_use, free)
    }
}

#[cfg(debug_assertions)]
unsafe fn check_tree(msp: *mut SpaceHeader, t: *mut TreeChunk) {
    // Safety: exclusive access.
    unsafe {
        let tindex = (*t).index;
        let tsize = chunk_size(t.cast::<Chunk>());
        let index = tree_bin_index(tsize);
        debug_assert_eq!(tindex, index, "tree chunk filed under the wrong index");
        debug_assert!(tsize >= MIN_LARGE_SIZE);
        debug_assert!(tsize >= min_size_for_tree_index(index));
        debug_assert!(
            index == NUM_TREE_BINS - 1 || tsize < min_size_for_tree_index(index + 1)
        );

        let mut head: *mut TreeChunk = ptr::null_mut();
        let mut u = t;
        loop {
            debug_assert!(is_aligned(chunk_to_mem(u.cast::<Chunk>()) as usize));
            debug_assert_eq!((*u).index, tindex);
            debug_assert_eq!(chunk_size(u.cast::<Chunk>()), tsize);
            debug_assert!(!is_inuse(u.cast::<Chunk>()));
            debug_assert!(!pinuse(next_chunk(u.cast::<Chunk>())));
            debug_assert_eq!((*(*u).chunk.fd).bk, u.cast::<Chunk>());
            debug_assert_eq!((*(*u).chunk.bk).fd, u.cast::<Chunk>());
            if (*u).parent.is_null() {
                debug_assert!((*u).child[0].is_null(), "chained node has a child");
                debug_assert!((*u).child[1].is_null(), "chained node has a child");
            } else {
                debug_assert!(head.is_null(), "two tree-resident nodes in one ring");
                head = u;
                debug_assert!((*u).parent != u, "node is its own parent");
                debug_assert!(
                    (*(*u).parent).child[0] == u
                        || (*(*u).parent).child[1] == u
                        || *((*u).parent.cast::<*mut TreeChunk>()) == u,
                    "parent does not refer back to this node"
                );
                for side in 0..2 {
                    let c = (*u).child[side];
                    if !c.is_null() {
                        debug_assert_eq!((*c).parent, u);
                        debug_assert!(c != u, "node is its own child");
                        check_tree(msp, c);
                    }
                }
                if !(*u).child[0].is_null() && !(*u).child[1].is_null() {
                    debug_assert!(
                        chunk_size((*u).child[0].cast::<Chunk>())
                            < chunk_size((*u).child[1].cast::<Chunk>()),
                        "left child is not smaller than right child"
                    );
                }
            }
            u = (*u).chunk.fd.cast::<TreeChunk>();
            if u == t {
                break;
            }
        }
        debug_assert!(!head.is_null(), "ring without a tree-resident node");
    }
}

#[cfg(debug_assertions)]
unsafe fn validate_space(msp: *mut SpaceHeader) {
    // Safety: exclusive access.
    unsafe {
        // Small bins: rings of exact-size free chunks, map bit agreement.
        for i in 0..NUM_SMALL_BINS {
            let bin = small_bin_at(msp, i);
            let empty = !small_map_marked(msp, i);
            let mut p = (*bin).bk;
            debug_assert!(p != bin || empty, "small_map bit disagrees with bin");
            while p != bin {
                debug_assert_eq!(small_bin_index(chunk_size(p)), i);
                check_free_chunk(msp, p);
                p = (*p).bk;
            }
        }
        // Tree bins.
        for i in 0..NUM_TREE_BINS {
            let t = *tree_bin_at(msp, i);
            let empty = !tree_map_marked(msp, i);
            debug_assert!(!t.is_null() || empty, "tree_map bit disagrees with bin");
            if !t.is_null() {
                check_tree(msp, t);
            }
        }
        // dv is never binned and matches its recorded size.
        if (*msp).dv_size != 0 {
            let dv = (*msp).dv;
            debug_assert!(is_aligned(chunk_to_mem(dv) as usize));
            debug_assert_eq!((*msp).dv_size, chunk_size(dv));
            debug_assert!((*msp).dv_size >= MIN_CHUNK_SIZE);
        }
        // top is aligned, sized consistently and ends at the footprint.
        if (*msp).top_size != 0 {
            let top = (*msp).top;
            debug_assert!(is_aligned(chunk_to_mem(top) as usize));
            debug_assert_eq!(chunk_size(top), (*msp).top_size);
            debug_assert!(pinuse(top), "PINUSE of top is not set");
            debug_assert_eq!(
                top.cast::<u8>() as usize + (*msp).top_size,
                (*msp).least_addr as usize + (*msp).footprint,
                "top does not end at the footprint"
            );
        }
        let _ = walk_chunks(msp);
    }
}
