//! Arena allocation, reference counting, and free dispatch.
//!
//! An arena is a raw byte region described by a [`SharedInfo`] record: an
//! optional free callback, opaque user data for that callback, and an atomic
//! reference count. Self-allocated arenas co-locate the `SharedInfo` at the
//! front of the data block (one allocation); take-ownership arenas box it
//! separately; user-owned arenas have none at all.
//!
//! Combined allocations place the descriptor, the `SharedInfo`, and the data
//! region in a single block. Such a block has two independent claimants (the
//! descriptor and the arena refcount), so it is released through a two-flag
//! protocol: whichever claim is dropped last deallocates the block.

use super::{BufKind, Node, FLAG_COMBINED};
use crate::Error;
use std::{
    alloc::{alloc, alloc_zeroed, dealloc, Layout},
    mem::{align_of, offset_of, size_of},
    ptr::{self, addr_of_mut, NonNull},
    sync::atomic::{AtomicU32, AtomicU8, Ordering},
};

/// Free callback invoked exactly once when an arena's reference count
/// reaches zero.
///
/// Called with the arena base pointer and the user data registered at
/// creation. The callback must not panic: it runs during drops, where a
/// panic aborts the process.
pub type FreeFn = unsafe fn(buf: *mut u8, user_data: *mut ());

/// Shared arena metadata.
///
/// Lives either at the front of a self-allocated data block
/// (`co_located == true`), boxed on its own (take-ownership arenas), or
/// inside a [`CombinedStorage`] block.
pub(crate) struct SharedInfo {
    pub(crate) free_fn: Option<FreeFn>,
    pub(crate) user_data: *mut (),
    pub(crate) refcount: AtomicU32,
    /// Whether this record sits at the head of the data block it describes.
    co_located: bool,
}

impl SharedInfo {
    /// Register one more descriptor aliasing the arena.
    #[inline]
    pub(crate) fn incref(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one aliasing descriptor. Returns true if this was the last
    /// reference; the caller must then free the arena exactly once.
    ///
    /// Acquire-release so the freeing thread observes every prior write to
    /// the arena bytes and metadata.
    #[inline]
    pub(crate) fn decref(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// A freshly allocated self-managed arena: `[SharedInfo | data]`.
pub(crate) struct ArenaAlloc {
    pub(crate) info: NonNull<SharedInfo>,
    pub(crate) buf: NonNull<u8>,
    pub(crate) capacity: u32,
}

/// Round a requested allocation size up to an allocator-friendly size.
///
/// Small requests round to the next power of two (with a 64-byte floor);
/// requests past a page round to a page multiple.
pub(crate) fn good_size(min: usize) -> Result<usize, Error> {
    const PAGE: usize = 4096;
    if min <= 64 {
        return Ok(64);
    }
    if min <= PAGE {
        return Ok(min.next_power_of_two());
    }
    let rounded = min.checked_add(PAGE - 1).ok_or(Error::Overflow)? / PAGE * PAGE;
    Ok(rounded)
}

/// Layout of a co-located `[SharedInfo | data]` block with `capacity` data
/// bytes.
fn co_located_layout(capacity: u32) -> Layout {
    Layout::from_size_align(
        size_of::<SharedInfo>() + capacity as usize,
        align_of::<SharedInfo>(),
    )
    .expect("arena layout was valid at allocation")
}

/// Allocate a zeroed arena of at least `min_capacity` data bytes, with its
/// `SharedInfo` co-located at the front of the block and a refcount of one.
pub(crate) fn alloc_arena(min_capacity: usize) -> Result<ArenaAlloc, Error> {
    let header = size_of::<SharedInfo>();
    let total = good_size(header.checked_add(min_capacity).ok_or(Error::Overflow)?)?;
    let capacity = total - header;
    if capacity > u32::MAX as usize {
        return Err(Error::Overflow);
    }
    let layout =
        Layout::from_size_align(total, align_of::<SharedInfo>()).map_err(|_| Error::Overflow)?;
    // SAFETY: the layout has non-zero size (the header alone is non-empty).
    let block = unsafe { alloc_zeroed(layout) };
    let Some(block) = NonNull::new(block) else {
        return Err(Error::OutOfMemory);
    };
    let info = block.cast::<SharedInfo>();
    // SAFETY: the block is valid for a SharedInfo write at its base.
    unsafe {
        info.as_ptr().write(SharedInfo {
            free_fn: None,
            user_data: ptr::null_mut(),
            refcount: AtomicU32::new(1),
            co_located: true,
        });
    }
    // SAFETY: header < total, so the data region starts inside the block.
    let buf = unsafe { NonNull::new_unchecked(block.as_ptr().add(header)) };
    Ok(ArenaAlloc {
        info,
        buf,
        capacity: capacity as u32,
    })
}

/// Free an arena whose reference count has reached zero.
///
/// `buf` and `capacity` are the releasing descriptor's cached copies of the
/// arena fields. `free_boxed_info` reflects the descriptor's
/// `FLAG_FREE_SHARED_INFO`: the `SharedInfo` was boxed separately and must
/// be dropped after the data region is released.
pub(crate) unsafe fn free_arena(
    info: *mut SharedInfo,
    buf: *mut u8,
    capacity: u32,
    free_boxed_info: bool,
) {
    if let Some(free_fn) = (*info).free_fn {
        free_fn(buf, (*info).user_data);
    } else if (*info).co_located {
        dealloc(info as *mut u8, co_located_layout(capacity));
    } else {
        // Take-ownership arena with no callback: the region came from the
        // system allocator.
        libc::free(buf as *mut libc::c_void);
    }
    if free_boxed_info {
        dealloc_shared_info(info);
    }
}

/// Allocate (uninitialized) space for one descriptor node.
pub(crate) fn alloc_node() -> Result<NonNull<Node>, Error> {
    // SAFETY: Node has non-zero size.
    let ptr = unsafe { alloc(Layout::new::<Node>()) };
    NonNull::new(ptr.cast::<Node>()).ok_or(Error::OutOfMemory)
}

/// Release a separately allocated descriptor node.
pub(crate) unsafe fn dealloc_node(node: NonNull<Node>) {
    dealloc(node.as_ptr().cast::<u8>(), Layout::new::<Node>());
}

/// Allocate a separately boxed `SharedInfo` (take-ownership arenas).
pub(crate) fn alloc_shared_info(
    free_fn: Option<FreeFn>,
    user_data: *mut (),
) -> Result<NonNull<SharedInfo>, Error> {
    // SAFETY: SharedInfo has non-zero size.
    let ptr = unsafe { alloc(Layout::new::<SharedInfo>()) };
    let Some(info) = NonNull::new(ptr.cast::<SharedInfo>()) else {
        return Err(Error::OutOfMemory);
    };
    // SAFETY: the allocation is valid for a SharedInfo write.
    unsafe {
        info.as_ptr().write(SharedInfo {
            free_fn,
            user_data,
            refcount: AtomicU32::new(1),
            co_located: false,
        });
    }
    Ok(info)
}

/// Release a separately boxed `SharedInfo`.
pub(crate) unsafe fn dealloc_shared_info(info: *mut SharedInfo) {
    dealloc(info.cast::<u8>(), Layout::new::<SharedInfo>());
}

/// Storage claim: the descriptor is still alive.
const STORAGE_NODE: u8 = 1 << 0;
/// Storage claim: the arena refcount has not reached zero.
const STORAGE_ARENA: u8 = 1 << 1;

/// A combined allocation: descriptor, arena metadata, and data region in one
/// block, laid out as `[flags, alloc_size, Node, SharedInfo | data]`.
#[repr(C)]
pub(crate) struct CombinedStorage {
    /// Outstanding claims on the block ([`STORAGE_NODE`] | [`STORAGE_ARENA`]).
    flags: AtomicU8,
    /// Total block size, kept so the releasing party can rebuild the layout.
    alloc_size: usize,
    node: Node,
    shared: SharedInfo,
}

/// Free trampoline for combined arenas: `user_data` is the storage block.
/// Ignores the buffer pointer; releases the arena's claim on the block.
unsafe fn free_combined(_buf: *mut u8, user_data: *mut ()) {
    release_storage(user_data as *mut CombinedStorage, STORAGE_ARENA);
}

/// Clear one claim bit on a combined block; whoever clears the last bit
/// deallocates. Acquire-release so the deallocating party synchronizes with
/// the other release.
unsafe fn release_storage(storage: *mut CombinedStorage, bit: u8) {
    let prev = (*storage).flags.fetch_and(!bit, Ordering::AcqRel);
    debug_assert_ne!(prev & bit, 0, "storage claim released twice");
    if prev == bit {
        let layout =
            Layout::from_size_align((*storage).alloc_size, align_of::<CombinedStorage>())
                .expect("storage layout was valid at allocation");
        dealloc(storage.cast::<u8>(), layout);
    }
}

/// Drop the descriptor claim on the combined block containing `node`.
pub(crate) unsafe fn release_combined_node(node: NonNull<Node>) {
    let storage = node
        .as_ptr()
        .cast::<u8>()
        .sub(offset_of!(CombinedStorage, node))
        .cast::<CombinedStorage>();
    release_storage(storage, STORAGE_NODE);
}

/// Allocate a combined block with at least `min_capacity` zeroed data bytes
/// and initialize the descriptor as an empty singleton. Returns the node.
pub(crate) fn alloc_combined(min_capacity: usize) -> Result<NonNull<Node>, Error> {
    let header = size_of::<CombinedStorage>();
    let total = good_size(header.checked_add(min_capacity).ok_or(Error::Overflow)?)?;
    let capacity = total - header;
    if capacity > u32::MAX as usize {
        return Err(Error::Overflow);
    }
    let layout = Layout::from_size_align(total, align_of::<CombinedStorage>())
        .map_err(|_| Error::Overflow)?;
    // SAFETY: the layout has non-zero size.
    let block = unsafe { alloc_zeroed(layout) };
    let Some(block) = NonNull::new(block) else {
        return Err(Error::OutOfMemory);
    };
    let storage = block.as_ptr().cast::<CombinedStorage>();
    // SAFETY: field writes stay within the freshly allocated block; the data
    // region starts right after the header and is already zeroed.
    unsafe {
        let buf = block.as_ptr().add(header);
        addr_of_mut!((*storage).flags).write(AtomicU8::new(STORAGE_NODE | STORAGE_ARENA));
        addr_of_mut!((*storage).alloc_size).write(total);
        let shared = addr_of_mut!((*storage).shared);
        shared.write(SharedInfo {
            free_fn: Some(free_combined),
            user_data: storage as *mut (),
            refcount: AtomicU32::new(1),
            co_located: false,
        });
        let node = addr_of_mut!((*storage).node);
        let node_nn = NonNull::new_unchecked(node);
        node.write(Node {
            next: node_nn,
            prev: node_nn,
            data: buf,
            buf,
            length: 0,
            capacity: capacity as u32,
            flags: AtomicU8::new(FLAG_COMBINED),
            kind: BufKind::Combined,
            shared,
        });
        Ok(node_nn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_good_size_rounding() {
        assert_eq!(good_size(0).unwrap(), 64);
        assert_eq!(good_size(1).unwrap(), 64);
        assert_eq!(good_size(64).unwrap(), 64);
        assert_eq!(good_size(65).unwrap(), 128);
        assert_eq!(good_size(4096).unwrap(), 4096);
        assert_eq!(good_size(4097).unwrap(), 8192);
        assert_eq!(good_size(10_000).unwrap(), 12_288);
    }

    #[test]
    fn test_good_size_overflow() {
        assert_eq!(good_size(usize::MAX), Err(Error::Overflow));
    }

    #[test]
    fn test_arena_zeroed_and_counted() {
        let arena = alloc_arena(100).unwrap();
        assert!(arena.capacity as usize >= 100);
        // SAFETY: the data region is capacity bytes, zero-initialized.
        let data = unsafe {
            std::slice::from_raw_parts(arena.buf.as_ptr(), arena.capacity as usize)
        };
        assert!(data.iter().all(|&b| b == 0));
        // SAFETY: info is live until freed below; the refcount is dropped to
        // zero first, as free_arena requires.
        unsafe {
            assert!(arena.info.as_ref().decref());
            free_arena(arena.info.as_ptr(), arena.buf.as_ptr(), arena.capacity, false);
        }
    }

    #[test]
    fn test_shared_info_refcount() {
        let info = alloc_shared_info(None, std::ptr::null_mut()).unwrap();
        // SAFETY: info is live until deallocated below.
        unsafe {
            info.as_ref().incref();
            assert!(!info.as_ref().decref());
            assert!(info.as_ref().decref());
            dealloc_shared_info(info.as_ptr());
        }
    }
}
