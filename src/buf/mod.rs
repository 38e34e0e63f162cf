//! The buffer descriptor and its operations.
//!
//! A [`NetBuf`] owns a circular chain of heap descriptors ("nodes"), each
//! recording a window `[data, data + length)` into a reference-counted
//! arena:
//!
//! ```text
//!  arena:  [..headroom..|...window (length)...|..tailroom..]
//!           ^            ^                     ^            ^
//!           buf          data                  tail         buf + capacity
//! ```
//!
//! The handle always designates the chain head; every other node in the
//! chain is owned transitively and destroyed with it.
//!
//! # Invariants
//!
//! - `buf <= data <= data + length <= buf + capacity` for every node
//! - `next`/`prev` form one circular list: a singleton points at itself
//! - a node's `shared` pointer is null iff its arena is user-owned

mod arena;
mod chain;

pub use arena::FreeFn;
pub use chain::Iter;

use crate::Error;
use arena::{ArenaAlloc, SharedInfo};
use bytes::Bytes;
use std::{
    fmt,
    marker::PhantomData,
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU8, Ordering},
};
use tracing::trace;

/// The arena is user-owned: no refcount, never freed by this crate.
const FLAG_USER_OWNED: u8 = 1 << 0;
/// The `SharedInfo` was boxed separately and is freed with the arena.
const FLAG_FREE_SHARED_INFO: u8 = 1 << 1;
/// Aliasing hint: the arena may be referenced by other descriptors.
/// Set whenever aliasing is created; cleared when the refcount is observed
/// to be one. Conservative: it may lag after aliasing ends.
const FLAG_MAYBE_SHARED: u8 = 1 << 2;
/// The descriptor lives inside a combined block and is released through the
/// two-flag storage protocol.
const FLAG_COMBINED: u8 = 1 << 3;

/// How a buffer's arena is managed.
///
/// Informational: a descriptor re-seated onto a fresh arena by a copying
/// slow path reports [`BufKind::Allocated`] afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufKind {
    /// Self-managed arena allocated by this crate.
    Allocated,
    /// Caller-provided arena freed through a registered callback.
    UserSupplied,
    /// Caller-owned arena this crate never frees; permanently shared.
    UserOwned,
    /// Descriptor and arena share one combined allocation.
    Combined,
}

/// Chain node: the fixed-size descriptor record.
pub(crate) struct Node {
    pub(crate) next: NonNull<Node>,
    pub(crate) prev: NonNull<Node>,
    /// Start of the valid window.
    pub(crate) data: *mut u8,
    /// Cached arena base.
    pub(crate) buf: *mut u8,
    /// Valid bytes from `data`.
    pub(crate) length: u32,
    /// Cached arena capacity.
    pub(crate) capacity: u32,
    /// Flag bits; atomic so `&self` paths may update the aliasing hint.
    pub(crate) flags: AtomicU8,
    pub(crate) kind: BufKind,
    /// Arena metadata; null iff `FLAG_USER_OWNED`.
    pub(crate) shared: *mut SharedInfo,
}

impl Node {
    #[inline]
    fn headroom(&self) -> usize {
        self.data as usize - self.buf as usize
    }

    #[inline]
    fn tailroom(&self) -> usize {
        self.capacity as usize - self.headroom() - self.length as usize
    }

    /// One past the last valid byte.
    #[inline]
    fn tail(&self) -> *mut u8 {
        // SAFETY: the window invariant keeps data + length inside the arena.
        unsafe { self.data.add(self.length as usize) }
    }

    #[inline]
    fn debug_check(&self) {
        debug_assert!(self.buf <= self.data);
        debug_assert!(self.headroom() + self.length as usize <= self.capacity as usize);
    }

    /// Whether other descriptors (or a foreign owner) reference this arena.
    ///
    /// Checks the flag byte first so the unique-owner common case pays no
    /// atomic refcount load. Observing a refcount of one clears the lagging
    /// aliasing hint.
    fn is_shared_one(&self) -> bool {
        let flags = self.flags.load(Ordering::Relaxed);
        if flags & (FLAG_USER_OWNED | FLAG_MAYBE_SHARED) == 0 {
            return false;
        }
        if flags & FLAG_USER_OWNED != 0 {
            return true;
        }
        // SAFETY: every descriptor that is not user-owned holds a live
        // SharedInfo reference.
        let shared = unsafe { (*self.shared).refcount.load(Ordering::Acquire) > 1 };
        if !shared {
            self.flags.fetch_and(!FLAG_MAYBE_SHARED, Ordering::Relaxed);
        }
        shared
    }

    /// Drop this descriptor's arena reference, freeing the arena if it was
    /// the last one. Leaves the descriptor fields untouched.
    unsafe fn release_arena(&mut self) {
        let shared = self.shared;
        if !shared.is_null() && (*shared).decref() {
            arena::free_arena(
                shared,
                self.buf,
                self.capacity,
                self.flags.load(Ordering::Relaxed) & FLAG_FREE_SHARED_INFO != 0,
            );
        }
    }

    /// Re-seat this descriptor on a freshly allocated arena, with the window
    /// placed at `data_offset`. The previous arena reference must already be
    /// released.
    unsafe fn adopt_arena(&mut self, arena: ArenaAlloc, data_offset: usize, length: u32) {
        self.buf = arena.buf.as_ptr();
        self.capacity = arena.capacity;
        self.data = arena.buf.as_ptr().add(data_offset);
        self.length = length;
        self.shared = arena.info.as_ptr();
        self.kind = BufKind::Allocated;
        // The new arena is unique and crate-owned: every flag except the
        // storage bit is stale.
        self.flags.fetch_and(FLAG_COMBINED, Ordering::Relaxed);
        self.debug_check();
    }
}

/// Destroy one node: release its arena reference, then its descriptor
/// storage. The node must already be unlinked or owned by the caller.
pub(crate) unsafe fn destroy_node(node: NonNull<Node>) {
    let n = node.as_ptr();
    let shared = (*n).shared;
    if !shared.is_null() && (*shared).decref() {
        arena::free_arena(
            shared,
            (*n).buf,
            (*n).capacity,
            (*n).flags.load(Ordering::Relaxed) & FLAG_FREE_SHARED_INFO != 0,
        );
    }
    if (*n).flags.load(Ordering::Relaxed) & FLAG_COMBINED != 0 {
        arena::release_combined_node(node);
    } else {
        arena::dealloc_node(node);
    }
}

/// A chained, reference-counted byte buffer.
///
/// The handle owns the chain headed at its descriptor; dropping it destroys
/// every descriptor in the chain and releases their arena references.
/// Handles move, they are never implicitly copied; aliasing is explicit via
/// [`NetBuf::try_clone`] and [`NetBuf::try_clone_one`].
///
/// Unless noted otherwise, accessors and window operations apply to the
/// head descriptor only; chain-wide operations say so in their names or
/// docs ([`NetBuf::total_len`], [`NetBuf::is_shared`], ...).
pub struct NetBuf {
    head: NonNull<Node>,
    _marker: PhantomData<Node>,
}

// SAFETY: the handle owns its chain of descriptors and their arena
// references. Arena refcounts are atomic; descriptors aliasing an arena
// from other threads never touch this handle's nodes; byte-moving
// operations on shared arenas panic, so no safe call sequence races on
// arena contents. User-provided regions (take_ownership, wrap_buffer) come
// through unsafe factories whose contracts include cross-thread validity.
unsafe impl Send for NetBuf {}
// SAFETY: all &self methods only read descriptor fields and arena bytes;
// the one &self write (the aliasing-hint bit) is atomic. Field writes
// require &mut self.
unsafe impl Sync for NetBuf {}

unsafe fn vec_free(_buf: *mut u8, user_data: *mut ()) {
    drop(Box::from_raw(user_data as *mut Vec<u8>));
}

unsafe fn boxed_slice_free(_buf: *mut u8, user_data: *mut ()) {
    drop(Box::from_raw(user_data as *mut Box<[u8]>));
}

impl NetBuf {
    #[inline]
    fn node(&self) -> &Node {
        // SAFETY: head is live for the lifetime of the handle.
        unsafe { self.head.as_ref() }
    }

    #[inline]
    fn node_mut(&mut self) -> &mut Node {
        // SAFETY: head is live and the handle is uniquely borrowed.
        unsafe { self.head.as_mut() }
    }

    pub(crate) fn from_head(head: NonNull<Node>) -> Self {
        Self {
            head,
            _marker: PhantomData,
        }
    }

    pub(crate) fn head_ptr(&self) -> NonNull<Node> {
        self.head
    }

    /// Allocate an empty buffer with at least `capacity` bytes of tailroom.
    ///
    /// The descriptor and the arena are separate allocations; use
    /// [`NetBuf::create_combined`] to fold them into one block. The arena is
    /// zero-initialized and may be larger than requested.
    pub fn create(capacity: usize) -> Result<Self, Error> {
        Self::create_separate(capacity)
    }

    /// Allocate an empty buffer with descriptor and arena in separate
    /// allocations.
    pub fn create_separate(capacity: usize) -> Result<Self, Error> {
        let node = arena::alloc_node()?;
        let arena = match arena::alloc_arena(capacity) {
            Ok(arena) => arena,
            Err(err) => {
                // SAFETY: the node allocation was never initialized or linked.
                unsafe { arena::dealloc_node(node) };
                return Err(err);
            }
        };
        // SAFETY: node points at an uninitialized allocation we own.
        unsafe {
            node.as_ptr().write(Node {
                next: node,
                prev: node,
                data: arena.buf.as_ptr(),
                buf: arena.buf.as_ptr(),
                length: 0,
                capacity: arena.capacity,
                flags: AtomicU8::new(0),
                kind: BufKind::Allocated,
                shared: arena.info.as_ptr(),
            });
        }
        Ok(Self::from_head(node))
    }

    /// Allocate an empty buffer with descriptor and arena in one block.
    ///
    /// Saves an allocation for short-lived buffers. The trade-off: if a slow
    /// path later re-seats the descriptor on a bigger arena, the original
    /// block stays allocated until the descriptor itself is destroyed.
    pub fn create_combined(capacity: usize) -> Result<Self, Error> {
        Ok(Self::from_head(arena::alloc_combined(capacity)?))
    }

    /// Allocate a chain with `total_capacity` bytes of tailroom overall,
    /// with no node holding more than `max_buf_capacity`.
    ///
    /// # Panics
    ///
    /// Panics if `max_buf_capacity` is zero.
    pub fn create_chain(total_capacity: usize, max_buf_capacity: usize) -> Result<Self, Error> {
        assert!(max_buf_capacity > 0, "max_buf_capacity must be non-zero");
        let mut head = Self::create(total_capacity.min(max_buf_capacity))?;
        let mut allocated = head.capacity();
        while allocated < total_capacity {
            let size = (total_capacity - allocated).min(max_buf_capacity);
            let next = Self::create(size)?;
            allocated += next.capacity();
            head.prepend_chain(next);
        }
        Ok(head)
    }

    /// Take ownership of an existing region, freeing it through `free_fn`
    /// (or the system allocator's `free` if none) when the last descriptor
    /// referencing it is destroyed.
    ///
    /// The window initially covers `[ptr, ptr + length)`; `length` defaults
    /// to the full capacity in the original API and callers wanting that
    /// pass `length == capacity`. If descriptor allocation fails and
    /// `free_on_error` is set, the region is freed before returning the
    /// error.
    ///
    /// # Safety
    ///
    /// - `ptr` must be non-null and valid for reads and writes of `capacity`
    ///   bytes until the free callback runs, from any thread
    /// - all `capacity` bytes must be initialized
    /// - the free callback must be safe to call exactly once with
    ///   `(ptr, user_data)` and must not panic; with no callback, `ptr` must
    ///   have come from the system allocator
    ///
    /// # Panics
    ///
    /// Panics if `length > capacity`.
    pub unsafe fn take_ownership(
        ptr: *mut u8,
        capacity: usize,
        length: usize,
        free_fn: Option<FreeFn>,
        user_data: *mut (),
        free_on_error: bool,
    ) -> Result<Self, Error> {
        assert!(length <= capacity, "length exceeds capacity");

        unsafe fn free_input(ptr: *mut u8, free_fn: Option<FreeFn>, user_data: *mut ()) {
            match free_fn {
                Some(f) => f(ptr, user_data),
                None => libc::free(ptr as *mut libc::c_void),
            }
        }

        if capacity > u32::MAX as usize {
            if free_on_error {
                free_input(ptr, free_fn, user_data);
            }
            return Err(Error::Overflow);
        }
        let info = match arena::alloc_shared_info(free_fn, user_data) {
            Ok(info) => info,
            Err(err) => {
                if free_on_error {
                    free_input(ptr, free_fn, user_data);
                }
                return Err(err);
            }
        };
        let node = match arena::alloc_node() {
            Ok(node) => node,
            Err(err) => {
                arena::dealloc_shared_info(info.as_ptr());
                if free_on_error {
                    free_input(ptr, free_fn, user_data);
                }
                return Err(err);
            }
        };
        node.as_ptr().write(Node {
            next: node,
            prev: node,
            data: ptr,
            buf: ptr,
            length: length as u32,
            capacity: capacity as u32,
            flags: AtomicU8::new(FLAG_FREE_SHARED_INFO),
            kind: BufKind::UserSupplied,
            shared: info.as_ptr(),
        });
        Ok(Self::from_head(node))
    }

    /// Take ownership of a `Vec`, without copying its contents.
    ///
    /// The window covers the vec's initialized length; its spare capacity
    /// becomes tailroom (zero-filled, since tailroom is reachable through
    /// [`NetBuf::tail_mut`]). The vec's disposer is captured behind the free
    /// callback and runs once when the last referencing descriptor dies.
    pub fn from_vec(vec: Vec<u8>) -> Result<Self, Error> {
        let mut vec = vec;
        let length = vec.len();
        // Spare capacity becomes visible tailroom and must be initialized.
        vec.resize(vec.capacity(), 0);
        let capacity = vec.len();
        let mut boxed = Box::new(vec);
        let ptr = boxed.as_mut_ptr();
        let user_data = Box::into_raw(boxed) as *mut ();
        // SAFETY: the boxed vec keeps [ptr, ptr + capacity) alive and fully
        // initialized until vec_free reclaims it exactly once; on error,
        // free_on_error runs vec_free and nothing leaks.
        unsafe { Self::take_ownership(ptr, capacity, length, Some(vec_free), user_data, true) }
    }

    /// Take ownership of a boxed slice, without copying its contents.
    pub fn from_boxed_slice(slice: Box<[u8]>) -> Result<Self, Error> {
        let length = slice.len();
        let mut boxed = Box::new(slice);
        let ptr = boxed.as_mut_ptr();
        let user_data = Box::into_raw(boxed) as *mut ();
        // SAFETY: as in from_vec; a boxed slice is fully initialized.
        unsafe {
            Self::take_ownership(
                ptr,
                length,
                length,
                Some(boxed_slice_free),
                user_data,
                true,
            )
        }
    }

    /// Point a buffer at a caller-owned region without taking ownership.
    ///
    /// The region is never freed by this crate and is reported as
    /// permanently shared: every write path requires [`NetBuf::unshare`]
    /// first, which copies out of the region.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null, and the region `[ptr, ptr + length)` must be
    /// initialized and remain valid for reads, from any thread, until every
    /// descriptor referencing it (clones included) has been destroyed.
    pub unsafe fn wrap_buffer(ptr: *const u8, length: usize) -> Result<Self, Error> {
        if length > u32::MAX as usize {
            return Err(Error::Overflow);
        }
        let node = arena::alloc_node()?;
        node.as_ptr().write(Node {
            next: node,
            prev: node,
            data: ptr as *mut u8,
            buf: ptr as *mut u8,
            length: length as u32,
            capacity: length as u32,
            flags: AtomicU8::new(FLAG_USER_OWNED),
            kind: BufKind::UserOwned,
            shared: ptr::null_mut(),
        });
        Ok(Self::from_head(node))
    }

    /// Point a buffer at static data without copying.
    pub fn wrap_static(data: &'static [u8]) -> Result<Self, Error> {
        // SAFETY: static data is initialized, never freed, and outlives
        // every descriptor; user-owned buffers are never written (they are
        // permanently shared, so write paths panic or copy first).
        unsafe { Self::wrap_buffer(data.as_ptr(), data.len()) }
    }

    /// Allocate a buffer holding a copy of `src`, with `headroom` bytes
    /// before the window and at least `min_tailroom` after it.
    pub fn copy_buffer(src: &[u8], headroom: usize, min_tailroom: usize) -> Result<Self, Error> {
        let total = headroom
            .checked_add(src.len())
            .and_then(|n| n.checked_add(min_tailroom))
            .ok_or(Error::Overflow)?;
        let mut buf = Self::create(total)?;
        let node = buf.node_mut();
        // SAFETY: headroom + src.len() <= capacity, so both the re-seated
        // window and the copy stay inside the fresh, unaliased arena.
        unsafe {
            node.data = node.buf.add(headroom);
            ptr::copy_nonoverlapping(src.as_ptr(), node.data, src.len());
        }
        node.length = src.len() as u32;
        node.debug_check();
        Ok(buf)
    }

    /// Like [`NetBuf::copy_buffer`], but returns `None` for empty input.
    pub fn maybe_copy_buffer(
        src: &[u8],
        headroom: usize,
        min_tailroom: usize,
    ) -> Result<Option<Self>, Error> {
        if src.is_empty() {
            return Ok(None);
        }
        Self::copy_buffer(src, headroom, min_tailroom).map(Some)
    }

    /// Valid bytes of the head buffer.
    #[inline]
    pub fn data(&self) -> &[u8] {
        let node = self.node();
        // SAFETY: the window invariant; arenas are initialized (§ factories).
        unsafe { std::slice::from_raw_parts(node.data, node.length as usize) }
    }

    /// Raw pointer to the first valid byte of the head buffer.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.node().data
    }

    /// Number of valid bytes in the head buffer (not the whole chain; see
    /// [`NetBuf::total_len`]).
    #[inline]
    pub fn len(&self) -> usize {
        self.node().length as usize
    }

    /// Whether the head buffer's window is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.node().length == 0
    }

    /// Total arena capacity of the head buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.node().capacity as usize
    }

    /// Unused capacity before the window.
    #[inline]
    pub fn headroom(&self) -> usize {
        self.node().headroom()
    }

    /// Unused capacity after the window.
    #[inline]
    pub fn tailroom(&self) -> usize {
        self.node().tailroom()
    }

    /// How the head buffer's arena is managed.
    #[inline]
    pub fn kind(&self) -> BufKind {
        self.node().kind
    }

    /// Mutable access to the head buffer's valid bytes.
    ///
    /// # Panics
    ///
    /// Panics if the arena is shared; call [`NetBuf::unshare`] first.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        let node = self.node_mut();
        assert!(
            !node.is_shared_one(),
            "buffer is shared; unshare before writing"
        );
        // SAFETY: the window invariant, and exclusivity was just checked.
        unsafe { std::slice::from_raw_parts_mut(node.data, node.length as usize) }
    }

    /// Mutable access to the head buffer's tailroom, for filling before
    /// [`NetBuf::append`].
    ///
    /// # Panics
    ///
    /// Panics if the arena is shared; call [`NetBuf::unshare`] first.
    #[inline]
    pub fn tail_mut(&mut self) -> &mut [u8] {
        let node = self.node_mut();
        assert!(
            !node.is_shared_one(),
            "buffer is shared; unshare before writing"
        );
        let tailroom = node.tailroom();
        // SAFETY: [tail, tail + tailroom) is inside the arena, initialized,
        // and exclusivity was just checked.
        unsafe { std::slice::from_raw_parts_mut(node.tail(), tailroom) }
    }

    /// Shift the window forward by `amount` bytes, moving the valid bytes
    /// along with it. Headroom grows, tailroom shrinks, length is unchanged.
    ///
    /// # Panics
    ///
    /// Panics if `amount` exceeds the tailroom, or if the buffer is non-empty
    /// and shared (the byte move would race with other readers).
    pub fn advance(&mut self, amount: usize) {
        let node = self.node_mut();
        assert!(
            amount <= node.tailroom(),
            "cannot advance past the end of the buffer"
        );
        if node.length > 0 {
            assert!(
                !node.is_shared_one(),
                "cannot advance a shared buffer; unshare first"
            );
            // SAFETY: both windows are inside the arena (amount <= tailroom)
            // and ptr::copy handles the overlap.
            unsafe { ptr::copy(node.data, node.data.add(amount), node.length as usize) };
        }
        // SAFETY: amount <= tailroom keeps the window in bounds.
        node.data = unsafe { node.data.add(amount) };
        node.debug_check();
    }

    /// Shift the window backward by `amount` bytes, moving the valid bytes
    /// along with it. Headroom shrinks, tailroom grows, length is unchanged.
    ///
    /// # Panics
    ///
    /// Panics if `amount` exceeds the headroom, or if the buffer is non-empty
    /// and shared.
    pub fn retreat(&mut self, amount: usize) {
        let node = self.node_mut();
        assert!(
            amount <= node.headroom(),
            "cannot retreat past the start of the buffer"
        );
        if node.length > 0 {
            assert!(
                !node.is_shared_one(),
                "cannot retreat a shared buffer; unshare first"
            );
            // SAFETY: both windows are inside the arena (amount <= headroom)
            // and ptr::copy handles the overlap.
            unsafe { ptr::copy(node.data, node.data.sub(amount), node.length as usize) };
        }
        // SAFETY: amount <= headroom keeps the window in bounds.
        node.data = unsafe { node.data.sub(amount) };
        node.debug_check();
    }

    /// Grow the window backward into the headroom. No bytes move; the newly
    /// included region holds whatever was there (zero for fresh arenas), and
    /// the caller is expected to fill it.
    ///
    /// # Panics
    ///
    /// Panics if `amount` exceeds the headroom.
    pub fn prepend(&mut self, amount: usize) {
        let node = self.node_mut();
        assert!(amount <= node.headroom(), "insufficient headroom");
        // SAFETY: amount <= headroom keeps the window in bounds.
        node.data = unsafe { node.data.sub(amount) };
        node.length += amount as u32;
        node.debug_check();
    }

    /// Grow the window forward into the tailroom. No bytes move.
    ///
    /// # Panics
    ///
    /// Panics if `amount` exceeds the tailroom.
    pub fn append(&mut self, amount: usize) {
        let node = self.node_mut();
        assert!(amount <= node.tailroom(), "insufficient tailroom");
        node.length += amount as u32;
        node.debug_check();
    }

    /// Drop `amount` bytes from the front of the window.
    ///
    /// # Panics
    ///
    /// Panics if `amount` exceeds the length.
    pub fn trim_start(&mut self, amount: usize) {
        let node = self.node_mut();
        assert!(
            amount <= node.length as usize,
            "cannot trim more than the buffer length"
        );
        // SAFETY: amount <= length keeps the window in bounds.
        node.data = unsafe { node.data.add(amount) };
        node.length -= amount as u32;
        node.debug_check();
    }

    /// Drop `amount` bytes from the back of the window.
    ///
    /// # Panics
    ///
    /// Panics if `amount` exceeds the length.
    pub fn trim_end(&mut self, amount: usize) {
        let node = self.node_mut();
        assert!(
            amount <= node.length as usize,
            "cannot trim more than the buffer length"
        );
        node.length -= amount as u32;
        node.debug_check();
    }

    /// Empty the window and move it back to the start of the arena.
    ///
    /// Postcondition: `headroom() == 0`, `len() == 0`,
    /// `tailroom() == capacity()`.
    pub fn clear(&mut self) {
        let node = self.node_mut();
        node.data = node.buf;
        node.length = 0;
    }

    /// Ensure at least `min_headroom` bytes before the window and
    /// `min_tailroom` after it, preserving the valid bytes.
    ///
    /// No-op when already satisfied; re-seats an empty window when total
    /// room suffices; otherwise slides the window inside a unique arena, or
    /// re-allocates. On error the buffer is unchanged.
    pub fn reserve(&mut self, min_headroom: usize, min_tailroom: usize) -> Result<(), Error> {
        let node = self.node_mut();
        if node.headroom() >= min_headroom && node.tailroom() >= min_tailroom {
            return Ok(());
        }
        if node.length == 0 && node.headroom() + node.tailroom() >= min_headroom + min_tailroom {
            // SAFETY: min_headroom <= capacity, so the empty window stays in
            // bounds.
            node.data = unsafe { node.buf.add(min_headroom) };
            return Ok(());
        }
        self.reserve_slow(min_headroom, min_tailroom)
    }

    fn reserve_slow(&mut self, min_headroom: usize, min_tailroom: usize) -> Result<(), Error> {
        let total = min_headroom
            .checked_add(self.len())
            .and_then(|n| n.checked_add(min_tailroom))
            .ok_or(Error::Overflow)?;
        let node = self.node_mut();
        if !node.is_shared_one() && node.capacity as usize >= total {
            // Enough room in the unique arena: slide the window into place.
            // SAFETY: min_headroom + length <= capacity; ptr::copy handles
            // the overlap; exclusivity was just checked.
            unsafe {
                let dst = node.buf.add(min_headroom);
                ptr::copy(node.data, dst, node.length as usize);
                node.data = dst;
            }
            node.debug_check();
            return Ok(());
        }
        trace!(min_headroom, min_tailroom, "reserve reallocating buffer");
        let arena = arena::alloc_arena(total)?;
        // SAFETY: the fresh arena fits headroom + length; the old reference
        // is released only after the copy succeeds.
        unsafe {
            ptr::copy_nonoverlapping(
                node.data,
                arena.buf.as_ptr().add(min_headroom),
                node.length as usize,
            );
            let length = node.length;
            node.release_arena();
            node.adopt_arena(arena, min_headroom, length);
        }
        Ok(())
    }

    /// Whether other descriptors (or a foreign owner) reference the head
    /// buffer's arena. Chain-agnostic; see [`NetBuf::is_shared`].
    #[inline]
    pub fn is_shared_one(&self) -> bool {
        self.node().is_shared_one()
    }

    /// Whether any buffer in the chain is shared. Short-circuits on the
    /// first shared element.
    pub fn is_shared(&self) -> bool {
        let mut current = self.head;
        loop {
            // SAFETY: chain nodes are live while the handle is borrowed.
            let node = unsafe { current.as_ref() };
            if node.is_shared_one() {
                return true;
            }
            current = node.next;
            if current == self.head {
                return false;
            }
        }
    }

    /// Clone the head buffer as a singleton aliasing the same arena.
    ///
    /// Both descriptors are marked possibly-shared and the arena refcount is
    /// incremented; no bytes are copied.
    pub fn try_clone_one(&self) -> Result<Self, Error> {
        // SAFETY: head is live.
        unsafe { Self::clone_node(self.head) }
    }

    /// Clone the whole chain, preserving element order. Every element
    /// aliases its original arena.
    pub fn try_clone(&self) -> Result<Self, Error> {
        // SAFETY: chain nodes are live; on error the partial clone drops and
        // releases everything it acquired.
        unsafe {
            let mut cloned = Self::clone_node(self.head)?;
            let mut current = self.node().next;
            while current != self.head {
                let one = Self::clone_node(current)?;
                cloned.prepend_chain(one);
                current = current.as_ref().next;
            }
            Ok(cloned)
        }
    }

    unsafe fn clone_node(node: NonNull<Node>) -> Result<Self, Error> {
        let new = arena::alloc_node()?;
        let src = node.as_ref();
        let kept = src.flags.load(Ordering::Relaxed) & (FLAG_USER_OWNED | FLAG_FREE_SHARED_INFO);
        new.as_ptr().write(Node {
            next: new,
            prev: new,
            data: src.data,
            buf: src.buf,
            length: src.length,
            capacity: src.capacity,
            flags: AtomicU8::new(kept),
            kind: src.kind,
            shared: src.shared,
        });
        if !src.shared.is_null() {
            (*src.shared).incref();
            src.flags.fetch_or(FLAG_MAYBE_SHARED, Ordering::Relaxed);
            new.as_ref().flags.fetch_or(FLAG_MAYBE_SHARED, Ordering::Relaxed);
        }
        Ok(Self::from_head(new))
    }

    /// Make every arena in the chain uniquely owned, copying as needed.
    ///
    /// A singleton is re-seated on a private copy of its arena. A chain with
    /// any shared element is coalesced into one freshly allocated arena (the
    /// single allocation is cheaper than per-element unsharing for
    /// protocol-sized chains). On error the chain is unchanged.
    pub fn unshare(&mut self) -> Result<(), Error> {
        if self.is_chained() {
            self.unshare_chained()
        } else {
            self.unshare_one()
        }
    }

    fn unshare_one(&mut self) -> Result<(), Error> {
        if self.node().is_shared_one() {
            self.unshare_one_slow()?;
        }
        Ok(())
    }

    fn unshare_one_slow(&mut self) -> Result<(), Error> {
        let node = self.node_mut();
        let arena = arena::alloc_arena(node.capacity as usize)?;
        let headroom = node.headroom();
        // SAFETY: the fresh arena is at least as large as the old one, so
        // the window fits at the same headroom; the old reference is
        // released only after the copy succeeds.
        unsafe {
            ptr::copy_nonoverlapping(
                node.data,
                arena.buf.as_ptr().add(headroom),
                node.length as usize,
            );
            let length = node.length;
            node.release_arena();
            node.adopt_arena(arena, headroom, length);
        }
        Ok(())
    }

    fn unshare_chained(&mut self) -> Result<(), Error> {
        if !self.is_shared() {
            return Ok(());
        }
        trace!("unsharing chain by coalescing");
        self.coalesce_slow()
    }

    /// Fold the whole chain into one contiguous buffer, returning the
    /// now-contiguous bytes.
    ///
    /// After it returns, the chain is a singleton with at least as much
    /// headroom as the first element had and at least as much tailroom as
    /// the last. Eliminated descriptors are destroyed. On error the chain is
    /// unchanged.
    pub fn coalesce(&mut self) -> Result<&[u8], Error> {
        if self.is_chained() {
            self.coalesce_slow()?;
        }
        Ok(self.data())
    }

    fn coalesce_slow(&mut self) -> Result<(), Error> {
        let new_headroom = self.headroom();
        // SAFETY: prev is live; for the full-circle fold the tailroom ask
        // comes from the last element.
        let new_tailroom = unsafe { self.node().prev.as_ref().tailroom() };
        let new_length = self.total_len_u64();
        self.coalesce_and_reallocate(new_headroom, new_length, self.head, new_tailroom)
    }

    /// Ensure at least `min_contiguous` contiguous bytes at the head,
    /// folding whole elements into it until the target is reached.
    ///
    /// Elements are never split, so the result may exceed the target.
    /// Postcondition: `len() >= min_contiguous` or the chain is a singleton.
    /// Errors with [`Error::Overflow`] if the whole chain is shorter than
    /// `min_contiguous`; on error the chain is unchanged.
    pub fn gather(&mut self, min_contiguous: usize) -> Result<(), Error> {
        if !self.is_chained() || self.len() >= min_contiguous {
            return Ok(());
        }
        let head = self.head;
        let mut gathered: u64 = 0;
        let mut current = head;
        let end = loop {
            // SAFETY: chain nodes are live.
            let node = unsafe { current.as_ref() };
            gathered += u64::from(node.length);
            let next = node.next;
            if gathered >= min_contiguous as u64 {
                break next;
            }
            if next == head {
                // The whole chain is shorter than the request.
                return Err(Error::Overflow);
            }
            current = next;
        };
        let new_headroom = self.headroom();
        // SAFETY: end's prev is the last element being folded in.
        let new_tailroom = unsafe { end.as_ref().prev.as_ref().tailroom() };
        self.coalesce_and_reallocate(new_headroom, gathered, end, new_tailroom)
    }

    /// Shared slow path: fold the elements from the head up to (excluding)
    /// `end` into one freshly allocated arena, destroy the consumed
    /// descriptors, and splice the remainder back on. `end == head` folds
    /// the full circle. On error nothing is modified.
    fn coalesce_and_reallocate(
        &mut self,
        new_headroom: usize,
        new_length: u64,
        end: NonNull<Node>,
        new_tailroom: usize,
    ) -> Result<(), Error> {
        if new_length > u64::from(u32::MAX) {
            return Err(Error::Overflow);
        }
        let total = new_headroom
            .checked_add(new_length as usize)
            .and_then(|n| n.checked_add(new_tailroom))
            .ok_or(Error::Overflow)?;
        trace!(new_length, "coalescing chain into one buffer");
        let arena = arena::alloc_arena(total)?;
        // SAFETY: every copy lands inside the fresh arena (the segment
        // lengths sum to new_length); nodes stay valid until destroyed
        // below; the relink restores a well-formed circle.
        unsafe {
            let mut dst = arena.buf.as_ptr().add(new_headroom);
            let mut remaining = new_length;
            let mut current = self.head;
            loop {
                let node = current.as_ref();
                if node.length > 0 {
                    debug_assert!(u64::from(node.length) <= remaining);
                    ptr::copy_nonoverlapping(node.data, dst, node.length as usize);
                    dst = dst.add(node.length as usize);
                    remaining -= u64::from(node.length);
                }
                current = node.next;
                if current == end {
                    break;
                }
            }
            debug_assert_eq!(remaining, 0);

            let head = self.head.as_ptr();
            (*head).release_arena();
            (*head).adopt_arena(arena, new_headroom, new_length as u32);

            let mut cursor = (*head).next;
            while cursor != end {
                let next = cursor.as_ref().next;
                destroy_node(cursor);
                cursor = next;
            }
            if end == self.head {
                (*head).next = self.head;
                (*head).prev = self.head;
            } else {
                (*head).next = end;
                (*end.as_ptr()).prev = self.head;
            }
        }
        Ok(())
    }

    /// Convert the chain into a contiguous `Vec`, consuming it.
    ///
    /// Zero-copy when the buffer is an unshared, untrimmed-at-the-front
    /// singleton whose arena was donated by [`NetBuf::from_vec`]: the
    /// original vec is reclaimed. Otherwise the chain bytes are gathered
    /// into a fresh allocation. Either way every arena reference is
    /// released.
    pub fn into_vec(self) -> Result<Vec<u8>, Error> {
        if !self.is_chained() && !self.is_shared_one() {
            let node = self.node();
            let reclaimable = !node.shared.is_null()
                // SAFETY: non-null shared is live.
                && unsafe { (*node.shared).free_fn } == Some(vec_free as FreeFn)
                && node.data == node.buf;
            if reclaimable {
                let head = self.head;
                // SAFETY: the buffer is the unique owner; the vec box is the
                // arena's user_data; descriptor and SharedInfo are released
                // directly (the disposer must not run: the bytes live on in
                // the reclaimed vec).
                unsafe {
                    let shared = (*head.as_ptr()).shared;
                    let mut vec = *Box::from_raw((*shared).user_data as *mut Vec<u8>);
                    let length = (*head.as_ptr()).length as usize;
                    arena::dealloc_shared_info(shared);
                    arena::dealloc_node(head);
                    mem::forget(self);
                    vec.truncate(length);
                    return Ok(vec);
                }
            }
        }
        let total = self.total_len();
        let mut out = Vec::new();
        out.try_reserve_exact(total).map_err(|_| Error::OutOfMemory)?;
        for segment in &self {
            out.extend_from_slice(segment);
        }
        Ok(out)
    }

    /// Convert the chain into contiguous [`Bytes`], consuming it.
    pub fn into_bytes(self) -> Result<Bytes, Error> {
        Ok(Bytes::from(self.into_vec()?))
    }
}

impl Drop for NetBuf {
    fn drop(&mut self) {
        let head = self.head;
        // SAFETY: the handle owns every node in the chain; each is destroyed
        // exactly once, head last.
        unsafe {
            let mut current = head.as_ref().next;
            while current != head {
                let next = current.as_ref().next;
                destroy_node(current);
                current = next;
            }
            destroy_node(head);
        }
    }
}

impl AsRef<[u8]> for NetBuf {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl fmt::Debug for NetBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetBuf")
            .field("length", &self.len())
            .field("capacity", &self.capacity())
            .field("headroom", &self.headroom())
            .field("tailroom", &self.tailroom())
            .field("kind", &self.kind())
            .field("elements", &self.count_elements())
            .finish()
    }
}

impl PartialEq for NetBuf {
    fn eq(&self, other: &Self) -> bool {
        self.iter().flatten().eq(other.iter().flatten())
    }
}

impl Eq for NetBuf {}

impl PartialEq<[u8]> for NetBuf {
    fn eq(&self, other: &[u8]) -> bool {
        let mut rest = other;
        for segment in self {
            let Some((head, tail)) = rest.split_at_checked(segment.len()) else {
                return false;
            };
            if head != segment {
                return false;
            }
            rest = tail;
        }
        rest.is_empty()
    }
}

impl PartialEq<&[u8]> for NetBuf {
    #[inline]
    fn eq(&self, other: &&[u8]) -> bool {
        *self == **other
    }
}

impl<const N: usize> PartialEq<[u8; N]> for NetBuf {
    #[inline]
    fn eq(&self, other: &[u8; N]) -> bool {
        self == other.as_slice()
    }
}

impl<const N: usize> PartialEq<&[u8; N]> for NetBuf {
    #[inline]
    fn eq(&self, other: &&[u8; N]) -> bool {
        self == other.as_slice()
    }
}
