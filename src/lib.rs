//! Chained, reference-counted byte buffers for network I/O.
//!
//! - [`NetBuf`]: a view into a reference-counted byte arena, linkable into a
//!   circular chain of non-contiguous fragments
//! - [`Iter`]: per-fragment iteration over a chain
//! - [`BufKind`]: how a buffer's arena is managed
//!
//! # Overview
//!
//! Protocol stacks receive bytes into whatever buffers the transport hands
//! them and then need to prepend headers, strip framing, split messages, and
//! pass regions to consumers without copying. [`NetBuf`] supports this the
//! way BSD `mbuf` and Linux `sk_buff` do: a small descriptor records a
//! window `[data, data + length)` into a larger arena, multiple descriptors
//! may alias one arena (tracked by an atomic reference count), and
//! descriptors link into a circular chain that represents a single logical
//! byte sequence.
//!
//! Mutating operations come in three flavors: window adjustments
//! ([`NetBuf::advance`], [`NetBuf::trim_start`], ...) that touch only the
//! descriptor, chain surgery ([`NetBuf::append_chain`], [`NetBuf::pop`],
//! [`NetBuf::separate`]) that relinks descriptors, and copying slow paths
//! ([`NetBuf::unshare`], [`NetBuf::coalesce`], [`NetBuf::gather`]) that
//! restore unique ownership or contiguity.
//!
//! # Example
//!
//! ```
//! use netbuf::NetBuf;
//!
//! // Reserve room for a header, write a payload, then prepend the header
//! // without moving the payload.
//! let mut buf = NetBuf::create(64)?;
//! buf.advance(8);
//! buf.tail_mut()[..5].copy_from_slice(b"hello");
//! buf.append(5);
//! buf.prepend(2);
//! buf.data_mut()[..2].copy_from_slice(b"v1");
//! assert_eq!(buf, b"v1hello");
//! # Ok::<(), netbuf::Error>(())
//! ```
//!
//! # Thread Safety
//!
//! A single buffer or chain must be accessed from one thread at a time
//! (`&mut self` enforces this). Two buffers aliasing the same arena (via
//! [`NetBuf::try_clone`]) may live on different threads: the only shared
//! mutable state is the arena's reference count, which is atomic. Operations
//! that would move bytes inside a shared arena panic instead; call
//! [`NetBuf::unshare`] first.

mod buf;

pub use buf::{BufKind, FreeFn, Iter, NetBuf};

use thiserror::Error;

/// Errors surfaced by allocating operations.
///
/// Every fallible operation is strongly exception-safe: on error, the buffer
/// or chain it was called on is unchanged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An allocation failed.
    #[error("allocation failed")]
    OutOfMemory,
    /// A size computation exceeded the 32-bit arena capacity bound.
    #[error("size exceeds the 32-bit buffer capacity bound")]
    Overflow,
}
