// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fixed-size, aligned stack chunks.
//!
//! Frames are bump-allocated inside chunks of `CHUNK_SIZE` bytes, each
//! aligned on a `CHUNK_SIZE` boundary. The alignment is what makes
//! [`chunk_of`] work: the owning chunk of any frame pointer can be
//! recovered with a single mask, no per-frame bookkeeping required.
//!
//! Chunks are shared between stack descriptors after a fork or split, so
//! each chunk carries an atomic reference count. The count tracks how many
//! live descriptors hold frames (or a nursery) inside the chunk; the last
//! one to let go frees the memory.

use core::alloc::Layout;
use core::num::NonZero;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use static_assertions::const_assert;
use tracing::trace;

/// Chunk size exponent: chunks span `1 << LG_CHUNK_SIZE` bytes.
pub const LG_CHUNK_SIZE: usize = 12;

/// Size in bytes of a chunk, including its header.
pub const CHUNK_SIZE: usize = 1 << LG_CHUNK_SIZE;

const_assert!(CHUNK_SIZE.is_power_of_two());
const_assert!(CHUNK_SIZE >= 2 * size_of::<ChunkHeader>());
const_assert!(CHUNK_SIZE % align_of::<ChunkHeader>() == 0);

/// Number of bytes taken by the header at the base of every chunk.
pub(crate) const DATA_OFFSET: usize = size_of::<ChunkHeader>();

/// Header at the base of every chunk; the remaining
/// `CHUNK_SIZE - DATA_OFFSET` bytes hold frames.
#[repr(C)]
pub(crate) struct ChunkHeader {
    /// Number of live descriptors with frames or a nursery in this chunk.
    refcount: AtomicUsize,
    /// `sp` to restore when a pop returns into this chunk from a later one.
    saved_sp: *mut u8,
    /// `lp` to restore when a pop returns into this chunk from a later one.
    saved_lp: *mut u8,
}

const fn chunk_layout() -> Layout {
    match Layout::from_size_align(CHUNK_SIZE, CHUNK_SIZE) {
        Ok(layout) => layout,
        Err(_) => panic!("CHUNK_SIZE must be a valid power-of-two layout"),
    }
}

/// Allocates a fresh chunk with `refcount = 1`, remembering the nursery to
/// restore once control pops back out of it.
///
/// Returns `None` if the global allocator cannot satisfy the aligned
/// request; nothing is mutated in that case.
pub(crate) fn create(saved_sp: *mut u8, saved_lp: *mut u8) -> Option<NonNull<ChunkHeader>> {
    // Safety: the layout has non-zero size.
    let raw = unsafe { alloc::alloc::alloc(chunk_layout()) };
    let chunk = NonNull::new(raw)?.cast::<ChunkHeader>();
    // Safety: freshly allocated, exclusively owned, properly aligned.
    unsafe {
        chunk.write(ChunkHeader {
            refcount: AtomicUsize::new(1),
            saved_sp,
            saved_lp,
        });
    }
    trace!(chunk = ?chunk.as_ptr(), "allocated chunk");
    Some(chunk)
}

/// Recovers the chunk that owns the frame at `p`.
///
/// The `- 1` bias attributes a pointer sitting exactly on a chunk boundary
/// to the chunk *below* it, which is the owner whenever `p` is the
/// one-past-the-end position of a completely full chunk.
pub(crate) fn chunk_of<T>(p: NonNull<T>) -> NonNull<ChunkHeader> {
    p.map_addr(|addr| {
        let base = (addr.get() - 1) & !(CHUNK_SIZE - 1);
        NonZero::new(base).expect("frame pointers never live in the zero page")
    })
    .cast()
}

impl ChunkHeader {
    /// First byte of the frames region.
    pub(crate) fn data(this: NonNull<Self>) -> *mut u8 {
        this.as_ptr().cast::<u8>().wrapping_add(DATA_OFFSET)
    }

    /// One past the last byte of the chunk.
    pub(crate) fn end(this: NonNull<Self>) -> *mut u8 {
        this.as_ptr().cast::<u8>().wrapping_add(CHUNK_SIZE)
    }

    pub(crate) fn saved_sp(&self) -> *mut u8 {
        self.saved_sp
    }

    pub(crate) fn saved_lp(&self) -> *mut u8 {
        self.saved_lp
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Records one more descriptor holding pointers into this chunk.
    pub(crate) fn incref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases one descriptor's claim; frees the chunk when it was the
    /// last. The acquire side of the RMW makes all writes through the
    /// chunk visible to whichever thread performs the final decrement.
    ///
    /// # Safety
    ///
    /// `this` must point to a live chunk on which the caller holds one
    /// claim; the chunk must not be touched through this claim afterwards.
    pub(crate) unsafe fn decref(this: NonNull<Self>) {
        // Safety: per contract the chunk is still live here.
        let prev = unsafe { this.as_ref() }.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "chunk refcount underflow");
        if prev == 1 {
            trace!(chunk = ?this.as_ptr(), "released chunk");
            // Safety: the count reached zero, so no descriptor points into
            // the chunk anymore and this thread has exclusive access.
            unsafe { alloc::alloc::dealloc(this.as_ptr().cast(), chunk_layout()) };
        }
    }
}
