// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The basic cactus stack: the mark chain tracks asynchronous frames only.
//!
//! Every frame pushed with [`CallKind::Async`] is a candidate for
//! stealing and is threaded onto the doubly linked mark chain as it is
//! pushed; [`Stack::fork_mark`] cuts the stack right below the oldest such
//! candidate and yields the upper slice to another worker.
//!
//! See the [crate docs](crate) for the memory layout shared with the
//! [`plus`](crate::plus) variant.

use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

use tracing::trace;

use crate::CallKind;
use crate::chunk::{self, ChunkHeader};
use crate::layout::{self, align_addr_up};

type Link = Option<NonNull<FrameHeader>>;

/// In-stack record prefixing every frame.
///
/// `pred` threads the call chain; `mark_pred`/`mark_succ` thread the mark
/// chain, a sublist of the call chain holding the async frames.
#[repr(C)]
struct FrameHeader {
    pred: Link,
    mark_pred: Link,
    mark_succ: Link,
    call: CallKind,
}

const fn frame_align<T>() -> usize {
    layout::frame_align::<FrameHeader, T>()
}

const fn frame_size<T>() -> usize {
    layout::frame_size::<FrameHeader, T>()
}

const fn first_frame_offset<T>() -> usize {
    layout::first_frame_offset::<FrameHeader, T>()
}

fn payload_ptr<T>(fp: NonNull<FrameHeader>) -> *mut T {
    layout::payload_ptr::<FrameHeader, T>(fp)
}

/// The five-pointer descriptor of one logical stack.
///
/// `Stack` is a move-only value: every operation consumes the descriptor
/// and returns its successor, mirroring how a worker's stack evolves in
/// program order. The half-open byte region `[sp, lp)` is the *nursery*,
/// reserved inside the current chunk for the next push.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct RawParts {
    fp: Link,
    sp: *mut u8,
    lp: *mut u8,
    mhd: Link,
    mtl: Link,
}

impl RawParts {
    const EMPTY: Self = Self {
        fp: None,
        sp: ptr::null_mut(),
        lp: ptr::null_mut(),
        mhd: None,
        mtl: None,
    };
}

/// A basic cactus stack holding frames of type `T`.
///
/// All frames of one stack share the payload type; the payload slot of
/// each frame is properly aligned for `T`.
///
/// Dropping a non-empty stack releases the chunks it references but does
/// **not** drop the frame payloads still in them; [`Stack::pop_back`] is
/// the destructing path.
pub struct Stack<T> {
    raw: RawParts,
    _payload: PhantomData<T>,
}

// Safety: a descriptor is mutated only by its single owner; handing it to
// another thread hands over the frames (and chunk claims) with it. The
// chunk refcounts shared with other descriptors are atomic.
unsafe impl<T: Send> Send for Stack<T> {}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Stack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("fp", &self.raw.fp)
            .field("sp", &self.raw.sp)
            .field("lp", &self.raw.lp)
            .field("mhd", &self.raw.mhd)
            .field("mtl", &self.raw.mtl)
            .finish()
    }
}

impl<T> PartialEq for Stack<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        // Decrement each distinct chunk the call chain runs through.
        let mut cur = self.raw.fp;
        while let Some(fp) = cur {
            let c = chunk::chunk_of(fp);
            let mut pred = unsafe { (*fp.as_ptr()).pred };
            while let Some(p) = pred {
                if chunk::chunk_of(p) != c {
                    break;
                }
                pred = unsafe { (*p.as_ptr()).pred };
            }
            // Safety: this descriptor holds one claim on `c` and will not
            // touch it again.
            unsafe { ChunkHeader::decref(c) };
            cur = pred;
        }
    }
}

/// Error returned when a push could not allocate a new chunk.
///
/// Carries the untouched descriptor and payload back to the caller; the
/// failed operation has no other effect.
pub struct PushError<T> {
    pub stack: Stack<T>,
    pub value: T,
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushError")
            .field("stack", &self.stack)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to allocate a stack chunk")
    }
}

impl<T> core::error::Error for PushError<T> {}

impl<T> Stack<T> {
    /// Creates the empty descriptor. No allocation happens until the first
    /// push.
    #[must_use]
    pub const fn new() -> Self {
        Self::from_raw(RawParts::EMPTY)
    }

    const fn from_raw(raw: RawParts) -> Self {
        Self {
            raw,
            _payload: PhantomData,
        }
    }

    fn into_raw(self) -> RawParts {
        let raw = self.raw;
        mem::forget(self);
        raw
    }

    /// Returns `true` if the stack holds no frames.
    pub fn is_empty(&self) -> bool {
        self.raw.fp.is_none()
    }

    /// Returns `true` if at least one frame is a steal candidate.
    pub fn has_marks(&self) -> bool {
        self.raw.mhd.is_some()
    }

    /// Pushes a frame holding `value` on top of the stack.
    ///
    /// An [`CallKind::Async`] frame is additionally appended to the mark
    /// chain. The frame is placed in the nursery when it fits, otherwise a
    /// fresh chunk is allocated and the old nursery is remembered in its
    /// header for the matching pop.
    ///
    /// On allocation failure the descriptor comes back unchanged inside
    /// the error.
    pub fn push_back(self, call: CallKind, value: T) -> Result<Self, PushError<T>> {
        const {
            assert!(
                first_frame_offset::<T>() + frame_size::<T>() <= chunk::CHUNK_SIZE,
                "frame does not fit in a stack chunk"
            );
        }
        let b = frame_size::<T>();
        let s = self.into_raw();
        let mut t = s;

        let fp = if s.sp.is_null() || s.sp.wrapping_add(b) > s.lp {
            let Some(c) = chunk::create(s.sp, s.lp) else {
                return Err(PushError {
                    stack: Self::from_raw(s),
                    value,
                });
            };
            t.lp = ChunkHeader::end(c);
            let first = align_addr_up(ChunkHeader::data(c), frame_align::<T>());
            // Safety: `first` points into the freshly allocated chunk.
            unsafe { NonNull::new_unchecked(first) }.cast::<FrameHeader>()
        } else {
            // Safety: a non-null `sp` always points at free frame bytes.
            unsafe { NonNull::new_unchecked(s.sp) }.cast::<FrameHeader>()
        };
        t.fp = Some(fp);
        t.sp = fp.as_ptr().cast::<u8>().wrapping_add(b);

        unsafe {
            payload_ptr::<T>(fp).write(value);
            fp.write(FrameHeader {
                pred: s.fp,
                mark_pred: None,
                mark_succ: None,
                call,
            });
        }
        if call == CallKind::Async {
            unsafe { (*fp.as_ptr()).mark_pred = s.mtl };
            if let Some(mtl) = s.mtl {
                unsafe { (*mtl.as_ptr()).mark_succ = Some(fp) };
            }
            t.mtl = Some(fp);
            if t.mhd.is_none() {
                t.mhd = t.mtl;
            }
        }
        Ok(Self::from_raw(t))
    }

    /// Pops the top frame, returning its payload.
    ///
    /// When the pop crosses back into an earlier chunk, the nursery saved
    /// in the abandoned chunk's header is restored and the chunk's
    /// refcount dropped.
    ///
    /// # Panics
    ///
    /// Panics if the stack is empty.
    pub fn pop_back(self) -> (Self, T) {
        let s = self.into_raw();
        let Some(fp) = s.fp else {
            panic!("pop_back on an empty stack");
        };
        let mut t = s;
        let value = unsafe { payload_ptr::<T>(fp).read() };

        if s.mtl == Some(fp) {
            let mark_pred = unsafe { (*fp.as_ptr()).mark_pred };
            match mark_pred {
                None => t.mhd = None,
                Some(p) => unsafe { (*p.as_ptr()).mark_succ = None },
            }
            t.mtl = mark_pred;
        }

        t.fp = unsafe { (*fp.as_ptr()).pred };
        let cfp = chunk::chunk_of(fp);
        match t.fp {
            Some(nf) if chunk::chunk_of(nf) == cfp => {
                t.sp = fp.as_ptr().cast();
            }
            Some(_) => {
                let header = unsafe { cfp.as_ref() };
                t.sp = header.saved_sp();
                t.lp = header.saved_lp();
                // Safety: this descriptor is leaving the chunk for good.
                unsafe { ChunkHeader::decref(cfp) };
            }
            None => {
                // Popping the bottom frame empties the descriptor outright.
                // The nursery saved in the chunk header belongs to whatever
                // lineage created the chunk; a forked slice must not adopt
                // it.
                t.sp = ptr::null_mut();
                t.lp = ptr::null_mut();
                // Safety: this descriptor is leaving the chunk for good.
                unsafe { ChunkHeader::decref(cfp) };
            }
        }
        (Self::from_raw(t), value)
    }

    /// Returns a writable view of the top frame's payload.
    ///
    /// # Panics
    ///
    /// Panics if the stack is empty.
    pub fn peek_back(&mut self) -> &mut T {
        let fp = self.raw.fp.expect("peek_back on an empty stack");
        unsafe { &mut *payload_ptr::<T>(fp) }
    }

    /// Returns the payloads at the steal point: the oldest marked frame
    /// and its call-chain predecessor (the continuation to resume into on
    /// a successful steal).
    ///
    /// # Panics
    ///
    /// Panics if the mark chain is empty.
    pub fn peek_mark(&mut self) -> (&mut T, Option<&mut T>) {
        let mhd = self.raw.mhd.expect("peek_mark on a stack with no marked frames");
        let pred = unsafe { (*mhd.as_ptr()).pred };
        unsafe {
            (
                &mut *payload_ptr::<T>(mhd),
                pred.map(|p| &mut *payload_ptr::<T>(p)),
            )
        }
    }

    /// Splits off the suffix starting at the oldest marked frame that is
    /// not the bottom of the call chain.
    ///
    /// Returns `(bottom, top)`; the caller keeps `bottom` and hands `top`
    /// to another worker. When no cut point exists the stack comes back
    /// untouched alongside an empty descriptor.
    ///
    /// When both sides of the cut share a chunk its refcount is bumped;
    /// the bottom slice's nursery is closed off at the cut so the two
    /// slices never write the same bytes.
    pub fn fork_mark(self) -> (Self, Self) {
        let s = self.into_raw();
        let mut s1 = s;
        let Some(mhd) = s.mhd else {
            return (Self::from_raw(s1), Self::new());
        };

        let pf2 = if unsafe { (*mhd.as_ptr()).pred }.is_none() {
            // The oldest mark sits on the bottom frame, which cannot be
            // stolen; cut at the next mark instead. The bottom slice keeps
            // `mhd` as its only chain node, so its outgoing edge must go.
            let Some(succ) = (unsafe { (*mhd.as_ptr()).mark_succ }) else {
                return (Self::from_raw(s1), Self::new());
            };
            unsafe { (*mhd.as_ptr()).mark_succ = None };
            succ
        } else {
            s1.mhd = None;
            mhd
        };
        let Some(pf1) = (unsafe { (*pf2.as_ptr()).pred }) else {
            unreachable!("the frame above a cut always has a caller");
        };

        s1.fp = Some(pf1);
        let cf1 = chunk::chunk_of(pf1);
        if cf1 == chunk::chunk_of(pf2) {
            unsafe { cf1.as_ref() }.incref();
        }
        if NonNull::new(s.sp).map(chunk::chunk_of) == Some(cf1) {
            s1.sp = pf2.as_ptr().cast();
        } else {
            s1.sp = ptr::null_mut();
        }
        s1.lp = s1.sp;
        s1.mtl = s1.mhd;

        let mut s2 = s;
        s2.mhd = Some(pf2);
        unsafe {
            (*pf1.as_ptr()).mark_succ = None;
            (*pf2.as_ptr()).pred = None;
            (*pf2.as_ptr()).mark_pred = None;
        }
        trace!(at = ?pf2.as_ptr(), "forked stack at marked frame");
        (Self::from_raw(s1), Self::from_raw(s2))
    }

    /// Iterates over frame payloads from the top of the stack to the
    /// bottom (the natural `pred` order).
    pub fn frames(&self) -> Frames<'_, T> {
        Frames {
            curr: self.raw.fp,
            _stack: self,
        }
    }

    /// Double-ended iterator over the marked frames, oldest first going
    /// forward and newest first going backward.
    pub fn marks(&self) -> Marks<'_, T> {
        Marks {
            curr: self.raw.mhd,
            curr_back: self.raw.mtl,
            done: false,
            _stack: self,
        }
    }

    /// Asserts every representation invariant of this descriptor.
    ///
    /// # Panics
    ///
    /// Panics when an invariant does not hold.
    #[track_caller]
    pub fn assert_valid(&self) {
        use alloc::vec::Vec;

        assert_eq!(
            self.raw.mhd.is_none(),
            self.raw.mtl.is_none(),
            "mark head and tail must be null together"
        );

        let mut fwd = Vec::new();
        let mut cur = self.raw.mhd;
        while let Some(m) = cur {
            fwd.push(m);
            cur = unsafe { (*m.as_ptr()).mark_succ };
        }
        let mut bwd = Vec::new();
        let mut cur = self.raw.mtl;
        while let Some(m) = cur {
            bwd.push(m);
            cur = unsafe { (*m.as_ptr()).mark_pred };
        }
        bwd.reverse();
        assert_eq!(fwd, bwd, "mark chain must read the same in both directions");

        let mut call_chain = Vec::new();
        let mut cur = self.raw.fp;
        while let Some(fp) = cur {
            call_chain.push(fp);
            cur = unsafe { (*fp.as_ptr()).pred };
        }
        for m in &fwd {
            assert!(
                call_chain.contains(m),
                "marked frame must lie on the call chain"
            );
            assert_eq!(
                unsafe { (*m.as_ptr()).call },
                CallKind::Async,
                "only async frames belong on the basic mark chain"
            );
        }

        if let (Some(fp), Some(sp)) = (self.raw.fp, NonNull::new(self.raw.sp)) {
            assert_eq!(
                chunk::chunk_of(sp),
                chunk::chunk_of(fp),
                "nursery must live in the top frame's chunk"
            );
        }
    }
}

/// Iterator over a stack's frame payloads, top to bottom.
pub struct Frames<'a, T> {
    curr: Link,
    _stack: &'a Stack<T>,
}

impl<'a, T> Iterator for Frames<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let fp = self.curr.take()?;
        self.curr = unsafe { (*fp.as_ptr()).pred };
        // Safety: the iterator borrows the stack, so the frame outlives it.
        Some(unsafe { &*payload_ptr::<T>(fp) })
    }
}

/// Double-ended iterator over a stack's marked frames.
pub struct Marks<'a, T> {
    curr: Link,
    curr_back: Link,
    done: bool,
    _stack: &'a Stack<T>,
}

impl<'a, T> Iterator for Marks<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let fp = self.curr?;
        if Some(fp) == self.curr_back {
            self.done = true;
        }
        self.curr = unsafe { (*fp.as_ptr()).mark_succ };
        Some(unsafe { &*payload_ptr::<T>(fp) })
    }
}

impl<T> DoubleEndedIterator for Marks<'_, T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let fp = self.curr_back?;
        if Some(fp) == self.curr {
            self.done = true;
        }
        self.curr_back = unsafe { (*fp.as_ptr()).mark_pred };
        Some(unsafe { &*payload_ptr::<T>(fp) })
    }
}
