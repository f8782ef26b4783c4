//! Fixed-capacity bump arena used as the payload region of an RPC segment.
//!
//! Every allocation is padded to [`MEMBER_ALIGNMENT`] so a structure never
//! straddles an alignment boundary, whichever process lays it out. The base
//! must itself be aligned; [`RelocatableBuffer::new`] rejects a region that
//! is not.

use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};

use thiserror::Error;

/// Alignment (and padding granularity) of every allocation.
pub const MEMBER_ALIGNMENT: usize = 8;

/// Rounds `n` up to the next multiple of [`MEMBER_ALIGNMENT`].
///
/// `None` when the rounded value overflows.
#[must_use]
pub const fn pad(n: usize) -> Option<usize> {
    n.checked_next_multiple_of(MEMBER_ALIGNMENT)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer exhausted: requested {requested} bytes, {remaining} remaining")]
    Capacity { requested: usize, remaining: usize },
    #[error("buffer base {addr:#x} is not 8-byte aligned")]
    Misaligned { addr: usize },
}

/// Bump allocator over a borrowed byte region.
///
/// The cursor only moves forward, except through [`reset`](Self::reset);
/// individual allocations are never released.
#[derive(Debug)]
pub struct RelocatableBuffer<'a> {
    base: NonNull<u8>,
    capacity: usize,
    cursor: usize,
    _region: PhantomData<&'a mut [u8]>,
}

// SAFETY: the buffer is a unique borrow of its region, like &mut [u8].
unsafe impl Send for RelocatableBuffer<'_> {}

impl<'a> RelocatableBuffer<'a> {
    /// Wraps `region`. The cursor starts at zero.
    ///
    /// # Errors
    ///
    /// [`BufferError::Misaligned`] when the region does not start on an
    /// 8-byte boundary.
    pub fn new(region: &'a mut [u8]) -> Result<Self, BufferError> {
        let capacity = region.len();
        let base = NonNull::from(region).cast::<u8>();
        if base.as_ptr().addr() % MEMBER_ALIGNMENT != 0 {
            return Err(BufferError::Misaligned {
                addr: base.as_ptr().addr(),
            });
        }
        Ok(Self {
            base,
            capacity,
            cursor: 0,
            _region: PhantomData,
        })
    }

    /// Wraps a raw region.
    ///
    /// # Safety
    ///
    /// `base` must be 8-byte aligned and valid for reads and writes of
    /// `capacity` bytes for `'a`, and nothing else may access the region
    /// through another path while the buffer is alive.
    #[must_use]
    pub unsafe fn from_raw_parts(base: NonNull<u8>, capacity: usize) -> Self {
        debug_assert_eq!(base.as_ptr().addr() % MEMBER_ALIGNMENT, 0);
        Self {
            base,
            capacity,
            cursor: 0,
            _region: PhantomData,
        }
    }

    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes consumed so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.cursor
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.cursor
    }

    /// Rewinds to the start. Contents are left as they are.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Moves the cursor to `position`.
    ///
    /// # Errors
    ///
    /// [`BufferError::Capacity`] when `position` lies past the end.
    pub fn seek(&mut self, position: usize) -> Result<(), BufferError> {
        if position > self.capacity {
            return Err(BufferError::Capacity {
                requested: position,
                remaining: self.capacity,
            });
        }
        self.cursor = position;
        Ok(())
    }

    /// Reserves `size` bytes (padded) and returns their start.
    ///
    /// # Errors
    ///
    /// [`BufferError::Capacity`] when the padded size does not fit; the
    /// cursor does not move.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, BufferError> {
        let padded = pad(size)
            .filter(|&p| p <= self.remaining())
            .ok_or(BufferError::Capacity {
                requested: size,
                remaining: self.remaining(),
            })?;
        // SAFETY: cursor + padded <= capacity, so the offset stays in the region.
        let ptr = unsafe { self.base.add(self.cursor) };
        self.cursor += padded;
        Ok(ptr)
    }

    /// Copies `bytes` at the cursor and advances past them.
    ///
    /// # Errors
    ///
    /// [`BufferError::Capacity`] when they do not fit; nothing is written.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let dst = self.allocate(bytes.len())?;
        // SAFETY: dst has room for bytes.len() bytes and cannot overlap a
        // shared borrow passed in by the caller while we hold &mut self.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len()) };
        Ok(())
    }

    /// Copies `out.len()` bytes from the cursor and advances past them.
    ///
    /// # Panics
    ///
    /// Reading past the end means both sides disagree about the message
    /// layout, which is unrecoverable.
    pub fn read(&mut self, out: &mut [u8]) {
        let src = match self.allocate(out.len()) {
            Ok(src) => src,
            Err(err) => panic!("message framing error: {err}"),
        };
        // SAFETY: src has out.len() readable bytes.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), out.as_mut_ptr(), out.len()) };
    }

    /// Moves `value` into the buffer and returns where it landed.
    ///
    /// # Errors
    ///
    /// [`BufferError::Capacity`] when it does not fit.
    pub fn write_value<T: Copy>(&mut self, value: T) -> Result<NonNull<T>, BufferError> {
        const { assert!(align_of::<T>() <= MEMBER_ALIGNMENT) };
        let dst = self.allocate(size_of::<T>())?.cast::<T>();
        // SAFETY: dst is aligned (8-aligned base, 8-padded cursor) and sized for T.
        unsafe { dst.write(value) };
        Ok(dst)
    }

    /// Reads a `T` at the cursor and advances past it.
    ///
    /// # Safety
    ///
    /// The bytes at the cursor must be a valid `T`.
    ///
    /// # Panics
    ///
    /// On reading past the end, like [`read`](Self::read).
    pub unsafe fn read_value<T: Copy>(&mut self) -> T {
        let src = self.get_and_advance::<T>();
        // SAFETY: aligned, in bounds, and valid per the caller.
        unsafe { src.read() }
    }

    /// Returns a pointer to the `T` at the cursor and advances past it.
    ///
    /// # Panics
    ///
    /// On reading past the end, like [`read`](Self::read).
    pub fn get_and_advance<T>(&mut self) -> NonNull<T> {
        const { assert!(align_of::<T>() <= MEMBER_ALIGNMENT) };
        match self.allocate(size_of::<T>()) {
            Ok(ptr) => ptr.cast(),
            Err(err) => panic!("message framing error: {err}"),
        }
    }

    /// True when `ptr` points into this buffer's region.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.base.as_ptr().addr();
        (start..start + self.capacity).contains(&ptr.addr())
    }
}
