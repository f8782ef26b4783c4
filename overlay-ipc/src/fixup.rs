//! Pointer relocation bookkeeping for chains serialized into shared memory.
//!
//! A serialized chain contains pointers (`next` links, payload pointers) that
//! are only meaningful in the address space that wrote them. The ledger
//! remembers *where* those pointer slots are, as byte offsets from the segment
//! base, so that the pointers themselves can be rewritten to base-relative
//! offsets before the segment changes hands and back to absolute addresses in
//! the receiving process.
//!
//! ```text
//!  segment base ─┐
//!                ▼
//!                ┌────────┬──────────────┬──────────────┐
//!                │ header │ node A       │ node B       │
//!                │ ledger │ next ────────┼─► ...        │
//!                └────────┴──────────────┴──────────────┘
//!  ledger.offsets = [ offset_of(A.next), ... ]
//! ```

use std::ffi::c_void;
use std::ptr;

use thiserror::Error;

/// Maximum number of pointer slots one message may carry.
pub const MAX_POINTER_FIXUPS: usize = 128;

const SLOT_SIZE: usize = size_of::<*mut c_void>();

/// A recorded offset that cannot name a pointer slot in the region.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("fixup offset {offset:#x} does not name an aligned slot in a {len}-byte region")]
pub struct FixupError {
    pub offset: u64,
    pub len: usize,
}

/// Bounded list of pointer-slot offsets, laid out for shared memory.
#[repr(C)]
#[derive(Debug)]
pub struct FixupLedger {
    count: u32,
    _reserved: u32,
    offsets: [u64; MAX_POINTER_FIXUPS],
}

// SAFETY: repr(C) over integers; zero means empty.
unsafe impl crate::ipc::shmem::SharedMemorySafe for FixupLedger {}

impl Default for FixupLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl FixupLedger {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: 0,
            _reserved: 0,
            offsets: [0; MAX_POINTER_FIXUPS],
        }
    }

    /// Records `slot` as a pointer to relocate.
    ///
    /// Returns `false`, leaving the ledger unchanged, when it is full or
    /// `slot` lies below `base`. Callers treat `false` as a failed
    /// serialization of the whole message.
    #[must_use]
    pub fn record(&mut self, base: *const u8, slot: *const *mut c_void) -> bool {
        let len = self.len();
        if len >= MAX_POINTER_FIXUPS {
            return false;
        }
        let Some(offset) = slot.addr().checked_sub(base.addr()) else {
            return false;
        };
        self.offsets[len] = offset as u64;
        self.count += 1;
        true
    }

    /// Rewrites every recorded non-null pointer as an offset from `base`.
    ///
    /// Every offset is checked against the `len`-byte region first; if any
    /// is out of bounds or misaligned nothing is rewritten.
    ///
    /// # Errors
    ///
    /// [`FixupError`] for the first offset that does not fit.
    ///
    /// # Safety
    ///
    /// `base..base + len` must be valid for reads and writes and the
    /// recorded pointers must currently be absolute. Calling this twice
    /// without an intervening [`make_absolute`](Self::make_absolute)
    /// corrupts them.
    pub unsafe fn make_relative(&self, base: *mut u8, len: usize) -> Result<(), FixupError> {
        for slot in self.slots(base, len)? {
            // SAFETY: slot lies inside the region, which the caller vouches for.
            unsafe {
                let value = slot.read();
                if !value.is_null() {
                    let offset = value.addr().wrapping_sub(base.addr());
                    slot.write(ptr::without_provenance_mut(offset));
                }
            }
        }
        Ok(())
    }

    /// Rewrites every recorded non-null offset as an address in the mapping
    /// starting at `base`. Exact inverse of [`make_relative`](Self::make_relative).
    ///
    /// # Errors
    ///
    /// As for `make_relative`.
    ///
    /// # Safety
    ///
    /// As for `make_relative`, with the pointers currently relative.
    pub unsafe fn make_absolute(&self, base: *mut u8, len: usize) -> Result<(), FixupError> {
        for slot in self.slots(base, len)? {
            // SAFETY: as above.
            unsafe {
                let value = slot.read();
                if !value.is_null() {
                    slot.write(base.wrapping_add(value.addr()).cast());
                }
            }
        }
        Ok(())
    }

    fn slots(
        &self,
        base: *mut u8,
        len: usize,
    ) -> Result<impl Iterator<Item = *mut *mut c_void> + '_, FixupError> {
        for &offset in self.offsets() {
            let fits = usize::try_from(offset)
                .ok()
                .and_then(|start| start.checked_add(SLOT_SIZE))
                .is_some_and(|end| end <= len);
            if !fits || offset % SLOT_SIZE as u64 != 0 {
                return Err(FixupError { offset, len });
            }
        }
        Ok(self
            .offsets()
            .iter()
            .map(move |&off| base.wrapping_add(off as usize).cast::<*mut c_void>()))
    }

    /// Forgets every recorded slot.
    pub fn clear(&mut self) {
        self.count = 0;
    }

    /// Forgets every slot recorded after the first `len`.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len() {
            self.count = len as u32;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        (self.count as usize).min(MAX_POINTER_FIXUPS)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() == MAX_POINTER_FIXUPS
    }

    /// Recorded offsets, oldest first.
    #[must_use]
    pub fn offsets(&self) -> &[u64] {
        &self.offsets[..self.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Arena {
        a: *mut c_void,
        b: *mut c_void,
        null: *mut c_void,
        data: [u64; 4],
    }

    fn arena() -> Box<Arena> {
        let mut arena = Box::new(Arena {
            a: ptr::null_mut(),
            b: ptr::null_mut(),
            null: ptr::null_mut(),
            data: [1, 2, 3, 4],
        });
        arena.a = (&raw mut arena.data[0]).cast();
        arena.b = (&raw mut arena.data[3]).cast();
        arena
    }

    fn record_all(ledger: &mut FixupLedger, arena: &mut Arena) {
        let base = (&raw mut *arena).cast::<u8>();
        assert!(ledger.record(base, &raw const arena.a));
        assert!(ledger.record(base, &raw const arena.b));
        assert!(ledger.record(base, &raw const arena.null));
    }

    #[test]
    fn test_relative_then_absolute_restores_pointers() {
        let mut arena = arena();
        let (a, b) = (arena.a, arena.b);
        let mut ledger = FixupLedger::new();
        record_all(&mut ledger, &mut arena);

        let base = (&raw mut *arena).cast::<u8>();
        unsafe { ledger.make_relative(base, size_of::<Arena>()) }.unwrap();
        assert_eq!(arena.a.addr(), std::mem::offset_of!(Arena, data));
        assert_eq!(arena.b.addr(), std::mem::offset_of!(Arena, data) + 24);
        assert!(arena.null.is_null());

        unsafe { ledger.make_absolute(base, size_of::<Arena>()) }.unwrap();
        assert_eq!(arena.a, a);
        assert_eq!(arena.b, b);
        assert!(arena.null.is_null());
        // SAFETY: relocated back into the live arena.
        assert_eq!(unsafe { *arena.b.cast::<u64>() }, 4);
    }

    #[test]
    fn test_relocates_into_a_different_base() {
        let mut src = arena();
        let mut ledger = FixupLedger::new();
        record_all(&mut ledger, &mut src);
        unsafe { ledger.make_relative((&raw mut *src).cast(), size_of::<Arena>()) }.unwrap();

        // Byte-copy the relative image elsewhere, as a second mapping would see it.
        let mut dst = Box::new(Arena {
            a: src.a,
            b: src.b,
            null: src.null,
            data: src.data,
        });
        unsafe { ledger.make_absolute((&raw mut *dst).cast(), size_of::<Arena>()) }.unwrap();
        assert_eq!(dst.a, (&raw mut dst.data[0]).cast());
        assert_eq!(unsafe { *dst.b.cast::<u64>() }, 4);
    }

    #[test]
    fn test_ledger_is_bounded() {
        let mut slots = vec![ptr::null_mut::<c_void>(); MAX_POINTER_FIXUPS + 1];
        let base = slots.as_mut_ptr().cast::<u8>();
        let mut ledger = FixupLedger::new();

        for slot in &slots[..MAX_POINTER_FIXUPS] {
            assert!(ledger.record(base, slot));
        }
        assert!(ledger.is_full());
        assert!(!ledger.record(base, &slots[MAX_POINTER_FIXUPS]));
        assert_eq!(ledger.len(), MAX_POINTER_FIXUPS);
        assert_eq!(ledger.offsets()[1], size_of::<*mut c_void>() as u64);

        ledger.truncate(2);
        assert_eq!(ledger.len(), 2);
        ledger.clear();
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_slot_below_base_is_rejected() {
        let slots = [ptr::null_mut::<c_void>(); 2];
        let mut ledger = FixupLedger::new();
        let base = (&raw const slots[1]).cast::<u8>();
        assert!(!ledger.record(base, &raw const slots[0]));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_empty_ledger_is_a_no_op() {
        let mut arena = arena();
        let a = arena.a;
        let ledger = FixupLedger::new();
        unsafe { ledger.make_relative((&raw mut *arena).cast(), size_of::<Arena>()) }.unwrap();
        assert_eq!(arena.a, a);
    }

    #[test]
    fn test_offset_past_region_end_is_refused() {
        let mut arena = arena();
        let (a, b) = (arena.a, arena.b);
        let mut ledger = FixupLedger::new();
        record_all(&mut ledger, &mut arena);
        let base = (&raw mut *arena).cast::<u8>();

        // A region that ends just before `arena.b`'s slot ends.
        let short = std::mem::offset_of!(Arena, b) + 4;
        let err = unsafe { ledger.make_relative(base, short) }.unwrap_err();
        assert_eq!(err.offset, std::mem::offset_of!(Arena, b) as u64);
        assert_eq!(err.len, short);
        // Nothing was rewritten, not even the slot that fit.
        assert_eq!((arena.a, arena.b), (a, b));
        assert!(unsafe { ledger.make_absolute(base, 0) }.is_err());
    }

    #[test]
    fn test_corrupt_shared_offsets_are_refused() {
        let mut arena = arena();
        let a = arena.a;
        let base = (&raw mut *arena).cast::<u8>();
        let len = size_of::<Arena>();

        for offset in [u64::MAX, len as u64, 3] {
            let mut ledger = FixupLedger::new();
            ledger.count = 1;
            ledger.offsets[0] = offset;
            assert_eq!(
                unsafe { ledger.make_absolute(base, len) },
                Err(FixupError { offset, len })
            );
        }
        assert_eq!(arena.a, a);
    }
}
