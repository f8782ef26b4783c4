//! Allocation strategies the codec copies through.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

use crate::buffer::{MEMBER_ALIGNMENT, RelocatableBuffer};

/// Source of memory for chain copies.
///
/// Deallocation mirrors allocation exactly: every pointer handed out is
/// released at most once, with the layout it was requested with.
pub trait ChainAllocator {
    /// Returns `layout.size()` bytes aligned to `layout.align()`, or `None`.
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>>;

    /// Releases memory from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator with the same `layout` and must
    /// not have been released already.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout);
}

/// Arena allocation: individual frees are no-ops, the whole buffer is
/// reclaimed by [`RelocatableBuffer::reset`].
impl ChainAllocator for RelocatableBuffer<'_> {
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.align() > MEMBER_ALIGNMENT {
            return None;
        }
        RelocatableBuffer::allocate(self, layout.size()).ok()
    }

    unsafe fn deallocate(&mut self, _ptr: NonNull<u8>, _layout: Layout) {}
}

/// The process heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl ChainAllocator for HeapAllocator {
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return NonNull::new(ptr::without_provenance_mut(layout.align()));
        }
        // SAFETY: non-zero size.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            // SAFETY: allocated above with this layout, per the caller.
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}

impl<A: ChainAllocator + ?Sized> ChainAllocator for &mut A {
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded contract.
        unsafe { (**self).deallocate(ptr, layout) }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Heap allocator that tracks live allocations and can be told to fail.
    #[derive(Default)]
    pub(crate) struct CountingAllocator {
        pub live: HashMap<usize, Layout>,
        pub allocations: usize,
        pub fail_after: Option<usize>,
    }

    impl CountingAllocator {
        pub(crate) fn failing_after(n: usize) -> Self {
            Self {
                fail_after: Some(n),
                ..Self::default()
            }
        }
    }

    impl ChainAllocator for CountingAllocator {
        fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
            if self.fail_after.is_some_and(|n| self.allocations >= n) {
                return None;
            }
            self.allocations += 1;
            let ptr = HeapAllocator.allocate(layout)?;
            assert!(self.live.insert(ptr.as_ptr().addr(), layout).is_none());
            Some(ptr)
        }

        unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
            let recorded = self
                .live
                .remove(&ptr.as_ptr().addr())
                .expect("double free or foreign pointer");
            assert_eq!(recorded, layout, "freed with a different layout");
            unsafe { HeapAllocator.deallocate(ptr, layout) };
        }
    }

    #[test]
    fn test_heap_allocator_zero_size() {
        let layout = Layout::from_size_align(0, 8).unwrap();
        let ptr = HeapAllocator.allocate(layout).unwrap();
        assert_eq!(ptr.as_ptr().addr() % 8, 0);
        unsafe { HeapAllocator.deallocate(ptr, layout) };
    }

    #[test]
    fn test_buffer_allocator_rejects_over_aligned() {
        #[repr(C, align(8))]
        struct Region([u8; 64]);
        let mut region = Region([0; 64]);
        let mut buf = RelocatableBuffer::new(&mut region.0).unwrap();

        assert!(ChainAllocator::allocate(&mut buf, Layout::from_size_align(8, 16).unwrap()).is_none());
        assert!(ChainAllocator::allocate(&mut buf, Layout::new::<u64>()).is_some());
        assert_eq!(buf.position(), 8);
    }
}
