//! Struct-chain codec: deep copies of linked, tagged structure chains.
//!
//! A chain is a singly linked list of `#[repr(C)]` nodes, each starting with
//! a [`StructureType`] tag and a `next` link. The codec copies a chain through
//! a [`ChainAllocator`] (the RPC arena, or the heap), reporting every pointer
//! slot it writes so the arena's [`FixupLedger`](crate::fixup::FixupLedger)
//! can relocate the copy between address spaces.

mod alloc;
mod copy;
mod event;
mod free;
pub mod types;

use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use thiserror::Error;

pub use self::alloc::{ChainAllocator, HeapAllocator};
pub use self::copy::{CopyMode, RecordPointer, copy_chain};
pub use event::copy_event_into_buffer;
pub use free::free_chain;
pub use types::{BaseInStructure, StructureType, TypedStructure};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("allocation of {requested} bytes failed")]
    OutOfMemory { requested: usize },
    #[error("pointer fixup ledger is full")]
    LedgerFull,
    #[error("chain links back to an earlier node")]
    Cycle,
    #[error("event of {size} bytes does not fit in {capacity} bytes")]
    EventTooLarge { size: usize, capacity: usize },
    #[error("{ty:?} is not a known event structure")]
    UnsupportedEvent { ty: StructureType },
}

/// Copies a chain onto the process heap. Pointers are not recorded.
///
/// # Safety
///
/// See [`copy_chain`].
///
/// # Errors
///
/// See [`copy_chain`].
pub unsafe fn copy_chain_with_malloc(
    head: *const BaseInStructure,
) -> Result<*mut BaseInStructure, CodecError> {
    // SAFETY: forwarded contract.
    unsafe { copy_chain(head, CopyMode::Everything, &mut HeapAllocator, &mut |_| true) }
}

/// Frees a chain from [`copy_chain_with_malloc`].
///
/// # Safety
///
/// See [`free_chain`].
pub unsafe fn free_chain_with_free(head: *const BaseInStructure) {
    // SAFETY: forwarded contract.
    unsafe { free_chain(head, &mut HeapAllocator) }
}

/// Heap copy of a chain, freed on drop.
#[derive(Debug)]
pub struct OwnedChain {
    head: *mut BaseInStructure,
}

impl OwnedChain {
    /// # Safety
    ///
    /// See [`copy_chain`].
    ///
    /// # Errors
    ///
    /// See [`copy_chain`].
    pub unsafe fn copy_from(head: *const BaseInStructure) -> Result<Self, CodecError> {
        Ok(Self {
            // SAFETY: forwarded contract.
            head: unsafe { copy_chain_with_malloc(head)? },
        })
    }

    #[must_use]
    pub fn head(&self) -> *const BaseInStructure {
        self.head
    }

    #[must_use]
    pub fn iter(&self) -> ChainIter<'_> {
        // SAFETY: the copy is well formed and lives as long as self.
        unsafe { ChainIter::new(self.head) }
    }

    /// First node of type `T`.
    #[must_use]
    pub fn find<T: TypedStructure>(&self) -> Option<&T> {
        // SAFETY: as for iter().
        unsafe { find_in_chain::<T>(self.head).map(|p| p.as_ref()) }
    }
}

impl Drop for OwnedChain {
    fn drop(&mut self) {
        // SAFETY: produced by copy_chain_with_malloc, freed only here.
        unsafe { free_chain_with_free(self.head) };
    }
}

/// Brent's cycle detection for a walk along `next` links.
///
/// Feed it every node after the head, in order; it reports the first one
/// that proves the walk is going round in circles.
pub(crate) struct CycleDetector {
    anchor: *const BaseInStructure,
    power: usize,
    steps: usize,
}

impl CycleDetector {
    pub(crate) const fn new(head: *const BaseInStructure) -> Self {
        Self {
            anchor: head,
            power: 1,
            steps: 0,
        }
    }

    pub(crate) fn revisits(&mut self, node: *const BaseInStructure) -> bool {
        if node == self.anchor {
            return true;
        }
        self.steps += 1;
        if self.steps == self.power {
            self.anchor = node;
            self.power *= 2;
            self.steps = 0;
        }
        false
    }
}

/// Iterator over the nodes of a chain.
///
/// A cyclic chain ends the iteration once the cycle is detected; some nodes
/// of the cycle may have been yielded twice by then.
pub struct ChainIter<'a> {
    node: *const BaseInStructure,
    cycle: CycleDetector,
    _chain: PhantomData<&'a BaseInStructure>,
}

impl ChainIter<'_> {
    /// # Safety
    ///
    /// `head` must be null or a well-formed chain that outlives the iterator.
    #[must_use]
    pub unsafe fn new(head: *const BaseInStructure) -> Self {
        Self {
            node: head,
            cycle: CycleDetector::new(head),
            _chain: PhantomData,
        }
    }
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a BaseInStructure;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: guaranteed by the constructor.
        let node = unsafe { self.node.as_ref()? };
        self.node = if !node.next.is_null() && self.cycle.revisits(node.next) {
            ptr::null()
        } else {
            node.next
        };
        Some(node)
    }
}

/// First node of type `T` in the chain at `head`.
///
/// # Safety
///
/// See [`ChainIter::new`].
#[must_use]
pub unsafe fn find_in_chain<T: TypedStructure>(head: *const BaseInStructure) -> Option<NonNull<T>> {
    // SAFETY: forwarded contract.
    unsafe { ChainIter::new(head) }
        .find(|node| node.ty == T::TYPE)
        .map(|node| NonNull::from(node).cast())
}

/// Links `nodes` into a chain in order and returns its head.
///
/// The caller keeps ownership of every node; this only rewrites `next`.
pub fn link_chain(nodes: &mut [&mut BaseInStructure]) -> *const BaseInStructure {
    let mut next = ptr::null();
    for node in nodes.iter_mut().rev() {
        node.next = next;
        next = ptr::from_ref(&**node);
    }
    next
}

#[cfg(test)]
mod tests {
    use super::alloc::tests::CountingAllocator;
    use super::event::copy_event_into;
    use super::types::*;
    use super::*;
    use crate::buffer::RelocatableBuffer;
    use std::ffi::{CStr, CString, c_char, c_void};

    fn base<T: TypedStructure>(node: &mut T) -> &mut BaseInStructure {
        // SAFETY: TypedStructure types start with the base fields.
        unsafe { &mut *ptr::from_mut(node).cast::<BaseInStructure>() }
    }

    fn record_nothing() -> impl FnMut(*const *mut c_void) -> bool {
        |_| true
    }

    #[test]
    fn test_null_chain_copies_to_null() {
        let mut alloc = CountingAllocator::default();
        let copy = unsafe {
            copy_chain(ptr::null(), CopyMode::Everything, &mut alloc, &mut record_nothing())
        }
        .unwrap();
        assert!(copy.is_null());
        assert_eq!(alloc.allocations, 0);
        unsafe { free_chain(copy, &mut alloc) };
    }

    #[test]
    fn test_everything_copies_payloads_and_links() {
        let bytes: Vec<u8> = (0..16).collect();
        let mut payload = BinaryPayload {
            size: bytes.len() as u32,
            data: bytes.as_ptr(),
            ..Default::default()
        };
        let mut session = SessionCreateInfo {
            system_id: 42,
            ..Default::default()
        };
        let head = link_chain(&mut [base(&mut session), base(&mut payload)]);

        let mut alloc = CountingAllocator::default();
        let mut recorded = Vec::new();
        let copy = unsafe {
            copy_chain(head, CopyMode::Everything, &mut alloc, &mut |slot: *const *mut c_void| {
                recorded.push(slot.addr());
                true
            })
        }
        .unwrap();

        let nodes: Vec<_> = unsafe { ChainIter::new(copy) }.collect();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].ty, StructureType::SESSION_CREATE_INFO);
        assert_eq!(nodes[1].ty, StructureType::BINARY_PAYLOAD);

        let session_copy = unsafe { find_in_chain::<SessionCreateInfo>(copy).unwrap().as_ref() };
        assert_eq!(session_copy.system_id, 42);

        let payload_copy = unsafe { find_in_chain::<BinaryPayload>(copy).unwrap().as_ref() };
        assert_ne!(payload_copy.data, bytes.as_ptr());
        let copied = unsafe { std::slice::from_raw_parts(payload_copy.data, 16) };
        assert_eq!(copied, bytes.as_slice());

        // session.next and payload.data
        assert_eq!(recorded.len(), 2);
        assert!(recorded.contains(&(&raw const session_copy.next).addr()));
        assert!(recorded.contains(&(&raw const payload_copy.data).addr()));

        unsafe { free_chain(copy, &mut alloc) };
        assert!(alloc.live.is_empty());
    }

    #[test]
    fn test_only_type_next_zeroes_everything_else() {
        let bytes = [9u8; 8];
        let mut payload = BinaryPayload {
            size: 8,
            data: bytes.as_ptr(),
            ..Default::default()
        };
        let mut props = SystemProperties {
            system_id: 7,
            vendor_id: 99,
            ..Default::default()
        };
        let head = link_chain(&mut [base(&mut props), base(&mut payload)]);

        let mut alloc = CountingAllocator::default();
        let copy = unsafe {
            copy_chain(head, CopyMode::OnlyTypeNext, &mut alloc, &mut record_nothing())
        }
        .unwrap();

        let props_copy = unsafe { find_in_chain::<SystemProperties>(copy).unwrap().as_ref() };
        assert_eq!(props_copy.system_id, 0);
        assert_eq!(props_copy.vendor_id, 0);
        assert!(!props_copy.next.is_null());

        let payload_copy = unsafe { find_in_chain::<BinaryPayload>(copy).unwrap().as_ref() };
        assert_eq!(payload_copy.size, 0);
        assert!(payload_copy.data.is_null());

        unsafe { free_chain(copy, &mut alloc) };
        assert!(alloc.live.is_empty());
    }

    #[test]
    fn test_unknown_type_becomes_header_only() {
        #[repr(C)]
        struct Vendor {
            base: BaseInStructure,
            secret: [u64; 12],
        }
        let mut vendor = Vendor {
            base: BaseInStructure::new(StructureType(1_234_567)),
            secret: [0xff; 12],
        };
        let mut quad = CompositionLayerQuad {
            size: [1.0, 2.0],
            ..Default::default()
        };
        let head = link_chain(&mut [&mut vendor.base, base(&mut quad)]);

        let mut alloc = CountingAllocator::default();
        let copy = unsafe {
            copy_chain(head, CopyMode::Everything, &mut alloc, &mut record_nothing())
        }
        .unwrap();

        let first = unsafe { &*copy };
        assert_eq!(first.ty, StructureType(1_234_567));
        let sizes: Vec<_> = alloc.live.values().map(|l| l.size()).collect();
        assert!(sizes.contains(&size_of::<BaseInStructure>()));
        assert!(!sizes.contains(&size_of::<Vendor>()));

        let quad_copy = unsafe { find_in_chain::<CompositionLayerQuad>(copy).unwrap().as_ref() };
        assert_eq!(quad_copy.size, [1.0, 2.0]);

        unsafe { free_chain(copy, &mut alloc) };
        assert!(alloc.live.is_empty());
    }

    #[test]
    fn test_nested_strings_and_layers() {
        let names: Vec<CString> = ["XR_layer_a", "XR_layer_b"]
            .iter()
            .map(|s| CString::new(*s).unwrap())
            .collect();
        let name_ptrs: Vec<*const c_char> = names.iter().map(|s| s.as_ptr()).collect();
        let mut instance = InstanceCreateInfo {
            enabled_api_layer_count: 2,
            enabled_api_layer_names: name_ptrs.as_ptr(),
            ..Default::default()
        };

        let mut quad_a = CompositionLayerQuad {
            swapchain: 1,
            ..Default::default()
        };
        let mut quad_b = CompositionLayerQuad {
            swapchain: 2,
            ..Default::default()
        };
        let layers = [base(&mut quad_a) as *const _, base(&mut quad_b) as *const _];
        let mut frame = FrameEndInfo {
            layer_count: 2,
            layers: layers.as_ptr(),
            ..Default::default()
        };
        let head = link_chain(&mut [base(&mut instance), base(&mut frame)]);

        let mut alloc = CountingAllocator::default();
        let copy = unsafe {
            copy_chain(head, CopyMode::Everything, &mut alloc, &mut record_nothing())
        }
        .unwrap();

        let instance_copy = unsafe { find_in_chain::<InstanceCreateInfo>(copy).unwrap().as_ref() };
        assert_ne!(instance_copy.enabled_api_layer_names, name_ptrs.as_ptr());
        let second = unsafe { CStr::from_ptr(*instance_copy.enabled_api_layer_names.add(1)) };
        assert_eq!(second.to_str().unwrap(), "XR_layer_b");
        assert!(instance_copy.enabled_extension_names.is_null());

        let frame_copy = unsafe { find_in_chain::<FrameEndInfo>(copy).unwrap().as_ref() };
        let layer_b = unsafe {
            find_in_chain::<CompositionLayerQuad>(*frame_copy.layers.add(1))
                .unwrap()
                .as_ref()
        };
        assert_eq!(layer_b.swapchain, 2);

        unsafe { free_chain(copy, &mut alloc) };
        assert!(alloc.live.is_empty());
    }

    #[test]
    fn test_allocation_failure_releases_partial_copy() {
        let bytes = [1u8; 32];
        let mut payload = BinaryPayload {
            size: 32,
            data: bytes.as_ptr(),
            ..Default::default()
        };
        let mut session = SessionCreateInfo::default();
        let head = link_chain(&mut [base(&mut session), base(&mut payload)]);

        for fail_after in 0..3 {
            let mut alloc = CountingAllocator::failing_after(fail_after);
            let result = unsafe {
                copy_chain(head, CopyMode::Everything, &mut alloc, &mut record_nothing())
            };
            assert!(matches!(result, Err(CodecError::OutOfMemory { .. })));
            assert!(alloc.live.is_empty(), "leaked after {fail_after} allocations");
        }
    }

    #[test]
    fn test_ledger_refusal_fails_copy() {
        let mut a = SessionCreateInfo::default();
        let mut b = SessionCreateInfo::default();
        let head = link_chain(&mut [base(&mut a), base(&mut b)]);

        let mut alloc = CountingAllocator::default();
        let result = unsafe { copy_chain(head, CopyMode::Everything, &mut alloc, &mut |_| false) };
        assert_eq!(result, Err(CodecError::LedgerFull));
        assert!(alloc.live.is_empty());
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut a = SessionCreateInfo::default();
        let mut b = SessionCreateInfo::default();
        b.next = base(&mut a) as *const _;
        a.next = base(&mut b) as *const _;

        let mut alloc = CountingAllocator::default();
        let result = unsafe {
            copy_chain(a.as_base(), CopyMode::Everything, &mut alloc, &mut record_nothing())
        };
        assert_eq!(result, Err(CodecError::Cycle));
        assert!(alloc.live.is_empty());
    }

    #[test]
    fn test_self_loop_is_rejected_mid_chain() {
        let mut head = SessionCreateInfo::default();
        let mut tail = SystemProperties::default();
        tail.next = base(&mut tail) as *const _;
        head.next = base(&mut tail) as *const _;

        let mut alloc = CountingAllocator::default();
        let result = unsafe {
            copy_chain(head.as_base(), CopyMode::OnlyTypeNext, &mut alloc, &mut record_nothing())
        };
        assert_eq!(result, Err(CodecError::Cycle));
        assert!(alloc.live.is_empty());
    }

    #[test]
    fn test_long_chain_copies_completely() {
        let mut nodes: Vec<SessionCreateInfo> = (0..200)
            .map(|i| SessionCreateInfo {
                system_id: i,
                ..Default::default()
            })
            .collect();
        let mut bases: Vec<&mut BaseInStructure> = nodes.iter_mut().map(|n| base(n)).collect();
        let head = link_chain(&mut bases);

        let mut alloc = CountingAllocator::default();
        let copy = unsafe { copy_chain(head, CopyMode::Everything, &mut alloc, &mut record_nothing()) }.unwrap();
        let ids: Vec<u64> = unsafe { ChainIter::new(copy) }
            .map(|node| {
                assert_eq!(node.ty, StructureType::SESSION_CREATE_INFO);
                unsafe { &*ptr::from_ref(node).cast::<SessionCreateInfo>() }.system_id
            })
            .collect();
        assert_eq!(ids, (0..200).collect::<Vec<u64>>());
        assert_eq!(alloc.live.len(), 200);
        unsafe { free_chain(copy, &mut alloc) };
        assert!(alloc.live.is_empty());
    }

    #[test]
    fn test_find_in_cyclic_chain_terminates() {
        let mut a = SessionCreateInfo::default();
        let mut b = BinaryPayload::default();
        let mut c = SessionCreateInfo::default();
        a.next = base(&mut b) as *const _;
        b.next = base(&mut c) as *const _;
        c.next = base(&mut b) as *const _;

        assert!(unsafe { find_in_chain::<SystemProperties>(a.as_base()) }.is_none());
        assert!(unsafe { find_in_chain::<BinaryPayload>(a.as_base()) }.is_some());
        assert!(unsafe { ChainIter::new(a.as_base()) }.count() < 16);
    }

    #[test]
    fn test_copy_into_arena_exhaustion() {
        #[repr(C, align(8))]
        struct Region([u8; 64]);
        let mut region = Region([0; 64]);
        let mut buf = RelocatableBuffer::new(&mut region.0).unwrap();

        let props = SystemProperties::default();
        let result = unsafe {
            copy_chain(props.as_base(), CopyMode::OnlyTypeNext, &mut buf, &mut record_nothing())
        };
        assert!(matches!(result, Err(CodecError::OutOfMemory { .. })));
        assert_eq!(buf.position(), 0);
    }

    #[test]
    fn test_owned_chain_heap_round_trip() {
        let mut lost = EventDataEventsLost {
            lost_event_count: 3,
            ..Default::default()
        };
        let owned = unsafe { OwnedChain::copy_from(base(&mut lost)) }.unwrap();
        assert_ne!(owned.head(), lost.as_base());
        assert_eq!(owned.find::<EventDataEventsLost>().unwrap().lost_event_count, 3);
        assert!(owned.find::<SessionCreateInfo>().is_none());
        assert_eq!(owned.iter().count(), 1);
    }

    #[test]
    fn test_event_copy_into_buffer() {
        let mut next = SessionCreateInfo::default();
        let mut changed = EventDataSessionStateChanged {
            session: 5,
            state: 2,
            next: base(&mut next) as *const _,
            ..Default::default()
        };
        let mut buffer = EventDataBuffer::default();
        unsafe { copy_event_into_buffer(NonNull::from(base(&mut changed)), &mut buffer) }.unwrap();

        assert_eq!(buffer.ty, StructureType::EVENT_DATA_SESSION_STATE_CHANGED);
        assert!(buffer.next.is_null());
        let view = unsafe { &*(&raw const buffer).cast::<EventDataSessionStateChanged>() };
        assert_eq!((view.session, view.state), (5, 2));
    }

    #[test]
    fn test_event_copy_rejects_oversized_and_unknown() {
        let mut changed = EventDataSessionStateChanged::default();
        let mut small = [0u64; 2];
        let result = unsafe {
            copy_event_into(
                NonNull::from(base(&mut changed)),
                NonNull::from(&mut small).cast(),
                size_of_val(&small),
            )
        };
        assert_eq!(
            result,
            Err(CodecError::EventTooLarge {
                size: size_of::<EventDataSessionStateChanged>(),
                capacity: 16
            })
        );

        let mut session = SessionCreateInfo::default();
        let mut buffer = EventDataBuffer::default();
        let result = unsafe { copy_event_into_buffer(NonNull::from(base(&mut session)), &mut buffer) };
        assert_eq!(
            result,
            Err(CodecError::UnsupportedEvent {
                ty: StructureType::SESSION_CREATE_INFO
            })
        );
    }
}
