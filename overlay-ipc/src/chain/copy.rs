use std::alloc::Layout;
use std::ffi::{CStr, c_char, c_void};
use std::ptr::{self, NonNull};

use super::alloc::ChainAllocator;
use super::types::*;
use super::{CodecError, CycleDetector};
use crate::trace::trace;

/// How much of each node to carry across.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Full deep copy. For chains the callee reads.
    Everything,
    /// Zero-filled nodes with only `ty` and `next` set. For chains the
    /// callee writes into; only their shape crosses the boundary.
    OnlyTypeNext,
}

/// Receives the address of each pointer slot written into the copy.
///
/// Returning `false` aborts the copy with [`CodecError::LedgerFull`].
pub type RecordPointer<'r> = dyn FnMut(*const *mut c_void) -> bool + 'r;

/// Deep-copies the chain at `head` through `alloc`.
///
/// Returns the head of the copy (null for a null `head`). Each node type is
/// copied by a routine that knows its out-of-line fields; unknown types
/// become a bare `ty`/`next` node. Every non-null pointer slot of the copy
/// is passed to `record`.
///
/// On failure everything allocated so far is released through `alloc`.
///
/// # Safety
///
/// `head` must be null or point to a well-formed chain: every `next`,
/// payload pointer and nested chain valid for reads, strings
/// NUL-terminated, array lengths matching their counts.
///
/// # Errors
///
/// [`CodecError::OutOfMemory`], [`CodecError::LedgerFull`] or
/// [`CodecError::Cycle`] when a `next` link (at any nesting level) leads
/// back into the same chain.
pub unsafe fn copy_chain<A: ChainAllocator + ?Sized>(
    head: *const BaseInStructure,
    mode: CopyMode,
    alloc: &mut A,
    record: &mut RecordPointer<'_>,
) -> Result<*mut BaseInStructure, CodecError> {
    let mut copier = Copier {
        mode,
        alloc,
        record,
        allocations: Vec::new(),
    };
    // SAFETY: forwarded contract.
    match unsafe { copier.chain(head) } {
        Ok(copy) => Ok(copy),
        Err(err) => {
            trace!(?err, allocations = copier.allocations.len(), "chain copy failed");
            copier.release_all();
            Err(err)
        }
    }
}

struct Copier<'a, 'r, A: ChainAllocator + ?Sized> {
    mode: CopyMode,
    alloc: &'a mut A,
    record: &'a mut RecordPointer<'r>,
    /// Everything allocated so far, released on failure.
    allocations: Vec<(NonNull<u8>, Layout)>,
}

impl<A: ChainAllocator + ?Sized> Copier<'_, '_, A> {
    fn release_all(&mut self) {
        for (ptr, layout) in self.allocations.drain(..).rev() {
            // SAFETY: each entry was allocated once by this allocator.
            unsafe { self.alloc.deallocate(ptr, layout) };
        }
    }

    fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, CodecError> {
        let ptr = self.alloc.allocate(layout).ok_or(CodecError::OutOfMemory {
            requested: layout.size(),
        })?;
        self.allocations.push((ptr, layout));
        Ok(ptr)
    }

    fn record<T>(&mut self, slot: *const *const T) -> Result<(), CodecError> {
        if (self.record)(slot.cast()) {
            Ok(())
        } else {
            Err(CodecError::LedgerFull)
        }
    }

    /// Writes `value` into `slot` and records it when non-null.
    ///
    /// # Safety
    ///
    /// `slot` must be valid for writes.
    unsafe fn link<T>(&mut self, slot: *mut *const T, value: *const T) -> Result<(), CodecError> {
        // SAFETY: caller contract.
        unsafe { slot.write(value) };
        if value.is_null() {
            Ok(())
        } else {
            self.record(slot.cast_const())
        }
    }

    unsafe fn chain(&mut self, head: *const BaseInStructure) -> Result<*mut BaseInStructure, CodecError> {
        let mut copy_head: *mut BaseInStructure = ptr::null_mut();
        let mut tail: *mut BaseInStructure = ptr::null_mut();
        let mut src = head;
        let mut cycle = CycleDetector::new(head);

        while !src.is_null() {
            // SAFETY: src is a valid node per the caller.
            let node = unsafe { self.node(src)? };
            if tail.is_null() {
                copy_head = node;
            } else {
                // SAFETY: tail is a node we allocated.
                unsafe { self.link(&raw mut (*tail).next, node.cast_const())? };
            }
            tail = node;
            // SAFETY: as above.
            src = unsafe { (*src).next };
            if !src.is_null() && cycle.revisits(src) {
                return Err(CodecError::Cycle);
            }
        }
        Ok(copy_head)
    }

    /// Copies one node; the copy's `next` is null.
    unsafe fn node(&mut self, src: *const BaseInStructure) -> Result<*mut BaseInStructure, CodecError> {
        // SAFETY: all arms read src as the type its tag names, per the caller.
        unsafe {
            let node: *mut BaseInStructure = match (*src).ty {
                StructureType::INSTANCE_CREATE_INFO => self.instance_create_info(src.cast())?.cast(),
                StructureType::BINARY_PAYLOAD => self.binary_payload(src.cast())?.cast(),
                StructureType::FRAME_END_INFO => self.frame_end_info(src.cast())?.cast(),
                StructureType::SESSION_CREATE_INFO => self.plain::<SessionCreateInfo>(src)?.cast(),
                StructureType::COMPOSITION_LAYER_QUAD => {
                    self.plain::<CompositionLayerQuad>(src)?.cast()
                }
                StructureType::SYSTEM_PROPERTIES => self.plain::<SystemProperties>(src)?.cast(),
                StructureType::EVENT_DATA_BUFFER => self.plain::<EventDataBuffer>(src)?.cast(),
                StructureType::EVENT_DATA_EVENTS_LOST => self.plain::<EventDataEventsLost>(src)?.cast(),
                StructureType::EVENT_DATA_SESSION_STATE_CHANGED => {
                    self.plain::<EventDataSessionStateChanged>(src)?.cast()
                }
                ty => {
                    trace!(?ty, "copying unknown structure as type/next only");
                    let node = self
                        .allocate(Layout::new::<BaseInStructure>())?
                        .cast::<BaseInStructure>();
                    node.write(BaseInStructure::new(ty));
                    node.as_ptr()
                }
            };
            Ok(node)
        }
    }

    /// Copies a node without out-of-line fields (or only the header of
    /// any node in [`CopyMode::OnlyTypeNext`]).
    unsafe fn plain<T: TypedStructure>(&mut self, src: *const BaseInStructure) -> Result<*mut T, CodecError> {
        let dst = self.allocate(Layout::new::<T>())?;
        // SAFETY: dst is a fresh allocation sized for T; src is a T per its tag.
        unsafe {
            match self.mode {
                CopyMode::Everything => {
                    ptr::copy_nonoverlapping(src.cast::<u8>(), dst.as_ptr(), size_of::<T>());
                }
                CopyMode::OnlyTypeNext => {
                    ptr::write_bytes(dst.as_ptr(), 0, size_of::<T>());
                    dst.cast::<BaseInStructure>().as_mut().ty = T::TYPE;
                }
            }
            dst.cast::<BaseInStructure>().as_mut().next = ptr::null();
        }
        Ok(dst.as_ptr().cast())
    }

    unsafe fn instance_create_info(
        &mut self,
        src: *const InstanceCreateInfo,
    ) -> Result<*mut InstanceCreateInfo, CodecError> {
        // SAFETY: src is valid per the caller; dst was just allocated.
        unsafe {
            let dst = self.plain::<InstanceCreateInfo>(src.cast())?;
            if self.mode == CopyMode::Everything {
                let layers = self.string_array((*src).enabled_api_layer_count, (*src).enabled_api_layer_names)?;
                self.link(&raw mut (*dst).enabled_api_layer_names, layers)?;
                let extensions =
                    self.string_array((*src).enabled_extension_count, (*src).enabled_extension_names)?;
                self.link(&raw mut (*dst).enabled_extension_names, extensions)?;
            }
            Ok(dst)
        }
    }

    unsafe fn binary_payload(&mut self, src: *const BinaryPayload) -> Result<*mut BinaryPayload, CodecError> {
        // SAFETY: src is valid per the caller; dst was just allocated.
        unsafe {
            let dst = self.plain::<BinaryPayload>(src.cast())?;
            if self.mode == CopyMode::Everything {
                let size = (*src).size as usize;
                let data = if size == 0 || (*src).data.is_null() {
                    ptr::null()
                } else {
                    let bytes = self.allocate(byte_layout(size)?)?;
                    ptr::copy_nonoverlapping((*src).data, bytes.as_ptr(), size);
                    bytes.as_ptr().cast_const()
                };
                self.link(&raw mut (*dst).data, data)?;
            }
            Ok(dst)
        }
    }

    unsafe fn frame_end_info(&mut self, src: *const FrameEndInfo) -> Result<*mut FrameEndInfo, CodecError> {
        // SAFETY: src is valid per the caller; dst and the array were just allocated.
        unsafe {
            let dst = self.plain::<FrameEndInfo>(src.cast())?;
            if self.mode != CopyMode::Everything {
                return Ok(dst);
            }
            let count = (*src).layer_count as usize;
            let layers = (*src).layers;
            if count == 0 || layers.is_null() {
                (*dst).layers = ptr::null();
                return Ok(dst);
            }
            let array = self
                .allocate(pointer_array_layout::<BaseInStructure>(count)?)?
                .cast::<*const BaseInStructure>();
            for i in 0..count {
                let layer = self.chain(*layers.add(i))?;
                self.link(array.as_ptr().add(i), layer.cast_const())?;
            }
            self.link(&raw mut (*dst).layers, array.as_ptr().cast_const())?;
            Ok(dst)
        }
    }

    /// Copies `count` C strings and the array pointing at them.
    unsafe fn string_array(
        &mut self,
        count: u32,
        src: *const *const c_char,
    ) -> Result<*const *const c_char, CodecError> {
        let count = count as usize;
        if count == 0 || src.is_null() {
            return Ok(ptr::null());
        }
        // SAFETY: src holds count string pointers per the caller.
        unsafe {
            let array = self
                .allocate(pointer_array_layout::<c_char>(count)?)?
                .cast::<*const c_char>();
            for i in 0..count {
                let string = self.string(*src.add(i))?;
                self.link(array.as_ptr().add(i), string)?;
            }
            Ok(array.as_ptr().cast_const())
        }
    }

    unsafe fn string(&mut self, src: *const c_char) -> Result<*const c_char, CodecError> {
        if src.is_null() {
            return Ok(ptr::null());
        }
        // SAFETY: NUL-terminated per the caller.
        let bytes = unsafe { CStr::from_ptr(src) }.to_bytes_with_nul();
        let dst = self.allocate(byte_layout(bytes.len())?)?;
        // SAFETY: dst was sized for bytes.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len()) };
        Ok(dst.as_ptr().cast_const().cast())
    }
}

pub(super) fn byte_layout(size: usize) -> Result<Layout, CodecError> {
    Layout::array::<u8>(size).map_err(|_| CodecError::OutOfMemory { requested: size })
}

pub(super) fn pointer_array_layout<T>(count: usize) -> Result<Layout, CodecError> {
    Layout::array::<*const T>(count).map_err(|_| CodecError::OutOfMemory {
        requested: count.saturating_mul(size_of::<*const T>()),
    })
}
