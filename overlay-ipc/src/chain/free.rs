use std::alloc::Layout;
use std::ffi::{CStr, c_char};
use std::ptr::NonNull;

use super::alloc::ChainAllocator;
use super::copy::{byte_layout, pointer_array_layout};
use super::types::*;

/// Releases a chain produced by [`copy_chain`](super::copy_chain).
///
/// Walks the chain like the copy did and hands every payload, then every
/// node, back to `alloc` with the layout it was allocated with. Freeing null
/// does nothing.
///
/// # Safety
///
/// `head` must be null or the unmodified result of a successful
/// `copy_chain` through the same allocator, not freed before.
pub unsafe fn free_chain<A: ChainAllocator + ?Sized>(head: *const BaseInStructure, alloc: &mut A) {
    let mut node = head;
    while let Some(current) = NonNull::new(node.cast_mut()) {
        // SAFETY: every node of the chain is live until released below.
        unsafe {
            node = current.as_ref().next;
            free_node(current, alloc);
        }
    }
}

unsafe fn free_node<A: ChainAllocator + ?Sized>(node: NonNull<BaseInStructure>, alloc: &mut A) {
    // SAFETY: the tag names the layout the copy allocated.
    unsafe {
        let layout = match node.as_ref().ty {
            StructureType::INSTANCE_CREATE_INFO => {
                let info = node.cast::<InstanceCreateInfo>().as_ref();
                free_string_array(info.enabled_api_layer_count, info.enabled_api_layer_names, alloc);
                free_string_array(info.enabled_extension_count, info.enabled_extension_names, alloc);
                Layout::new::<InstanceCreateInfo>()
            }
            StructureType::BINARY_PAYLOAD => {
                let payload = node.cast::<BinaryPayload>().as_ref();
                if let Some(data) = NonNull::new(payload.data.cast_mut())
                    && let Ok(layout) = byte_layout(payload.size as usize)
                {
                    alloc.deallocate(data, layout);
                }
                Layout::new::<BinaryPayload>()
            }
            StructureType::FRAME_END_INFO => {
                let info = node.cast::<FrameEndInfo>().as_ref();
                let count = info.layer_count as usize;
                if let Some(layers) = NonNull::new(info.layers.cast_mut()) {
                    for i in 0..count {
                        free_chain(*layers.as_ptr().add(i), alloc);
                    }
                    if let Ok(layout) = pointer_array_layout::<BaseInStructure>(count) {
                        alloc.deallocate(layers.cast(), layout);
                    }
                }
                Layout::new::<FrameEndInfo>()
            }
            StructureType::SESSION_CREATE_INFO => Layout::new::<SessionCreateInfo>(),
            StructureType::COMPOSITION_LAYER_QUAD => Layout::new::<CompositionLayerQuad>(),
            StructureType::SYSTEM_PROPERTIES => Layout::new::<SystemProperties>(),
            StructureType::EVENT_DATA_BUFFER => Layout::new::<EventDataBuffer>(),
            StructureType::EVENT_DATA_EVENTS_LOST => Layout::new::<EventDataEventsLost>(),
            StructureType::EVENT_DATA_SESSION_STATE_CHANGED => {
                Layout::new::<EventDataSessionStateChanged>()
            }
            _ => Layout::new::<BaseInStructure>(),
        };
        alloc.deallocate(node.cast(), layout);
    }
}

unsafe fn free_string_array<A: ChainAllocator + ?Sized>(
    count: u32,
    array: *const *const c_char,
    alloc: &mut A,
) {
    let Some(array) = NonNull::new(array.cast_mut()) else {
        return;
    };
    let count = count as usize;
    // SAFETY: count entries, each null or a copied NUL-terminated string.
    unsafe {
        for i in 0..count {
            let string = *array.as_ptr().add(i);
            if let Some(string) = NonNull::new(string.cast_mut()) {
                let len = CStr::from_ptr(string.as_ptr()).to_bytes_with_nul().len();
                if let Ok(layout) = byte_layout(len) {
                    alloc.deallocate(string.cast(), layout);
                }
            }
        }
        if let Ok(layout) = pointer_array_layout::<c_char>(count) {
            alloc.deallocate(array.cast(), layout);
        }
    }
}
