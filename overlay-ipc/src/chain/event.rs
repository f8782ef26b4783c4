use std::ptr::{self, NonNull};

use super::CodecError;
use super::types::{BaseInStructure, EventDataBuffer, event_size};

/// Copies a single event node into `buffer`. The copy's `next` is null.
///
/// # Safety
///
/// `event` must point to a valid event structure of the type its tag names.
///
/// # Errors
///
/// [`CodecError::UnsupportedEvent`] for a tag that is not a known event and
/// [`CodecError::EventTooLarge`] when the event does not fit.
pub unsafe fn copy_event_into_buffer(
    event: NonNull<BaseInStructure>,
    buffer: &mut EventDataBuffer,
) -> Result<(), CodecError> {
    let dst = NonNull::from(buffer).cast::<u8>();
    // SAFETY: dst is valid for size_of::<EventDataBuffer>() bytes.
    unsafe { copy_event_into(event, dst, size_of::<EventDataBuffer>()) }
}

/// # Safety
///
/// `event` as for [`copy_event_into_buffer`]; `dst` valid for writes of
/// `capacity` bytes, aligned for [`BaseInStructure`], not overlapping `event`.
pub(super) unsafe fn copy_event_into(
    event: NonNull<BaseInStructure>,
    dst: NonNull<u8>,
    capacity: usize,
) -> Result<(), CodecError> {
    // SAFETY: the event is valid per the caller.
    let ty = unsafe { event.as_ref().ty };
    let size = event_size(ty).ok_or(CodecError::UnsupportedEvent { ty })?;
    if size > capacity {
        return Err(CodecError::EventTooLarge { size, capacity });
    }
    // SAFETY: size bytes are readable from event and writable at dst.
    unsafe {
        ptr::copy_nonoverlapping(event.as_ptr().cast::<u8>(), dst.as_ptr(), size);
        dst.cast::<BaseInStructure>().as_mut().next = ptr::null();
    }
    Ok(())
}
