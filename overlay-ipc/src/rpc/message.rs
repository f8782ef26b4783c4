use std::ffi::c_void;
use std::ptr::{self, NonNull};

use super::types::{RPC_SHMEM_SIZE, RpcError, RpcHeader};
use crate::buffer::RelocatableBuffer;
use crate::chain::{BaseInStructure, CodecError, CopyMode, copy_chain};

/// Write access to the segment while this side holds the turn.
///
/// Obtained from [`RpcChannel::message`](super::RpcChannel::message). Every
/// pointer written into the payload has to be recorded (the codec does this
/// for chains; [`record_pointer`](Self::record_pointer) covers the rest) so
/// that it survives the trip to the other address space.
pub struct RpcMessage<'c> {
    header: &'c mut RpcHeader,
    buffer: RelocatableBuffer<'c>,
    base: *mut u8,
}

impl<'c> RpcMessage<'c> {
    /// # Safety
    ///
    /// `base` is the start of a mapped segment whose header and payload
    /// are exclusively ours for `'c`.
    pub(crate) unsafe fn new(
        base: *mut u8,
        header: &'c mut RpcHeader,
        payload: NonNull<u8>,
        payload_size: usize,
    ) -> Self {
        // SAFETY: payload is 8-aligned (after an 8-multiple header) and ours.
        let mut buffer = unsafe { RelocatableBuffer::from_raw_parts(payload, payload_size) };
        let used = usize::try_from(header.payload_used).unwrap_or(usize::MAX);
        let _ = buffer.seek(used.min(payload_size));
        Self {
            header,
            buffer,
            base,
        }
    }

    /// Starts a fresh message: empty payload, no fixups, no root.
    pub fn clear(&mut self, request_type: u64) {
        self.buffer.reset();
        self.header.ledger.clear();
        self.header.request_type = request_type;
        self.header.result = 0;
        self.header.root = 0;
    }

    #[must_use]
    pub fn request_type(&self) -> u64 {
        self.header.request_type
    }

    /// Result code of the call, written by the main side.
    #[must_use]
    pub fn result(&self) -> i32 {
        self.header.result
    }

    pub fn set_result(&mut self, result: i32) {
        self.header.result = result;
    }

    /// Deep-copies the chain at `head` into the payload.
    ///
    /// On failure the payload and fixups are rolled back to where they were.
    ///
    /// # Safety
    ///
    /// See [`copy_chain`].
    ///
    /// # Errors
    ///
    /// [`RpcError::Codec`] when the payload or the fixup ledger is exhausted.
    pub unsafe fn encode_chain(
        &mut self,
        head: *const BaseInStructure,
        mode: CopyMode,
    ) -> Result<*mut BaseInStructure, RpcError> {
        let base = self.base.cast_const();
        let position = self.buffer.position();
        let ledger = &mut self.header.ledger;
        let fixups = ledger.len();

        // SAFETY: forwarded contract.
        let result = unsafe {
            copy_chain(head, mode, &mut self.buffer, &mut |slot: *const *mut c_void| {
                ledger.record(base, slot)
            })
        };
        if result.is_err() {
            self.header.ledger.truncate(fixups);
            self.buffer.seek(position)?;
        }
        Ok(result?)
    }

    /// Copies `value` into the payload.
    ///
    /// # Errors
    ///
    /// [`RpcError::Buffer`] when it does not fit.
    pub fn write_value<T: Copy>(&mut self, value: T) -> Result<NonNull<T>, RpcError> {
        Ok(self.buffer.write_value(value)?)
    }

    /// Copies `bytes` into the payload.
    ///
    /// # Errors
    ///
    /// [`RpcError::Buffer`] when they do not fit.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<NonNull<u8>, RpcError> {
        let dst = self.buffer.allocate(bytes.len())?;
        // SAFETY: freshly allocated, sized for bytes.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len()) };
        Ok(dst)
    }

    /// Registers a pointer slot in the payload for relocation.
    ///
    /// # Errors
    ///
    /// [`CodecError::LedgerFull`] once the ledger is full, or when `slot`
    /// is not inside the payload.
    pub fn record_pointer<T>(&mut self, slot: *const *const T) -> Result<(), RpcError> {
        if self.buffer.contains(slot.cast()) && self.header.ledger.record(self.base, slot.cast()) {
            Ok(())
        } else {
            Err(CodecError::LedgerFull.into())
        }
    }

    /// Sets the chain the peer should start decoding from.
    pub fn set_root(&mut self, root: *const BaseInStructure) {
        self.header.root = if root.is_null() {
            0
        } else {
            root.addr().wrapping_sub(self.base.addr()) as u64
        };
    }

    /// Root chain of the message in this address space, or null.
    #[must_use]
    pub fn root(&self) -> *mut BaseInStructure {
        match usize::try_from(self.header.root) {
            Ok(offset) if offset != 0 && offset < RPC_SHMEM_SIZE => {
                self.base.wrapping_add(offset).cast()
            }
            _ => ptr::null_mut(),
        }
    }

    /// Pointer slots recorded so far.
    #[must_use]
    pub fn fixup_count(&self) -> usize {
        self.header.ledger.len()
    }

    /// Payload bytes in use.
    #[must_use]
    pub fn payload_used(&self) -> usize {
        self.buffer.position()
    }

    /// Payload bytes still free.
    #[must_use]
    pub fn payload_remaining(&self) -> usize {
        self.buffer.remaining()
    }
}

impl Drop for RpcMessage<'_> {
    fn drop(&mut self) {
        self.header.payload_used = self.buffer.position() as u64;
    }
}
