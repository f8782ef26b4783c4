//! Shared layout, names and outcomes of the RPC channel.

use std::cell::UnsafeCell;

use thiserror::Error;

use crate::buffer::BufferError;
use crate::chain::CodecError;
use crate::config::Config;
use crate::fixup::{FixupError, FixupLedger};
use crate::ipc::process::ProcessId;
use crate::ipc::shmem::{SharedMemorySafe, ShmError, ShmPath, unlink_stale};

/// Total size of one channel's shared segment.
pub const RPC_SHMEM_SIZE: usize = 1024 * 1024;

/// Bytes available to message payloads after the header.
pub const RPC_PAYLOAD_SIZE: usize = RPC_SHMEM_SIZE - size_of::<RpcHeader>();

/// Outcome of waiting for the other side of a channel.
///
/// Every waiter has to handle all five.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The overlay posted a request (seen by the main side).
    OverlayRequestReady,
    /// The main process posted a response (seen by the overlay).
    MainResponseReady,
    /// The overlay process is gone.
    OverlayProcessTerminated,
    /// The main process is gone.
    MainProcessTerminated,
    /// The wait itself failed (liveness check error, or waiting out of turn).
    WaitError,
}

/// Errors raised while using an RPC channel.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Creating or opening a channel object failed.
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
    /// Encoding into the payload arena failed.
    #[error("encoding failed: {0}")]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// The fixup ledger names a slot outside the segment.
    #[error(transparent)]
    Fixup(#[from] FixupError),
    /// The main process terminated while a call was outstanding.
    #[error("main process {0} terminated")]
    MainProcessTerminated(ProcessId),
    /// The overlay process terminated.
    #[error("overlay process {0} terminated")]
    OverlayProcessTerminated(ProcessId),
    /// Waiting for the peer failed.
    #[error("waiting for the peer failed")]
    WaitFailed,
    /// The segment was touched while the peer owns it.
    #[error("channel used out of turn")]
    OutOfTurn,
}

/// Fixed header at offset 0 of the segment.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct RpcHeader {
    pub(crate) request_type: u64,
    pub(crate) result: i32,
    _reserved: u32,
    /// Offset of the root chain from the segment base, 0 for none.
    pub(crate) root: u64,
    /// Payload bytes in use.
    pub(crate) payload_used: u64,
    pub(crate) ledger: FixupLedger,
}

/// One channel's shared segment: header followed by the payload arena.
///
/// Whoever holds the turn (see [`RpcChannel`](super::RpcChannel)) has
/// exclusive access to both cells.
#[repr(C)]
pub struct RpcSegment {
    pub(crate) header: UnsafeCell<RpcHeader>,
    pub(crate) payload: UnsafeCell<[u8; RPC_PAYLOAD_SIZE]>,
}

const _: () = assert!(size_of::<RpcSegment>() == RPC_SHMEM_SIZE);
const _: () = assert!(size_of::<RpcHeader>() % 8 == 0);

// SAFETY: access to the cells alternates between the two processes under
// the semaphore protocol, and the turn is tracked on each side.
unsafe impl Sync for RpcSegment {}

// SAFETY: repr(C) over integers; an all-zero header is an empty message.
unsafe impl SharedMemorySafe for RpcSegment {}

/// Names of one channel's objects, templated on the overlay's pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcNames {
    pub shmem: ShmPath,
    pub mutex: ShmPath,
    pub overlay_request_sema: ShmPath,
    pub main_response_sema: ShmPath,
}

impl RpcNames {
    /// # Errors
    ///
    /// [`ShmError::InvalidPath`] for an unusable namespace.
    pub fn new(config: &Config, overlay: ProcessId) -> Result<Self, ShmError> {
        Ok(Self {
            shmem: config.object_path(&format!("rpc-shmem-{overlay}"))?,
            mutex: config.object_path(&format!("rpc-mutex-{overlay}"))?,
            overlay_request_sema: config.object_path(&format!("rpc-overlay-request-sema-{overlay}"))?,
            main_response_sema: config.object_path(&format!("rpc-main-response-sema-{overlay}"))?,
        })
    }

    /// Removes objects left behind by a previous process with the same pid.
    pub fn unlink_stale(&self) {
        unlink_stale(&self.shmem);
        unlink_stale(&self.mutex);
        unlink_stale(&self.overlay_request_sema);
        unlink_stale(&self.main_response_sema);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_names() {
        let config = Config::with_namespace("ns");
        let names = RpcNames::new(&config, ProcessId::from_raw(4242)).unwrap();
        assert_eq!(names.shmem.as_str(), "/ns-rpc-shmem-4242");
        assert_eq!(names.mutex.as_str(), "/ns-rpc-mutex-4242");
        assert_eq!(names.overlay_request_sema.as_str(), "/ns-rpc-overlay-request-sema-4242");
        assert_eq!(names.main_response_sema.as_str(), "/ns-rpc-main-response-sema-4242");
    }

    #[test]
    fn test_payload_follows_header_aligned() {
        assert_eq!(std::mem::offset_of!(RpcSegment, payload), size_of::<RpcHeader>());
        assert_eq!(RPC_PAYLOAD_SIZE % 8, 0);
    }
}
