//! Shared record, names and errors of the negotiation handshake.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use thiserror::Error;

use crate::config::Config;
use crate::ipc::process::ProcessId;
use crate::ipc::shmem::{Creator, Opener, SharedMemorySafe, Shm, ShmError, ShmMode, ShmPath};
use crate::ipc::sync::{NamedMutex, NamedSemaphore};

/// Result code the main process writes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NegotiationStatus {
    /// No reply yet.
    Pending = 0,
    Success = 1,
    DifferentBinaryVersion = 2,
    /// Versions matched but the overlay's RPC objects could not be opened.
    RpcChannelUnavailable = 3,
}

impl NegotiationStatus {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Pending,
            1 => Self::Success,
            2 => Self::DifferentBinaryVersion,
            3 => Self::RpcChannelUnavailable,
            _ => return None,
        })
    }
}

/// Progress of one overlay attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Unstarted,
    SegmentOpened,
    VersionExchanged,
    Compatible,
    Incompatible,
    Closed,
}

impl NegotiationState {
    /// Whether `next` directly follows `self` in an attempt.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unstarted, Self::SegmentOpened)
                | (Self::SegmentOpened, Self::VersionExchanged | Self::Closed)
                | (Self::VersionExchanged, Self::Compatible | Self::Incompatible)
                | (Self::Compatible | Self::Incompatible, Self::Closed)
        )
    }
}

/// The single record in the negotiation segment.
///
/// The overlay fills the `overlay_*` fields and `nonce`; the main process
/// answers with the `main_*` fields, `status`, and echoes the nonce in
/// `reply_nonce` so a reply can be matched to its attempt.
#[repr(C)]
#[derive(Debug, Default)]
pub struct NegotiationRecord {
    pub(crate) main_pid: AtomicU32,
    pub(crate) overlay_pid: AtomicU32,
    pub(crate) main_version: AtomicU32,
    pub(crate) overlay_version: AtomicU32,
    pub(crate) status: AtomicU32,
    _reserved: u32,
    pub(crate) nonce: AtomicU64,
    pub(crate) reply_nonce: AtomicU64,
}

// SAFETY: repr(C) over atomics and integers; zero is a pending, empty record.
unsafe impl SharedMemorySafe for NegotiationRecord {}

/// Overlay's half of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OverlayRequest {
    pub(crate) pid: ProcessId,
    pub(crate) version: u32,
    pub(crate) nonce: u64,
}

/// Main's half of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MainReply {
    pub(crate) pid: ProcessId,
    pub(crate) version: u32,
    pub(crate) status: Option<NegotiationStatus>,
    pub(crate) nonce: u64,
}

impl NegotiationRecord {
    pub(crate) fn write_request(&self, request: OverlayRequest) {
        self.status.store(NegotiationStatus::Pending as u32, Ordering::Relaxed);
        self.overlay_pid.store(request.pid.as_raw(), Ordering::Relaxed);
        self.overlay_version.store(request.version, Ordering::Relaxed);
        self.nonce.store(request.nonce, Ordering::Release);
    }

    pub(crate) fn read_request(&self) -> OverlayRequest {
        let nonce = self.nonce.load(Ordering::Acquire);
        OverlayRequest {
            pid: ProcessId::from_raw(self.overlay_pid.load(Ordering::Relaxed)),
            version: self.overlay_version.load(Ordering::Relaxed),
            nonce,
        }
    }

    pub(crate) fn write_reply(&self, reply: MainReply) {
        self.main_pid.store(reply.pid.as_raw(), Ordering::Relaxed);
        self.main_version.store(reply.version, Ordering::Relaxed);
        self.reply_nonce.store(reply.nonce, Ordering::Relaxed);
        let status = reply.status.unwrap_or(NegotiationStatus::Pending);
        self.status.store(status as u32, Ordering::Release);
    }

    pub(crate) fn read_reply(&self) -> MainReply {
        let status = NegotiationStatus::from_raw(self.status.load(Ordering::Acquire));
        MainReply {
            pid: ProcessId::from_raw(self.main_pid.load(Ordering::Relaxed)),
            version: self.main_version.load(Ordering::Relaxed),
            status,
            nonce: self.reply_nonce.load(Ordering::Relaxed),
        }
    }
}

/// Well-known names of the negotiation objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationNames {
    pub shmem: ShmPath,
    pub mutex: ShmPath,
    pub overlay_wait_sema: ShmPath,
    pub main_wait_sema: ShmPath,
}

impl NegotiationNames {
    /// # Errors
    ///
    /// [`ShmError::InvalidPath`] for an unusable namespace.
    pub fn new(config: &Config) -> Result<Self, ShmError> {
        Ok(Self {
            shmem: config.object_path("negotiation-shmem")?,
            mutex: config.object_path("negotiation-mutex")?,
            overlay_wait_sema: config.object_path("negotiation-overlay-wait-sema")?,
            main_wait_sema: config.object_path("negotiation-main-wait-sema")?,
        })
    }

    pub(crate) fn unlink_stale(&self) {
        use crate::ipc::shmem::unlink_stale;
        unlink_stale(&self.shmem);
        unlink_stale(&self.mutex);
        unlink_stale(&self.overlay_wait_sema);
        unlink_stale(&self.main_wait_sema);
    }
}

/// The segment, its mutex and the two semaphores.
pub struct NegotiationObjects<Mode: ShmMode> {
    pub(crate) record: Shm<NegotiationRecord, Mode>,
    pub(crate) mutex: NamedMutex<Mode>,
    /// "overlay may proceed", posted by the main process.
    pub(crate) overlay_wait: NamedSemaphore<Mode>,
    /// "main may proceed", posted by the overlay.
    pub(crate) main_wait: NamedSemaphore<Mode>,
}

impl NegotiationObjects<Creator> {
    /// Creates the objects, replacing stale ones. Only the holder of the
    /// main session lock may do this.
    ///
    /// # Errors
    ///
    /// Any [`ShmError`] from creating the objects.
    pub fn create(names: &NegotiationNames) -> Result<Self, ShmError> {
        names.unlink_stale();
        Ok(Self {
            record: Shm::create(names.shmem.clone(), |slot| {
                slot.write(NegotiationRecord::default());
            })?,
            mutex: NamedMutex::create(names.mutex.clone())?,
            overlay_wait: NamedSemaphore::create(names.overlay_wait_sema.clone(), 0)?,
            main_wait: NamedSemaphore::create(names.main_wait_sema.clone(), 0)?,
        })
    }
}

impl NegotiationObjects<Opener> {
    /// # Errors
    ///
    /// `ENOENT` (see [`ShmError::is_not_found`]) when no main process is up.
    pub fn open(names: &NegotiationNames) -> Result<Self, ShmError> {
        Ok(Self {
            record: Shm::open(names.shmem.clone())?,
            mutex: NamedMutex::open(names.mutex.clone())?,
            overlay_wait: NamedSemaphore::open(names.overlay_wait_sema.clone())?,
            main_wait: NamedSemaphore::open(names.main_wait_sema.clone())?,
        })
    }
}

/// Why an overlay could not pair with a main process.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// Every attempt failed: no main process, or it never answered.
    #[error("no main process answered after {attempts} attempts")]
    NoMainProcess { attempts: u32 },
    /// The main process runs a different protocol version.
    #[error("main process runs binary version {main}, overlay runs {overlay}")]
    DifferentBinaryVersion { main: u32, overlay: u32 },
    /// The main process could not open this overlay's RPC objects.
    #[error("main process {main} could not open the RPC channel")]
    RpcChannelUnavailable { main: ProcessId },
    /// The reply carried no status this overlay understands.
    #[error("main process {main} sent an unrecognized negotiation status")]
    UnrecognizedReply { main: ProcessId },
    /// Setting up the overlay's own objects failed.
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
    /// The listener thread could not be started.
    #[error("failed to spawn negotiation thread: {0}")]
    Spawn(std::io::Error),
}
