use std::ptr::NonNull;
use std::time::Duration;

use super::message::RpcMessage;
use super::types::{RPC_PAYLOAD_SIZE, RpcError, RpcNames, RpcSegment, WaitResult};
use crate::ipc::process::{Liveness, PeerProcess};
use crate::ipc::shmem::{Creator, Opener, Shm, ShmError, ShmMode};
use crate::fixup::FixupError;
use crate::ipc::sync::{NamedMutex, NamedSemaphore, Timeout, poll_until};
use crate::trace::{debug, error, trace};

/// The objects making up one channel.
pub struct RpcResources<Mode: ShmMode> {
    pub(crate) segment: Shm<RpcSegment, Mode>,
    /// Exists for the channel's lifetime; the request protocol never locks
    /// it, turns are passed with the semaphores.
    _mutex: NamedMutex<Mode>,
    pub(crate) overlay_request: NamedSemaphore<Mode>,
    pub(crate) main_response: NamedSemaphore<Mode>,
}

impl RpcResources<Creator> {
    /// Creates the channel objects, replacing any stale ones with the same
    /// names. Done by the overlay before it negotiates.
    ///
    /// # Errors
    ///
    /// Any [`ShmError`] from creating the objects.
    pub fn create(names: &RpcNames) -> Result<Self, ShmError> {
        names.unlink_stale();
        Ok(Self {
            segment: Shm::create(names.shmem.clone(), |_| {})?,
            _mutex: NamedMutex::create(names.mutex.clone())?,
            overlay_request: NamedSemaphore::create(names.overlay_request_sema.clone(), 0)?,
            main_response: NamedSemaphore::create(names.main_response_sema.clone(), 0)?,
        })
    }
}

impl RpcResources<Opener> {
    /// Opens the objects an overlay created.
    ///
    /// # Errors
    ///
    /// Any [`ShmError`] from opening the objects (`ENOENT` if the overlay
    /// never created them or is gone).
    pub fn open(names: &RpcNames) -> Result<Self, ShmError> {
        Ok(Self {
            segment: Shm::open(names.shmem.clone())?,
            _mutex: NamedMutex::open(names.mutex.clone())?,
            overlay_request: NamedSemaphore::open(names.overlay_request_sema.clone())?,
            main_response: NamedSemaphore::open(names.main_response_sema.clone())?,
        })
    }
}

/// Strategy trait mapping a side of the channel to its signals and outcomes.
pub trait ChannelRole {
    type Mode: ShmMode;
    /// Whether this side owns the segment when the channel starts.
    const STARTS_WITH_TURN: bool;
    /// Outcome when the peer signals.
    const PEER_READY: WaitResult;
    /// Outcome when the peer process is gone.
    const PEER_TERMINATED: WaitResult;

    /// Semaphore this side posts when handing the segment over.
    fn outgoing(res: &RpcResources<Self::Mode>) -> &NamedSemaphore<Self::Mode>;
    /// Semaphore the peer posts when handing the segment back.
    fn incoming(res: &RpcResources<Self::Mode>) -> &NamedSemaphore<Self::Mode>;
}

/// Marker for the overlay side: creates the objects, sends requests.
pub struct OverlayRole;
/// Marker for the main side: opens the objects, answers requests.
pub struct MainRole;

impl ChannelRole for OverlayRole {
    type Mode = Creator;
    const STARTS_WITH_TURN: bool = true;
    const PEER_READY: WaitResult = WaitResult::MainResponseReady;
    const PEER_TERMINATED: WaitResult = WaitResult::MainProcessTerminated;

    fn outgoing(res: &RpcResources<Creator>) -> &NamedSemaphore<Creator> {
        &res.overlay_request
    }

    fn incoming(res: &RpcResources<Creator>) -> &NamedSemaphore<Creator> {
        &res.main_response
    }
}

impl ChannelRole for MainRole {
    type Mode = Opener;
    const STARTS_WITH_TURN: bool = false;
    const PEER_READY: WaitResult = WaitResult::OverlayRequestReady;
    const PEER_TERMINATED: WaitResult = WaitResult::OverlayProcessTerminated;

    fn outgoing(res: &RpcResources<Opener>) -> &NamedSemaphore<Opener> {
        &res.main_response
    }

    fn incoming(res: &RpcResources<Opener>) -> &NamedSemaphore<Opener> {
        &res.overlay_request
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    /// This side may read and write the segment.
    Local,
    /// The peer owns the segment.
    Remote,
}

/// One side of a request/response channel.
///
/// The segment alternates between the two sides. Handing it over
/// ([`finish_overlay_request`](RpcChannel::finish_overlay_request) /
/// [`finish_main_response`](RpcChannel::finish_main_response)) makes every
/// recorded pointer relative and posts the peer's semaphore; receiving it
/// makes them absolute again. Waits poll the incoming semaphore and the
/// peer's liveness, so a dead peer ends the wait with a distinct result.
pub struct RpcChannel<R: ChannelRole> {
    res: RpcResources<R::Mode>,
    peer: PeerProcess,
    poll: Duration,
    turn: Turn,
}

impl<R: ChannelRole> RpcChannel<R> {
    /// Wraps created/opened objects. `poll` bounds each wait slice between
    /// liveness checks in the blocking waits.
    #[must_use]
    pub fn new(res: RpcResources<R::Mode>, peer: PeerProcess, poll: Duration) -> Self {
        Self {
            res,
            peer,
            poll,
            turn: if R::STARTS_WITH_TURN {
                Turn::Local
            } else {
                Turn::Remote
            },
        }
    }

    #[must_use]
    pub fn peer(&self) -> PeerProcess {
        self.peer
    }

    /// True while this side owns the segment.
    #[must_use]
    pub fn has_turn(&self) -> bool {
        self.turn == Turn::Local
    }

    fn base(&self) -> *mut u8 {
        self.res.segment.as_ptr().cast()
    }

    /// Access to the message in the segment.
    ///
    /// # Errors
    ///
    /// [`RpcError::OutOfTurn`] while the peer owns the segment.
    pub fn message(&mut self) -> Result<RpcMessage<'_>, RpcError> {
        if self.turn != Turn::Local {
            return Err(RpcError::OutOfTurn);
        }
        let segment: &RpcSegment = &self.res.segment;
        // SAFETY: holding the turn gives this side exclusive access to the
        // segment, and &mut self keeps a second message from existing.
        unsafe {
            let header = &mut *segment.header.get();
            let payload = NonNull::new_unchecked(segment.payload.get().cast::<u8>());
            Ok(RpcMessage::new(self.base(), header, payload, RPC_PAYLOAD_SIZE))
        }
    }

    /// Relocates the message and hands the segment to the peer.
    fn hand_over(&mut self) -> Result<(), RpcError> {
        if self.turn != Turn::Local {
            return Err(RpcError::OutOfTurn);
        }
        // SAFETY: we hold the turn and the recorded pointers are absolute.
        unsafe {
            let header = &*self.res.segment.header.get();
            header.ledger.make_relative(self.base(), size_of::<RpcSegment>())?;
        }
        self.turn = Turn::Remote;
        R::outgoing(&self.res).post();
        trace!(peer = %self.peer.pid(), "segment handed over");
        Ok(())
    }

    /// Takes the segment back after the peer signalled.
    ///
    /// The turn is ours either way; a ledger the peer left corrupt makes the
    /// wait fail instead of writing outside the segment.
    fn take_back(&mut self) -> Result<(), FixupError> {
        self.turn = Turn::Local;
        // SAFETY: the peer handed the segment over with relative pointers.
        unsafe {
            let header = &*self.res.segment.header.get();
            header.ledger.make_absolute(self.base(), size_of::<RpcSegment>())
        }
    }

    /// Waits up to `timeout` for the peer to hand the segment back.
    ///
    /// `None` on timeout. The incoming signal is checked before the peer's
    /// liveness, so a reply posted just before the peer exited is still
    /// delivered.
    pub fn poll_peer(&mut self, timeout: Duration) -> Option<WaitResult> {
        if self.turn == Turn::Local {
            error!(peer = %self.peer.pid(), "waiting on a channel this side owns");
            return Some(WaitResult::WaitError);
        }
        let incoming = R::incoming(&self.res);
        let peer = self.peer;
        let result = poll_until(Timeout::Duration(timeout), || {
            if incoming.try_acquire() {
                return Some(R::PEER_READY);
            }
            match peer.liveness() {
                Liveness::Alive => None,
                Liveness::Terminated => Some(R::PEER_TERMINATED),
                Liveness::Unknown(_err) => {
                    error!(peer = %peer.pid(), err = %_err, "liveness check failed");
                    Some(WaitResult::WaitError)
                }
            }
        })?;
        if result == R::PEER_READY {
            if let Err(_err) = self.take_back() {
                error!(peer = %peer.pid(), err = %_err, "peer handed over a corrupt fixup ledger");
                return Some(WaitResult::WaitError);
            }
        } else {
            debug!(peer = %peer.pid(), ?result, "wait ended without a reply");
        }
        Some(result)
    }

    /// Waits for the peer, re-issuing bounded polls until it replies or
    /// terminates.
    pub fn wait_peer(&mut self) -> WaitResult {
        loop {
            if let Some(result) = self.poll_peer(self.poll) {
                return result;
            }
        }
    }
}

impl RpcChannel<OverlayRole> {
    /// Makes pointers relative and signals "request ready".
    ///
    /// # Errors
    ///
    /// [`RpcError::OutOfTurn`] while a request is already outstanding.
    pub fn finish_overlay_request(&mut self) -> Result<(), RpcError> {
        self.hand_over()
    }

    /// Blocks until the main process responds ([`WaitResult::MainResponseReady`],
    /// pointers absolute again) or terminates.
    pub fn wait_for_main_response(&mut self) -> WaitResult {
        self.wait_peer()
    }
}

impl RpcChannel<MainRole> {
    /// Waits up to `timeout` for a request from the overlay.
    pub fn poll_overlay_request(&mut self, timeout: Duration) -> Option<WaitResult> {
        self.poll_peer(timeout)
    }

    /// Blocks until the overlay sends a request or terminates.
    pub fn wait_for_overlay_request(&mut self) -> WaitResult {
        self.wait_peer()
    }

    /// Makes pointers relative and signals "response ready".
    ///
    /// # Errors
    ///
    /// [`RpcError::OutOfTurn`] when no request is pending.
    pub fn finish_main_response(&mut self) -> Result<(), RpcError> {
        self.hand_over()
    }
}
