use std::thread;

use super::types::{
    MainReply, NegotiationError, NegotiationNames, NegotiationObjects, NegotiationState,
    NegotiationStatus, OverlayRequest,
};
use crate::config::Config;
use crate::ipc::process::ProcessId;
use crate::ipc::shmem::Opener;
use crate::ipc::sync::{Timeout, poll_until};
use crate::trace::{debug, info, trace, warn};

/// A main process that accepted this overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub main: ProcessId,
    pub main_version: u32,
}

/// Pairs this process, as an overlay, with the main process.
///
/// The overlay's RPC objects must already exist: the main process opens
/// them before it answers. Attempts that find no main process, time out on
/// the mutex, or get no reply are retried up to `config.max_attempts`.
///
/// # Errors
///
/// - [`NegotiationError::NoMainProcess`] when every attempt failed
/// - [`NegotiationError::DifferentBinaryVersion`] when the versions differ
/// - [`NegotiationError::RpcChannelUnavailable`] when the main process could
///   not open this overlay's RPC objects
/// - [`NegotiationError::UnrecognizedReply`] when the reply's status is not
///   one this overlay knows
pub fn negotiate(config: &Config) -> Result<Negotiated, NegotiationError> {
    let names = NegotiationNames::new(config)?;
    for _attempt in 1..=config.max_attempts {
        debug!(attempt = _attempt, "negotiation attempt");
        let mut attempt = Attempt::new();
        if let Some(reply) = attempt.run(config, &names) {
            return attempt.conclude(config, reply);
        }
    }
    warn!(attempts = config.max_attempts, "no main process answered");
    Err(NegotiationError::NoMainProcess {
        attempts: config.max_attempts,
    })
}

/// One pass through the negotiation state machine.
struct Attempt {
    state: NegotiationState,
}

impl Attempt {
    fn new() -> Self {
        Self {
            state: NegotiationState::Unstarted,
        }
    }

    fn enter(&mut self, next: NegotiationState) {
        debug_assert!(self.state.can_advance_to(next), "{:?} -> {next:?}", self.state);
        trace!(from = ?self.state, to = ?next, "negotiation state");
        self.state = next;
    }

    fn run(&mut self, config: &Config, names: &NegotiationNames) -> Option<MainReply> {
        let objects = match NegotiationObjects::<Opener>::open(names) {
            Ok(objects) => objects,
            Err(_err) => {
                debug!(err = %_err, "negotiation objects unavailable");
                thread::sleep(config.negotiation_wait());
                return None;
            }
        };
        self.enter(NegotiationState::SegmentOpened);
        let reply = self.exchange(config, &objects);
        if reply.is_none() {
            self.enter(NegotiationState::Closed);
        }
        reply
    }

    fn exchange(&mut self, config: &Config, objects: &NegotiationObjects<Opener>) -> Option<MainReply> {
        let Some(_guard) = objects.mutex.lock(Timeout::Duration(config.mutex_wait())) else {
            debug!("negotiation mutex busy");
            return None;
        };

        // Posts left over from an attempt that gave up.
        objects.main_wait.drain();
        objects.overlay_wait.drain();

        let nonce = rand::random::<u64>() | 1;
        objects.record.write_request(OverlayRequest {
            pid: ProcessId::current(),
            version: config.layer_binary_version,
            nonce,
        });
        objects.main_wait.post();

        let reply = poll_until(Timeout::Duration(config.negotiation_wait()), || {
            if !objects.overlay_wait.try_acquire() {
                return None;
            }
            let reply = objects.record.read_reply();
            (reply.nonce == nonce && reply.status != Some(NegotiationStatus::Pending)).then_some(reply)
        });
        match reply {
            Some(reply) => {
                self.enter(NegotiationState::VersionExchanged);
                Some(reply)
            }
            None => {
                debug!("main process did not answer");
                None
            }
        }
    }

    fn conclude(&mut self, config: &Config, reply: MainReply) -> Result<Negotiated, NegotiationError> {
        let result = match reply.status {
            Some(NegotiationStatus::Success) => {
                self.enter(NegotiationState::Compatible);
                info!(main = %reply.pid, version = reply.version, "negotiated with main process");
                Ok(Negotiated {
                    main: reply.pid,
                    main_version: reply.version,
                })
            }
            Some(NegotiationStatus::RpcChannelUnavailable) => {
                self.enter(NegotiationState::Incompatible);
                Err(NegotiationError::RpcChannelUnavailable { main: reply.pid })
            }
            Some(NegotiationStatus::DifferentBinaryVersion) => {
                self.enter(NegotiationState::Incompatible);
                warn!(main = reply.version, overlay = config.layer_binary_version, "binary version mismatch");
                Err(NegotiationError::DifferentBinaryVersion {
                    main: reply.version,
                    overlay: config.layer_binary_version,
                })
            }
            Some(NegotiationStatus::Pending) | None => {
                self.enter(NegotiationState::Incompatible);
                warn!(main = %reply.pid, "unrecognized negotiation reply");
                Err(NegotiationError::UnrecognizedReply { main: reply.pid })
            }
        };
        self.enter(NegotiationState::Closed);
        result
    }
}
