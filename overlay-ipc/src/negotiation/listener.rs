use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use super::types::{MainReply, NegotiationError, NegotiationObjects, NegotiationStatus, OverlayRequest};
use crate::config::Config;
use crate::ipc::process::ProcessId;
use crate::ipc::shmem::{Creator, Opener};
use crate::ipc::sync::{Timeout, poll_until};
use crate::rpc::{RpcNames, RpcResources};
use crate::trace::{debug, info, warn};

/// Main-side thread answering overlay negotiation attempts.
///
/// Dropping the handle signals the thread to stop without waiting for it.
/// Use [`NegotiationListener::stop`] to stop and join.
pub struct NegotiationListener {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NegotiationListener {
    /// Starts answering on `objects`.
    ///
    /// `on_connect` is called with each compatible overlay and its opened
    /// RPC objects. An error from it is reported to the overlay as
    /// [`NegotiationStatus::RpcChannelUnavailable`].
    ///
    /// # Errors
    ///
    /// [`NegotiationError::Spawn`] if the thread cannot be started.
    pub fn spawn(
        objects: NegotiationObjects<Creator>,
        config: Config,
        on_connect: impl FnMut(ProcessId, RpcResources<Opener>) -> io::Result<()> + Send + 'static,
    ) -> Result<Self, NegotiationError> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("overlay-negotiation".into())
            .spawn(move || {
                info!("negotiation thread started");
                let mut listener = Listener {
                    objects,
                    config,
                    stop: thread_stop,
                    on_connect,
                    last_nonce: 0,
                };
                listener.run();
                info!("negotiation thread exiting");
            })
            .map_err(NegotiationError::Spawn)?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signals the thread and waits for it to exit.
    ///
    /// A wait in progress is interrupted within one poll step.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            debug!("waiting for negotiation thread to exit");
            let _ = handle.join();
        }
    }
}

impl Drop for NegotiationListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

struct Listener<F> {
    objects: NegotiationObjects<Creator>,
    config: Config,
    stop: Arc<AtomicBool>,
    on_connect: F,
    /// Nonce of the last request answered; a repeated post for it is stale.
    last_nonce: u64,
}

impl<F> Listener<F>
where
    F: FnMut(ProcessId, RpcResources<Opener>) -> io::Result<()>,
{
    fn run(&mut self) {
        while !self.stop.load(Ordering::Acquire) {
            let woke = poll_until(Timeout::Duration(self.config.negotiation_wait()), || {
                if self.stop.load(Ordering::Acquire) {
                    Some(false)
                } else {
                    self.objects.main_wait.try_acquire().then_some(true)
                }
            });
            if woke == Some(true) {
                self.answer();
            }
        }
    }

    fn answer(&mut self) {
        let request = self.objects.record.read_request();
        if request.nonce == self.last_nonce {
            debug!(overlay = %request.pid, "ignoring repeated negotiation signal");
            return;
        }
        self.last_nonce = request.nonce;

        let status = self.decide(request);
        info!(overlay = %request.pid, version = request.version, ?status, "negotiation answered");
        self.objects.record.write_reply(MainReply {
            pid: ProcessId::current(),
            version: self.config.layer_binary_version,
            status: Some(status),
            nonce: request.nonce,
        });
        self.objects.overlay_wait.post();
    }

    fn decide(&mut self, request: OverlayRequest) -> NegotiationStatus {
        if request.version != self.config.layer_binary_version {
            warn!(
                overlay = %request.pid,
                overlay_version = request.version,
                main_version = self.config.layer_binary_version,
                "overlay runs a different binary version"
            );
            return NegotiationStatus::DifferentBinaryVersion;
        }

        let resources = RpcNames::new(&self.config, request.pid).and_then(|names| RpcResources::open(&names));
        match resources {
            Ok(resources) => match (self.on_connect)(request.pid, resources) {
                Ok(()) => NegotiationStatus::Success,
                Err(_err) => {
                    warn!(overlay = %request.pid, err = %_err, "could not start servicing overlay");
                    NegotiationStatus::RpcChannelUnavailable
                }
            },
            Err(_err) => {
                warn!(overlay = %request.pid, err = %_err, "could not open overlay RPC channel");
                NegotiationStatus::RpcChannelUnavailable
            }
        }
    }
}
