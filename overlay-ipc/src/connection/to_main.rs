use crate::config::Config;
use crate::ipc::process::{PeerProcess, ProcessId};
use crate::negotiation::{Negotiated, NegotiationError, negotiate};
use crate::rpc::{OverlayRole, RpcChannel, RpcError, RpcMessage, RpcNames, RpcResources, WaitResult};
use crate::trace::{error, info};

/// An overlay's connection to the main process.
///
/// The RPC objects are named after this process, so there is at most one
/// connection per overlay process.
pub struct ConnectionToMain {
    channel: RpcChannel<OverlayRole>,
    main: Negotiated,
    lost: bool,
}

impl ConnectionToMain {
    /// Creates this overlay's RPC objects and negotiates with the main
    /// process.
    ///
    /// # Errors
    ///
    /// Any [`NegotiationError`]; the RPC objects are removed again.
    pub fn connect(config: &Config) -> Result<Self, NegotiationError> {
        let names = RpcNames::new(config, ProcessId::current())?;
        let resources = RpcResources::create(&names)?;
        let main = negotiate(config)?;
        info!(main = %main.main, "connected to main process");
        Ok(Self {
            channel: RpcChannel::new(resources, PeerProcess::new(main.main), config.rpc_poll()),
            main,
            lost: false,
        })
    }

    #[must_use]
    pub fn main(&self) -> Negotiated {
        self.main
    }

    /// False once the main process was seen to terminate.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.lost
    }

    /// Sends one request and blocks for the response.
    ///
    /// `encode` fills the freshly cleared message. The returned message is
    /// the main process's response with pointers valid in this process.
    ///
    /// # Errors
    ///
    /// - whatever `encode` returns; nothing is sent
    /// - [`RpcError::MainProcessTerminated`] if the main process is gone,
    ///   now or on any later call
    /// - [`RpcError::WaitFailed`] if waiting for the response failed
    pub fn call<F>(&mut self, request_type: u64, encode: F) -> Result<RpcMessage<'_>, RpcError>
    where
        F: FnOnce(&mut RpcMessage<'_>) -> Result<(), RpcError>,
    {
        if self.lost {
            return Err(RpcError::MainProcessTerminated(self.main.main));
        }
        {
            let mut message = self.channel.message()?;
            message.clear(request_type);
            encode(&mut message)?;
        }
        self.channel.finish_overlay_request()?;

        match self.channel.wait_for_main_response() {
            WaitResult::MainResponseReady => self.channel.message(),
            WaitResult::MainProcessTerminated => {
                self.lost = true;
                error!(main = %self.main.main, request_type, "main process terminated during call");
                Err(RpcError::MainProcessTerminated(self.main.main))
            }
            _result => {
                error!(?_result, request_type, "waiting for the main response failed");
                Err(RpcError::WaitFailed)
            }
        }
    }
}
