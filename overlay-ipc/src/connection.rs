//! Connections built on negotiation and the RPC channel.
//!
//! - [`ConnectionToMain`] - an overlay's single connection to the main process
//! - [`MainSession`] - the main process: session lock, negotiation listener,
//!   and one [`ConnectionToOverlay`] service thread per overlay

mod main_session;
mod to_main;
mod to_overlay;

pub use main_session::{MainSession, SessionError};
pub use to_main::ConnectionToMain;
pub use to_overlay::{ConnectionToOverlay, HANDLER_PANICKED, RequestHandler};
