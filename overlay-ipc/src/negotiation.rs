//! Handshake that pairs an overlay process with the main process.
//!
//! The main process owns a well-known segment holding one
//! [`NegotiationRecord`], a mutex serializing overlays, and two semaphores.
//! An overlay locks the mutex, writes its pid, version and a fresh nonce,
//! posts "main may proceed" and waits for "overlay may proceed". The main
//! process checks the version, opens the overlay's RPC objects, and writes
//! its answer with the nonce echoed back.

mod listener;
mod overlay;
mod types;

pub use listener::NegotiationListener;
pub use overlay::{Negotiated, negotiate};
pub use types::{
    NegotiationError, NegotiationNames, NegotiationObjects, NegotiationRecord, NegotiationState,
    NegotiationStatus,
};
