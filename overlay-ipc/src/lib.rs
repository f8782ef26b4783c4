//! Cross-process call substrate for an overlay API layer.
//!
//! An overlay process forwards API calls to the main process that owns the
//! session. Arguments travel as chains of typed structures deep-copied into
//! a shared segment; every pointer written there is recorded so it can be
//! relocated between the two address spaces.
//!
//! - [`buffer`] - bump arena over a caller-supplied region
//! - [`fixup`] - ledger of pointer slots, relative/absolute conversion
//! - [`chain`] - deep copy and free of structure chains, event copy
//! - [`negotiation`] - pairing an overlay with the main process
//! - [`rpc`] - request/response channel with peer-death detection
//! - [`connection`] - both ends wired together

pub mod buffer;
pub mod chain;
pub mod config;
pub mod connection;
pub mod fixup;
pub mod handle;
pub mod ipc;
pub mod negotiation;
pub mod rpc;
pub mod trace;

pub use config::{Config, LAYER_BINARY_VERSION};
pub use connection::{ConnectionToMain, MainSession, RequestHandler, SessionError};
pub use ipc::shmem::SharedMemorySafe;
pub use rpc::{RpcError, RpcMessage, WaitResult};
