use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, MutexGuard};

use thiserror::Error;

use super::to_overlay::{RequestHandler, SessionShared};
use crate::config::Config;
use crate::ipc::process::{Liveness, PeerProcess, ProcessId};
use crate::ipc::shmem::{Creator, Opener, SharedMemorySafe, Shm, ShmError, ShmPath, unlink_stale};
use crate::negotiation::{NegotiationError, NegotiationListener, NegotiationNames, NegotiationObjects};
use crate::rpc::RpcResources;
use crate::trace::{debug, info, warn};

/// Errors starting a main session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Another live process already runs a main session in this namespace.
    #[error("main session already active in process {owner}")]
    MainSessionActive { owner: ProcessId },
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
    #[error("negotiation setup failed: {0}")]
    Negotiation(#[from] NegotiationError),
}

#[repr(C)]
#[derive(Debug)]
struct MainSessionRecord {
    owner: AtomicU32,
}

// SAFETY: a single atomic; zero means "being created".
unsafe impl SharedMemorySafe for MainSessionRecord {}

/// Marks this process as the namespace's only main process.
///
/// A lock left behind by a terminated owner is taken over.
struct MainSessionLock {
    _record: Shm<MainSessionRecord, Creator>,
}

impl MainSessionLock {
    fn acquire(path: ShmPath) -> Result<Self, SessionError> {
        match Self::create(path.clone()) {
            Err(err) if err.is_already_exists() => {}
            other => return other.map_err(Into::into),
        }

        let owner = match Shm::<MainSessionRecord, Opener>::open(path.clone()) {
            Ok(record) => ProcessId::from_raw(record.owner.load(Ordering::Acquire)),
            // Released between our create and open.
            Err(err) if err.is_not_found() => return Self::create(path).map_err(Into::into),
            Err(err) => return Err(err.into()),
        };
        if owner.as_raw() == 0 || PeerProcess::new(owner).liveness() != Liveness::Terminated {
            return Err(SessionError::MainSessionActive { owner });
        }

        warn!(%owner, "taking over main session lock from terminated process");
        unlink_stale(&path);
        Self::create(path).map_err(|err| {
            if err.is_already_exists() {
                SessionError::MainSessionActive { owner }
            } else {
                err.into()
            }
        })
    }

    fn create(path: ShmPath) -> Result<Self, ShmError> {
        let record = Shm::create(path, |slot| {
            slot.write(MainSessionRecord {
                owner: AtomicU32::new(ProcessId::current().as_raw()),
            });
        })?;
        Ok(Self { _record: record })
    }
}

/// The main process's side of every overlay connection.
///
/// Holds the main session lock, answers negotiations on a listener thread
/// and services each connected overlay on its own thread.
pub struct MainSession {
    shared: Arc<SessionShared>,
    listener: Option<NegotiationListener>,
    _lock: MainSessionLock,
}

impl MainSession {
    /// Takes the main session lock and starts accepting overlays.
    ///
    /// # Errors
    ///
    /// [`SessionError::MainSessionActive`] if a live process holds the lock,
    /// otherwise any failure creating the negotiation objects or thread.
    pub fn start(config: Config, handler: impl RequestHandler) -> Result<Self, SessionError> {
        let lock = MainSessionLock::acquire(config.object_path("main-session")?)?;
        let objects = NegotiationObjects::create(&NegotiationNames::new(&config)?)?;

        let shared = Arc::new(SessionShared::new(handler));
        let poll = config.rpc_poll();
        let on_connect = {
            let shared = Arc::clone(&shared);
            move |overlay: ProcessId, resources: RpcResources<Opener>| shared.connect(overlay, resources, poll)
        };
        let listener = NegotiationListener::spawn(objects, config, on_connect)?;
        info!("main session started");

        Ok(Self {
            shared,
            listener: Some(listener),
            _lock: lock,
        })
    }

    /// Pids of the overlays currently connected, in ascending order.
    #[must_use]
    pub fn connections(&self) -> Vec<ProcessId> {
        self.shared.connected()
    }

    /// Blocks request handling on every connection while held.
    pub fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.shared.exclusive()
    }

    /// Stops accepting overlays, then stops and joins every service thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.stop();
        }
        let connections = self.shared.take_all();
        debug!(count = connections.len(), "stopping overlay connections");
        for connection in connections {
            connection.stop();
        }
        info!("main session stopped");
    }
}

impl Drop for MainSession {
    fn drop(&mut self) {
        if self.listener.is_some() {
            self.stop();
        }
    }
}
