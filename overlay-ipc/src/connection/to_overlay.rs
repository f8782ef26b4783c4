use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::handle::LocalHandleAllocator;
use crate::ipc::process::{PeerProcess, ProcessId};
use crate::ipc::shmem::Opener;
use crate::rpc::{MainRole, RpcChannel, RpcMessage, RpcResources, WaitResult};
use crate::trace::{debug, error, info};

/// Result sent back in place of a handler's answer when the handler
/// panicked (`XR_ERROR_RUNTIME_FAILURE`).
pub const HANDLER_PANICKED: i32 = -2;

/// Answers overlay requests on the main side.
///
/// Called on the overlay's service thread with the session's exclusive
/// lock held, so handlers never run concurrently and must not call
/// [`MainSession::exclusive`](super::MainSession::exclusive). A panic is
/// caught: the overlay gets an empty response with [`HANDLER_PANICKED`] and
/// the connection stays up.
pub trait RequestHandler: Send + Sync + 'static {
    /// Reads the request in `message` and writes the response into it.
    fn handle(&self, overlay: ProcessId, message: &mut RpcMessage<'_>);
}

impl<F> RequestHandler for F
where
    F: Fn(ProcessId, &mut RpcMessage<'_>) + Send + Sync + 'static,
{
    fn handle(&self, overlay: ProcessId, message: &mut RpcMessage<'_>) {
        self(overlay, message);
    }
}

/// State shared by the main session and every service thread.
pub(crate) struct SessionShared {
    connections: Mutex<HashMap<ProcessId, ConnectionToOverlay>>,
    exclusive: Mutex<()>,
    handler: Box<dyn RequestHandler>,
    ids: LocalHandleAllocator,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionShared {
    pub(crate) fn new(handler: impl RequestHandler) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            exclusive: Mutex::new(()),
            handler: Box::new(handler),
            ids: LocalHandleAllocator::new(),
        }
    }

    pub(crate) fn exclusive(&self) -> MutexGuard<'_, ()> {
        relock(&self.exclusive)
    }

    /// Starts servicing `overlay` and adds it to the table, replacing an
    /// older connection for the same pid.
    pub(crate) fn connect(
        self: &Arc<Self>,
        overlay: ProcessId,
        resources: RpcResources<Opener>,
        poll: Duration,
    ) -> io::Result<()> {
        let mut connections = relock(&self.connections);
        let connection = ConnectionToOverlay::spawn(overlay, resources, poll, Arc::clone(self))?;
        if connections.insert(overlay, connection).is_some() {
            debug!(%overlay, "replaced previous connection");
        }
        Ok(())
    }

    pub(crate) fn connected(&self) -> Vec<ProcessId> {
        let mut pids: Vec<_> = relock(&self.connections).keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Empties the table. The caller stops the returned connections after
    /// the lock is released.
    pub(crate) fn take_all(&self) -> Vec<ConnectionToOverlay> {
        relock(&self.connections).drain().map(|(_, connection)| connection).collect()
    }

    fn remove(&self, overlay: ProcessId, id: u64) {
        let mut connections = relock(&self.connections);
        if connections.get(&overlay).is_some_and(|connection| connection.id == id) {
            connections.remove(&overlay);
        }
    }
}

/// The main side of one overlay's channel, serviced on its own thread.
///
/// The thread ends when the overlay terminates (removing the entry from the
/// session's table) or when stopped. Dropping the handle signals the thread
/// without joining it.
pub struct ConnectionToOverlay {
    overlay: ProcessId,
    id: u64,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ConnectionToOverlay {
    fn spawn(
        overlay: ProcessId,
        resources: RpcResources<Opener>,
        poll: Duration,
        shared: Arc<SessionShared>,
    ) -> io::Result<Self> {
        let id = shared.ids.next_handle();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let channel = RpcChannel::<MainRole>::new(resources, PeerProcess::new(overlay), poll);

        let handle = thread::Builder::new()
            .name(format!("overlay-{overlay}"))
            .spawn(move || {
                info!(%overlay, "servicing overlay");
                let mut entry = TableEntry {
                    shared: Arc::clone(&shared),
                    overlay,
                    id,
                    remove: true,
                };
                let mut service = Service {
                    channel,
                    poll,
                    stop: thread_stop,
                    shared,
                };
                // Stopped by the session, which owns the table entry.
                entry.remove = service.run();
                info!(%overlay, "overlay service exiting");
            })?;

        Ok(Self {
            overlay,
            id,
            stop,
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn overlay(&self) -> ProcessId {
        self.overlay
    }

    /// True once the service thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Signals the service thread and waits for it to exit.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConnectionToOverlay {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// Removes the service's table entry when its thread exits, unwinding
/// included, unless the session stopped it.
struct TableEntry {
    shared: Arc<SessionShared>,
    overlay: ProcessId,
    id: u64,
    remove: bool,
}

impl Drop for TableEntry {
    fn drop(&mut self) {
        if self.remove {
            self.shared.remove(self.overlay, self.id);
        }
    }
}

struct Service {
    channel: RpcChannel<MainRole>,
    poll: Duration,
    stop: Arc<AtomicBool>,
    shared: Arc<SessionShared>,
}

impl Service {
    /// Serves requests until stopped or the channel fails. Returns true if
    /// the service ended on its own.
    fn run(&mut self) -> bool {
        let overlay = self.channel.peer().pid();
        while !self.stop.load(Ordering::Acquire) {
            match self.channel.poll_overlay_request(self.poll) {
                None => {}
                Some(WaitResult::OverlayRequestReady) => {
                    if !self.serve_one(overlay) {
                        return true;
                    }
                }
                Some(WaitResult::OverlayProcessTerminated) => {
                    info!(%overlay, "overlay process terminated");
                    return true;
                }
                Some(_result) => {
                    error!(%overlay, ?_result, "waiting for overlay request failed");
                    return true;
                }
            }
        }
        false
    }

    fn serve_one(&mut self, overlay: ProcessId) -> bool {
        let _exclusive = self.shared.exclusive();
        match self.channel.message() {
            Ok(mut message) => {
                let request_type = message.request_type();
                debug!(%overlay, request_type, "handling request");
                let handler = &self.shared.handler;
                let handled = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(overlay, &mut message)));
                if handled.is_err() {
                    error!(%overlay, request_type, "request handler panicked");
                    message.clear(request_type);
                    message.set_result(HANDLER_PANICKED);
                }
            }
            Err(_err) => {
                error!(%overlay, err = %_err, "request arrived out of turn");
                return false;
            }
        }
        match self.channel.finish_main_response() {
            Ok(()) => true,
            Err(_err) => {
                error!(%overlay, err = %_err, "failed to send response");
                false
            }
        }
    }
}
