//! Cross-process primitives: shared memory, named sync objects, liveness.

pub mod process;
pub mod shmem;
pub mod sync;

pub use process::{Liveness, PeerProcess, ProcessId};
pub use shmem::{Creator, Opener, SharedMemorySafe, Shm, ShmError, ShmMode, ShmPath};
pub use sync::{NamedMutex, NamedMutexGuard, NamedSemaphore, Timeout};
