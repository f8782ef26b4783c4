//! Named cross-process synchronization objects over shared memory.
//!
//! - [`NamedSemaphore`] - counting semaphore (an atomic counter in its own object)
//! - [`NamedMutex`] - owner-pid mutex; a lock whose owner died is reclaimed
//! - [`poll_until`] - bounded wait on an arbitrary readiness check
//!
//! There is no kernel wait queue behind these objects. Every wait is a polling
//! loop with a deadline and a spin → yield → sleep backoff, so a single wait
//! can watch several conditions at once (a semaphore and the peer's liveness,
//! or a semaphore and a stop flag).

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use minstant::Instant;

use super::process::{Liveness, PeerProcess, ProcessId};
use super::shmem::{Creator, Opener, SharedMemorySafe, Shm, ShmError, ShmMode, ShmPath};

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

const SPIN_STEPS: u32 = 6;
const YIELD_STEPS: u32 = 10;
const MAX_SLEEP: Duration = Duration::from_millis(1);

/// Escalating pause between checks.
struct Backoff {
    step: u32,
}

impl Backoff {
    const fn new() -> Self {
        Self { step: 0 }
    }

    fn snooze(&mut self) {
        if self.step < SPIN_STEPS {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else if self.step < YIELD_STEPS {
            thread::yield_now();
        } else {
            let micros = 50u64 << (self.step - YIELD_STEPS).min(5);
            thread::sleep(Duration::from_micros(micros).min(MAX_SLEEP));
        }
        self.step = self.step.saturating_add(1);
    }
}

/// Calls `check` until it yields a value or `timeout` passes.
///
/// The check runs at least once, even with a zero timeout.
pub fn poll_until<T>(timeout: Timeout, mut check: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = match timeout {
        Timeout::Infinite => None,
        Timeout::Duration(d) => Some(Instant::now() + d),
    };
    let mut backoff = Backoff::new();
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if let Some(dl) = deadline
            && Instant::now() > dl
        {
            return None;
        }
        backoff.snooze();
    }
}

#[repr(C)]
pub(crate) struct SemaphoreState {
    count: AtomicU32,
}

// SAFETY: repr(C) over an atomic; a zero count is the valid initial state.
unsafe impl SharedMemorySafe for SemaphoreState {}

/// Named counting semaphore.
///
/// Creators unlink the name on drop (see [`Creator`]); openers do not.
pub struct NamedSemaphore<Mode: ShmMode> {
    shm: Shm<SemaphoreState, Mode>,
}

impl NamedSemaphore<Creator> {
    /// Creates the semaphore with `initial` permits.
    ///
    /// # Errors
    ///
    /// See [`Shm::create`].
    pub fn create(path: ShmPath, initial: u32) -> Result<Self, ShmError> {
        let shm = Shm::<SemaphoreState, Creator>::create(path, |slot| {
            slot.write(SemaphoreState {
                count: AtomicU32::new(initial),
            });
        })?;
        Ok(Self { shm })
    }
}

impl NamedSemaphore<Opener> {
    /// Opens a semaphore created by another process.
    ///
    /// # Errors
    ///
    /// See [`Shm::open`].
    pub fn open(path: ShmPath) -> Result<Self, ShmError> {
        Ok(Self {
            shm: Shm::open(path)?,
        })
    }
}

impl<Mode: ShmMode> NamedSemaphore<Mode> {
    /// Releases one permit.
    pub fn post(&self) {
        self.shm.count.fetch_add(1, Ordering::Release);
    }

    /// Takes one permit if one is available.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.shm
            .count
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Waits for a permit. Returns `false` on timeout.
    #[must_use]
    pub fn acquire(&self, timeout: Timeout) -> bool {
        poll_until(timeout, || self.try_acquire().then_some(())).is_some()
    }

    /// Discards every pending permit, returning how many there were.
    pub fn drain(&self) -> u32 {
        self.shm.count.swap(0, Ordering::AcqRel)
    }

    /// Current number of permits (diagnostics only; racy by nature).
    #[must_use]
    pub fn permits(&self) -> u32 {
        self.shm.count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn path(&self) -> &ShmPath {
        self.shm.path()
    }
}

const UNLOCKED: u32 = 0;

#[repr(C)]
pub(crate) struct MutexState {
    /// Pid of the holder, or 0 when unlocked.
    owner: AtomicU32,
}

// SAFETY: repr(C) over an atomic; zero means unlocked.
unsafe impl SharedMemorySafe for MutexState {}

/// Named mutex shared between processes.
///
/// The holder's pid is stored in the object. When a waiter finds the lock
/// held by a process that no longer exists, it takes the lock over instead of
/// waiting forever.
pub struct NamedMutex<Mode: ShmMode> {
    shm: Shm<MutexState, Mode>,
    me: ProcessId,
}

impl NamedMutex<Creator> {
    /// Creates the mutex unlocked.
    ///
    /// # Errors
    ///
    /// See [`Shm::create`].
    pub fn create(path: ShmPath) -> Result<Self, ShmError> {
        let shm = Shm::<MutexState, Creator>::create(path, |slot| {
            slot.write(MutexState {
                owner: AtomicU32::new(UNLOCKED),
            });
        })?;
        Ok(Self {
            shm,
            me: ProcessId::current(),
        })
    }
}

impl NamedMutex<Opener> {
    /// Opens a mutex created by another process.
    ///
    /// # Errors
    ///
    /// See [`Shm::open`].
    pub fn open(path: ShmPath) -> Result<Self, ShmError> {
        Ok(Self {
            shm: Shm::open(path)?,
            me: ProcessId::current(),
        })
    }
}

impl<Mode: ShmMode> NamedMutex<Mode> {
    /// Takes the lock if it is free or abandoned.
    #[must_use]
    pub fn try_lock(&self) -> Option<NamedMutexGuard<'_, Mode>> {
        let owner = &self.shm.owner;
        let me = self.me.as_raw();
        match owner.compare_exchange(UNLOCKED, me, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => Some(NamedMutexGuard { mutex: self }),
            Err(holder) => {
                let abandoned = PeerProcess::new(ProcessId::from_raw(holder)).liveness()
                    == Liveness::Terminated;
                // The guard must only exist once the CAS succeeded: dropping
                // it unlocks.
                if abandoned
                    && owner
                        .compare_exchange(holder, me, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                {
                    Some(NamedMutexGuard { mutex: self })
                } else {
                    None
                }
            }
        }
    }

    /// Waits for the lock. Returns `None` on timeout.
    #[must_use]
    pub fn lock(&self, timeout: Timeout) -> Option<NamedMutexGuard<'_, Mode>> {
        poll_until(timeout, || self.try_lock())
    }

    /// Pid of the current holder, if any.
    #[must_use]
    pub fn holder(&self) -> Option<ProcessId> {
        match self.shm.owner.load(Ordering::Relaxed) {
            UNLOCKED => None,
            pid => Some(ProcessId::from_raw(pid)),
        }
    }
}

/// Holds a [`NamedMutex`] until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct NamedMutexGuard<'a, Mode: ShmMode> {
    mutex: &'a NamedMutex<Mode>,
}

impl<Mode: ShmMode> Drop for NamedMutexGuard<'_, Mode> {
    fn drop(&mut self) {
        self.mutex.shm.owner.store(UNLOCKED, Ordering::Release);
    }
}
