//! Process identity and peer liveness.
//!
//! A process id names per-overlay shared objects and doubles as the only
//! "the peer is gone" signal. Liveness is checked through a pidfd, which
//! turns readable once the process exits even if its parent has not reaped
//! it yet. Kernels without `pidfd_open` fall back to `kill(pid, 0)`, which
//! only notices reaped processes.

use std::fmt;

use rustix::event::{PollFd, PollFlags, Timespec, poll};
use rustix::io;
use rustix::process::{Pid, PidfdFlags, pidfd_open, test_kill_process};
use serde::{Deserialize, Serialize};

use super::shmem::SharedMemorySafe;

/// Operating system process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ProcessId(u32);

// SAFETY: repr(transparent) over u32.
unsafe impl SharedMemorySafe for ProcessId {}

impl ProcessId {
    /// The calling process.
    #[must_use]
    pub fn current() -> Self {
        Self(std::process::id())
    }

    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl From<u32> for ProcessId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Terminated,
    /// The check itself failed; the peer's state is unknown.
    Unknown(io::Errno),
}

/// The remote end of a channel, watched for termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerProcess {
    pid: ProcessId,
}

impl PeerProcess {
    #[must_use]
    pub const fn new(pid: ProcessId) -> Self {
        Self { pid }
    }

    #[must_use]
    pub const fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Checks on the peer without sending a signal.
    ///
    /// An exited process counts as terminated while it is still a zombie.
    /// Pid 0 and pids outside the positive `pid_t` range can never name a
    /// peer and report [`Liveness::Terminated`].
    #[must_use]
    pub fn liveness(&self) -> Liveness {
        let Some(pid) = i32::try_from(self.pid.0).ok().and_then(Pid::from_raw) else {
            return Liveness::Terminated;
        };
        match pidfd_open(pid, PidfdFlags::empty()) {
            Ok(pidfd) => {
                let mut fds = [PollFd::new(&pidfd, PollFlags::IN)];
                let now = Timespec { tv_sec: 0, tv_nsec: 0 };
                match poll(&mut fds, Some(&now)) {
                    Ok(0) => Liveness::Alive,
                    Ok(_) => Liveness::Terminated,
                    Err(err) => Liveness::Unknown(err),
                }
            }
            Err(io::Errno::SRCH) => Liveness::Terminated,
            Err(_) => Self::signal_check(pid),
        }
    }

    /// `EPERM` means the process exists but belongs to someone else, so it
    /// counts as alive.
    fn signal_check(pid: Pid) -> Liveness {
        match test_kill_process(pid) {
            Ok(()) | Err(io::Errno::PERM) => Liveness::Alive,
            Err(io::Errno::SRCH) => Liveness::Terminated,
            Err(err) => Liveness::Unknown(err),
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.liveness() == Liveness::Alive
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::process::Command;

    /// Spawns a short-lived child and reaps it, returning a pid that is no
    /// longer running.
    pub(crate) fn reaped_pid() -> ProcessId {
        let mut child = Command::new("true").spawn().expect("spawn `true`");
        let pid = child.id();
        child.wait().expect("reap child");
        ProcessId::from_raw(pid)
    }

    #[test]
    fn test_current_process_is_alive() {
        let me = PeerProcess::new(ProcessId::current());
        assert_eq!(me.liveness(), Liveness::Alive);
        assert!(me.is_alive());
    }

    #[test]
    fn test_reaped_child_is_terminated() {
        let peer = PeerProcess::new(reaped_pid());
        assert_eq!(peer.liveness(), Liveness::Terminated);
    }

    #[test]
    fn test_exited_child_is_terminated_before_reaping() {
        let mut child = Command::new("true").spawn().expect("spawn `true`");
        let peer = PeerProcess::new(ProcessId::from_raw(child.id()));
        let mut liveness = peer.liveness();
        for _ in 0..500 {
            if liveness == Liveness::Terminated {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
            liveness = peer.liveness();
        }
        // Not reaped yet: the child is a zombie at this point.
        assert_eq!(liveness, Liveness::Terminated);
        assert!(child.wait().expect("reap child").success());
    }

    #[test]
    fn test_invalid_pids_are_terminated() {
        assert_eq!(
            PeerProcess::new(ProcessId::from_raw(0)).liveness(),
            Liveness::Terminated
        );
        assert_eq!(
            PeerProcess::new(ProcessId::from_raw(u32::MAX)).liveness(),
            Liveness::Terminated
        );
    }
}
