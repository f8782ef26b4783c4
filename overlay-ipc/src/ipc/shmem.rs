//! POSIX shared memory with typestate-based cleanup.
//!
//! Every cross-process object in this crate (negotiation record, RPC segment,
//! named semaphores and mutexes) is a [`Shm<T, Mode>`] over a `#[repr(C)]`
//! type that is valid when all of its bytes are zero. A freshly truncated
//! POSIX shared memory object is zero-filled, so an opener that races the
//! creator never observes an invalid value.
//!
//! - [`Shm<T, Mode>`] - smart pointer to a mapped object
//! - [`SharedMemorySafe`] - marker for types that may live in shared memory
//! - [`Creator`] - creates the object, unmaps and unlinks on drop
//! - [`Opener`] - opens an existing object, only unmaps on drop
//!
//! ```no_run
//! use overlay_ipc::ipc::shmem::{Creator, Opener, Shm, ShmPath, ShmError};
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! let path = ShmPath::new("/my-counter")?;
//! let counter = Shm::<AtomicU64, Creator>::create(path.clone(), |slot| {
//!     slot.write(AtomicU64::new(0));
//! })?;
//! counter.store(42, Ordering::Release);
//!
//! let other = Shm::<AtomicU64, Opener>::open(path)?;
//! assert_eq!(other.load(Ordering::Acquire), 42);
//! # Ok::<(), ShmError>(())
//! ```

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use std::fmt;
use std::marker::PhantomData;
use std::mem::{MaybeUninit, size_of};
use std::ops::Deref;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`Shm`] and [`ShmPath`].
#[derive(Debug)]
pub enum ShmError {
    /// The provided POSIX shared memory name is invalid.
    InvalidPath { path: String, reason: &'static str },
    /// `mmap`, `shm_open`, `ftruncate`, etc. failed with an errno.
    PosixError {
        op: &'static str,
        path: String,
        source: io::Errno,
    },
    /// The existing shared memory object has a different size than `T`.
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
}

impl ShmError {
    fn posix(op: &'static str, path: &ShmPath, err: io::Errno) -> Self {
        Self::PosixError {
            op,
            path: path.to_string(),
            source: err,
        }
    }

    /// The errno behind this error, if it came from a system call.
    #[must_use]
    pub fn errno(&self) -> Option<io::Errno> {
        match self {
            Self::PosixError { source, .. } => Some(*source),
            _ => None,
        }
    }

    /// True when the object does not exist (`ENOENT`).
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.errno() == Some(io::Errno::NOENT)
    }

    /// True when creation failed because the name is taken (`EEXIST`).
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        self.errno() == Some(io::Errno::EXIST)
    }
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmError::InvalidPath { path, reason } => {
                write!(f, "invalid shared memory path `{}`: {}", path, reason)
            }
            ShmError::PosixError { op, path, source } => {
                write!(f, "{} failed for `{}`: {}", op, path, source)
            }
            ShmError::SizeMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "shared memory `{}` size mismatch: expected {} bytes, got {}",
                path, expected, actual
            ),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShmError::PosixError { source, .. } => Some(source),
            _ => None,
        }
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated POSIX shared memory object name.
///
/// Must start with `/`, contain no other `/`, and be at most 255 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    /// Validates `path` as a portable `shm_open` name.
    ///
    /// # Errors
    ///
    /// [`ShmError::InvalidPath`] describing the first violated rule.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate_shm_path(&path)?;
        Ok(Self(path))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ShmPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ShmPath> for String {
    fn from(path: ShmPath) -> Self {
        path.0
    }
}

fn validate_shm_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must start with '/'",
        });
    }

    if path[1..].contains('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must not contain additional '/' characters",
        });
    }

    if path.len() > POSIX_NAME_MAX {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path length must be <= 255 bytes",
        });
    }

    Ok(())
}

/// Removes a shared memory name, ignoring a missing object.
///
/// Used to clear names left behind by a crashed owner before re-creating them.
pub fn unlink_stale(path: &ShmPath) {
    let _ = shm::unlink(path.as_str());
}

/// Cleanup behavior of a [`Shm`] mapping.
pub trait ShmMode {
    /// Whether to unlink the shared memory name on drop.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker: this mapping created the object and unlinks it on drop.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker: this mapping opened an existing object; no unlink on drop.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types safe to place in POSIX shared memory and access from several processes.
///
/// # Safety
///
/// Implementers must guarantee:
/// - `#[repr(C)]` or `#[repr(transparent)]` layout
/// - the all-zero bit pattern is a valid value
/// - no process-local pointers are dereferenced by the type itself (pointer-sized
///   slots that are relocated through a fixup ledger are plain integers here)
/// - concurrent access is mediated by atomics or by an external protocol
/// - safety does not depend on `Drop` running (crashed processes skip it)
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    bool,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// Smart pointer to a POSIX shared memory object holding one `T`.
///
/// The `Mode` parameter ([`Creator`] or [`Opener`]) fixes cleanup at compile
/// time: creators unmap and unlink, openers only unmap. The kernel frees the
/// memory once the name is unlinked and every mapping is gone.
///
/// Two mappings of the same object (even in one process) live at different
/// virtual addresses, which is exactly why pointers stored inside the object
/// must be relocated before the other side reads them.
pub struct Shm<T: SharedMemorySafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    size: usize,
    path: ShmPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: T: SharedMemorySafe requires Send + Sync, and the mapping is not
// tied to the thread that created it.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Send for Shm<T, Mode> {}

// SAFETY: shared access only hands out &T, and T is Sync.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

fn map_shared(fd: &std::os::fd::OwnedFd, size: usize) -> io::Result<*mut std::ffi::c_void> {
    // SAFETY: a fresh MAP_SHARED mapping chosen by the kernel; it aliases no
    // Rust object in this process and is page aligned, which satisfies the
    // alignment of every T used here.
    unsafe {
        mmap(
            null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
}

impl<T: SharedMemorySafe> Shm<T, Creator> {
    /// Creates a new object named `path`, sized for `T`, and maps it.
    ///
    /// The memory arrives zero-filled; `init` may write the initial value.
    /// Whatever `init` leaves untouched stays zero, which `SharedMemorySafe`
    /// guarantees is valid.
    ///
    /// # Errors
    ///
    /// `EEXIST` if the name is taken, `EACCES`, `ENOMEM`, or an `ftruncate` /
    /// `mmap` failure. Partially created objects are unlinked before returning.
    ///
    /// # Panics
    ///
    /// Propagates a panic from `init` after unmapping and unlinking.
    pub fn create(path: ShmPath, init: impl FnOnce(&mut MaybeUninit<T>)) -> Result<Self> {
        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        if let Err(e) = ftruncate(&fd, size_of::<T>() as u64) {
            drop(fd);
            let _ = shm::unlink(path.as_str());
            return Err(ShmError::posix("ftruncate", &path, e));
        }

        let ptr = match map_shared(&fd, size_of::<T>()) {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path.as_str());
                return Err(ShmError::posix("mmap", &path, err));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr.cast::<T>()) };

        let shm = Self {
            ptr,
            size: size_of::<T>(),
            path,
            _mode: PhantomData,
        };

        let init_result = catch_unwind(AssertUnwindSafe(|| {
            // SAFETY: the mapping is exclusively ours until create() returns,
            // and MaybeUninit<T> has the layout of T.
            let slot = unsafe { &mut *shm.ptr.as_ptr().cast::<MaybeUninit<T>>() };
            init(slot);
        }));

        match init_result {
            Ok(()) => Ok(shm),
            Err(payload) => {
                drop(shm);
                resume_unwind(payload);
            }
        }
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Opens an existing object named `path` and maps it.
    ///
    /// # Errors
    ///
    /// `ENOENT` if it does not exist, `EACCES`, [`ShmError::SizeMismatch`] when
    /// the object was created for a different `T`, or an `mmap` failure.
    pub fn open(path: ShmPath) -> Result<Self> {
        let fd = shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", &path, err))?;
        let expected_size = size_of::<T>() as i64;
        if stat.st_size != expected_size {
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        let ptr = map_shared(&fd, size_of::<T>()).map_err(|err| ShmError::posix("mmap", &path, err))?;

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr.cast::<T>()) };

        Ok(Self {
            ptr,
            size: size_of::<T>(),
            path,
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Shm<T, Mode> {
    /// Base address of this process's mapping.
    #[must_use]
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.size);
        }

        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the mapping is valid and initialized for the lifetime of
        // self (zero bytes are a valid T), and T: Sync covers concurrent access.
        unsafe { self.ptr.as_ref() }
    }
}
