//! Logging for overlay-ipc.
//!
//! With the `tracing` feature the crate logs through `tracing`; without it
//! the same macro names expand to `()` and their arguments are never
//! evaluated.

use std::fmt;

/// Installs a stderr subscriber filtered by `RUST_LOG`
/// (default `overlay_ipc=debug`). Safe to call more than once.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("overlay_ipc=debug"));
    let layer = fmt::layer()
        .with_thread_names(true)
        .with_timer(fmt::time::uptime());
    let _ = tracing_subscriber::registry().with(layer).with(filter).try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {
        ()
    };
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {discard as debug, discard as error, discard as info, discard as trace, discard as warn};

/// Severity of a [`log_message`] diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Verbose,
    Info,
    Warning,
    Error,
}

/// Kind of object a diagnostic refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectType {
    Unknown,
    Instance,
    Session,
    Space,
    Swapchain,
}

/// A handle value paired with its object kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectInfo {
    pub handle: u64,
    pub ty: ObjectType,
}

impl fmt::Display for ObjectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#x})", self.ty, self.handle)
    }
}

/// Reports a diagnostic about an intercepted call.
///
/// `command` names the call, `objects` the handles involved (may be empty).
pub fn log_message(severity: Severity, command: &str, objects: &[ObjectInfo], message: &str) {
    let objects = objects
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    match severity {
        Severity::Verbose => {
            debug!(command, objects, "{message}");
        }
        Severity::Info => {
            info!(command, objects, "{message}");
        }
        Severity::Warning => {
            warn!(command, objects, "{message}");
        }
        Severity::Error => {
            error!(command, objects, "{message}");
        }
    }
    #[cfg(not(feature = "tracing"))]
    let _ = (command, objects, message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_info_display() {
        let info = ObjectInfo {
            handle: 0x2a,
            ty: ObjectType::Session,
        };
        assert_eq!(info.to_string(), "Session(0x2a)");
    }

    #[test]
    fn test_log_message_accepts_every_severity() {
        init_tracing();
        let objects = [ObjectInfo {
            handle: 1,
            ty: ObjectType::Instance,
        }];
        for severity in [
            Severity::Verbose,
            Severity::Info,
            Severity::Warning,
            Severity::Error,
        ] {
            log_message(severity, "xrCreateSession", &objects, "test");
        }
        log_message(Severity::Info, "xrDestroyInstance", &[], "no objects");
    }

    #[cfg(not(feature = "tracing"))]
    #[test]
    fn test_disabled_macros_are_expressions() {
        let level = 2;
        let unit: () = match level {
            0 => trace!(level, "zero"),
            1 => debug!(level = %level, "one"),
            2 => info!("two {level}"),
            3 => warn!(?level),
            _ => error!("other"),
        };
        assert_eq!(unit, ());
    }
}
