//! Error types and the fail-fast path for broken invariants.

use std::fmt;
use std::io;

/// Errors raised while building a fiber
#[derive(Debug)]
pub enum Error {
    /// Requested stack is below [`MIN_STACK_SIZE`](crate::stack::MIN_STACK_SIZE)
    StackTooSmall { requested: usize, minimum: usize },
    /// The stack mapping could not be obtained
    StackAlloc { size: usize, source: io::Error },
    /// The usable part of the mapping could not be made writable
    GuardPage(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::StackTooSmall { requested, minimum } => write!(
                f,
                "fiber stack of {} bytes is below the {} byte minimum",
                requested, minimum
            ),
            Error::StackAlloc { size, .. } => {
                write!(f, "failed to map a {} byte fiber stack", size)
            }
            Error::GuardPage(_) => write!(f, "failed to protect fiber stack"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::StackTooSmall { .. } => None,
            Error::StackAlloc { source, .. } => Some(source),
            Error::GuardPage(source) => Some(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Log and abort. Continuing after a broken switching invariant would run on
/// corrupted machine state, and unwinding cannot cross a context switch.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        log::error!($($arg)+);
        eprintln!("myfiber: fatal: {}", format_args!($($arg)+));
        std::process::abort()
    }};
}

pub(crate) use fatal;
