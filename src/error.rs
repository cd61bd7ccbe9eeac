//! Error taxonomy for the allocator subsystem.
//!
//! Every fallible operation returns [`Result<T>`], an alias over
//! [`std::result::Result`] with [`Error`] as the error type. `Error` pairs an
//! [`Errno`] (the taxonomy used by callers to match on failure kind) with a
//! human-readable message built at the call site.

use std::fmt;

/// Coarse failure classification, independent of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// Two extents claim overlapping blocks (double free, corruption).
    ExtentOverlap,
    /// An extent falls, partially or completely, outside the block array.
    ExtentOutOfBounds,
    /// On-disk/in-memory state is already inconsistent.
    InconsistentState,
    /// Completing the requested operation would leave state inconsistent.
    WouldBecomeInconsistent,
    /// The block array or a free-space map ran out of room to satisfy a
    /// request.
    NotEnoughRoom,
    /// A caller passed a value outside of the accepted domain.
    InvalidArgs,
    /// A two-step setup method (`manage_block_array`, `initialize_*`) was
    /// called more than once, or before its prerequisite.
    NotInitialized,
    /// Allocation/deallocation was attempted while blocked by a held guard.
    Blocked,
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Errno::ExtentOverlap => "extent overlap",
            Errno::ExtentOutOfBounds => "extent out of bounds",
            Errno::InconsistentState => "inconsistent state",
            Errno::WouldBecomeInconsistent => "would become inconsistent",
            Errno::NotEnoughRoom => "not enough room",
            Errno::InvalidArgs => "invalid arguments",
            Errno::NotInitialized => "not initialized",
            Errno::Blocked => "blocked",
        };
        f.write_str(name)
    }
}

/// An [`Errno`] plus the message explaining the specific circumstance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    errno: Errno,
    msg: String,
}

impl Error {
    pub fn with_msg(errno: Errno, msg: impl Into<String>) -> Self {
        Self { errno, msg: msg.into() }
    }

    pub fn errno(&self) -> Errno {
        self.errno
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.errno, self.msg)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Builds an `Err(Error::with_msg(...))` from a format string.
macro_rules! return_errno_with_msg {
    ($errno:expr, $($arg:tt)*) => {
        return Err($crate::error::Error::with_msg($errno, format!($($arg)*)))
    };
}

pub(crate) use return_errno_with_msg;
