//! Error taxonomy observed by tasks awaiting I/O.

use std::fmt;

/// What an I/O awaiter can resolve to besides a non-negative result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// Kernel completion result was negative; carries the decoded errno.
    Sys(i32),
    /// The I/O context refused the submission because it is shutting down.
    CtxClosed,
    /// A link-timeout fired and the primary op was cancelled.
    Timeout,
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sys(errno) => {
                write!(f, "{}", std::io::Error::from_raw_os_error(*errno))
            }
            Self::CtxClosed => write!(f, "io context closed"),
            Self::Timeout => write!(f, "timed out"),
        }
    }
}

impl std::error::Error for IoError {}

pub type IoResult = std::result::Result<i32, IoError>;
