//! Errors reported by the operations of a connection.
//!
//! Problems with individual frames are never reported here. A malformed, misaddressed or
//! unexpected frame is dropped inside the dispatch loop and reception continues. What remains
//! are the outcomes the application has to react to: the connection could not be set up, was
//! torn down, or the operation is not legal in its current state.
use core::fmt;

/// The result type for operations on a connection.
pub type Result<T> = core::result::Result<T, Error>;

/// The error type for operations on a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// The operation was not permitted.
    ///
    /// Returned when the device refuses an operation, for example transmitting while it has no
    /// outgoing frame.
    Illegal,

    /// The connection is not established.
    NotEstablished,

    /// The hardware address of the peer, or of the gateway towards it, could not be resolved.
    Unreachable,

    /// The peer did not answer within the configured number of attempts.
    TimedOut,

    /// The peer reset or finished the connection while an operation was in progress.
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Illegal        => write!(f, "illegal operation"),
            Error::NotEstablished => write!(f, "connection not established"),
            Error::Unreachable    => write!(f, "peer unreachable"),
            Error::TimedOut       => write!(f, "timed out"),
            Error::Closed         => write!(f, "connection closed by peer"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

