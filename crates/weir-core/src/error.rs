//! Error types for the weir transport

use std::fmt;

use thiserror::Error;

/// Core weir errors
#[derive(Error, Debug)]
pub enum WeirError {
    // Framing errors
    #[error("Negative frame length: {0}")]
    NegativeFrameLength(i32),

    #[error("Frame too large: declared {declared}, limit {limit}")]
    FrameTooLarge { declared: usize, limit: usize },

    #[error("Message too large to frame: {0} bytes")]
    MessageTooLarge(usize),

    // Peer naming errors
    #[error("Invalid peer name: {0}")]
    InvalidPeer(String),

    #[error("Unresolvable peer address: {0}")]
    Unresolvable(String),

    // Transport errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network is not running")]
    NotRunning,

    // Application errors
    #[error("Handler error: {0}")]
    Handler(String),
}

/// Result type for weir operations
pub type WeirResult<T> = Result<T, WeirError>;

/// Why a connection died. Recorded once at the point of failure and logged
/// when the connection is torn down.
#[derive(Debug)]
pub enum CloseReason {
    /// The remote end closed the stream.
    PeerClosed,
    /// A read, write, or connect operation failed.
    Io(std::io::Error),
    /// The remote violated the length-prefix framing.
    Framing(WeirError),
    /// No activity for longer than the configured idle limit.
    IdleTimeout,
    /// An outbound connect did not complete in time.
    ConnectTimeout,
    /// Lost a simultaneous-connect race against the same peer.
    DuplicateConnection,
    /// Local shutdown.
    Shutdown,
}

impl From<WeirError> for CloseReason {
    fn from(err: WeirError) -> Self {
        match err {
            WeirError::Io(e) => CloseReason::Io(e),
            other => CloseReason::Framing(other),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::Io(e) => write!(f, "i/o error: {e}"),
            CloseReason::Framing(e) => write!(f, "framing error: {e}"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::ConnectTimeout => write!(f, "connect timeout"),
            CloseReason::DuplicateConnection => write!(f, "duplicate connection"),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}
