//! Error types for the transfer engine.

use std::io;

/// Transfer-engine errors.
#[derive(Debug)]
pub enum Error {
    /// Failure reported by the fabric provider.
    Fabric(io::Error),
    /// The peer violated the wire protocol.
    Protocol(&'static str),
    /// A buffer pool or FIFO could not supply or accept a buffer.
    Exhausted(&'static str),
    /// The run was cancelled by a signal before reaching steady state.
    Cancelled,
    /// The peer did not complete the handshake within the deadline.
    HandshakeTimeout,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Fabric(e) => write!(f, "fabric error: {}", e),
            Error::Protocol(what) => write!(f, "protocol error: {}", what),
            Error::Exhausted(what) => write!(f, "out of resources: {}", what),
            Error::Cancelled => write!(f, "cancelled by signal"),
            Error::HandshakeTimeout => write!(f, "peer did not answer the handshake"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Fabric(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Fabric(e)
    }
}

/// Result type for transfer operations.
pub type Result<T> = std::result::Result<T, Error>;
