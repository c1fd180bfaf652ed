//! Error types for the FastCGI codec, connection handler, and pool.

use std::io;
use thiserror::Error;

/// Errors surfaced by the record codec, connection state machine, and gateway.
#[derive(Debug, Error)]
pub enum FcgiError {
    /// Underlying I/O failure that isn't a broken pipe.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The stream ended before a full record (or an in-flight request) could be read.
    #[error("truncated FastCGI input")]
    Truncated,

    /// A record header carried a version other than 1.
    #[error("unsupported FastCGI version {0}, expected 1")]
    UnsupportedVersion(u8),

    /// Content bytes didn't match the shape the record type requires
    /// (wrong length, unknown role/status, a reserved flag bit set, a
    /// truncated name-value stream).
    #[error("malformed FastCGI input: {0}")]
    MalformedInput(String),

    /// A record arrived in a state that doesn't allow it: a management
    /// record mid-request, a second BeginRequest before EndRequest, a
    /// record referencing an id that isn't the in-flight request, etc.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A value supplied to a constructor fell outside what the wire
    /// format can represent (content too long, type byte too large).
    #[error("value out of range: {0}")]
    ValueOutOfRange(String),

    /// The peer closed its read side while we were writing a response.
    /// Treated as a benign connection termination, not a fatal error.
    #[error("broken pipe")]
    BrokenPipe,

    /// Propagated from the application callable.
    #[error("application error: {0}")]
    Application(#[from] anyhow::Error),
}

impl FcgiError {
    /// True if this is the broken-pipe case the connection handler should swallow.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, FcgiError::BrokenPipe)
            || matches!(self, FcgiError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe)
    }

    pub(crate) fn from_io(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::BrokenPipe {
            FcgiError::BrokenPipe
        } else {
            FcgiError::Io(e)
        }
    }
}
