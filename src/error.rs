//! Crate-level error type.
//!
//! Mirrors the shape of `channel::ChannelError` in the repo this grew out of:
//! a small set of named variants with a manual `Display` impl rather than a
//! derive-macro error crate, so callers can match on the variant instead of
//! parsing a message string.

use std::fmt;

/// Errors surfaced by connections, the publisher, the subscriber, and lookup.
#[derive(Debug)]
pub enum Error {
    /// Transport-level failure: connect, read, or write.
    Io(std::io::Error),
    /// A frame violated the wire protocol (bad magic, truncated size, etc).
    Protocol(String),
    /// `nsqd` returned an `ERROR` frame for a command.
    ServerError {
        /// Raw NSQ error code, e.g. `E_INVALID`, `E_FIN_FAILED`.
        code: String,
        /// Full error text as sent by `nsqd`.
        message: String,
    },
    /// A `nsqlookupd` host could not be reached or returned malformed JSON.
    Lookup {
        /// The lookup URL that failed.
        host: String,
        /// Underlying cause.
        source: String,
    },
    /// The caller asked for something the protocol does not allow, e.g.
    /// a negative delay on `DPUB` or combining a delay with `MPUB`.
    InvalidInvocation(String),
    /// The connection reached its terminal `Failure` state (reconnects
    /// exhausted or a non-recoverable protocol error).
    Terminal(String),
    /// The connection or subscriber was already closed.
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::ServerError { code, message } => write!(f, "server error {code}: {message}"),
            Self::Lookup { host, source } => write!(f, "lookup error for {host}: {source}"),
            Self::InvalidInvocation(msg) => write!(f, "invalid invocation: {msg}"),
            Self::Terminal(msg) => write!(f, "connection terminated: {msg}"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl Error {
    /// Raw NSQ error code for a `ServerError`, if any.
    pub fn server_code(&self) -> Option<&str> {
        match self {
            Self::ServerError { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// True if this error leaves the connection usable (a single command
    /// failed) rather than terminal (the connection itself is gone).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ServerError { .. } | Self::InvalidInvocation(_))
    }
}

/// Convenience alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, Error>;
