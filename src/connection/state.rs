//! Connection lifecycle state.

use std::fmt;

/// Lifecycle state of a [`super::Connection`].
///
/// `Closed` and `Failure` are terminal: every other state is reachable from
/// any non-terminal state via the transitions documented on the connection
/// task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket yet.
    Disconnected,
    /// TCP connect in progress.
    Connecting,
    /// Sent `IDENTIFY`, awaiting the feature negotiation response.
    Identifying,
    /// Handshake complete; may send commands and is processing inbound
    /// frames.
    Ready,
    /// Draining the outbound command queue.
    Pulsing,
    /// Ready-count is zero; no new messages will be delivered.
    Paused,
    /// `close()` has been called; draining inflight messages.
    Closing,
    /// Closed cleanly. Terminal.
    Closed,
    /// Reconnect attempts exhausted, or an unrecoverable protocol error.
    /// Terminal.
    Failure(String),
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl ConnectionState {
    /// True for `Closed` and `Failure`, which no further transition leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failure(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Identifying => write!(f, "identifying"),
            Self::Ready => write!(f, "ready"),
            Self::Pulsing => write!(f, "pulsing"),
            Self::Paused => write!(f, "paused"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Failure(msg) => write!(f, "failure: {msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn only_closed_and_failure_are_terminal() {
        assert!(!ConnectionState::Ready.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Failure("x".into()).is_terminal());
    }
}
