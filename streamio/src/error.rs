//! Error taxonomy for the bridge layer.
//!
//! Two layers: [`TransportError`] is the lower-layer cause a bridge records
//! in its terminal state (cloneable, so every call that observes the state
//! receives the same cause), [`BridgeError`] is what consumer-side calls
//! return. A graceful close is never an error on the read side — it
//! surfaces as EOF (`Ok(0)`).

use std::io;
use std::time::Duration;

/// Lower-layer transport failure, recorded as a terminal cause.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("broken pipe")]
    BrokenPipe,

    /// The transport saw no inbound traffic for longer than the configured
    /// read timeout.
    #[error("read idle timeout exceeded")]
    ReadIdle,

    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

/// Errors surfaced by consumer-side bridge calls.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A blocked `read` exceeded the configured read timeout.
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// A blocked `write` or `flush` exceeded the configured write timeout.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// The transport reported a failure; the recorded cause is delivered
    /// to every call that observes the terminal state.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The session is closed. Writes and flushes after close get this;
    /// reads observe EOF instead.
    #[error("session closed")]
    SessionClosed,

    /// Coordinator misuse: duplicate open, or an event for an unregistered
    /// session. A programming defect, not a recoverable condition.
    #[error("illegal bridge state: {0}")]
    IllegalState(String),

    /// The per-session worker thread could not be started.
    #[error("failed to spawn session worker: {0}")]
    WorkerSpawn(String),
}

impl From<BridgeError> for io::Error {
    fn from(err: BridgeError) -> Self {
        let kind = match &err {
            BridgeError::ReadTimeout(_) | BridgeError::WriteTimeout(_) => io::ErrorKind::TimedOut,
            BridgeError::Transport(TransportError::ConnectionReset) => {
                io::ErrorKind::ConnectionReset
            }
            BridgeError::Transport(TransportError::BrokenPipe) => io::ErrorKind::BrokenPipe,
            BridgeError::Transport(TransportError::ReadIdle) => io::ErrorKind::TimedOut,
            BridgeError::Transport(TransportError::Other(_)) => io::ErrorKind::Other,
            BridgeError::SessionClosed => io::ErrorKind::BrokenPipe,
            BridgeError::IllegalState(_) | BridgeError::WorkerSpawn(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_cause_is_preserved_through_io_error() {
        let err: io::Error = BridgeError::Transport(TransportError::ConnectionReset).into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn timeouts_map_to_timed_out() {
        let read: io::Error = BridgeError::ReadTimeout(Duration::from_millis(100)).into();
        let write: io::Error = BridgeError::WriteTimeout(Duration::from_millis(100)).into();
        assert_eq!(read.kind(), io::ErrorKind::TimedOut);
        assert_eq!(write.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn session_closed_maps_to_broken_pipe() {
        let err: io::Error = BridgeError::SessionClosed.into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn transport_error_display() {
        assert_eq!(
            TransportError::other("dns lookup failed").to_string(),
            "transport failure: dns lookup failed"
        );
        assert_eq!(
            TransportError::ReadIdle.to_string(),
            "read idle timeout exceeded"
        );
    }
}
