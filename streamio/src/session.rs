//! Session identity and the transport-facing seam.

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Unique identifier for a transport session.
///
/// UUID v4 avoids confusion with transport-internal indices and prevents
/// accidental reuse across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Idle notification kinds a transport may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleKind {
    /// No inbound traffic for the transport's idle period.
    ReadIdle,
    /// No outbound traffic for the transport's idle period.
    WriteIdle,
}

/// Send-side surface of an open transport session.
///
/// Implementations are owned by the transport; the bridge layer keeps a
/// non-owning reference. Every method is a producer operation: O(1)
/// enqueue or flag, never waiting on consumer progress.
pub trait TransportSession: Send + Sync {
    fn id(&self) -> SessionId;

    /// Queue bytes for asynchronous delivery.
    ///
    /// Returns the number of bytes accepted into the outbound queue; zero
    /// means the backlog is above the transport's threshold and the caller
    /// must wait for acknowledgements before retrying. Acceptance of each
    /// submitted byte is reported later through the coordinator's
    /// `on_send_ack`.
    fn send(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Signal that no further outbound data will be submitted.
    fn shutdown_send(&self);

    /// Request session close. The transport fires the close event once the
    /// session is torn down.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_roundtrips_through_display() {
        let id = SessionId::new();
        let parsed = SessionId::parse(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn session_id_serde_is_transparent() {
        let id = SessionId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"550e8400-e29b-41d4-a716-446655440000\"");

        let parsed: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }
}
