//! Event and request types exchanged between the engine and its host.
//!
//! - [`InboundEvent`] flows *out* of the engine: a peer connected, left, or
//!   sent a message.
//! - [`OutboundRequest`] flows *in*: the host wants to send something to a
//!   session.
//! - [`ConnectionStatus`] and [`ReceivedMessage`] are the two simplified
//!   projections a UI usually wants; they serialize to camelCase JSON.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use wsdock_core::CloseCode;

/// Identifies one live connection: the peer's `host:port` at accept time.
///
/// Unique among currently registered connections.  A key may be reused once
/// the earlier connection with the same peer address has gone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SocketAddr> for SessionId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something that happened on a connection.
///
/// Events for one connection are emitted in wire order; there is no ordering
/// between different connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Upgrade completed; the session is registered and can receive sends.
    Connected(SessionId),
    /// The peer closed, the transport failed, or the server stopped.
    Disconnected(SessionId),
    /// The server closed the connection with `code` after a protocol error.
    ClosedWithCode { id: SessionId, code: CloseCode },
    TextReceived { id: SessionId, text: String },
    BinaryReceived { id: SessionId, data: Vec<u8> },
}

impl InboundEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            InboundEvent::Connected(id) | InboundEvent::Disconnected(id) => id,
            InboundEvent::ClosedWithCode { id, .. }
            | InboundEvent::TextReceived { id, .. }
            | InboundEvent::BinaryReceived { id, .. } => id,
        }
    }

    /// Connection-status projection: `Some` for connect/disconnect/close.
    pub fn status(&self) -> Option<ConnectionStatus> {
        let is_connect = match self {
            InboundEvent::Connected(_) => true,
            InboundEvent::Disconnected(_) | InboundEvent::ClosedWithCode { .. } => false,
            _ => return None,
        };
        Some(ConnectionStatus {
            session_id: self.session_id().clone(),
            is_connect,
        })
    }

    /// Message projection: text as-is, binary only if it is valid UTF-8.
    pub fn message(&self) -> Option<ReceivedMessage> {
        let content = match self {
            InboundEvent::TextReceived { text, .. } => text.clone(),
            InboundEvent::BinaryReceived { data, .. } => {
                std::str::from_utf8(data).ok()?.to_string()
            }
            _ => return None,
        };
        Some(ReceivedMessage {
            session_id: self.session_id().clone(),
            content,
        })
    }
}

/// A send the host wants performed.  Unknown session ids are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundRequest {
    SendText { id: SessionId, text: String },
    SendBinary { id: SessionId, data: Vec<u8> },
}

impl OutboundRequest {
    pub fn session_id(&self) -> &SessionId {
        match self {
            OutboundRequest::SendText { id, .. } | OutboundRequest::SendBinary { id, .. } => id,
        }
    }
}

/// `{"sessionId": "...", "isConnect": true}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub session_id: SessionId,
    pub is_connect: bool,
}

/// `{"sessionId": "...", "content": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    pub session_id: SessionId,
    pub content: String,
}

/// Lifecycle of a [`crate::infrastructure::ServerEngine`].
///
/// ```text
/// Idle → Starting → Listening → Stopping → Idle
///            ↓
///          Failed → (next start) Starting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Idle,
    Starting,
    Listening,
    Stopping,
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Starting => "starting",
            EngineState::Listening => "listening",
            EngineState::Stopping => "stopping",
            EngineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
