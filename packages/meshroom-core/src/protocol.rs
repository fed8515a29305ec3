//! Wire messages exchanged with the signaling relay.
//!
//! These mirror the relay server's protocol. The signaling payloads carried
//! inside `offer`, `answer` and `candidate` are defined here too: the relay
//! forwards them as opaque JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Relay-assigned identifier of one channel connection.
pub type SessionId = String;

/// Caller-supplied room identifier.
pub type RoomId = String;

// ============================================================================
// RELAY PROTOCOL
// ============================================================================

/// Messages sent from client to relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    JoinRoom { room_id: RoomId },
    LeaveRoom { room_id: RoomId },
    Offer { to: SessionId, payload: Value },
    Answer { to: SessionId, payload: Value },
    Candidate { to: SessionId, payload: Value },
    Ping,
}

/// Messages received from the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Welcome { session_id: SessionId },
    ExistingUsers { room_id: RoomId, users: Vec<SessionId> },
    UserJoined { room_id: RoomId, session_id: SessionId },
    UserLeft { room_id: RoomId, session_id: SessionId },
    Offer { from: SessionId, payload: Value },
    Answer { from: SessionId, payload: Value },
    Candidate { from: SessionId, payload: Value },
    Pong,
    Error { message: String },
}

// ============================================================================
// SIGNALING PAYLOADS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP offer or answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Parse a relayed payload, checking it carries the expected type.
    pub fn from_payload(payload: Value, expected: SdpType) -> Result<Self> {
        let desc: SessionDescription = serde_json::from_value(payload)
            .map_err(|e| Error::InvalidDescription(e.to_string()))?;
        if desc.sdp_type != expected {
            return Err(Error::InvalidDescription(format!(
                "expected {:?}, got {:?}",
                expected, desc.sdp_type
            )));
        }
        if desc.sdp.is_empty() {
            return Err(Error::InvalidDescription("empty sdp".into()));
        }
        Ok(desc)
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }

    pub fn from_payload(payload: Value) -> Result<Self> {
        serde_json::from_value(payload).map_err(|e| Error::InvalidCandidate(e.to_string()))
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ============================================================================
// TESTS
// ============================================================================
