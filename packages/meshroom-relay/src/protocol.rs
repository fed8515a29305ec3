//! Relay protocol message definitions.
//!
//! The relay speaks a simple JSON-over-WebSocket protocol.
//! Signaling payloads are opaque to the relay: SDP and ICE candidates are
//! forwarded verbatim, tagged with the sender's session id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Relay-assigned identifier of one channel connection.
pub type SessionId = String;

/// Caller-supplied room identifier.
pub type RoomId = String;

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Messages sent from a client to the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Request membership of a room. Creates the room if it doesn't exist.
    JoinRoom {
        room_id: RoomId,
    },

    /// Leave a room. Leaving a room you are not in is a no-op.
    LeaveRoom {
        room_id: RoomId,
    },

    /// SDP offer for another session.
    Offer {
        to: SessionId,
        payload: Value,
    },

    /// SDP answer for another session.
    Answer {
        to: SessionId,
        payload: Value,
    },

    /// Trickled ICE candidate for another session.
    Candidate {
        to: SessionId,
        payload: Value,
    },

    /// Ping to keep connection alive.
    Ping,
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First frame on every connection: the session id assigned to it.
    Welcome {
        session_id: SessionId,
    },

    /// Sent to a new member: the other members of the room, in join order.
    ExistingUsers {
        room_id: RoomId,
        users: Vec<SessionId>,
    },

    /// Sent to existing members when someone joins.
    UserJoined {
        room_id: RoomId,
        session_id: SessionId,
    },

    /// Sent to remaining members when someone leaves or disconnects.
    UserLeft {
        room_id: RoomId,
        session_id: SessionId,
    },

    /// An offer forwarded from another session.
    Offer {
        from: SessionId,
        payload: Value,
    },

    /// An answer forwarded from another session.
    Answer {
        from: SessionId,
        payload: Value,
    },

    /// An ICE candidate forwarded from another session.
    Candidate {
        from: SessionId,
        payload: Value,
    },

    /// Pong response to keep connection alive.
    Pong,

    /// Error response.
    Error {
        message: String,
    },
}

// ── Signal Kinds ──────────────────────────────────────────────────────────────

/// The three kinds of message the relay forwards between sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    /// Build the outbound frame delivered to the target session.
    pub fn forward(self, from: SessionId, payload: Value) -> ServerMessage {
        match self {
            SignalKind::Offer => ServerMessage::Offer { from, payload },
            SignalKind::Answer => ServerMessage::Answer { from, payload },
            SignalKind::Candidate => ServerMessage::Candidate { from, payload },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}
