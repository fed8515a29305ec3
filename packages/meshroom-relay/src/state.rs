//! Server state management.
//!
//! Tracks connected sessions and room membership. Session senders live in a
//! `DashMap`; rooms live in a [`RoomRegistry`] behind one mutex, and every
//! membership notification is queued while that mutex is held.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{RoomId, ServerMessage, SessionId, SignalKind};
use crate::registry::{JoinOutcome, LeaveOutcome, RoomError, RoomRegistry, DEFAULT_MAX_ROOM_MEMBERS};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 5000;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Join requests beyond this many members are refused.
    pub max_room_members: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_room_members: DEFAULT_MAX_ROOM_MEMBERS,
        }
    }
}

impl RelayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A connected session's sender channel.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Snapshot returned by the `/stats` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub connected_sessions: usize,
    pub active_rooms: usize,
    pub room_members: usize,
    pub uptime_secs: i64,
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    /// Session ID → sender channel for connected sessions.
    pub sessions: Arc<DashMap<SessionId, ClientSender>>,

    /// Room membership. Held while membership notifications are queued.
    registry: Arc<Mutex<RoomRegistry>>,

    /// Server configuration.
    pub config: RelayConfig,

    started_at: DateTime<Utc>,
}

impl RelayState {
    /// Create a new relay state with the given configuration.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            registry: Arc::new(Mutex::new(RoomRegistry::new(config.max_room_members))),
            config,
            started_at: Utc::now(),
        }
    }

    // ── Session Management ────────────────────────────────────────────────

    /// Register a new connection and return its freshly minted session id.
    pub fn connect_session(&self, sender: ClientSender) -> SessionId {
        let session_id = Uuid::new_v4().to_string();
        self.sessions.insert(session_id.clone(), sender);
        tracing::info!(session_id = session_id.as_str(), "Session connected");
        session_id
    }

    /// Tear down a session: leave its room (notifying the rest) and drop its sender.
    ///
    /// This is the authoritative cleanup path. It does not assume the client
    /// sent `leave-room` first.
    pub fn disconnect_session(&self, session_id: &str) -> Option<LeaveOutcome> {
        let outcome = {
            let mut registry = self.registry.lock();
            let outcome = registry.disconnect(session_id);
            if let Some(ref left) = outcome {
                self.notify_left(session_id, left);
            }
            outcome
        };

        self.sessions.remove(session_id);
        tracing::info!(session_id = session_id, "Session disconnected");
        outcome
    }

    /// Check if a session is currently connected.
    pub fn is_connected(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Queue a message for a session. Returns false if it is not connected.
    pub fn send_to_session(&self, session_id: &str, message: ServerMessage) -> bool {
        match self.sessions.get(session_id) {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    // ── Rooms ─────────────────────────────────────────────────────────────

    /// Add a session to a room.
    ///
    /// Prior members receive `user-joined` before the newcomer receives
    /// `existing-users`, so no member can see a signal from the newcomer
    /// before learning that it joined.
    pub fn join_room(&self, session_id: &str, room_id: &str) -> Result<JoinOutcome, RoomError> {
        if !self.is_connected(session_id) {
            return Err(RoomError::NotConnected(session_id.to_string()));
        }

        let mut registry = self.registry.lock();
        let outcome = registry.join(session_id, room_id)?;

        if let Some(ref left) = outcome.left {
            self.notify_left(session_id, left);
        }

        if !outcome.already_member {
            for member in &outcome.existing {
                self.send_to_session(
                    member,
                    ServerMessage::UserJoined {
                        room_id: room_id.to_string(),
                        session_id: session_id.to_string(),
                    },
                );
            }
        }

        self.send_to_session(
            session_id,
            ServerMessage::ExistingUsers {
                room_id: room_id.to_string(),
                users: outcome.existing.clone(),
            },
        );
        drop(registry);

        tracing::info!(
            session_id = session_id,
            room_id = room_id,
            existing = outcome.existing.len(),
            rejoin = outcome.already_member,
            "Session joined room"
        );
        Ok(outcome)
    }

    /// Remove a session from a room. A no-op if it is not a member.
    pub fn leave_room(&self, session_id: &str, room_id: &str) -> Option<LeaveOutcome> {
        let mut registry = self.registry.lock();
        let outcome = registry.leave(session_id, room_id)?;
        self.notify_left(session_id, &outcome);
        drop(registry);

        tracing::info!(
            session_id = session_id,
            room_id = room_id,
            remaining = outcome.remaining.len(),
            closed = outcome.room_closed,
            "Session left room"
        );
        Some(outcome)
    }

    fn notify_left(&self, session_id: &str, outcome: &LeaveOutcome) {
        for member in &outcome.remaining {
            self.send_to_session(
                member,
                ServerMessage::UserLeft {
                    room_id: outcome.room_id.clone(),
                    session_id: session_id.to_string(),
                },
            );
        }
    }

    // ── Signal Relay ──────────────────────────────────────────────────────

    /// Forward an offer/answer/candidate to another member of the sender's room.
    ///
    /// Returns whether the message was queued. Nothing is retried or stored:
    /// a dropped signal is recovered by renegotiation on the client side.
    pub fn relay_signal(&self, from: &str, to: &str, kind: SignalKind, payload: Value) -> bool {
        let registry = self.registry.lock();
        if !registry.share_room(from, to) {
            tracing::debug!(
                from = from,
                to = to,
                kind = kind.as_str(),
                "Dropping signal: sessions do not share a room"
            );
            return false;
        }

        let delivered = self.send_to_session(to, kind.forward(from.to_string(), payload));
        drop(registry);

        if delivered {
            tracing::debug!(from = from, to = to, kind = kind.as_str(), "Signal forwarded");
        } else {
            tracing::debug!(
                from = from,
                to = to,
                kind = kind.as_str(),
                "Dropping signal: target not connected"
            );
        }
        delivered
    }

    // ── Introspection ─────────────────────────────────────────────────────

    /// Room id → member count.
    pub fn room_counts(&self) -> HashMap<RoomId, usize> {
        self.registry.lock().room_counts()
    }

    pub fn member_count(&self, room_id: &str) -> Option<usize> {
        self.registry.lock().member_count(room_id)
    }

    pub fn room_of(&self, session_id: &str) -> Option<RoomId> {
        self.registry.lock().room_of(session_id).map(str::to_string)
    }

    pub fn active_rooms(&self) -> usize {
        self.registry.lock().room_count()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> RelayStats {
        let (active_rooms, room_members) = {
            let registry = self.registry.lock();
            (registry.room_count(), registry.member_total())
        };
        RelayStats {
            connected_sessions: self.session_count(),
            active_rooms,
            room_members,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        }
    }
}
