//! # Mesh Events
//!
//! Events emitted by a [`MeshClient`](crate::MeshClient) for the UI to render:
//! remote tracks to attach to tiles, per-peer state, connectivity banners and
//! notifications.

use serde::Serialize;

use crate::error::Notification;
use crate::media::{LocalMediaState, RemoteTrackHandle};
use crate::peer::PeerState;
use crate::protocol::{RoomId, SessionId};

/// Relay connectivity, for a banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ConnectivityState {
    Connected,
    /// Waiting before reconnect attempt `attempt`.
    Reconnecting { attempt: u32 },
    /// Reconnection gave up.
    Offline,
}

/// Events emitted by the mesh client
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// Relay connectivity changed
    Connectivity(ConnectivityState),

    /// The relay confirmed our membership
    RoomJoined {
        room_id: RoomId,
        /// Our session id in this room
        session_id: SessionId,
        /// Other members at join time
        members: Vec<SessionId>,
    },

    /// We left the room; every link and local track is released
    RoomLeft {
        room_id: RoomId,
    },

    /// A remote participant's link changed state
    PeerStateChanged {
        remote: SessionId,
        state: PeerState,
    },

    /// A remote participant started sending a track
    RemoteTrack {
        remote: SessionId,
        track: RemoteTrackHandle,
    },

    /// A link failed and could not recover on its own; offer a manual retry
    PeerUnreachable {
        remote: SessionId,
    },

    /// A participant's link was torn down and should leave the UI
    PeerRemoved {
        remote: SessionId,
    },

    /// Local tracks or their flags changed
    LocalMediaChanged(LocalMediaState),

    /// Something for the user to know about
    Notification(Notification),
}

impl MeshEvent {
    /// The remote session this event concerns, if any.
    pub fn remote(&self) -> Option<&str> {
        match self {
            MeshEvent::PeerStateChanged { remote, .. }
            | MeshEvent::RemoteTrack { remote, .. }
            | MeshEvent::PeerUnreachable { remote }
            | MeshEvent::PeerRemoved { remote } => Some(remote),
            _ => None,
        }
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, MeshEvent::Notification(_))
    }
}
