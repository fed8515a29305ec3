//! # Meshroom Core
//!
//! Client side of a Meshroom room: every participant holds one direct
//! WebRTC connection to every other participant, negotiated through the
//! signaling relay.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        MESHROOM CORE MODULES                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   UI ──► MeshClient ──► MeshCommand ──► event loop ──► MeshEvent ──► UI │
//! │                                             │                           │
//! │         ┌───────────────────┬───────────────┼────────────────┐          │
//! │         ▼                   ▼               ▼                ▼          │
//! │  ┌──────────────┐  ┌────────────────┐  ┌──────────┐  ┌──────────────┐   │
//! │  │   Channel    │  │  Peer Links    │  │  Media   │  │   Protocol   │   │
//! │  │              │  │                │  │          │  │              │   │
//! │  │ - WebSocket  │  │ - one per      │  │ - ladder │  │ - relay msgs │   │
//! │  │ - keepalive  │  │   remote       │  │ - toggle │  │ - SDP / ICE  │   │
//! │  │ - reconnect  │  │ - negotiation  │  │ - screen │  │   payloads   │   │
//! │  └──────────────┘  └───────┬────────┘  └──────────┘  └──────────────┘   │
//! │                            │                                            │
//! │                            ▼                                            │
//! │               PeerConnection seam (platform / native-rtc)               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error taxonomy and user-facing notifications
//! - [`config`] - Client configuration
//! - [`protocol`] - Relay messages and signaling payloads
//! - [`channel`] - The reconnecting session channel to the relay
//! - [`peer`] - Peer links and their negotiation
//! - [`media`] - Local capture, degradation and screen share
//! - [`events`] - Events for the UI
//! - [`client`] - [`MeshClient`], the handle the UI holds
//!
//! ## Failure containment
//!
//! A denied microphone, a failed peer link or a dropped relay connection is
//! reported as a [`MeshEvent::Notification`] and handled where it happened.
//! None of them ends the session.

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
mod event_loop;
pub mod events;
pub mod media;
pub mod peer;
pub mod protocol;

#[cfg(feature = "native-rtc")]
pub mod rtc;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use client::{generate_room_code, JoinedRoom, MeshClient};
pub use config::ClientConfig;
pub use error::{Error, Notification, Recovery, Result};
pub use events::{ConnectivityState, MeshEvent};
pub use media::{
    LocalMediaState, MediaDevices, MediaTrack, RemoteTrack, RemoteTrackHandle, TrackHandle,
    TrackKind,
};
pub use peer::{PeerConnection, PeerConnectionFactory, PeerInfo, PeerState, Role};
pub use protocol::{RoomId, SessionId};

#[cfg(feature = "native-rtc")]
pub use rtc::{RtcLocalTrack, RtcPeerConnectionFactory, RtcRemoteTrack};

/// Returns the version of Meshroom Core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
