//! The platform WebRTC seam.
//!
//! Meshroom drives negotiation but does not implement ICE, DTLS or RTP. A
//! backend implements [`PeerConnection`] over its WebRTC stack and reports
//! asynchronous happenings through the [`PeerEventSink`] it was built with.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::{RemoteTrackHandle, TrackHandle, TrackKind};
use crate::protocol::{IceCandidate, SessionDescription, SessionId};

/// ICE transport state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }
}

/// One direct connection to a remote session.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach an outbound track. Takes effect with the next offer/answer.
    async fn add_track(&self, track: TrackHandle) -> Result<()>;

    /// Swap the outbound track of `kind` in place, without renegotiation.
    ///
    /// Returns `false` if there is no sender of that kind to reuse.
    async fn replace_track(&self, kind: TrackKind, track: Option<TrackHandle>) -> Result<bool>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Tear down the transport. Idempotent.
    async fn close(&self) -> Result<()>;
}

pub type PeerConnectionHandle = Arc<dyn PeerConnection>;

/// Settings handed to every new peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub ice_servers: Vec<String>,
}

/// Creates peer connections.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, config: &PeerConfig, events: PeerEventSink) -> Result<PeerConnectionHandle>;
}

/// Something the backend observed on a connection.
#[derive(Debug, Clone)]
pub enum PeerConnectionEvent {
    /// A local ICE candidate to trickle to the remote side.
    LocalCandidate(IceCandidate),
    IceStateChanged(IceConnectionState),
    /// The remote side started sending a track.
    RemoteTrack(RemoteTrackHandle),
}

/// A [`PeerConnectionEvent`] tagged with the link it belongs to.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub remote: SessionId,
    /// Generation of the link; events from torn-down links are ignored.
    pub link_id: u64,
    pub event: PeerConnectionEvent,
}

/// Where a backend sends events for one connection.
#[derive(Clone)]
pub struct PeerEventSink {
    remote: SessionId,
    link_id: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl fmt::Debug for PeerEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerEventSink")
            .field("remote", &self.remote)
            .field("link_id", &self.link_id)
            .finish()
    }
}

impl PeerEventSink {
    pub fn new(remote: SessionId, link_id: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { remote, link_id, tx }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn emit(&self, event: PeerConnectionEvent) {
        let _ = self.tx.send(PeerEvent {
            remote: self.remote.clone(),
            link_id: self.link_id,
            event,
        });
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(PeerConnectionEvent::LocalCandidate(candidate));
    }

    pub fn ice_state(&self, state: IceConnectionState) {
        self.emit(PeerConnectionEvent::IceStateChanged(state));
    }

    pub fn remote_track(&self, track: RemoteTrackHandle) {
        self.emit(PeerConnectionEvent::RemoteTrack(track));
    }
}
