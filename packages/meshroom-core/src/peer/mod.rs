//! # Peer Links
//!
//! One direct connection per remote participant.
//!
//! - [`connection`]: the seam to the platform WebRTC stack
//! - [`negotiation`]: offer/answer/candidate state for one link
//! - [`manager`]: the set of links, keyed by remote session id

pub mod connection;
pub mod manager;
pub mod negotiation;

#[cfg(test)]
pub(crate) mod fake;

pub use connection::{
    IceConnectionState, PeerConfig, PeerConnection, PeerConnectionEvent, PeerConnectionFactory,
    PeerConnectionHandle, PeerEvent, PeerEventSink,
};
pub use manager::{LinkTimer, PeerInfo, PeerLinkManager, TimerKind};
pub use negotiation::{
    CandidateDisposition, NegotiationEngine, PeerState, Role, SignalingPhase, TrackSwap,
};
