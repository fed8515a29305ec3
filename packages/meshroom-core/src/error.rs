//! # Error Handling
//!
//! Error types for Meshroom Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                      │
//! │  │                                                                      │
//! │  ├── Client Errors (100)                                                │
//! │  │   ├── NotConnected          - No session with the relay              │
//! │  │   ├── ShutdownInProgress    - Client is shutting down                │
//! │  │   └── NotInRoom             - Operation needs an active room         │
//! │  │                                                                      │
//! │  ├── Capability Errors (200)   - devices; never fatal                   │
//! │  │   ├── PermissionDenied                                               │
//! │  │   ├── DeviceUnavailable                                              │
//! │  │   └── CaptureFailed                                                  │
//! │  │                                                                      │
//! │  ├── Transport Errors (300)    - relay channel                          │
//! │  │   ├── ConnectionFailed                                               │
//! │  │   ├── ChannelClosed                                                  │
//! │  │   ├── Timeout                                                        │
//! │  │   └── ReconnectExhausted                                             │
//! │  │                                                                      │
//! │  ├── Negotiation Errors (400)  - one peer link                          │
//! │  │   ├── InvalidDescription                                             │
//! │  │   ├── InvalidCandidate                                               │
//! │  │   ├── UnexpectedSignal                                               │
//! │  │   ├── PeerConnection                                                 │
//! │  │   └── PeerNotFound                                                   │
//! │  │                                                                      │
//! │  ├── Room Errors (500)                                                  │
//! │  │   ├── InvalidRoomId                                                  │
//! │  │   └── RelayRejected                                                  │
//! │  │                                                                      │
//! │  └── Internal Errors (900)                                              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every error maps to a [`Notification`]: a short message for the UI and a
//! suggested [`Recovery`]. Failures stay contained to the unit they hit (one
//! device, one peer link) and are reported, not propagated upward.

use serde::Serialize;
use thiserror::Error;

/// Result type alias for Meshroom Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Meshroom Core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ========================================================================
    // Client Lifecycle Errors (100-199)
    // ========================================================================

    /// No live session with the relay
    #[error("Not connected to the signaling relay.")]
    NotConnected,

    /// The client is shutting down
    #[error("Meshroom client is shutting down.")]
    ShutdownInProgress,

    /// The operation needs the client to be in a room
    #[error("Not in a room.")]
    NotInRoom,

    // ========================================================================
    // Capability Errors (200-299)
    // ========================================================================

    /// The user or platform refused access to a capture device
    #[error("Permission denied for {0}")]
    PermissionDenied(String),

    /// No such device is present
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device exists but capture failed
    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    // ========================================================================
    // Transport Errors (300-399)
    // ========================================================================

    /// Could not open the channel to the relay
    #[error("Connection to relay failed: {0}")]
    ConnectionFailed(String),

    /// The channel to the relay closed
    #[error("Signaling channel closed")]
    ChannelClosed,

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Reconnection gave up
    #[error("Could not reconnect to relay after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    // ========================================================================
    // Negotiation Errors (400-499)
    // ========================================================================

    /// A session description could not be parsed or applied
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// An ICE candidate could not be parsed or applied
    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    /// A signal arrived in a state that cannot accept it
    #[error("Unexpected {kind} in state {state}")]
    UnexpectedSignal { kind: String, state: String },

    /// The underlying peer connection reported an error
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    /// No link exists for this remote session
    #[error("No peer link for session {0}")]
    PeerNotFound(String),

    // ========================================================================
    // Room Errors (500-599)
    // ========================================================================

    /// Room id was empty or otherwise unusable
    #[error("Invalid room id: {0:?}")]
    InvalidRoomId(String),

    /// The relay refused a request
    #[error("Relay rejected request: {0}")]
    RelayRejected(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Suggested user action attached to a [`Notification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recovery {
    /// Ask the user to re-grant device permissions.
    RetryPermissions,
    /// Offer a manual reconnect to the relay. A client that went offline
    /// stays offline: shut it down and connect a new
    /// [`MeshClient`](crate::MeshClient).
    Reconnect,
    /// Nothing to do; the remote side may come back.
    WaitForPeer,
    /// Offer a manual retry of one peer link.
    RetryPeer,
    None,
}

/// Human-readable, non-blocking notification for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub message: String,
    pub recovery: Recovery,
}

impl Notification {
    pub fn new(message: impl Into<String>, recovery: Recovery) -> Self {
        Self {
            message: message.into(),
            recovery,
        }
    }
}

impl Error {
    /// Get the error code for this error
    pub fn code(&self) -> i32 {
        match self {
            // Client (100-199)
            Error::NotConnected => 100,
            Error::ShutdownInProgress => 101,
            Error::NotInRoom => 102,

            // Capability (200-299)
            Error::PermissionDenied(_) => 200,
            Error::DeviceUnavailable(_) => 201,
            Error::CaptureFailed(_) => 202,

            // Transport (300-399)
            Error::ConnectionFailed(_) => 300,
            Error::ChannelClosed => 301,
            Error::Timeout(_) => 302,
            Error::ReconnectExhausted { .. } => 303,

            // Negotiation (400-499)
            Error::InvalidDescription(_) => 400,
            Error::InvalidCandidate(_) => 401,
            Error::UnexpectedSignal { .. } => 402,
            Error::PeerConnection(_) => 403,
            Error::PeerNotFound(_) => 404,

            // Room (500-599)
            Error::InvalidRoomId(_) => 500,
            Error::RelayRejected(_) => 501,

            // Internal (900-999)
            Error::Internal(_) => 900,
            Error::SerializationError(_) => 901,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can potentially be resolved by retrying
    /// or by user action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NotConnected
                | Error::PermissionDenied(_)
                | Error::DeviceUnavailable(_)
                | Error::CaptureFailed(_)
                | Error::ConnectionFailed(_)
                | Error::ChannelClosed
                | Error::Timeout(_)
                | Error::ReconnectExhausted { .. }
                | Error::InvalidDescription(_)
                | Error::InvalidCandidate(_)
                | Error::UnexpectedSignal { .. }
                | Error::PeerConnection(_)
        )
    }

    /// Is this a device-side failure handled by the acquisition ladder?
    pub fn is_capability(&self) -> bool {
        (200..300).contains(&self.code())
    }

    /// Is this contained to a single peer link?
    pub fn is_negotiation(&self) -> bool {
        (400..500).contains(&self.code())
    }

    /// Suggested recovery for this error.
    pub fn recovery(&self) -> Recovery {
        match self {
            Error::PermissionDenied(_) | Error::DeviceUnavailable(_) | Error::CaptureFailed(_) => {
                Recovery::RetryPermissions
            }
            Error::NotConnected
            | Error::ConnectionFailed(_)
            | Error::ChannelClosed
            | Error::Timeout(_)
            | Error::ReconnectExhausted { .. } => Recovery::Reconnect,
            Error::InvalidDescription(_)
            | Error::InvalidCandidate(_)
            | Error::UnexpectedSignal { .. }
            | Error::PeerConnection(_) => Recovery::RetryPeer,
            Error::PeerNotFound(_) => Recovery::WaitForPeer,
            _ => Recovery::None,
        }
    }

    /// Notification for the UI collaborator.
    pub fn notification(&self) -> Notification {
        Notification::new(self.to_string(), self.recovery())
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Error::ChannelClosed,
            other => Error::ConnectionFailed(other.to_string()),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
