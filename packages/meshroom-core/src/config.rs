//! Client configuration.

use std::time::Duration;

/// Public Google STUN servers used when no ICE servers are configured.
pub const DEFAULT_ICE_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

/// Configuration for a [`MeshClient`](crate::MeshClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the relay, e.g. `ws://localhost:5000/ws`.
    pub relay_url: String,

    /// STUN/TURN URLs handed to every peer connection.
    pub ice_servers: Vec<String>,

    /// Give up after this many consecutive failed reconnects.
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,

    /// How often the client pings the relay.
    pub keepalive_interval: Duration,

    /// Time allowed for the socket handshake plus the `welcome` frame.
    pub connect_timeout: Duration,

    /// A link whose ICE stays `disconnected` this long is treated as failed.
    pub peer_disconnect_grace: Duration,

    /// A link that hasn't connected this long after creation is treated as failed.
    pub negotiation_timeout: Duration,

    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:5000/ws".to_string(),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(25),
            connect_timeout: Duration::from_secs(10),
            peer_disconnect_grace: Duration::from_secs(5),
            negotiation_timeout: Duration::from_secs(20),
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Default::default()
        }
    }
}
