//! # Mesh Client
//!
//! The handle a UI holds. Every call is a command to the event loop task,
//! answered over a oneshot channel; state changes arrive on
//! [`MeshClient::subscribe`].
//!
//! ```ignore
//! let client = MeshClient::connect(config, devices, factory).await?;
//! let mut events = client.subscribe();
//!
//! let room_id = client.create_room();
//! client.join_room(&room_id).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let MeshEvent::RemoteTrack { remote, track } = event {
//!         // attach `track` to the tile for `remote`
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::{ChannelEvent, SessionChannel};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::event_loop::{run_event_loop, EventLoopState};
use crate::events::MeshEvent;
use crate::media::{LocalMediaState, MediaDevices, MediaSourceManager};
use crate::peer::{PeerConnectionFactory, PeerInfo, PeerLinkManager};
use crate::protocol::{RoomId, SessionId};

/// Confirmation of a room join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinedRoom {
    pub room_id: RoomId,
    /// Our session id for this membership
    pub session_id: SessionId,
    /// Members already present, in join order
    pub members: Vec<SessionId>,
}

/// Commands sent to the event loop
pub(crate) enum MeshCommand {
    JoinRoom {
        room_id: RoomId,
        reply: oneshot::Sender<Result<JoinedRoom>>,
    },
    LeaveRoom {
        reply: oneshot::Sender<Result<()>>,
    },
    ToggleMicrophone {
        reply: oneshot::Sender<Result<bool>>,
    },
    ToggleCamera {
        reply: oneshot::Sender<Result<bool>>,
    },
    ToggleScreenShare {
        reply: oneshot::Sender<Result<bool>>,
    },
    RetryPeer {
        remote: SessionId,
        reply: oneshot::Sender<Result<()>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    MediaState {
        reply: oneshot::Sender<LocalMediaState>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl fmt::Debug for MeshCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JoinRoom { room_id, .. } => {
                f.debug_struct("JoinRoom").field("room_id", room_id).finish()
            }
            Self::LeaveRoom { .. } => write!(f, "LeaveRoom"),
            Self::ToggleMicrophone { .. } => write!(f, "ToggleMicrophone"),
            Self::ToggleCamera { .. } => write!(f, "ToggleCamera"),
            Self::ToggleScreenShare { .. } => write!(f, "ToggleScreenShare"),
            Self::RetryPeer { remote, .. } => {
                f.debug_struct("RetryPeer").field("remote", remote).finish()
            }
            Self::Peers { .. } => write!(f, "Peers"),
            Self::MediaState { .. } => write!(f, "MediaState"),
            Self::Shutdown { .. } => write!(f, "Shutdown"),
        }
    }
}

/// Generate a room code: the first group of a UUID v4, upper-cased.
pub fn generate_room_code() -> RoomId {
    let id = uuid::Uuid::new_v4().to_string();
    id.split('-').next().unwrap_or(&id).to_uppercase()
}

/// Handle to a running mesh client. Cheap to clone.
///
/// A lost relay connection is retried automatically up to
/// `max_reconnect_attempts` times. Past that the client emits
/// [`ConnectivityState::Offline`](crate::ConnectivityState::Offline) and
/// [`join_room`](Self::join_room) fails with [`Error::NotConnected`]; peer
/// links already up keep their media. To come back online, [`shutdown`](Self::shutdown)
/// this client and [`connect`](Self::connect) a new one.
#[derive(Clone)]
pub struct MeshClient {
    command_tx: mpsc::Sender<MeshCommand>,
    event_tx: broadcast::Sender<MeshEvent>,
    session_id: Arc<RwLock<Option<SessionId>>>,
    room: Arc<RwLock<Option<RoomId>>>,
    join_timeout: Duration,
    event_loop_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for MeshClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshClient")
            .field("session_id", &*self.session_id.read())
            .field("room", &*self.room.read())
            .finish()
    }
}

impl MeshClient {
    /// Connect to the relay and start the event loop.
    ///
    /// Fails if the relay cannot be reached; the first connection is not
    /// retried.
    pub async fn connect(
        config: ClientConfig,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> Result<Self> {
        let (channel, mut channel_rx) = SessionChannel::spawn(&config);

        let session_id = match tokio::time::timeout(
            config.connect_timeout * 2,
            wait_for_session(&mut channel_rx),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                channel.close();
                return Err(Error::Timeout("connecting to relay".into()));
            }
        };

        let (event_tx, _) = broadcast::channel(config.event_capacity);
        let (command_tx, command_rx) = mpsc::channel(64);

        let (mut peers, peer_rx, timer_rx) =
            PeerLinkManager::new(factory, &config, channel.clone(), event_tx.clone());
        peers.set_local_session(Some(session_id.clone()));

        let shared_session = Arc::new(RwLock::new(Some(session_id.clone())));
        let room = Arc::new(RwLock::new(None));
        let state = EventLoopState::new(
            channel,
            peers,
            MediaSourceManager::new(devices),
            event_tx.clone(),
            shared_session.clone(),
            room.clone(),
        );

        let handle = tokio::spawn(run_event_loop(
            command_rx, channel_rx, peer_rx, timer_rx, state,
        ));

        tracing::info!(
            session_id = session_id.as_str(),
            relay = config.relay_url.as_str(),
            "Mesh client connected"
        );

        Ok(Self {
            command_tx,
            event_tx,
            session_id: shared_session,
            room,
            join_timeout: config.connect_timeout,
            event_loop_handle: Arc::new(RwLock::new(Some(handle))),
        })
    }

    /// Subscribe to client events
    ///
    /// Multiple subscribers are supported.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.event_tx.subscribe()
    }

    /// Our current session id. Changes after a reconnect.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.read().clone()
    }

    /// The room we are in or joining.
    pub fn room(&self) -> Option<RoomId> {
        self.room.read().clone()
    }

    /// A fresh room code to share. Does not join it.
    pub fn create_room(&self) -> RoomId {
        generate_room_code()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> MeshCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(build(tx))
            .await
            .map_err(|_| Error::ShutdownInProgress)?;
        rx.await.map_err(|_| Error::ShutdownInProgress)
    }

    /// Acquire local media and join `room_id`.
    ///
    /// Resolves once the relay has sent the member list; links to every
    /// listed member are being negotiated by then.
    pub async fn join_room(&self, room_id: &str) -> Result<JoinedRoom> {
        let room_id = room_id.trim();
        if room_id.is_empty() {
            return Err(Error::InvalidRoomId(room_id.to_string()));
        }
        let room_id = room_id.to_string();

        match tokio::time::timeout(
            self.join_timeout,
            self.request(|reply| MeshCommand::JoinRoom { room_id, reply }),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => Err(Error::Timeout("waiting for room membership".into())),
        }
    }

    /// Leave the current room. Every peer link and local track is released
    /// before this returns. A no-op when not in a room.
    pub async fn leave_room(&self) -> Result<()> {
        self.request(|reply| MeshCommand::LeaveRoom { reply }).await?
    }

    /// Returns whether the microphone is now enabled.
    pub async fn toggle_microphone(&self) -> Result<bool> {
        self.request(|reply| MeshCommand::ToggleMicrophone { reply })
            .await?
    }

    /// Returns whether the camera is now enabled.
    pub async fn toggle_camera(&self) -> Result<bool> {
        self.request(|reply| MeshCommand::ToggleCamera { reply }).await?
    }

    /// Returns whether the screen is now being shared.
    pub async fn toggle_screen_share(&self) -> Result<bool> {
        self.request(|reply| MeshCommand::ToggleScreenShare { reply })
            .await?
    }

    /// Tear down and rebuild the link to `remote`, offering from our side.
    pub async fn retry_peer(&self, remote: &str) -> Result<()> {
        let remote = remote.to_string();
        self.request(|reply| MeshCommand::RetryPeer { remote, reply })
            .await?
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>> {
        self.request(|reply| MeshCommand::Peers { reply }).await
    }

    pub async fn media_state(&self) -> Result<LocalMediaState> {
        self.request(|reply| MeshCommand::MediaState { reply }).await
    }

    /// Leave any room, close the relay channel and stop the event loop.
    pub async fn shutdown(&self) -> Result<()> {
        // Already stopped is fine
        if self.request(|reply| MeshCommand::Shutdown { reply }).await.is_err() {
            return Ok(());
        }
        let handle = self.event_loop_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!("Mesh client stopped");
        Ok(())
    }
}

async fn wait_for_session(
    channel_rx: &mut mpsc::UnboundedReceiver<ChannelEvent>,
) -> Result<SessionId> {
    while let Some(event) = channel_rx.recv().await {
        match event {
            ChannelEvent::Connected { session_id } => return Ok(session_id),
            ChannelEvent::Closed { error } => return Err(error.unwrap_or(Error::ChannelClosed)),
            other => tracing::debug!(?other, "Channel event before connect"),
        }
    }
    Err(Error::ChannelClosed)
}
