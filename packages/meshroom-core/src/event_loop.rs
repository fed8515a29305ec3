//! # Client Event Loop
//!
//! The single task that owns all mutable client state.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        EVENT LOOP                                       │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  MeshCommand rx ───────┐                                                │
//! │  (MeshClient API)      │        ┌──────────────────────────┐            │
//! │                        ├───────►│  tokio::select! {        │            │
//! │  ChannelEvent rx ──────┤        │    command               │            │
//! │  (relay)               │        │    channel event         │            │
//! │                        │        │    peer event            │            │
//! │  PeerEvent rx ─────────┤        │    link timer            │            │
//! │  (WebRTC backend)      │        │  }                       │            │
//! │                        │        └────────────┬─────────────┘            │
//! │  LinkTimer rx ─────────┘                     │                          │
//! │                                              ▼                          │
//! │                                   MeshEvent broadcast                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing here blocks on the network: commands that need a relay answer
//! (joining a room) park their reply sender until the answer arrives.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::channel::{ChannelEvent, SessionChannel};
use crate::client::{JoinedRoom, MeshCommand};
use crate::error::{Error, Notification, Result};
use crate::events::{ConnectivityState, MeshEvent};
use crate::media::{MediaSourceManager, TrackKind};
use crate::peer::{LinkTimer, PeerEvent, PeerLinkManager, Role};
use crate::protocol::{ClientMessage, RoomId, ServerMessage, SessionId};

/// A join waiting for the relay's `existing-users`.
struct PendingJoin {
    room_id: RoomId,
    reply: oneshot::Sender<Result<JoinedRoom>>,
}

/// State owned by the event loop
pub(crate) struct EventLoopState {
    channel: SessionChannel,
    peers: PeerLinkManager,
    media: MediaSourceManager,
    event_tx: broadcast::Sender<MeshEvent>,
    /// Current session id, shared with the client handle
    session_id: Arc<RwLock<Option<SessionId>>>,
    /// Room we are in or joining, shared with the client handle
    room: Arc<RwLock<Option<RoomId>>>,
    pending_join: Option<PendingJoin>,
    connected: bool,
}

impl EventLoopState {
    pub(crate) fn new(
        channel: SessionChannel,
        peers: PeerLinkManager,
        media: MediaSourceManager,
        event_tx: broadcast::Sender<MeshEvent>,
        session_id: Arc<RwLock<Option<SessionId>>>,
        room: Arc<RwLock<Option<RoomId>>>,
    ) -> Self {
        let connected = session_id.read().is_some();
        Self {
            channel,
            peers,
            media,
            event_tx,
            session_id,
            room,
            pending_join: None,
            connected,
        }
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.event_tx.send(event);
    }

    fn notify(&self, notification: Notification) {
        self.emit(MeshEvent::Notification(notification));
    }

    fn current_room(&self) -> Option<RoomId> {
        self.room.read().clone()
    }

    fn in_room(&self, room_id: &str) -> bool {
        self.room.read().as_deref() == Some(room_id)
    }

    fn media_changed(&self) {
        self.emit(MeshEvent::LocalMediaChanged(self.media.state()));
    }

    // ── Room ──────────────────────────────────────────────────────────────

    async fn join_room(&mut self, room_id: RoomId, reply: oneshot::Sender<Result<JoinedRoom>>) {
        if !self.connected {
            let _ = reply.send(Err(Error::NotConnected));
            return;
        }
        if let Some(current) = self.current_room() {
            if current != room_id {
                tracing::info!(from = current.as_str(), to = room_id.as_str(), "Switching rooms");
                self.leave_current(false).await;
            }
        }
        if let Some(previous) = self.pending_join.take() {
            let _ = previous
                .reply
                .send(Err(Error::Internal("superseded by a newer join".into())));
        }

        // Media first, so the first offer already carries the tracks.
        for notice in self.media.acquire().await {
            self.notify(notice);
        }
        self.media_changed();

        *self.room.write() = Some(room_id.clone());
        if let Err(e) = self.channel.send(ClientMessage::JoinRoom {
            room_id: room_id.clone(),
        }) {
            *self.room.write() = None;
            let _ = reply.send(Err(e));
            return;
        }
        tracing::info!(room_id = room_id.as_str(), "Joining room");
        self.pending_join = Some(PendingJoin { room_id, reply });
    }

    async fn leave_room(&mut self) -> Result<()> {
        if let Some(pending) = self.pending_join.take() {
            let _ = pending.reply.send(Err(Error::NotInRoom));
        }
        self.leave_current(true).await;
        Ok(())
    }

    /// Close every link and forget the room. Safe to call when not in one.
    async fn leave_current(&mut self, release_media: bool) {
        let room = self.room.write().take();
        if let Some(ref room_id) = room {
            if self.connected {
                let _ = self.channel.send(ClientMessage::LeaveRoom {
                    room_id: room_id.clone(),
                });
            }
        }

        let closed = self.peers.close_all().await;

        if release_media && self.media.is_acquired() {
            self.media.release();
            self.media_changed();
        }

        if let Some(room_id) = room {
            tracing::info!(room_id = room_id.as_str(), links = closed, "Left room");
            self.emit(MeshEvent::RoomLeft { room_id });
        }
    }

    // ── Media ─────────────────────────────────────────────────────────────

    async fn toggle(&mut self, kind: TrackKind) -> Result<bool> {
        if !self.media.is_acquired() {
            return Err(Error::NotInRoom);
        }

        let enabled = if self.media.is_degraded(kind) {
            // A degraded modality toggles "on" by asking for the device again.
            let track = match self.media.regrant(kind).await {
                Ok(track) => track,
                Err(e) => {
                    self.notify(e.notification());
                    return Err(e);
                }
            };
            let active = kind == TrackKind::Audio || !self.media.is_sharing_screen();
            if active {
                let tracks = self.media.tracks();
                self.peers.replace_track(kind, Some(track), &tracks).await;
            }
            true
        } else {
            match kind {
                TrackKind::Audio => self.media.toggle_microphone()?,
                TrackKind::Video => self.media.toggle_camera()?,
            }
        };

        self.media_changed();
        Ok(enabled)
    }

    async fn toggle_screen_share(&mut self) -> Result<bool> {
        if !self.media.is_acquired() {
            return Err(Error::NotInRoom);
        }

        if let Some(camera) = self.media.stop_screen_share() {
            let tracks = self.media.tracks();
            self.peers.replace_track(TrackKind::Video, camera, &tracks).await;
            self.media_changed();
            return Ok(false);
        }

        let screen = match self.media.start_screen_share().await {
            Ok(screen) => screen,
            Err(e) => {
                self.notify(e.notification());
                return Err(e);
            }
        };
        let tracks = self.media.tracks();
        let renegotiated = self
            .peers
            .replace_track(TrackKind::Video, Some(screen), &tracks)
            .await;
        tracing::debug!(renegotiated = renegotiated, "Screen share on links");
        self.media_changed();
        Ok(true)
    }

    async fn retry_peer(&mut self, remote: &str) -> Result<()> {
        if self.current_room().is_none() {
            return Err(Error::NotInRoom);
        }
        let tracks = self.media.tracks();
        self.peers.retry(remote, &tracks).await
    }

    async fn teardown(&mut self) {
        if let Some(pending) = self.pending_join.take() {
            let _ = pending.reply.send(Err(Error::ShutdownInProgress));
        }
        self.leave_current(true).await;
        self.channel.close();
    }

    // ── Relay ─────────────────────────────────────────────────────────────

    async fn on_connected(&mut self, session_id: SessionId) {
        let previous = self.session_id.write().replace(session_id.clone());
        self.connected = true;
        self.peers.set_local_session(Some(session_id.clone()));
        self.emit(MeshEvent::Connectivity(ConnectivityState::Connected));

        if previous.as_deref() == Some(session_id.as_str()) {
            return;
        }
        // Members saw our old session leave and dropped their links to it.
        let closed = self.peers.close_all().await;
        tracing::info!(
            session_id = session_id.as_str(),
            closed_links = closed,
            "Reconnected with a new session"
        );

        if let Some(room_id) = self.current_room() {
            tracing::info!(room_id = room_id.as_str(), "Re-joining room");
            if let Err(e) = self.channel.send(ClientMessage::JoinRoom { room_id }) {
                tracing::warn!(error = %e, "Failed to re-join room");
            }
        }
    }

    fn on_channel_closed(&mut self, error: Option<Error>) {
        self.connected = false;
        if let Some(pending) = self.pending_join.take() {
            let _ = pending
                .reply
                .send(Err(error.clone().unwrap_or(Error::ChannelClosed)));
        }
        match error {
            Some(e) => {
                tracing::warn!(error = %e, "Relay unreachable, going offline");
                self.emit(MeshEvent::Connectivity(ConnectivityState::Offline));
                self.notify(e.notification());
            }
            None => tracing::debug!("Session channel closed"),
        }
    }

    async fn on_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::ExistingUsers { room_id, users } => {
                if !self.in_room(&room_id) {
                    tracing::debug!(room_id = room_id.as_str(), "Member list for another room");
                    return;
                }
                let tracks = self.media.tracks();
                self.peers.retain(&users).await;
                for user in &users {
                    if let Err(e) = self.peers.ensure_link(user, Role::Initiator, &tracks).await {
                        tracing::warn!(remote = user.as_str(), error = %e, "Failed to open peer link");
                        self.notify(e.notification());
                    }
                }

                let session_id = self.session_id.read().clone().unwrap_or_default();
                tracing::info!(room_id = room_id.as_str(), members = users.len(), "Joined room");
                let joined = JoinedRoom {
                    room_id: room_id.clone(),
                    session_id: session_id.clone(),
                    members: users.clone(),
                };
                if let Some(pending) = self.pending_join.take() {
                    if pending.room_id == room_id {
                        let _ = pending.reply.send(Ok(joined));
                    } else {
                        self.pending_join = Some(pending);
                    }
                }
                self.emit(MeshEvent::RoomJoined {
                    room_id,
                    session_id,
                    members: users,
                });
            }

            ServerMessage::UserJoined { room_id, session_id } => {
                if !self.in_room(&room_id) {
                    return;
                }
                tracing::info!(room_id = room_id.as_str(), remote = session_id.as_str(), "Member joined");
                let tracks = self.media.tracks();
                if let Err(e) = self
                    .peers
                    .ensure_link(&session_id, Role::Responder, &tracks)
                    .await
                {
                    tracing::warn!(remote = session_id.as_str(), error = %e, "Failed to open peer link");
                    self.notify(e.notification());
                }
            }

            ServerMessage::UserLeft { room_id, session_id } => {
                if !self.in_room(&room_id) {
                    return;
                }
                tracing::info!(room_id = room_id.as_str(), remote = session_id.as_str(), "Member left");
                self.peers.remove_link(&session_id).await;
            }

            ServerMessage::Offer { from, payload } => {
                if self.current_room().is_none() {
                    tracing::debug!(remote = from.as_str(), "Offer outside a room");
                    return;
                }
                let tracks = self.media.tracks();
                self.peers.handle_offer(&from, payload, &tracks).await;
            }

            ServerMessage::Answer { from, payload } => {
                let tracks = self.media.tracks();
                self.peers.handle_answer(&from, payload, &tracks).await;
            }

            ServerMessage::Candidate { from, payload } => {
                let tracks = self.media.tracks();
                self.peers.handle_candidate(&from, payload, &tracks).await;
            }

            ServerMessage::Error { message } => {
                let error = Error::RelayRejected(message);
                match self.pending_join.take() {
                    Some(pending) => {
                        tracing::warn!(room_id = pending.room_id.as_str(), error = %error, "Join rejected");
                        *self.room.write() = None;
                        self.media.release();
                        self.media_changed();
                        let _ = pending.reply.send(Err(error));
                    }
                    None => {
                        tracing::warn!(error = %error, "Relay error");
                        self.notify(error.notification());
                    }
                }
            }

            ServerMessage::Welcome { .. } | ServerMessage::Pong => {}
        }
    }
}

/// Run the client event loop until shutdown or until every client handle
/// is dropped.
pub(crate) async fn run_event_loop(
    mut command_rx: mpsc::Receiver<MeshCommand>,
    mut channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    mut timer_rx: mpsc::UnboundedReceiver<LinkTimer>,
    mut state: EventLoopState,
) {
    tracing::info!("Mesh event loop starting");
    let mut channel_open = true;

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                match command {
                    Some(cmd) => {
                        if !handle_command(cmd, &mut state).await {
                            tracing::info!("Shutdown command received, exiting event loop");
                            break;
                        }
                    }
                    None => {
                        tracing::info!("Client dropped, exiting event loop");
                        state.teardown().await;
                        break;
                    }
                }
            }

            event = channel_rx.recv(), if channel_open => {
                match event {
                    Some(event) => handle_channel_event(event, &mut state).await,
                    None => channel_open = false,
                }
            }

            Some(event) = peer_rx.recv() => {
                state.peers.handle_peer_event(event).await;
            }

            Some(timer) = timer_rx.recv() => {
                state.peers.handle_timer(timer).await;
            }
        }
    }

    tracing::info!("Mesh event loop stopped");
}

/// Handle a command from the client handle
///
/// Returns `false` if the event loop should stop.
async fn handle_command(command: MeshCommand, state: &mut EventLoopState) -> bool {
    tracing::trace!(?command, "Command");
    match command {
        MeshCommand::JoinRoom { room_id, reply } => state.join_room(room_id, reply).await,
        MeshCommand::LeaveRoom { reply } => {
            let _ = reply.send(state.leave_room().await);
        }
        MeshCommand::ToggleMicrophone { reply } => {
            let _ = reply.send(state.toggle(TrackKind::Audio).await);
        }
        MeshCommand::ToggleCamera { reply } => {
            let _ = reply.send(state.toggle(TrackKind::Video).await);
        }
        MeshCommand::ToggleScreenShare { reply } => {
            let _ = reply.send(state.toggle_screen_share().await);
        }
        MeshCommand::RetryPeer { remote, reply } => {
            let _ = reply.send(state.retry_peer(&remote).await);
        }
        MeshCommand::Peers { reply } => {
            let _ = reply.send(state.peers.peers());
        }
        MeshCommand::MediaState { reply } => {
            let _ = reply.send(state.media.state());
        }
        MeshCommand::Shutdown { reply } => {
            state.teardown().await;
            let _ = reply.send(());
            return false;
        }
    }
    true
}

async fn handle_channel_event(event: ChannelEvent, state: &mut EventLoopState) {
    match event {
        ChannelEvent::Connected { session_id } => state.on_connected(session_id).await,
        ChannelEvent::Message(message) => state.on_server_message(message).await,
        ChannelEvent::Disconnected { reason } => {
            state.connected = false;
            tracing::warn!(
                reason = reason.as_str(),
                links = state.peers.len(),
                "Relay connection lost, keeping peer links"
            );
        }
        ChannelEvent::Reconnecting { attempt, .. } => {
            state.emit(MeshEvent::Connectivity(ConnectivityState::Reconnecting {
                attempt,
            }));
        }
        ChannelEvent::Closed { error } => state.on_channel_closed(error),
    }
}
