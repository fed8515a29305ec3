//! # Peer Link Manager
//!
//! Owns one [`NegotiationEngine`] per remote session and routes relay
//! signals, backend events and timers to it.
//!
//! ```text
//!   relay offer/answer/candidate ──┐
//!   backend PeerEvent ─────────────┼──► PeerLinkManager ──► links[remote]
//!   LinkTimer ─────────────────────┘          │
//!                                             ├──► SessionChannel (signals out)
//!                                             └──► MeshEvent broadcast
//! ```
//!
//! At most one link exists per remote. Every link gets a fresh `link_id`;
//! events and timers carrying an older id are dropped, so a torn-down
//! connection never touches its replacement.
//!
//! Exactly one side of a pair offers. The member that learns of the other
//! from `existing-users` is the initiator; the one told by `user-joined`
//! waits as responder. When both offer anyway, the lower session id keeps
//! its offer and the higher one yields.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::channel::SessionChannel;
use crate::config::ClientConfig;
use crate::error::{Error, Notification, Recovery, Result};
use crate::events::MeshEvent;
use crate::media::{RemoteTrack, RemoteTrackHandle, TrackHandle, TrackKind};
use crate::protocol::{ClientMessage, IceCandidate, SdpType, SessionDescription, SessionId};

use super::connection::{
    IceConnectionState, PeerConfig, PeerConnectionEvent, PeerConnectionFactory, PeerEvent,
    PeerEventSink,
};
use super::negotiation::{NegotiationEngine, PeerState, Role, TrackSwap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// ICE reported `disconnected`; fail the link if it is still so.
    DisconnectGrace,
    /// The link had this long to connect.
    Negotiation,
}

/// A deadline for one link, delivered back to the event loop.
#[derive(Debug, Clone)]
pub struct LinkTimer {
    pub remote: SessionId,
    pub link_id: u64,
    pub kind: TimerKind,
}

/// Snapshot of one link for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub remote: SessionId,
    pub role: Role,
    pub state: PeerState,
    pub remote_tracks: usize,
    pub ice_restarts: u32,
}

struct PeerLink {
    link_id: u64,
    engine: NegotiationEngine,
    remote_tracks: Vec<RemoteTrackHandle>,
    last_state: PeerState,
    ever_connected: bool,
    unreachable: bool,
}

pub struct PeerLinkManager {
    local_session: Option<SessionId>,
    links: HashMap<SessionId, PeerLink>,
    factory: Arc<dyn PeerConnectionFactory>,
    peer_config: PeerConfig,
    channel: SessionChannel,
    events: broadcast::Sender<MeshEvent>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    timer_tx: mpsc::UnboundedSender<LinkTimer>,
    next_link_id: u64,
    disconnect_grace: Duration,
    negotiation_timeout: Duration,
}

impl PeerLinkManager {
    /// Create a manager. The returned receivers carry backend events and
    /// timers; the caller feeds them back through
    /// [`handle_peer_event`](Self::handle_peer_event) and
    /// [`handle_timer`](Self::handle_timer).
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        config: &ClientConfig,
        channel: SessionChannel,
        events: broadcast::Sender<MeshEvent>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<PeerEvent>,
        mpsc::UnboundedReceiver<LinkTimer>,
    ) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let manager = Self {
            local_session: None,
            links: HashMap::new(),
            factory,
            peer_config: PeerConfig {
                ice_servers: config.ice_servers.clone(),
            },
            channel,
            events,
            peer_tx,
            timer_tx,
            next_link_id: 0,
            disconnect_grace: config.peer_disconnect_grace,
            negotiation_timeout: config.negotiation_timeout,
        };
        (manager, peer_rx, timer_rx)
    }

    /// Our own session id, used to break offer collisions.
    pub fn set_local_session(&mut self, session_id: Option<SessionId>) {
        self.local_session = session_id;
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, remote: &str) -> bool {
        self.links.contains_key(remote)
    }

    pub fn state_of(&self, remote: &str) -> Option<PeerState> {
        self.links.get(remote).map(|l| l.engine.state())
    }

    pub fn role_of(&self, remote: &str) -> Option<Role> {
        self.links.get(remote).map(|l| l.engine.role())
    }

    /// Every link, ordered by remote session id.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .links
            .iter()
            .map(|(remote, link)| PeerInfo {
                remote: remote.clone(),
                role: link.engine.role(),
                state: link.engine.state(),
                remote_tracks: link.remote_tracks.len(),
                ice_restarts: link.engine.ice_restarts(),
            })
            .collect();
        peers.sort_by(|a, b| a.remote.cmp(&b.remote));
        peers
    }

    // ── Link lifecycle ────────────────────────────────────────────────────

    /// Create a link to `remote` unless one exists. Returns whether a link
    /// was created.
    pub async fn ensure_link(
        &mut self,
        remote: &str,
        role: Role,
        tracks: &[TrackHandle],
    ) -> Result<bool> {
        if self.links.contains_key(remote) {
            tracing::debug!(remote = remote, "Link already exists");
            return Ok(false);
        }
        if self.local_session.as_deref() == Some(remote) {
            return Ok(false);
        }
        self.create_link(remote, role, tracks).await?;
        Ok(true)
    }

    async fn create_link(&mut self, remote: &str, role: Role, tracks: &[TrackHandle]) -> Result<()> {
        self.next_link_id += 1;
        let link_id = self.next_link_id;

        let sink = PeerEventSink::new(remote.to_string(), link_id, self.peer_tx.clone());
        let pc = self.factory.create(&self.peer_config, sink).await?;
        let mut engine = NegotiationEngine::new(remote.to_string(), role, pc);

        let offer = match engine.start(tracks).await {
            Ok(offer) => offer,
            Err(e) => {
                engine.close().await;
                return Err(e);
            }
        };

        let state = engine.state();
        self.links.insert(
            remote.to_string(),
            PeerLink {
                link_id,
                engine,
                remote_tracks: Vec::new(),
                last_state: state,
                ever_connected: false,
                unreachable: false,
            },
        );
        tracing::info!(
            remote = remote,
            link_id = link_id,
            role = ?role,
            tracks = tracks.len(),
            "Peer link created"
        );

        if let Some(offer) = offer {
            self.send_description(remote, &offer);
        }
        self.arm_timer(remote, link_id, TimerKind::Negotiation, self.negotiation_timeout);
        let _ = self.events.send(MeshEvent::PeerStateChanged {
            remote: remote.to_string(),
            state,
        });
        Ok(())
    }

    /// Close whatever link exists for `remote` and start a fresh one.
    async fn replace_link(&mut self, remote: &str, role: Role, tracks: &[TrackHandle]) -> Result<()> {
        if let Some(mut old) = self.links.remove(remote) {
            tracing::debug!(remote = remote, link_id = old.link_id, "Replacing peer link");
            old.engine.close().await;
        }
        self.create_link(remote, role, tracks).await
    }

    /// Recreate a link after a negotiation error, keeping its role.
    async fn reset_link(&mut self, remote: &str, tracks: &[TrackHandle], error: Error) {
        let Some(role) = self.role_of(remote) else {
            tracing::debug!(remote = remote, error = %error, "Dropping bad signal for unknown link");
            return;
        };
        tracing::warn!(remote = remote, error = %error, "Negotiation error, recreating link");
        if let Err(e) = self.replace_link(remote, role, tracks).await {
            self.report(remote, e);
        }
    }

    /// Tear down the link to `remote`.
    pub async fn remove_link(&mut self, remote: &str) -> bool {
        let Some(mut link) = self.links.remove(remote) else {
            return false;
        };
        link.engine.close().await;
        tracing::info!(remote = remote, link_id = link.link_id, "Peer link removed");
        let _ = self.events.send(MeshEvent::PeerRemoved {
            remote: remote.to_string(),
        });
        true
    }

    /// Tear down every link.
    pub async fn close_all(&mut self) -> usize {
        let remotes: Vec<SessionId> = self.links.keys().cloned().collect();
        for remote in &remotes {
            self.remove_link(remote).await;
        }
        remotes.len()
    }

    /// Tear down links to anyone not in `members`.
    pub async fn retain(&mut self, members: &[SessionId]) -> usize {
        let gone: Vec<SessionId> = self
            .links
            .keys()
            .filter(|r| !members.contains(r))
            .cloned()
            .collect();
        for remote in &gone {
            self.remove_link(remote).await;
        }
        gone.len()
    }

    /// Rebuild the link to `remote` from scratch, with us offering.
    pub async fn retry(&mut self, remote: &str, tracks: &[TrackHandle]) -> Result<()> {
        if !self.links.contains_key(remote) {
            return Err(Error::PeerNotFound(remote.to_string()));
        }
        tracing::info!(remote = remote, "Retrying peer link");
        self.replace_link(remote, Role::Initiator, tracks).await
    }

    // ── Relay signals ─────────────────────────────────────────────────────

    pub async fn handle_offer(&mut self, from: &str, payload: Value, tracks: &[TrackHandle]) {
        let offer = match SessionDescription::from_payload(payload, SdpType::Offer) {
            Ok(offer) => offer,
            Err(e) => {
                self.reset_link(from, tracks, e).await;
                return;
            }
        };

        let fresh = match self.links.get(from) {
            None => Some("no link"),
            Some(link) if link.engine.has_pending_local_offer() => {
                if self.keeps_own_offer(from) {
                    tracing::info!(remote = from, "Offer collision, keeping ours");
                    return;
                }
                Some("offer collision")
            }
            // The remote rebuilt its side of the link.
            Some(link) if link.engine.role() == Role::Initiator => Some("remote reset"),
            Some(_) => None,
        };

        if let Some(reason) = fresh {
            tracing::debug!(remote = from, reason = reason, "Answering on a new responder link");
            if let Err(e) = self.replace_link(from, Role::Responder, tracks).await {
                self.report(from, e);
                return;
            }
        }

        if let Err(e) = self.answer(from, offer.clone()).await {
            tracing::warn!(remote = from, error = %e, "Offer rejected, retrying on a new link");
            let retried = match self.replace_link(from, Role::Responder, tracks).await {
                Ok(()) => self.answer(from, offer).await,
                Err(e) => Err(e),
            };
            if let Err(e) = retried {
                tracing::warn!(remote = from, error = %e, "Offer rejected twice");
                self.report(from, e);
            }
        }
        self.publish_state(from);
    }

    async fn answer(&mut self, from: &str, offer: SessionDescription) -> Result<()> {
        let link = self
            .links
            .get_mut(from)
            .ok_or_else(|| Error::PeerNotFound(from.to_string()))?;
        let answer = link.engine.handle_offer(offer).await?;
        self.send_description(from, &answer);
        Ok(())
    }

    fn keeps_own_offer(&self, remote: &str) -> bool {
        match self.local_session.as_deref() {
            Some(local) => local < remote,
            None => true,
        }
    }

    pub async fn handle_answer(&mut self, from: &str, payload: Value, tracks: &[TrackHandle]) {
        if !self.links.contains_key(from) {
            tracing::debug!(remote = from, "Answer for unknown link");
            return;
        }
        let answer = match SessionDescription::from_payload(payload, SdpType::Answer) {
            Ok(answer) => answer,
            Err(e) => {
                self.reset_link(from, tracks, e).await;
                return;
            }
        };

        let result = match self.links.get_mut(from) {
            Some(link) => link.engine.handle_answer(answer).await,
            None => return,
        };
        match result {
            Ok(Some(offer)) => self.send_description(from, &offer),
            Ok(None) => {}
            Err(e) => {
                self.reset_link(from, tracks, e).await;
                return;
            }
        }
        self.publish_state(from);
    }

    pub async fn handle_candidate(&mut self, from: &str, payload: Value, tracks: &[TrackHandle]) {
        if !self.links.contains_key(from) {
            tracing::debug!(remote = from, "Candidate for unknown link");
            return;
        }
        let candidate = match IceCandidate::from_payload(payload) {
            Ok(candidate) => candidate,
            Err(e) => {
                self.reset_link(from, tracks, e).await;
                return;
            }
        };

        let Some(link) = self.links.get_mut(from) else {
            return;
        };
        match link.engine.handle_candidate(candidate).await {
            Ok(disposition) => {
                tracing::trace!(remote = from, ?disposition, "Remote candidate");
            }
            Err(e) => {
                tracing::warn!(remote = from, error = %e, "Remote candidate rejected");
            }
        }
    }

    // ── Backend events and timers ─────────────────────────────────────────

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        let PeerEvent {
            remote,
            link_id,
            event,
        } = event;
        let Some(link) = self.links.get_mut(&remote) else {
            tracing::trace!(remote = remote.as_str(), "Event for removed link");
            return;
        };
        if link.link_id != link_id {
            tracing::trace!(remote = remote.as_str(), link_id = link_id, "Stale link event");
            return;
        }

        match event {
            PeerConnectionEvent::LocalCandidate(candidate) => {
                self.send(ClientMessage::Candidate {
                    to: remote,
                    payload: candidate.to_payload(),
                });
            }
            PeerConnectionEvent::RemoteTrack(track) => {
                link.remote_tracks.push(track.clone());
                tracing::info!(
                    remote = remote.as_str(),
                    kind = %track.kind(),
                    track = track.id(),
                    "Remote track"
                );
                let _ = self.events.send(MeshEvent::RemoteTrack { remote, track });
            }
            PeerConnectionEvent::IceStateChanged(ice) => {
                link.engine.on_ice_state(ice);
                tracing::debug!(remote = remote.as_str(), ice = ?ice, "ICE state");
                match ice {
                    IceConnectionState::Disconnected => {
                        self.arm_timer(&remote, link_id, TimerKind::DisconnectGrace, self.disconnect_grace);
                    }
                    IceConnectionState::Failed => self.on_failed(&remote).await,
                    _ => {}
                }
                self.publish_state(&remote);
            }
        }
    }

    pub async fn handle_timer(&mut self, timer: LinkTimer) {
        let Some(link) = self.links.get_mut(&timer.remote) else {
            return;
        };
        if link.link_id != timer.link_id {
            return;
        }
        let lapsed = match timer.kind {
            TimerKind::DisconnectGrace => {
                link.engine.ice_state() == IceConnectionState::Disconnected
            }
            TimerKind::Negotiation => {
                !link.ever_connected
                    && !link.engine.ice_state().is_connected()
                    && link.engine.state() != PeerState::Failed
            }
        };
        if !lapsed {
            return;
        }

        tracing::info!(remote = timer.remote.as_str(), timer = ?timer.kind, "Link deadline passed");
        link.engine.mark_failed();
        self.on_failed(&timer.remote).await;
        self.publish_state(&timer.remote);
    }

    /// Surface a failed link once and, as initiator, try an ICE restart.
    async fn on_failed(&mut self, remote: &str) {
        let Some(link) = self.links.get_mut(remote) else {
            return;
        };
        let first = !link.unreachable;
        link.unreachable = true;
        let restart = link.engine.restart_ice().await;

        if first {
            tracing::warn!(remote = remote, "Peer unreachable");
            let _ = self.events.send(MeshEvent::PeerUnreachable {
                remote: remote.to_string(),
            });
            let _ = self.events.send(MeshEvent::Notification(Notification::new(
                format!("Can't reach participant {}", short_id(remote)),
                Recovery::RetryPeer,
            )));
        }

        match restart {
            Ok(Some(offer)) => self.send_description(remote, &offer),
            Ok(None) => {}
            Err(e) => tracing::warn!(remote = remote, error = %e, "ICE restart failed"),
        }
    }

    fn arm_timer(&self, remote: &str, link_id: u64, kind: TimerKind, after: Duration) {
        let tx = self.timer_tx.clone();
        let timer = LinkTimer {
            remote: remote.to_string(),
            link_id,
            kind,
        };
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(timer);
        });
    }

    // ── Local media ───────────────────────────────────────────────────────

    /// Swap the outbound `kind` track on every link. Returns how many links
    /// needed a new offer.
    ///
    /// A link on which we are responder has no way to announce a new
    /// sender, so it is rebuilt with us offering `tracks`, the full local
    /// set after the swap.
    pub async fn replace_track(
        &mut self,
        kind: TrackKind,
        track: Option<TrackHandle>,
        tracks: &[TrackHandle],
    ) -> usize {
        let remotes: Vec<SessionId> = self.links.keys().cloned().collect();
        let mut renegotiated = 0;
        for remote in remotes {
            let Some(link) = self.links.get_mut(&remote) else {
                continue;
            };
            match link.engine.replace_track(kind, track.clone()).await {
                Ok(TrackSwap::InPlace) => {}
                Ok(TrackSwap::Offer(offer)) => {
                    self.send_description(&remote, &offer);
                    renegotiated += 1;
                }
                Ok(TrackSwap::Deferred) => renegotiated += 1,
                Ok(TrackSwap::NeedsInitiator) => {
                    tracing::info!(remote = remote.as_str(), kind = %kind, "New sender on responder link, rebuilding as initiator");
                    match self.replace_link(&remote, Role::Initiator, tracks).await {
                        Ok(()) => renegotiated += 1,
                        Err(e) => self.report(&remote, e),
                    }
                }
                Err(e) => {
                    tracing::warn!(remote = remote.as_str(), kind = %kind, error = %e, "Track replacement failed");
                }
            }
        }
        renegotiated
    }

    // ── Helpers ───────────────────────────────────────────────────────────

    fn publish_state(&mut self, remote: &str) {
        let Some(link) = self.links.get_mut(remote) else {
            return;
        };
        let state = link.engine.state();
        if state == link.last_state {
            return;
        }
        link.last_state = state;
        if state == PeerState::Connected {
            link.ever_connected = true;
            link.unreachable = false;
        }
        tracing::debug!(remote = remote, state = %state, "Peer state changed");
        let _ = self.events.send(MeshEvent::PeerStateChanged {
            remote: remote.to_string(),
            state,
        });
    }

    fn send_description(&self, remote: &str, desc: &SessionDescription) {
        let to = remote.to_string();
        let payload = desc.to_payload();
        let message = match desc.sdp_type {
            SdpType::Offer => ClientMessage::Offer { to, payload },
            SdpType::Answer => ClientMessage::Answer { to, payload },
        };
        self.send(message);
    }

    fn send(&self, message: ClientMessage) {
        if let Err(e) = self.channel.send(message) {
            tracing::debug!(error = %e, "Dropping signal");
        }
    }

    fn report(&self, remote: &str, error: Error) {
        tracing::warn!(remote = remote, error = %error, "Peer link error");
        let _ = self.events.send(MeshEvent::Notification(error.notification()));
    }
}

fn short_id(session_id: &str) -> &str {
    session_id.get(..8).unwrap_or(session_id)
}
