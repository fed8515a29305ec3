//! # Negotiation Engine
//!
//! Offer/answer/candidate exchange for a single peer link.
//!
//! ```text
//!  initiator:  new ──► have-local-offer ──► have-remote-answer ──┐
//!  responder:  new ──► have-remote-offer ──► have-local-answer ──┤
//!                                                                ▼
//!                  ICE: checking ──► connected | failed      connected
//! ```
//!
//! The engine is transport-agnostic: it returns the descriptions to send and
//! leaves addressing to the link manager. Remote candidates that arrive
//! before a remote description is set are held and applied, in arrival
//! order, straight after it is set.
//!
//! Only the initiator ever produces offers after the first exchange
//! (renegotiation, ICE restart). A responder accepts every offer it gets.

use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::media::{TrackHandle, TrackKind};
use crate::protocol::{IceCandidate, SessionDescription, SessionId};

use super::connection::{IceConnectionState, PeerConnectionHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

/// Offer/answer progress, independent of ICE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingPhase {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalAnswer,
    HaveRemoteAnswer,
}

/// Observable state of a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalAnswer,
    HaveRemoteAnswer,
    Connected,
    /// ICE could not find a path. Recoverable by restart or manual retry.
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Closed)
    }
}

impl From<SignalingPhase> for PeerState {
    fn from(phase: SignalingPhase) -> Self {
        match phase {
            SignalingPhase::New => PeerState::New,
            SignalingPhase::HaveLocalOffer => PeerState::HaveLocalOffer,
            SignalingPhase::HaveRemoteOffer => PeerState::HaveRemoteOffer,
            SignalingPhase::HaveLocalAnswer => PeerState::HaveLocalAnswer,
            SignalingPhase::HaveRemoteAnswer => PeerState::HaveRemoteAnswer,
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::New => "new",
            PeerState::HaveLocalOffer => "have-local-offer",
            PeerState::HaveRemoteOffer => "have-remote-offer",
            PeerState::HaveLocalAnswer => "have-local-answer",
            PeerState::HaveRemoteAnswer => "have-remote-answer",
            PeerState::Connected => "connected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What happened to an incoming candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    /// Held until the remote description is set.
    Buffered,
}

/// Outcome of [`NegotiationEngine::replace_track`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackSwap {
    /// The existing sender carries the new track; nothing to signal.
    InPlace,
    /// A sender was added; send this offer.
    Offer(SessionDescription),
    /// A sender was added; the offer follows the pending answer.
    Deferred,
    /// A responder cannot offer, so the link must be rebuilt with this side
    /// as initiator.
    NeedsInitiator,
}

pub struct NegotiationEngine {
    remote: SessionId,
    role: Role,
    pc: PeerConnectionHandle,
    phase: SignalingPhase,
    ice: IceConnectionState,
    remote_description_set: bool,
    pending: VecDeque<IceCandidate>,
    /// A renegotiation was requested while an offer was outstanding.
    renegotiate_pending: bool,
    ice_restarts: u32,
    closed: bool,
}

impl fmt::Debug for NegotiationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationEngine")
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("ice", &self.ice)
            .field("pending", &self.pending.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl NegotiationEngine {
    pub fn new(remote: SessionId, role: Role, pc: PeerConnectionHandle) -> Self {
        Self {
            remote,
            role,
            pc,
            phase: SignalingPhase::New,
            ice: IceConnectionState::New,
            remote_description_set: false,
            pending: VecDeque::new(),
            renegotiate_pending: false,
            ice_restarts: 0,
            closed: false,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> SignalingPhase {
        self.phase
    }

    pub fn ice_state(&self) -> IceConnectionState {
        self.ice
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    pub fn ice_restarts(&self) -> u32 {
        self.ice_restarts
    }

    /// Our offer is out and unanswered.
    pub fn has_pending_local_offer(&self) -> bool {
        self.phase == SignalingPhase::HaveLocalOffer
    }

    pub fn state(&self) -> PeerState {
        if self.closed {
            PeerState::Closed
        } else if self.ice == IceConnectionState::Failed {
            PeerState::Failed
        } else if self.ice.is_connected() {
            PeerState::Connected
        } else {
            self.phase.into()
        }
    }

    fn unexpected(&self, kind: &str) -> Error {
        Error::UnexpectedSignal {
            kind: kind.to_string(),
            state: self.state().to_string(),
        }
    }

    fn ensure_open(&self, kind: &str) -> Result<()> {
        if self.closed {
            Err(self.unexpected(kind))
        } else {
            Ok(())
        }
    }

    // ── Negotiation ───────────────────────────────────────────────────────

    /// Attach the local tracks and, as initiator, produce the first offer.
    ///
    /// The offer is only created once every track is attached.
    pub async fn start(&mut self, tracks: &[TrackHandle]) -> Result<Option<SessionDescription>> {
        self.ensure_open("start")?;
        for track in tracks {
            self.pc.add_track(track.clone()).await?;
        }
        match self.role {
            Role::Initiator => self.make_offer(false).await.map(Some),
            Role::Responder => Ok(None),
        }
    }

    async fn make_offer(&mut self, ice_restart: bool) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(ice_restart).await?;
        self.pc.set_local_description(offer.clone()).await?;
        self.phase = SignalingPhase::HaveLocalOffer;
        tracing::debug!(
            remote = self.remote.as_str(),
            ice_restart = ice_restart,
            "Local offer created"
        );
        Ok(offer)
    }

    /// Apply a remote offer and produce the answer.
    ///
    /// Refused while our own offer is outstanding; the caller resolves glare.
    pub async fn handle_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription> {
        self.ensure_open("offer")?;
        if self.has_pending_local_offer() {
            return Err(self.unexpected("offer"));
        }

        self.pc.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.phase = SignalingPhase::HaveRemoteOffer;
        self.flush_pending().await;

        let answer = self.pc.create_answer().await?;
        self.pc.set_local_description(answer.clone()).await?;
        self.phase = SignalingPhase::HaveLocalAnswer;
        tracing::debug!(remote = self.remote.as_str(), "Answer created");
        Ok(answer)
    }

    /// Apply the remote answer to our outstanding offer.
    ///
    /// Returns a follow-up offer if a renegotiation was queued meanwhile.
    pub async fn handle_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<Option<SessionDescription>> {
        self.ensure_open("answer")?;
        if !self.has_pending_local_offer() {
            return Err(self.unexpected("answer"));
        }

        self.pc.set_remote_description(answer).await?;
        self.remote_description_set = true;
        self.phase = SignalingPhase::HaveRemoteAnswer;
        self.flush_pending().await;
        tracing::debug!(remote = self.remote.as_str(), "Answer applied");

        if self.renegotiate_pending {
            self.renegotiate_pending = false;
            return self.make_offer(false).await.map(Some);
        }
        Ok(None)
    }

    /// Apply a remote candidate now, or hold it until a remote description exists.
    pub async fn handle_candidate(&mut self, candidate: IceCandidate) -> Result<CandidateDisposition> {
        self.ensure_open("candidate")?;
        if self.remote_description_set {
            self.pc.add_ice_candidate(candidate).await?;
            Ok(CandidateDisposition::Applied)
        } else {
            self.pending.push_back(candidate);
            Ok(CandidateDisposition::Buffered)
        }
    }

    async fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let count = self.pending.len();
        while let Some(candidate) = self.pending.pop_front() {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                tracing::warn!(remote = self.remote.as_str(), error = %e, "Buffered candidate rejected");
            }
        }
        tracing::debug!(remote = self.remote.as_str(), count = count, "Applied buffered candidates");
    }

    /// Offer again after a local track change. Initiator only.
    ///
    /// While an offer is outstanding the new one is deferred until the
    /// answer arrives.
    pub async fn renegotiate(&mut self) -> Result<Option<SessionDescription>> {
        self.ensure_open("renegotiate")?;
        if self.role != Role::Initiator {
            return Ok(None);
        }
        match self.phase {
            SignalingPhase::New => Ok(None),
            SignalingPhase::HaveLocalOffer => {
                self.renegotiate_pending = true;
                Ok(None)
            }
            _ => self.make_offer(false).await.map(Some),
        }
    }

    /// Swap the outbound track of `kind`.
    ///
    /// Reuses the existing sender when there is one. Otherwise the track
    /// needs a new sender, which only an offer can announce.
    pub async fn replace_track(
        &mut self,
        kind: TrackKind,
        track: Option<TrackHandle>,
    ) -> Result<TrackSwap> {
        self.ensure_open("replace-track")?;
        if self.pc.replace_track(kind, track.clone()).await? {
            return Ok(TrackSwap::InPlace);
        }
        let Some(track) = track else {
            return Ok(TrackSwap::InPlace);
        };
        if self.role != Role::Initiator {
            return Ok(TrackSwap::NeedsInitiator);
        }
        self.pc.add_track(track).await?;
        Ok(match self.renegotiate().await? {
            Some(offer) => TrackSwap::Offer(offer),
            None => TrackSwap::Deferred,
        })
    }

    // ── ICE ───────────────────────────────────────────────────────────────

    /// Record an ICE transition. Returns the new link state if it changed.
    pub fn on_ice_state(&mut self, ice: IceConnectionState) -> Option<PeerState> {
        if self.closed {
            return None;
        }
        let before = self.state();
        self.ice = ice;
        let after = self.state();
        (before != after).then_some(after)
    }

    /// Force the failed state, e.g. after a disconnect grace period lapsed.
    pub fn mark_failed(&mut self) -> Option<PeerState> {
        self.on_ice_state(IceConnectionState::Failed)
    }

    /// Produce an ICE-restart offer. Initiator only.
    pub async fn restart_ice(&mut self) -> Result<Option<SessionDescription>> {
        self.ensure_open("ice-restart")?;
        if self.role != Role::Initiator {
            return Ok(None);
        }
        self.ice_restarts += 1;
        self.renegotiate_pending = false;
        self.make_offer(true).await.map(Some)
    }

    /// Tear down the connection. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending.clear();
        if let Err(e) = self.pc.close().await {
            tracing::warn!(remote = self.remote.as_str(), error = %e, "Error closing peer connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::media::{MediaTrack, SyntheticTrack, TrackKind};
    use crate::peer::fake::{Call, FakePeerConnection};

    fn engine(role: Role) -> (NegotiationEngine, Arc<FakePeerConnection>) {
        let pc = Arc::new(FakePeerConnection::default());
        (NegotiationEngine::new("remote".into(), role, pc.clone()), pc)
    }

    fn tracks() -> Vec<TrackHandle> {
        vec![
            Arc::new(SyntheticTrack::new(TrackKind::Audio)),
            Arc::new(SyntheticTrack::new(TrackKind::Video)),
        ]
    }

    #[tokio::test]
    async fn test_initiator_attaches_tracks_before_offer() {
        let (mut e, pc) = engine(Role::Initiator);
        let offer = e.start(&tracks()).await.unwrap().unwrap();
        assert_eq!(offer.sdp_type, crate::protocol::SdpType::Offer);
        assert_eq!(e.state(), PeerState::HaveLocalOffer);

        let calls = pc.calls();
        let first_offer = calls.iter().position(|c| matches!(c, Call::CreateOffer { .. })).unwrap();
        let adds = calls.iter().filter(|c| matches!(c, Call::AddTrack(_))).count();
        assert_eq!(adds, 2);
        assert!(calls[..first_offer].iter().filter(|c| matches!(c, Call::AddTrack(_))).count() == 2);
    }

    #[tokio::test]
    async fn test_responder_waits_for_offer() {
        let (mut e, _pc) = engine(Role::Responder);
        assert!(e.start(&tracks()).await.unwrap().is_none());
        assert_eq!(e.state(), PeerState::New);

        let answer = e
            .handle_offer(SessionDescription::offer("remote-offer"))
            .await
            .unwrap();
        assert_eq!(answer.sdp_type, crate::protocol::SdpType::Answer);
        assert_eq!(e.state(), PeerState::HaveLocalAnswer);
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_remote_description() {
        let (mut e, pc) = engine(Role::Initiator);
        e.start(&[]).await.unwrap();

        for i in 0..3 {
            let d = e
                .handle_candidate(IceCandidate::new(format!("c{}", i)))
                .await
                .unwrap();
            assert_eq!(d, CandidateDisposition::Buffered);
        }
        assert_eq!(e.pending_candidates(), 3);
        assert!(pc.applied_candidates().is_empty());

        e.handle_answer(SessionDescription::answer("a")).await.unwrap();
        assert_eq!(e.pending_candidates(), 0);
        assert_eq!(pc.applied_candidates(), vec!["c0", "c1", "c2"]);

        // Remote description set: later candidates go straight through
        let d = e.handle_candidate(IceCandidate::new("c3")).await.unwrap();
        assert_eq!(d, CandidateDisposition::Applied);
        assert_eq!(pc.applied_candidates(), vec!["c0", "c1", "c2", "c3"]);

        // Never applied before the remote description
        let calls = pc.calls();
        let set_remote = calls.iter().position(|c| matches!(c, Call::SetRemote(_))).unwrap();
        let first_cand = calls.iter().position(|c| matches!(c, Call::AddCandidate(_))).unwrap();
        assert!(set_remote < first_cand);
    }

    #[tokio::test]
    async fn test_answer_out_of_order_rejected() {
        let (mut e, _pc) = engine(Role::Responder);
        e.start(&[]).await.unwrap();
        let err = e
            .handle_answer(SessionDescription::answer("stray"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedSignal { .. }));
        assert!(err.is_negotiation());
    }

    #[tokio::test]
    async fn test_offer_refused_while_own_offer_outstanding() {
        let (mut e, _pc) = engine(Role::Initiator);
        e.start(&[]).await.unwrap();
        assert!(e.handle_offer(SessionDescription::offer("glare")).await.is_err());
        assert_eq!(e.phase(), SignalingPhase::HaveLocalOffer);
    }

    #[tokio::test]
    async fn test_responder_accepts_renegotiation() {
        let (mut e, _pc) = engine(Role::Responder);
        e.start(&[]).await.unwrap();
        e.handle_offer(SessionDescription::offer("o1")).await.unwrap();
        e.handle_offer(SessionDescription::offer("o2")).await.unwrap();
        assert_eq!(e.phase(), SignalingPhase::HaveLocalAnswer);
    }

    #[tokio::test]
    async fn test_ice_states_drive_link_state() {
        let (mut e, _pc) = engine(Role::Initiator);
        e.start(&[]).await.unwrap();
        e.handle_answer(SessionDescription::answer("a")).await.unwrap();

        assert_eq!(e.on_ice_state(IceConnectionState::Checking), None);
        assert_eq!(
            e.on_ice_state(IceConnectionState::Connected),
            Some(PeerState::Connected)
        );
        assert_eq!(
            e.on_ice_state(IceConnectionState::Failed),
            Some(PeerState::Failed)
        );
        assert!(e.state().is_terminal());
    }

    #[tokio::test]
    async fn test_restart_ice_initiator_only() {
        let (mut init, pc) = engine(Role::Initiator);
        init.start(&[]).await.unwrap();
        init.handle_answer(SessionDescription::answer("a")).await.unwrap();
        init.mark_failed();
        let offer = init.restart_ice().await.unwrap();
        assert!(offer.is_some());
        assert_eq!(init.ice_restarts(), 1);
        assert!(pc
            .calls()
            .iter()
            .any(|c| matches!(c, Call::CreateOffer { ice_restart: true })));

        let (mut resp, _) = engine(Role::Responder);
        resp.start(&[]).await.unwrap();
        assert!(resp.restart_ice().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_renegotiation_deferred_while_offer_outstanding() {
        let (mut e, _pc) = engine(Role::Initiator);
        e.start(&[]).await.unwrap();
        assert!(e.renegotiate().await.unwrap().is_none());
        let follow_up = e.handle_answer(SessionDescription::answer("a")).await.unwrap();
        assert!(follow_up.is_some());
        assert_eq!(e.phase(), SignalingPhase::HaveLocalOffer);
    }

    #[tokio::test]
    async fn test_replace_track_reuses_sender() {
        let (mut e, pc) = engine(Role::Initiator);
        e.start(&tracks()).await.unwrap();
        e.handle_answer(SessionDescription::answer("a")).await.unwrap();

        let screen: TrackHandle = Arc::new(SyntheticTrack::new(TrackKind::Video));
        let offer = e
            .replace_track(TrackKind::Video, Some(screen.clone()))
            .await
            .unwrap();
        assert_eq!(offer, TrackSwap::InPlace, "in-place replace must not renegotiate");
        assert_eq!(pc.sender_track(TrackKind::Video), Some(screen.id().to_string()));
    }

    #[tokio::test]
    async fn test_replace_track_without_sender_renegotiates() {
        let (mut e, _pc) = engine(Role::Initiator);
        e.start(&[]).await.unwrap();
        e.handle_answer(SessionDescription::answer("a")).await.unwrap();

        let mic: TrackHandle = Arc::new(SyntheticTrack::new(TrackKind::Audio));
        let swap = e.replace_track(TrackKind::Audio, Some(mic)).await.unwrap();
        assert!(matches!(swap, TrackSwap::Offer(_)));
    }

    #[tokio::test]
    async fn test_replace_track_defers_while_offer_outstanding() {
        let (mut e, _pc) = engine(Role::Initiator);
        e.start(&[]).await.unwrap();

        let mic: TrackHandle = Arc::new(SyntheticTrack::new(TrackKind::Audio));
        let swap = e.replace_track(TrackKind::Audio, Some(mic)).await.unwrap();
        assert_eq!(swap, TrackSwap::Deferred);
        let follow_up = e.handle_answer(SessionDescription::answer("a")).await.unwrap();
        assert!(follow_up.is_some());
    }

    #[tokio::test]
    async fn test_responder_without_sender_needs_initiator() {
        let (mut e, pc) = engine(Role::Responder);
        e.start(&[]).await.unwrap();
        e.handle_offer(SessionDescription::offer("o")).await.unwrap();

        let mic: TrackHandle = Arc::new(SyntheticTrack::new(TrackKind::Audio));
        let swap = e.replace_track(TrackKind::Audio, Some(mic)).await.unwrap();
        assert_eq!(swap, TrackSwap::NeedsInitiator);
        assert!(!pc.calls().iter().any(|c| matches!(c, Call::AddTrack(_))));
        assert!(!pc.calls().iter().any(|c| matches!(c, Call::CreateOffer { .. })));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (mut e, pc) = engine(Role::Responder);
        e.start(&[]).await.unwrap();
        e.handle_candidate(IceCandidate::new("c")).await.unwrap();
        e.close().await;
        e.close().await;
        assert_eq!(e.state(), PeerState::Closed);
        assert_eq!(e.pending_candidates(), 0);
        assert_eq!(pc.calls().iter().filter(|c| matches!(c, Call::Close)).count(), 1);
        assert!(e.handle_offer(SessionDescription::offer("late")).await.is_err());
        assert_eq!(e.on_ice_state(IceConnectionState::Connected), None);
    }
}
