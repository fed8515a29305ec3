//! In-memory peer connection for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::media::{MediaTrack, TrackHandle, TrackKind};
use crate::protocol::{IceCandidate, SdpType, SessionDescription};

use super::connection::{
    PeerConfig, PeerConnection, PeerConnectionFactory, PeerConnectionHandle, PeerEventSink,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AddTrack(String),
    ReplaceTrack { kind: TrackKind, track: Option<String> },
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(String),
    AddCandidate(String),
    Close,
}

#[derive(Debug, Default)]
pub struct FakePeerConnection {
    calls: Mutex<Vec<Call>>,
    senders: Mutex<HashMap<TrackKind, Option<String>>>,
    offers: AtomicU32,
    pub reject_remote: AtomicBool,
}

impl FakePeerConnection {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::AddCandidate(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn sender_track(&self, kind: TrackKind) -> Option<String> {
        self.senders.lock().get(&kind).cloned().flatten()
    }

    pub fn is_closed(&self) -> bool {
        self.calls.lock().contains(&Call::Close)
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn add_track(&self, track: TrackHandle) -> Result<()> {
        self.senders
            .lock()
            .insert(track.kind(), Some(track.id().to_string()));
        self.record(Call::AddTrack(track.id().to_string()));
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Option<TrackHandle>) -> Result<bool> {
        let id = track.as_ref().map(|t| t.id().to_string());
        self.record(Call::ReplaceTrack {
            kind,
            track: id.clone(),
        });
        let mut senders = self.senders.lock();
        match senders.get_mut(&kind) {
            Some(slot) => {
                *slot = id;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        self.record(Call::CreateOffer { ice_restart });
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("offer-{}", n)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(Call::CreateAnswer);
        Ok(SessionDescription::answer("answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(Call::SetLocal(desc.sdp_type));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if self.reject_remote.load(Ordering::SeqCst) {
            return Err(Error::InvalidDescription("rejected by fake".into()));
        }
        self.record(Call::SetRemote(desc.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(Call::Close);
        Ok(())
    }
}

/// Factory that remembers every connection it built.
#[derive(Default)]
pub struct FakeFactory {
    created: Mutex<Vec<(String, Arc<FakePeerConnection>, PeerEventSink)>>,
}

impl FakeFactory {
    pub fn count(&self) -> usize {
        self.created.lock().len()
    }

    /// Most recent connection built for `remote`.
    pub fn last_for(&self, remote: &str) -> Option<(Arc<FakePeerConnection>, PeerEventSink)> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(r, _, _)| r == remote)
            .map(|(_, pc, sink)| (pc.clone(), sink.clone()))
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(&self, _config: &PeerConfig, events: PeerEventSink) -> Result<PeerConnectionHandle> {
        let pc = Arc::new(FakePeerConnection::default());
        self.created
            .lock()
            .push((events.remote().to_string(), pc.clone(), events));
        Ok(pc)
    }
}
