//! Native peer connections over the `webrtc` crate.
//!
//! Enabled with the `native-rtc` feature. Local media is written by the
//! embedding application into [`RtcLocalTrack`]s; tracks of any other type
//! (synthetic placeholders, foreign backends) get a silent sender so the
//! transceiver exists and can later be swapped in place.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::media::{MediaTrack, RemoteTrack, TrackHandle, TrackKind};
use crate::peer::{
    IceConnectionState, PeerConfig, PeerConnection, PeerConnectionFactory, PeerConnectionHandle,
    PeerEventSink,
};
use crate::protocol::{IceCandidate, SdpType, SessionDescription};

const STREAM_ID: &str = "meshroom";

fn rtc_err(e: webrtc::Error) -> Error {
    Error::PeerConnection(e.to_string())
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    let mime_type = match kind {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    RTCRtpCodecCapability {
        mime_type: mime_type.to_owned(),
        ..Default::default()
    }
}

// ── Local tracks ──────────────────────────────────────────────────────────

/// A local track the application feeds with encoded samples.
///
/// Check [`MediaTrack::is_enabled`] before writing: a disabled track stays
/// attached but should carry nothing.
pub struct RtcLocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl RtcLocalTrack {
    pub fn new(kind: TrackKind) -> Self {
        let id = format!("{}-{}", kind, uuid::Uuid::new_v4());
        Self {
            kind,
            track: Arc::new(TrackLocalStaticSample::new(
                codec_for(kind),
                id,
                STREAM_ID.to_owned(),
            )),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// The sample writer.
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }
}

impl fmt::Debug for RtcLocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcLocalTrack")
            .field("id", &self.track.id())
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl MediaTrack for RtcLocalTrack {
    fn id(&self) -> &str {
        self.track.id()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.is_stopped()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn to_track_local(track: &TrackHandle) -> Arc<dyn TrackLocal + Send + Sync> {
    match track.as_any().downcast_ref::<RtcLocalTrack>() {
        Some(rtc) => rtc.sample_track(),
        None => Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_owned(),
            STREAM_ID.to_owned(),
        )),
    }
}

// ── Remote tracks ─────────────────────────────────────────────────────────

/// A track received from a remote peer.
pub struct RtcRemoteTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackRemote>,
}

impl RtcRemoteTrack {
    /// Read RTP from here.
    pub fn track(&self) -> Arc<TrackRemote> {
        self.track.clone()
    }
}

impl fmt::Debug for RtcRemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcRemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl RemoteTrack for RtcRemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── Peer connection ───────────────────────────────────────────────────────

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

impl RtcPeerConnection {
    fn wire_events(pc: &RTCPeerConnection, events: PeerEventSink) {
        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // None marks the end of gathering
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => sink.local_candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                    }),
                    Err(e) => tracing::warn!(remote = sink.remote(), error = %e, "Unserializable local candidate"),
                }
            }
            Box::pin(async {})
        }));

        let sink = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            if let Some(state) = ice_state(state) {
                sink.ice_state(state);
            }
            Box::pin(async {})
        }));

        let sink = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    sink.remote_track(Arc::new(RtcRemoteTrack {
                        id: track.id(),
                        kind,
                        track,
                    }));
                }
                Box::pin(async {})
            },
        ));
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| Error::InvalidDescription(e.to_string()))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(Error::InvalidDescription(format!("unsupported sdp type {:?}", other))),
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_track(&self, track: TrackHandle) -> Result<()> {
        let sender = self
            .pc
            .add_track(to_track_local(&track))
            .await
            .map_err(rtc_err)?;
        self.senders.lock().insert(track.kind(), sender);
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Option<TrackHandle>) -> Result<bool> {
        let sender = self.senders.lock().get(&kind).cloned();
        let Some(sender) = sender else {
            return Ok(false);
        };
        sender
            .replace_track(track.as_ref().map(to_track_local))
            .await
            .map_err(rtc_err)?;
        Ok(true)
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await.map_err(rtc_err)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_err)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(rtc_err)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| Error::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| Error::InvalidCandidate(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(rtc_err)
    }
}

// ── Factory ───────────────────────────────────────────────────────────────

/// Builds [`RtcPeerConnection`]s with the default codecs and interceptors.
pub struct RtcPeerConnectionFactory {
    api: API,
}

impl RtcPeerConnectionFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_err)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(rtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerConnectionFactory {
    async fn create(&self, config: &PeerConfig, events: PeerEventSink) -> Result<PeerConnectionHandle> {
        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = self
            .api
            .new_peer_connection(rtc_config)
            .await
            .map_err(rtc_err)?;
        RtcPeerConnection::wire_events(&pc, events.clone());
        tracing::debug!(remote = events.remote(), link_id = events.link_id(), "Native peer connection created");

        Ok(Arc::new(RtcPeerConnection {
            pc: Arc::new(pc),
            senders: Mutex::new(HashMap::new()),
        }))
    }
}
