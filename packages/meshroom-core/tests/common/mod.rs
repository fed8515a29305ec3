//! Shared fixtures: an in-process relay, scriptable capture devices and a
//! loopback WebRTC backend.
//!
//! The fake backend reports ICE `connected` once both descriptions are
//! applied, and announces one remote track per kind listed in the remote SDP.

#![allow(dead_code)]

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};

use meshroom_core::media::CaptureRequest;
use meshroom_core::peer::{IceConnectionState, PeerConfig, PeerConnectionHandle, PeerEventSink};
use meshroom_core::protocol::{IceCandidate, SessionDescription};
use meshroom_core::{
    ClientConfig, Error, MediaDevices, MediaTrack, MeshClient, MeshEvent, PeerConnection,
    PeerConnectionFactory, PeerInfo, RemoteTrack, Result, TrackHandle, TrackKind,
};
use meshroom_relay::{router, RelayConfig, RelayState};

pub const WAIT: Duration = Duration::from_secs(5);

// ── Relay ─────────────────────────────────────────────────────────────────

/// Start a relay on an ephemeral port and return its WebSocket URL.
pub async fn spawn_relay(config: RelayConfig) -> String {
    let addr = spawn_relay_at(config).await;
    format!("ws://127.0.0.1:{}/ws", addr.port())
}

pub async fn spawn_relay_at(config: RelayConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(RelayState::new(config));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A TCP forwarder in front of the relay that a test can cut and restore.
///
/// Cutting drops every forwarded connection and refuses new ones, which
/// looks to a client like the relay vanished.
pub struct RelayLink {
    port: u16,
    upstream: SocketAddr,
    task: Option<JoinHandle<()>>,
}

impl RelayLink {
    pub async fn new(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self {
            port,
            upstream,
            task: Some(tokio::spawn(forward(listener, upstream))),
        }
    }

    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    pub async fn cut(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }

    pub async fn restore(&mut self) {
        let listener = TcpListener::bind(("127.0.0.1", self.port)).await.unwrap();
        self.task = Some(tokio::spawn(forward(listener, self.upstream)));
    }
}

async fn forward(listener: TcpListener, upstream: SocketAddr) {
    // Dropped with this task, which aborts every connection in it.
    let mut connections = JoinSet::new();
    while let Ok((mut inbound, _)) = listener.accept().await {
        connections.spawn(async move {
            if let Ok(mut outbound) = TcpStream::connect(upstream).await {
                let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
            }
        });
    }
}

pub fn test_config(relay_url: &str) -> ClientConfig {
    ClientConfig {
        ice_servers: Vec::new(),
        max_reconnect_attempts: 2,
        reconnect_base_delay: Duration::from_millis(50),
        reconnect_max_delay: Duration::from_millis(200),
        connect_timeout: Duration::from_secs(3),
        ..ClientConfig::new(relay_url)
    }
}

// ── Media ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct TestTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl TestTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }
}

impl MediaTrack for TestTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
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

/// Capture devices whose permissions a test can script.
#[derive(Debug, Default)]
pub struct ScriptedDevices {
    pub deny_microphone: AtomicBool,
    pub deny_camera: AtomicBool,
    captured: Mutex<Vec<TrackHandle>>,
    next_id: AtomicU32,
}

impl ScriptedDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn without_microphone() -> Arc<Self> {
        let devices = Self::default();
        devices.deny_microphone.store(true, Ordering::SeqCst);
        Arc::new(devices)
    }

    pub fn without_camera() -> Arc<Self> {
        let devices = Self::default();
        devices.deny_camera.store(true, Ordering::SeqCst);
        Arc::new(devices)
    }

    /// Every track handed out so far.
    pub fn captured(&self) -> Vec<TrackHandle> {
        self.captured.lock().clone()
    }

    fn track(&self, kind: TrackKind) -> TrackHandle {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let track: TrackHandle = Arc::new(TestTrack::new(format!("{}-{}", kind, n), kind));
        self.captured.lock().push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for ScriptedDevices {
    async fn capture(&self, request: CaptureRequest) -> Result<Vec<TrackHandle>> {
        if request.audio && self.deny_microphone.load(Ordering::SeqCst) {
            return Err(Error::PermissionDenied("microphone".into()));
        }
        if request.video && self.deny_camera.load(Ordering::SeqCst) {
            return Err(Error::PermissionDenied("camera".into()));
        }
        let mut tracks = Vec::new();
        if request.audio {
            tracks.push(self.track(TrackKind::Audio));
        }
        if request.video {
            tracks.push(self.track(TrackKind::Video));
        }
        Ok(tracks)
    }

    async fn capture_screen(&self) -> Result<TrackHandle> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let track: TrackHandle = Arc::new(TestTrack::new(format!("screen-{}", n), TrackKind::Video));
        self.captured.lock().push(track.clone());
        Ok(track)
    }
}

// ── Peer connections ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct LoopbackRemoteTrack {
    id: String,
    kind: TrackKind,
}

impl RemoteTrack for LoopbackRemoteTrack {
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

/// A peer connection that needs no network.
///
/// SDP bodies carry the sender kinds as `tracks=audio,video`.
#[derive(Debug)]
pub struct LoopbackConnection {
    sink: PeerEventSink,
    senders: Mutex<HashMap<TrackKind, Option<String>>>,
    has_local: AtomicBool,
    has_remote: AtomicBool,
    connected: AtomicBool,
    announced: Mutex<HashSet<TrackKind>>,
    offers: AtomicU32,
    closed: AtomicBool,
}

impl LoopbackConnection {
    fn new(sink: PeerEventSink) -> Self {
        Self {
            sink,
            senders: Mutex::new(HashMap::new()),
            has_local: AtomicBool::new(false),
            has_remote: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            announced: Mutex::new(HashSet::new()),
            offers: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn remote(&self) -> &str {
        self.sink.remote()
    }

    pub fn offers(&self) -> u32 {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn sender_track(&self, kind: TrackKind) -> Option<String> {
        self.senders.lock().get(&kind).cloned().flatten()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Report an ICE state as if the transport had observed it.
    pub fn force_ice(&self, state: IceConnectionState) {
        self.sink.ice_state(state);
    }

    fn describe(&self) -> String {
        let mut kinds: Vec<String> = self.senders.lock().keys().map(|k| k.to_string()).collect();
        kinds.sort();
        format!("v=0 loopback tracks={}", kinds.join(","))
    }

    fn maybe_connect(&self) {
        if self.has_local.load(Ordering::SeqCst)
            && self.has_remote.load(Ordering::SeqCst)
            && !self.connected.swap(true, Ordering::SeqCst)
        {
            self.sink.ice_state(IceConnectionState::Checking);
            self.sink.ice_state(IceConnectionState::Connected);
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn add_track(&self, track: TrackHandle) -> Result<()> {
        self.senders
            .lock()
            .insert(track.kind(), Some(track.id().to_string()));
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Option<TrackHandle>) -> Result<bool> {
        let mut senders = self.senders.lock();
        match senders.get_mut(&kind) {
            Some(slot) => {
                *slot = track.map(|t| t.id().to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        if ice_restart {
            self.connected.store(false, Ordering::SeqCst);
        }
        Ok(SessionDescription::offer(self.describe()))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(self.describe()))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<()> {
        self.has_local.store(true, Ordering::SeqCst);
        self.sink.local_candidate(IceCandidate::new(format!(
            "candidate:1 1 udp 2122260223 127.0.0.1 {} typ host",
            40000 + self.sink.link_id()
        )));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let kinds = desc
            .sdp
            .split("tracks=")
            .nth(1)
            .ok_or_else(|| Error::InvalidDescription("missing track list".into()))?;
        for kind in kinds.split(',').filter(|k| !k.is_empty()) {
            let kind = match kind {
                "audio" => TrackKind::Audio,
                "video" => TrackKind::Video,
                other => return Err(Error::InvalidDescription(format!("unknown kind {other}"))),
            };
            if self.announced.lock().insert(kind) {
                self.sink.remote_track(Arc::new(LoopbackRemoteTrack {
                    id: format!("{}-{}", self.sink.remote(), kind),
                    kind,
                }));
            }
        }
        self.has_remote.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Records every connection it creates.
#[derive(Debug, Default)]
pub struct LoopbackFactory {
    created: Mutex<Vec<Arc<LoopbackConnection>>>,
}

impl LoopbackFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    /// The newest connection to `remote`.
    pub fn latest(&self, remote: &str) -> Option<Arc<LoopbackConnection>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|c| c.remote() == remote)
            .cloned()
    }

    pub fn total_offers(&self) -> u32 {
        self.created.lock().iter().map(|c| c.offers()).sum()
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackFactory {
    async fn create(&self, _config: &PeerConfig, events: PeerEventSink) -> Result<PeerConnectionHandle> {
        let conn = Arc::new(LoopbackConnection::new(events));
        self.created.lock().push(conn.clone());
        Ok(conn)
    }
}

// ── Clients ───────────────────────────────────────────────────────────────

pub struct Participant {
    pub client: MeshClient,
    pub events: broadcast::Receiver<MeshEvent>,
    pub devices: Arc<ScriptedDevices>,
    pub factory: Arc<LoopbackFactory>,
}

impl Participant {
    pub async fn connect(relay_url: &str) -> Self {
        Self::with_devices(relay_url, ScriptedDevices::new()).await
    }

    pub async fn with_devices(relay_url: &str, devices: Arc<ScriptedDevices>) -> Self {
        Self::with_config(test_config(relay_url), devices).await
    }

    pub async fn with_config(config: ClientConfig, devices: Arc<ScriptedDevices>) -> Self {
        let factory = LoopbackFactory::new();
        let client = MeshClient::connect(config, devices.clone(), factory.clone())
            .await
            .expect("connect to relay");
        let events = client.subscribe();
        Self {
            client,
            events,
            devices,
            factory,
        }
    }

    pub fn id(&self) -> String {
        self.client.session_id().expect("session id")
    }

    /// Wait for the first event matching `pred`, skipping the rest.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> MeshEvent
    where
        F: FnMut(&MeshEvent) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Poll `peers()` until `pred` holds.
    pub async fn wait_for_peers<F>(&self, pred: F) -> Vec<PeerInfo>
    where
        F: Fn(&[PeerInfo]) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let peers = self.client.peers().await.expect("peers");
                if pred(&peers) {
                    return peers;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("timed out waiting for peer set")
    }
}
