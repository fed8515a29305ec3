//! # Local Media
//!
//! Capture devices are an external collaborator: the platform implements
//! [`MediaDevices`] and hands back [`MediaTrack`]s. This module decides which
//! tracks to use ([`MediaSourceManager`]) and never touches raw media.

pub mod manager;
pub mod synthetic;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

pub use manager::MediaSourceManager;
pub use synthetic::SyntheticTrack;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// A local capture track.
///
/// Disabling a track keeps it attached to every peer link; the remote side
/// sees silence or a frozen frame instead of a dropped stream.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Release the underlying device. Irreversible.
    fn stop(&self);
    fn is_stopped(&self) -> bool;
    /// For backends that need their concrete track type back.
    fn as_any(&self) -> &dyn Any;
}

pub type TrackHandle = Arc<dyn MediaTrack>;

/// A track received from a remote peer, as surfaced by the backend.
pub trait RemoteTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn as_any(&self) -> &dyn Any;
}

pub type RemoteTrackHandle = Arc<dyn RemoteTrack>;

/// What to ask the camera/microphone for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub audio: bool,
    pub video: bool,
}

impl CaptureRequest {
    pub const AUDIO_VIDEO: Self = Self { audio: true, video: true };
    pub const AUDIO: Self = Self { audio: true, video: false };
    pub const VIDEO: Self = Self { audio: false, video: true };

    pub fn describe(&self) -> &'static str {
        match (self.audio, self.video) {
            (true, true) => "camera and microphone",
            (true, false) => "microphone",
            (false, true) => "camera",
            (false, false) => "nothing",
        }
    }
}

/// Platform capture API.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Capture the requested kinds. All-or-nothing, like `getUserMedia`.
    async fn capture(&self, request: CaptureRequest) -> Result<Vec<TrackHandle>>;

    /// Capture a screen or window as a video track.
    async fn capture_screen(&self) -> Result<TrackHandle>;

    /// Silent audio plus blank video, used when nothing else can be captured.
    fn synthetic(&self) -> Vec<TrackHandle> {
        vec![
            Arc::new(SyntheticTrack::new(TrackKind::Audio)) as TrackHandle,
            Arc::new(SyntheticTrack::new(TrackKind::Video)) as TrackHandle,
        ]
    }
}

/// Which source feeds the outbound video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoSource {
    Camera,
    Screen,
}

/// UI-facing summary of one local track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackInfo {
    pub id: String,
    pub kind: TrackKind,
    pub enabled: bool,
    pub synthetic: bool,
}

impl TrackInfo {
    fn of(track: &TrackHandle) -> Self {
        Self {
            id: track.id().to_string(),
            kind: track.kind(),
            enabled: track.is_enabled(),
            synthetic: track.as_any().is::<SyntheticTrack>(),
        }
    }
}

/// Snapshot of the local track set and its fallback flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalMediaState {
    pub audio: Option<TrackInfo>,
    /// The active outbound video track (camera or screen).
    pub video: Option<TrackInfo>,
    /// Microphone could not be acquired.
    pub audio_degraded: bool,
    /// Camera could not be acquired.
    pub video_degraded: bool,
    pub video_source: VideoSource,
}

impl LocalMediaState {
    pub fn empty() -> Self {
        Self {
            audio: None,
            video: None,
            audio_degraded: false,
            video_degraded: false,
            video_source: VideoSource::Camera,
        }
    }

    pub fn microphone_enabled(&self) -> bool {
        self.audio.as_ref().map(|t| t.enabled).unwrap_or(false)
    }

    pub fn camera_enabled(&self) -> bool {
        self.video.as_ref().map(|t| t.enabled).unwrap_or(false)
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.video_source == VideoSource::Screen
    }
}
