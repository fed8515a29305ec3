//! Acquisition ladder, mute toggles and the camera/screen swap.

use std::sync::Arc;

use crate::error::{Error, Notification, Recovery, Result};

use super::{
    CaptureRequest, LocalMediaState, MediaDevices, MediaTrack, SyntheticTrack, TrackHandle,
    TrackInfo, TrackKind, VideoSource,
};

/// Owns the local track set. The only writer of [`LocalMediaState`].
pub struct MediaSourceManager {
    devices: Arc<dyn MediaDevices>,
    audio: Option<TrackHandle>,
    camera: Option<TrackHandle>,
    screen: Option<TrackHandle>,
    audio_degraded: bool,
    video_degraded: bool,
    acquired: bool,
}

impl MediaSourceManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            audio: None,
            camera: None,
            screen: None,
            audio_degraded: false,
            video_degraded: false,
            acquired: false,
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Acquire local media, most capable option first.
    ///
    /// camera + microphone, then microphone only, then camera only, then a
    /// synthetic silent/blank pair. Never fails; each step down sets a
    /// degraded flag and yields a notification. A no-op if already acquired.
    pub async fn acquire(&mut self) -> Vec<Notification> {
        if self.acquired {
            return Vec::new();
        }

        let ladder = [
            CaptureRequest::AUDIO_VIDEO,
            CaptureRequest::AUDIO,
            CaptureRequest::VIDEO,
        ];

        let mut failures: Vec<Error> = Vec::new();
        for request in ladder {
            match self.devices.capture(request).await {
                Ok(tracks) if !tracks.is_empty() => {
                    self.install(tracks);
                    break;
                }
                Ok(_) => {
                    tracing::debug!(request = request.describe(), "Capture returned no tracks");
                }
                Err(e) => {
                    tracing::warn!(request = request.describe(), error = %e, "Capture failed");
                    failures.push(e);
                }
            }
        }

        let synthetic = self.audio.is_none() && self.camera.is_none();
        self.audio_degraded = self.audio.is_none();
        self.video_degraded = self.camera.is_none();

        if synthetic {
            tracing::warn!("No capture device usable, joining with synthetic media");
            let tracks = self.devices.synthetic();
            self.install(tracks);
        }
        self.acquired = true;

        tracing::info!(
            audio_degraded = self.audio_degraded,
            video_degraded = self.video_degraded,
            synthetic = synthetic,
            "Local media acquired"
        );

        let cause = failures.last().map(|e| e.to_string());
        let mut notices = Vec::new();
        if self.audio_degraded {
            notices.push(degraded_notice("Microphone", cause.as_deref()));
        }
        if self.video_degraded {
            notices.push(degraded_notice("Camera", cause.as_deref()));
        }
        notices
    }

    fn install(&mut self, tracks: Vec<TrackHandle>) {
        for track in tracks {
            let slot = match track.kind() {
                TrackKind::Audio => &mut self.audio,
                TrackKind::Video => &mut self.camera,
            };
            if let Some(old) = slot.replace(track) {
                old.stop();
            }
        }
    }

    /// Tracks to attach to a peer link: audio plus the active video source.
    pub fn tracks(&self) -> Vec<TrackHandle> {
        self.audio
            .iter()
            .chain(self.active_video().iter())
            .cloned()
            .collect()
    }

    pub fn active_video(&self) -> Option<TrackHandle> {
        self.screen.clone().or_else(|| self.camera.clone())
    }

    pub fn is_degraded(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio_degraded,
            TrackKind::Video => self.video_degraded,
        }
    }

    // ── Toggles ───────────────────────────────────────────────────────────

    /// Flip the microphone at the source. Returns the new enabled state.
    pub fn toggle_microphone(&mut self) -> Result<bool> {
        let track = self
            .audio
            .as_ref()
            .ok_or_else(|| Error::DeviceUnavailable("microphone".into()))?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::debug!(enabled = enabled, "Microphone toggled");
        Ok(enabled)
    }

    /// Flip the camera at the source. Returns the new enabled state.
    pub fn toggle_camera(&mut self) -> Result<bool> {
        let track = self
            .camera
            .as_ref()
            .ok_or_else(|| Error::DeviceUnavailable("camera".into()))?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::debug!(enabled = enabled, "Camera toggled");
        Ok(enabled)
    }

    /// Retry capture for a degraded modality, e.g. after the user re-grants
    /// permission. The new track replaces the synthetic or missing one.
    pub async fn regrant(&mut self, kind: TrackKind) -> Result<TrackHandle> {
        let request = match kind {
            TrackKind::Audio => CaptureRequest::AUDIO,
            TrackKind::Video => CaptureRequest::VIDEO,
        };
        let tracks = self.devices.capture(request).await?;
        let track = tracks
            .into_iter()
            .find(|t| t.kind() == kind)
            .ok_or_else(|| Error::DeviceUnavailable(request.describe().into()))?;

        self.install(vec![track.clone()]);
        match kind {
            TrackKind::Audio => self.audio_degraded = false,
            TrackKind::Video => self.video_degraded = false,
        }
        tracing::info!(kind = %kind, "Capture re-granted");
        Ok(track)
    }

    // ── Screen Share ──────────────────────────────────────────────────────

    pub fn is_sharing_screen(&self) -> bool {
        self.screen.is_some()
    }

    /// Start capturing the screen. The returned track becomes the active video.
    pub async fn start_screen_share(&mut self) -> Result<TrackHandle> {
        if let Some(ref screen) = self.screen {
            return Ok(screen.clone());
        }
        let track = self.devices.capture_screen().await?;
        tracing::info!(track = track.id(), "Screen share started");
        self.screen = Some(track.clone());
        Ok(track)
    }

    /// Stop the screen capture.
    ///
    /// Returns `None` if no share was running, otherwise the camera track to
    /// restore (itself `None` when there is no camera).
    pub fn stop_screen_share(&mut self) -> Option<Option<TrackHandle>> {
        let screen = self.screen.take()?;
        screen.stop();
        tracing::info!(track = screen.id(), "Screen share stopped");
        Some(self.camera.clone())
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Stop every track and forget them.
    pub fn release(&mut self) {
        for track in [self.audio.take(), self.camera.take(), self.screen.take()]
            .into_iter()
            .flatten()
        {
            track.stop();
        }
        self.audio_degraded = false;
        self.video_degraded = false;
        if self.acquired {
            tracing::info!("Local media released");
        }
        self.acquired = false;
    }

    pub fn state(&self) -> LocalMediaState {
        LocalMediaState {
            audio: self.audio.as_ref().map(TrackInfo::of),
            video: self.active_video().as_ref().map(TrackInfo::of),
            audio_degraded: self.audio_degraded,
            video_degraded: self.video_degraded,
            video_source: if self.screen.is_some() {
                VideoSource::Screen
            } else {
                VideoSource::Camera
            },
        }
    }

    /// True if a track of `kind` is a synthetic placeholder.
    pub fn is_synthetic(&self, kind: TrackKind) -> bool {
        let track = match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.camera.as_ref(),
        };
        track.map(|t| t.as_any().is::<SyntheticTrack>()).unwrap_or(false)
    }
}

impl Drop for MediaSourceManager {
    fn drop(&mut self) {
        self.release();
    }
}

fn degraded_notice(device: &str, cause: Option<&str>) -> Notification {
    let message = match cause {
        Some(cause) => format!("{} unavailable ({}); joined without it", device, cause),
        None => format!("{} unavailable; joined without it", device),
    };
    Notification::new(message, Recovery::RetryPermissions)
}
