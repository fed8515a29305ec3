//! Placeholder tracks for participants with no usable device.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use super::{MediaTrack, TrackKind};

/// A silent audio or blank video track.
///
/// Carries no media of its own; backends render it as silence or black frames.
#[derive(Debug)]
pub struct SyntheticTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl SyntheticTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: format!("synthetic-{}-{}", kind, Uuid::new_v4()),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }
}

impl MediaTrack for SyntheticTrack {
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
