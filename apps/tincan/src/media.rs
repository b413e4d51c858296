use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use webrtc::track::track_local::TrackLocal;

/// Media kind as declared in signaling payloads.
///
/// Incoming calls take their kind from this declared value, never from
/// sniffing the session description, so audio-only offers that carry inactive
/// video lines stay unambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media device unavailable: {0}")]
    Unavailable(String),
    #[error("media permission denied: {0}")]
    PermissionDenied(String),
}

#[derive(Clone)]
enum TrackHandle {
    /// No engine-level handle; used for remote tracks and test tracks.
    Detached,
    /// Outbound track backed by the media engine.
    Local(Arc<dyn TrackLocal + Send + Sync>),
}

/// A single audio or video track, local or remote.
///
/// Enablement is shared across clones, so muting a track is observed by every
/// holder, mirroring how the platform track objects behave.
#[derive(Clone)]
pub struct MediaTrack {
    id: String,
    kind: MediaKind,
    enabled: Arc<AtomicBool>,
    handle: TrackHandle,
}

impl MediaTrack {
    /// A track with no engine handle. Collaborator fakes and remote tracks
    /// use this form.
    pub fn detached(kind: MediaKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            handle: TrackHandle::Detached,
        }
    }

    /// Wrap an engine-backed local track.
    pub fn local(kind: MediaKind, track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            handle: TrackHandle::Local(track),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// The engine-level handle, if this track can be attached outbound.
    pub fn rtc_handle(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        match &self.handle {
            TrackHandle::Detached => None,
            TrackHandle::Local(track) => Some(Arc::clone(track)),
        }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Immutable snapshot of the remote media bundle.
///
/// Merging a new track always produces a new snapshot containing every
/// previously observed track plus the new one, so a track that has been seen
/// once is never dropped by later arrivals.
#[derive(Debug, Clone, Default)]
pub struct RemoteMedia {
    tracks: Arc<Vec<MediaTrack>>,
}

impl RemoteMedia {
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn has(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind() == kind)
    }

    pub fn with_track(&self, track: MediaTrack) -> Self {
        let mut tracks = self.tracks.as_ref().clone();
        tracks.push(track);
        Self {
            tracks: Arc::new(tracks),
        }
    }
}

/// Camera/microphone acquisition, owned by the host platform.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire local capture tracks for the given kind: microphone only for
    /// audio, microphone plus camera for video.
    async fn acquire(&self, kind: MediaKind) -> Result<Vec<MediaTrack>, MediaError>;
}

/// Device audio routing: ringtone playback and in-call audio session control.
pub trait AudioRoute: Send + Sync {
    fn start_ringtone(&self);
    fn stop_ringtone(&self);
    fn start_session(&self, kind: MediaKind);
    fn stop_session(&self);
    fn set_speaker(&self, on: bool);
    fn set_mic_mute(&self, muted: bool);
}
