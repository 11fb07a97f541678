//! Local media model
//!
//! This module provides:
//! - Track and stream handles shared between the media manager, the peer
//!   session and the presentation layer
//! - The device platform seam (`MediaDevices`) and a synthetic platform
//! - The Media Source Manager that owns every physical device handle

pub mod devices;
pub mod manager;

pub use devices::{MediaDevices, SyntheticDevices};
pub use manager::{MediaSourceManager, RoomClaim};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical source behind a local track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    /// Screen or window capture
    Display,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    label: String,
    device_id: Option<String>,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

/// Handle to a local media track.
///
/// Clones share the same underlying track: flipping `enabled` or stopping
/// through one clone is visible through all of them. Identity is the track id.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub(crate) fn new(
        kind: TrackKind,
        source: TrackSource,
        label: impl Into<String>,
        device_id: Option<String>,
        enabled: bool,
    ) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                source,
                label: label.into(),
                device_id,
                enabled: AtomicBool::new(enabled),
                ended,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn device_id(&self) -> Option<&str> {
        self.inner.device_id.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute semantics: the track keeps running, only its output is gated
    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !*self.inner.ended.borrow()
    }

    /// Stop the track. Returns false if it had already ended.
    ///
    /// Only the media manager (or the platform, when the user ends a
    /// capture from the OS) may end a track.
    pub(crate) fn stop(&self) -> bool {
        !self.inner.ended.send_replace(true)
    }

    /// Resolves once the track has ended, whoever ended it
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        loop {
            let ended = *rx.borrow_and_update();
            if ended {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// An ordered pair of optional tracks (audio, video)
#[derive(Debug, Clone)]
pub struct LocalMediaStream {
    id: String,
    audio: Option<MediaTrack>,
    video: Option<MediaTrack>,
}

impl LocalMediaStream {
    pub(crate) fn new(audio: Option<MediaTrack>, video: Option<MediaTrack>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), audio, video)
    }

    /// A stream view over tracks owned elsewhere (e.g. capture video plus
    /// the camera's microphone while sharing)
    pub(crate) fn with_id(id: String, audio: Option<MediaTrack>, video: Option<MediaTrack>) -> Self {
        Self { id, audio, video }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.audio.as_ref()
    }

    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.video.as_ref()
    }

    pub fn track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    /// Whether any track of this stream is still running
    pub fn has_live_tracks(&self) -> bool {
        self.tracks().any(MediaTrack::is_live)
    }

    /// Enabled flag of the track of `kind`, if the stream carries one
    pub fn is_enabled(&self, kind: TrackKind) -> Option<bool> {
        self.track(kind).map(MediaTrack::is_enabled)
    }
}

impl PartialEq for LocalMediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.audio == other.audio && self.video == other.video
    }
}

/// Camera/microphone acquisition options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    #[serde(default)]
    pub audio_device_id: Option<String>,
    #[serde(default)]
    pub video_device_id: Option<String>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
            audio_device_id: None,
            video_device_id: None,
        }
    }
}

impl MediaConstraints {
    pub fn enabled(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio_enabled,
            TrackKind::Video => self.video_enabled,
        }
    }

    pub fn device_id(&self, kind: TrackKind) -> Option<&str> {
        match kind {
            TrackKind::Audio => self.audio_device_id.as_deref(),
            TrackKind::Video => self.video_device_id.as_deref(),
        }
    }
}

/// An input device reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub label: String,
    pub kind: TrackKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_enabled_and_live_state() {
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam", None, true);
        let other = track.clone();

        other.set_enabled(false);
        assert!(!track.is_enabled());

        assert!(track.stop());
        assert!(!other.is_live());
        assert!(!other.stop(), "second stop reports already ended");
        assert_eq!(track, other);
    }

    #[tokio::test]
    async fn ended_resolves_after_stop() {
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Display, "screen", None, true);
        let waiter = track.clone();
        let handle = tokio::spawn(async move { waiter.ended().await });
        track.stop();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("ended() did not resolve")
            .unwrap();
    }

    #[test]
    fn stream_reports_enabled_per_kind() {
        let audio = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic", None, false);
        let stream = LocalMediaStream::new(Some(audio), None);
        assert_eq!(stream.is_enabled(TrackKind::Audio), Some(false));
        assert_eq!(stream.is_enabled(TrackKind::Video), None);
        assert!(stream.has_live_tracks());
    }
}
