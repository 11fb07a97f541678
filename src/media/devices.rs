//! Device platform seam
//!
//! The call core treats the platform as an opaque provider of tracks and
//! capture sources. `SyntheticDevices` is an in-process platform with no
//! real hardware behind it: it hands out tracks, remembers every handle it
//! issued so leaks can be counted, and can simulate denials, slow permission
//! prompts and the user ending a screen share from the OS.

use super::{DeviceInfo, LocalMediaStream, MediaConstraints, MediaTrack, TrackKind, TrackSource};
use crate::error::CallError;
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Platform media provider
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// List available audio and video inputs
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, CallError>;

    /// Acquire camera and microphone tracks
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream, CallError>;

    /// Acquire a screen/window capture stream
    async fn get_display_media(&self) -> Result<LocalMediaStream, CallError>;
}

/// In-process device platform
pub struct SyntheticDevices {
    devices: Mutex<Vec<DeviceInfo>>,
    camera_denied: AtomicBool,
    capture_denied: AtomicBool,
    acquire_delay: Mutex<Duration>,
    issued: Mutex<Vec<MediaTrack>>,
}

impl SyntheticDevices {
    /// A platform with one microphone and one camera
    pub fn new() -> Self {
        Self::with_devices(vec![
            DeviceInfo {
                device_id: "default-mic".to_string(),
                label: "Built-in Microphone".to_string(),
                kind: TrackKind::Audio,
            },
            DeviceInfo {
                device_id: "default-camera".to_string(),
                label: "Built-in Camera".to_string(),
                kind: TrackKind::Video,
            },
        ])
    }

    pub fn with_devices(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices: Mutex::new(devices),
            camera_denied: AtomicBool::new(false),
            capture_denied: AtomicBool::new(false),
            acquire_delay: Mutex::new(Duration::ZERO),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Deny camera/microphone permission
    pub fn deny_camera(&self, denied: bool) {
        self.camera_denied.store(denied, Ordering::SeqCst);
    }

    /// Deny screen capture permission
    pub fn deny_capture(&self, denied: bool) {
        self.capture_denied.store(denied, Ordering::SeqCst);
    }

    /// Delay every acquisition, as a permission prompt would
    pub fn set_acquire_delay(&self, delay: Duration) {
        *self.acquire_delay.lock() = delay;
    }

    pub fn add_device(&self, device: DeviceInfo) {
        self.devices.lock().push(device);
    }

    /// Number of issued tracks that are still running
    pub fn live_tracks(&self) -> usize {
        self.issued.lock().iter().filter(|t| t.is_live()).count()
    }

    pub fn live_tracks_from(&self, source: TrackSource) -> usize {
        self.issued
            .lock()
            .iter()
            .filter(|t| t.source() == source && t.is_live())
            .count()
    }

    /// Total number of tracks handed out so far
    pub fn issued_tracks(&self) -> usize {
        self.issued.lock().len()
    }

    /// The user pressed "stop sharing" in the browser/OS chrome
    pub fn end_capture(&self) -> usize {
        self.stop_where(|t| t.source() == TrackSource::Display)
    }

    /// Camera and microphone disappeared (unplugged, revoked)
    pub fn unplug_camera(&self) -> usize {
        self.stop_where(|t| t.source() != TrackSource::Display)
    }

    fn stop_where(&self, pred: impl Fn(&MediaTrack) -> bool) -> usize {
        self.issued
            .lock()
            .iter()
            .filter(|t| pred(t))
            .filter(|t| t.stop())
            .count()
    }

    async fn wait_prompt(&self) {
        let delay = *self.acquire_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn pick_device(&self, kind: TrackKind, wanted: Option<&str>) -> Result<Option<DeviceInfo>, CallError> {
        let devices = self.devices.lock();
        let mut of_kind = devices.iter().filter(|d| d.kind == kind);
        match wanted {
            Some(id) => of_kind
                .find(|d| d.device_id == id)
                .cloned()
                .map(Some)
                .ok_or_else(|| CallError::DeviceUnavailable(format!("no {} device with id {}", kind, id))),
            None => Ok(of_kind.next().cloned()),
        }
    }

    fn issue(&self, track: MediaTrack) -> MediaTrack {
        self.issued.lock().push(track.clone());
        track
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, CallError> {
        Ok(self.devices.lock().clone())
    }

    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream, CallError> {
        self.wait_prompt().await;

        if self.camera_denied.load(Ordering::SeqCst) {
            return Err(CallError::DeviceUnavailable("permission denied".to_string()));
        }

        let mut tracks = Vec::with_capacity(2);
        for kind in [TrackKind::Audio, TrackKind::Video] {
            let device = self.pick_device(kind, constraints.device_id(kind))?;
            let track = match device {
                Some(device) => {
                    let source = match kind {
                        TrackKind::Audio => TrackSource::Microphone,
                        TrackKind::Video => TrackSource::Camera,
                    };
                    Some(self.issue(MediaTrack::new(
                        kind,
                        source,
                        device.label,
                        Some(device.device_id),
                        constraints.enabled(kind),
                    )))
                }
                None if constraints.enabled(kind) => {
                    return Err(CallError::DeviceUnavailable(format!("no {} input device", kind)));
                }
                None => None,
            };
            tracks.push(track);
        }

        let video = tracks.pop().flatten();
        let audio = tracks.pop().flatten();
        let stream = LocalMediaStream::new(audio, video);
        debug!("Synthetic user media {} acquired", stream.id());
        Ok(stream)
    }

    async fn get_display_media(&self) -> Result<LocalMediaStream, CallError> {
        self.wait_prompt().await;

        if self.capture_denied.load(Ordering::SeqCst) {
            return Err(CallError::CaptureUnavailable("permission denied".to_string()));
        }

        let video = self.issue(MediaTrack::new(TrackKind::Video, TrackSource::Display, "Screen 1", None, true));
        let stream = LocalMediaStream::new(None, Some(video));
        debug!("Synthetic display capture {} acquired", stream.id());
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn user_media_honours_enable_flags() {
        let devices = SyntheticDevices::new();
        let constraints = MediaConstraints {
            audio_enabled: true,
            video_enabled: false,
            ..Default::default()
        };
        let stream = devices.get_user_media(&constraints).await.unwrap();
        assert_eq!(stream.is_enabled(TrackKind::Audio), Some(true));
        assert_eq!(stream.is_enabled(TrackKind::Video), Some(false));
        assert_eq!(devices.live_tracks(), 2);
    }

    #[tokio::test]
    async fn missing_enabled_device_is_unavailable() {
        let devices = SyntheticDevices::with_devices(vec![DeviceInfo {
            device_id: "mic".to_string(),
            label: "Mic".to_string(),
            kind: TrackKind::Audio,
        }]);

        let err = devices.get_user_media(&MediaConstraints::default()).await.unwrap_err();
        assert!(matches!(err, CallError::DeviceUnavailable(_)));

        let audio_only = MediaConstraints {
            video_enabled: false,
            ..Default::default()
        };
        let stream = devices.get_user_media(&audio_only).await.unwrap();
        assert!(stream.video_track().is_none());
    }

    #[tokio::test]
    async fn denial_and_os_stop() {
        let devices = SyntheticDevices::new();
        devices.deny_capture(true);
        assert!(matches!(
            devices.get_display_media().await,
            Err(CallError::CaptureUnavailable(_))
        ));

        devices.deny_capture(false);
        let capture = devices.get_display_media().await.unwrap();
        assert_eq!(devices.end_capture(), 1);
        assert!(!capture.has_live_tracks());
        assert_eq!(devices.end_capture(), 0);
    }
}
