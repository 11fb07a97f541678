//! Media Source Manager
//!
//! Sole owner of physical device handles. Every stream it hands out is
//! registered under the stream id until `release` stops its tracks; views
//! built from tracks of other streams are never registered and releasing
//! them is a no-op.

use super::{DeviceInfo, LocalMediaStream, MediaConstraints, MediaDevices, TrackKind};
use crate::error::CallError;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Clone)]
pub struct MediaSourceManager {
    devices: Arc<dyn MediaDevices>,
    owned: Arc<Mutex<HashMap<String, LocalMediaStream>>>,
    /// Rooms with a live call using these devices
    rooms: Arc<Mutex<HashSet<String>>>,
}

/// Reservation of a room for one call; dropping it frees the room
#[derive(Debug)]
pub struct RoomClaim {
    rooms: Arc<Mutex<HashSet<String>>>,
    room_id: String,
}

impl Drop for RoomClaim {
    fn drop(&mut self) {
        self.rooms.lock().remove(&self.room_id);
        debug!("Room {} released", self.room_id);
    }
}

impl MediaSourceManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            owned: Arc::new(Mutex::new(HashMap::new())),
            rooms: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Reserve `room_id` for a single call on these devices
    pub fn claim_room(&self, room_id: &str) -> Result<RoomClaim, CallError> {
        if !self.rooms.lock().insert(room_id.to_string()) {
            return Err(CallError::InvalidState(format!("a call in room {} is already live", room_id)));
        }
        Ok(RoomClaim {
            rooms: self.rooms.clone(),
            room_id: room_id.to_string(),
        })
    }

    pub async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, CallError> {
        self.devices.enumerate_devices().await
    }

    /// Drop device selections the platform no longer offers, so the first
    /// device of that kind is used instead
    pub async fn resolve_constraints(&self, constraints: &MediaConstraints) -> MediaConstraints {
        let mut resolved = constraints.clone();
        let devices = match self.devices.enumerate_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Device enumeration failed, keeping selections: {}", e);
                return resolved;
            }
        };

        for kind in [TrackKind::Audio, TrackKind::Video] {
            let selected = match kind {
                TrackKind::Audio => &mut resolved.audio_device_id,
                TrackKind::Video => &mut resolved.video_device_id,
            };
            if let Some(id) = selected.as_deref() {
                if !devices.iter().any(|d| d.kind == kind && d.device_id == id) {
                    warn!("Selected {} device {} not present, using default", kind, id);
                    *selected = None;
                }
            }
        }
        resolved
    }

    /// Acquire camera and microphone
    pub async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream, CallError> {
        let constraints = self.resolve_constraints(constraints).await;
        let stream = self.devices.get_user_media(&constraints).await?;
        info!(
            "Acquired local stream {} (audio: {:?}, video: {:?})",
            stream.id(),
            stream.is_enabled(TrackKind::Audio),
            stream.is_enabled(TrackKind::Video)
        );
        self.owned.lock().insert(stream.id().to_string(), stream.clone());
        Ok(stream)
    }

    /// Acquire a screen/window capture stream
    pub async fn acquire_display_capture(&self) -> Result<LocalMediaStream, CallError> {
        let stream = self.devices.get_display_media().await?;
        info!("Acquired display capture {}", stream.id());
        self.owned.lock().insert(stream.id().to_string(), stream.clone());
        Ok(stream)
    }

    /// Flip a track's enabled flag. Returns false if the stream has no
    /// track of that kind.
    pub fn set_track_enabled(&self, stream: &LocalMediaStream, kind: TrackKind, enabled: bool) -> bool {
        match stream.track(kind) {
            Some(track) => {
                track.set_enabled(enabled);
                debug!("Stream {} {} track enabled={}", stream.id(), kind, enabled);
                true
            }
            None => false,
        }
    }

    /// Stop every track owned by `stream`. Releasing twice, or releasing a
    /// stream this manager never acquired, does nothing.
    pub fn release(&self, stream: &LocalMediaStream) -> usize {
        let Some(owned) = self.owned.lock().remove(stream.id()) else {
            return 0;
        };
        let stopped = owned.tracks().filter(|t| t.stop()).count();
        info!("Released stream {} ({} tracks stopped)", owned.id(), stopped);
        stopped
    }

    pub fn is_owned(&self, stream: &LocalMediaStream) -> bool {
        self.owned.lock().contains_key(stream.id())
    }

    /// Number of acquired streams not yet released
    pub fn owned_streams(&self) -> usize {
        self.owned.lock().len()
    }
}
