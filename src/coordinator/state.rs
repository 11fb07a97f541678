//! Call state published to the presentation layer

use crate::error::CallError;
use crate::media::{LocalMediaStream, TrackKind};
use crate::transport::Role;
use crate::webrtc::{PeerConnectionState, RemoteMediaStream};

/// Snapshot of everything the presentation layer renders
#[derive(Debug, Clone, PartialEq)]
pub struct CallState {
    pub room_id: String,
    pub nickname: Option<String>,
    /// Assigned by the relay; `None` until `room-joined`
    pub role: Option<Role>,
    pub connection: PeerConnectionState,
    pub peer_present: bool,
    /// The stream attached to the Peer Session
    pub local_stream: Option<LocalMediaStream>,
    pub remote_stream: Option<RemoteMediaStream>,
    pub is_screen_sharing: bool,
    /// Last known mute flags, kept across stream swaps
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub last_error: Option<CallError>,
    pub left: bool,
}

impl CallState {
    pub(crate) fn new(room_id: &str, nickname: Option<String>, audio_enabled: bool, video_enabled: bool) -> Self {
        Self {
            room_id: room_id.to_string(),
            nickname,
            role: None,
            connection: PeerConnectionState::Idle,
            peer_present: false,
            local_stream: None,
            remote_stream: None,
            is_screen_sharing: false,
            audio_enabled,
            video_enabled,
            last_error: None,
            left: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection == PeerConnectionState::Connected
    }

    pub fn enabled(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio_enabled,
            TrackKind::Video => self.video_enabled,
        }
    }
}

/// Individual changes, in the order they were applied
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    RoleAssigned(Role),
    PeerPresent,
    PeerLeft,
    ConnectionChanged(PeerConnectionState),
    LocalStreamChanged(Option<LocalMediaStream>),
    RemoteStreamChanged(Option<RemoteMediaStream>),
    TrackEnabled { kind: TrackKind, enabled: bool },
    ScreenShareChanged(bool),
    Error(CallError),
    Left,
}
