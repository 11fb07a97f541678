//! Peer connection layer
//!
//! This module provides:
//! - The negotiation seam (`PeerTransport`) over whatever primitive the
//!   platform exposes; payloads stay opaque to everything above it
//! - The Peer Session state machine built on top of it
//! - A webrtc-rs backed transport and an in-process loopback network

pub mod loopback;
#[cfg(feature = "webrtc-streaming")]
pub mod peer_connection;
pub mod session;

pub use loopback::LoopbackNetwork;
#[cfg(feature = "webrtc-streaming")]
pub use peer_connection::PeerConnectionManager;
pub use session::{PeerSession, SessionUpdate};

use crate::error::CallError;
use crate::media::{MediaTrack, TrackKind};
use crate::transport::SignalPayload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Connection state of a Peer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    /// Constructed, not started
    Idle,
    /// Negotiation in progress
    Connecting,
    /// Media negotiated and flowing
    Connected,
    /// Torn down locally or by the remote's departure
    Closed,
    /// Transport or negotiation failure; terminal for the instance
    Errored,
}

impl PeerConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerConnectionState::Idle => "idle",
            PeerConnectionState::Connecting => "connecting",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Closed => "closed",
            PeerConnectionState::Errored => "errored",
        }
    }

    /// No further transitions except to `closed`
    pub fn is_finished(&self) -> bool {
        matches!(self, PeerConnectionState::Closed | PeerConnectionState::Errored)
    }
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A track received from the far end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// The remote party's tracks assembled into one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMediaStream {
    pub id: String,
    pub audio: Option<RemoteTrack>,
    pub video: Option<RemoteTrack>,
}

impl RemoteMediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            audio: None,
            video: None,
        }
    }

    pub fn track(&self, kind: TrackKind) -> Option<&RemoteTrack> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    /// Copy of this stream with `track` put in its kind's slot
    pub fn with_track(&self, track: RemoteTrack) -> Self {
        let mut next = self.clone();
        match track.kind {
            TrackKind::Audio => next.audio = Some(track),
            TrackKind::Video => next.video = Some(track),
        }
        next
    }

    /// Copy of this stream with the `kind` slot emptied
    pub fn without(&self, kind: TrackKind) -> Self {
        let mut next = self.clone();
        match kind {
            TrackKind::Audio => next.audio = None,
            TrackKind::Video => next.video = None,
        }
        next
    }
}

/// Events raised by a transport, delivered in order on one channel
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// First successful negotiation completed
    Connected,
    /// Transport failure
    Failed(String),
    /// Remote side closed the connection
    Closed,
    /// Every track announced by one remote description, delivered together
    RemoteStream { stream_id: String, tracks: Vec<RemoteTrack> },
    /// A single remote track replaced the previous one of its kind
    RemoteTrack { stream_id: String, track: RemoteTrack },
    /// The remote stopped sending `kind` without renegotiating
    RemoteTrackRemoved { stream_id: String, kind: TrackKind },
}

/// Platform negotiation primitive for one direct connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Start sending `track` once negotiated
    async fn add_track(&self, track: &MediaTrack) -> Result<(), CallError>;

    /// Produce the first negotiation message
    async fn create_offer(&self) -> Result<SignalPayload, CallError>;

    /// Feed a remote negotiation message, possibly producing a reply
    async fn apply_remote(&self, payload: SignalPayload) -> Result<Option<SignalPayload>, CallError>;

    /// Swap the outbound track of `kind` without renegotiating
    async fn replace_track(&self, kind: TrackKind, track: &MediaTrack) -> Result<(), CallError>;

    /// Stop sending `kind` while keeping the negotiated sender
    async fn clear_track(&self, kind: TrackKind) -> Result<(), CallError>;

    async fn close(&self) -> Result<(), CallError>;
}

/// Builds transports; each gets its own event channel
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, CallError>;
}
