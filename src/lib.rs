//! p2p-call - two-party video call core
//!
//! Signaling, local media ownership, the peer media session and the
//! coordinator that ties them into one call lifecycle, including the live
//! camera/screen-share switch.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod media;
pub mod transport;
pub mod webrtc;

// Re-exports
pub use config::{Config, MediaPreferences, WebRTCConfig};
pub use coordinator::{CallDeps, CallEvent, CallHandle, CallState};
pub use error::CallError;
pub use media::{LocalMediaStream, MediaConstraints, MediaSourceManager, MediaTrack, TrackKind};
pub use transport::{Role, SignalPayload, SignalingClient};
pub use webrtc::{PeerConnectionState, PeerSession, RemoteMediaStream};
