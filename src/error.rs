//! Call error taxonomy
//!
//! Every failure the call core reports upward maps onto one of these
//! variants. Release failures (stopping an already stopped track, closing a
//! closed channel) are not errors and never produce one.

use crate::media::TrackKind;
use std::error::Error;
use std::fmt;

/// Call-level errors surfaced to the coordinator and presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Signaling transport could not be opened or was dropped
    ChannelUnavailable(String),
    /// Camera or microphone denied or absent
    DeviceUnavailable(String),
    /// Screen capture denied or unsupported
    CaptureUnavailable(String),
    /// The peer connection moved to `errored`
    NegotiationFailed(String),
    /// Track replacement attempted with nothing being sent for that kind
    NoActiveSender(TrackKind),
    /// Operation attempted outside its valid state
    InvalidState(String),
}

impl CallError {
    /// Short machine-readable code, used in logs and on the wire
    pub fn code(&self) -> &'static str {
        match self {
            CallError::ChannelUnavailable(_) => "CHANNEL_UNAVAILABLE",
            CallError::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
            CallError::CaptureUnavailable(_) => "CAPTURE_UNAVAILABLE",
            CallError::NegotiationFailed(_) => "NEGOTIATION_FAILED",
            CallError::NoActiveSender(_) => "NO_ACTIVE_SENDER",
            CallError::InvalidState(_) => "INVALID_STATE",
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::ChannelUnavailable(msg) => write!(f, "Signaling channel unavailable: {}", msg),
            CallError::DeviceUnavailable(msg) => write!(f, "Media device unavailable: {}", msg),
            CallError::CaptureUnavailable(msg) => write!(f, "Screen capture unavailable: {}", msg),
            CallError::NegotiationFailed(msg) => write!(f, "Negotiation failed: {}", msg),
            CallError::NoActiveSender(kind) => write!(f, "No active {} sender", kind),
            CallError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl Error for CallError {}
