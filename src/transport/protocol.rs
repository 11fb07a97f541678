//! Relay wire protocol
//!
//! JSON text frames exchanged with the signaling relay. Negotiation payloads
//! ride inside `peer-signal` events untouched; nothing in the call core
//! looks inside them.

use crate::error::CallError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque negotiation payload (offer/answer/candidate or equivalent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(pub Value);

impl SignalPayload {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn into_inner(self) -> Value {
        self.0
    }
}

/// Role assigned by the relay on join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Produces the first negotiation message
    Initiator,
    /// Waits for the remote's first message
    Responder,
}

impl Role {
    pub fn from_initiator_flag(is_initiator: bool) -> Self {
        if is_initiator {
            Role::Initiator
        } else {
            Role::Responder
        }
    }

    pub fn is_initiator(&self) -> bool {
        matches!(self, Role::Initiator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Events sent to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Announce intent to join a room
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
    },

    /// Forward a negotiation payload to the other participant
    PeerSignal { payload: SignalPayload },

    /// Leave the current room without dropping the socket
    LeaveRoom,
}

/// Events received from the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Role assignment for this participant
    RoomJoined {
        #[serde(rename = "isInitiator")]
        is_initiator: bool,
    },

    /// A second participant is present
    #[serde(alias = "user-joined")]
    PeerPresent,

    /// Negotiation payload from the other participant
    PeerSignal { payload: SignalPayload },

    /// The other participant left
    #[serde(alias = "user-left")]
    PeerLeft,

    /// Relay-side failure (room full, bad request)
    Error { message: String },
}

impl ClientEvent {
    pub fn to_json(&self) -> Result<String, CallError> {
        serde_json::to_string(self)
            .map_err(|e| CallError::InvalidState(format!("Failed to serialize relay message: {}", e)))
    }
}

impl ServerEvent {
    pub fn from_json(json: &str) -> Result<Self, CallError> {
        serde_json::from_str(json.trim())
            .map_err(|e| CallError::InvalidState(format!("Invalid relay message: {}", e)))
    }
}
