//! Transport layer for call signaling
//!
//! Handles the relay wire protocol, the Signaling Client and the concrete
//! relay connections (WebSocket, in-memory loopback).

pub mod loopback;
pub mod protocol;
pub mod signaling_client;
pub mod websocket;

pub use loopback::LoopbackRelay;
pub use protocol::{ClientEvent, Role, ServerEvent, SignalPayload};
pub use signaling_client::{InboundSignal, RelayConnector, RelayLink, SignalingClient, SignalingEvent};
pub use websocket::WebSocketConnector;
