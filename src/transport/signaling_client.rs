//! Signaling Client
//!
//! Owns the bidirectional channel to the relay. It holds no media state:
//! it announces joins, forwards opaque negotiation payloads and hands inbound
//! events to exactly one consumer, in arrival order, with every inbound
//! signal stamped by a per-connection arrival sequence number.

use super::protocol::{ClientEvent, Role, ServerEvent, SignalPayload};
use crate::error::CallError;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Raw channel pair to a relay, produced by a connector
pub struct RelayLink {
    pub outbound: mpsc::UnboundedSender<ClientEvent>,
    pub inbound: mpsc::UnboundedReceiver<ServerEvent>,
    /// Background reader to stop on close, if the transport has one
    pub reader: Option<JoinHandle<()>>,
}

/// Opens relay links
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn open(&self, endpoint: &str) -> Result<RelayLink, CallError>;
}

/// Inbound negotiation payload with its arrival position
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSignal {
    /// Starts at 1 and grows by one per signal received on this channel
    pub seq: u64,
    pub payload: SignalPayload,
}

/// Events delivered to the registered consumer
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    RoomJoined(Role),
    PeerPresent,
    Signal(InboundSignal),
    PeerLeft,
    /// Relay rejected a request (room full, malformed message)
    RelayError(String),
    /// The channel dropped underneath us
    Disconnected,
}

pub struct SignalingClient {
    endpoint: String,
    outbound: Option<mpsc::UnboundedSender<ClientEvent>>,
    inbound: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    reader: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
    handler_registered: bool,
    room_id: Option<String>,
}

impl SignalingClient {
    /// Open a persistent channel to the relay. Not retried here.
    pub async fn connect(connector: &dyn RelayConnector, endpoint: &str) -> Result<Self, CallError> {
        let link = connector.open(endpoint).await?;
        info!("Signaling channel to {} established", endpoint);
        Ok(Self {
            endpoint: endpoint.to_string(),
            outbound: Some(link.outbound),
            inbound: Some(link.inbound),
            reader: link.reader,
            forwarder: None,
            handler_registered: false,
            room_id: None,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_open(&self) -> bool {
        self.outbound.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }

    /// Announce intent to join `room_id`; the role arrives asynchronously
    pub fn join(&mut self, room_id: &str, nickname: Option<&str>) -> Result<(), CallError> {
        self.emit(ClientEvent::JoinRoom {
            room_id: room_id.to_string(),
            nickname: nickname.map(str::to_string),
        })?;
        self.room_id = Some(room_id.to_string());
        info!("Joining room {}", room_id);
        Ok(())
    }

    /// Forward a negotiation payload to the other participant
    pub fn send(&self, payload: SignalPayload) -> Result<(), CallError> {
        self.emit(ClientEvent::PeerSignal { payload })
    }

    /// Register the single consumer of inbound events
    pub fn on_message(&mut self, handler: mpsc::UnboundedSender<SignalingEvent>) -> Result<(), CallError> {
        if self.handler_registered {
            return Err(CallError::InvalidState("signaling handler already registered".to_string()));
        }
        let mut inbound = self
            .inbound
            .take()
            .ok_or_else(|| CallError::ChannelUnavailable("signaling channel closed".to_string()))?;
        self.handler_registered = true;

        let endpoint = self.endpoint.clone();
        self.forwarder = Some(tokio::spawn(async move {
            let mut seq: u64 = 0;
            while let Some(event) = inbound.recv().await {
                let event = match event {
                    ServerEvent::RoomJoined { is_initiator } => {
                        SignalingEvent::RoomJoined(Role::from_initiator_flag(is_initiator))
                    }
                    ServerEvent::PeerPresent => SignalingEvent::PeerPresent,
                    ServerEvent::PeerSignal { payload } => {
                        seq += 1;
                        SignalingEvent::Signal(InboundSignal { seq, payload })
                    }
                    ServerEvent::PeerLeft => SignalingEvent::PeerLeft,
                    ServerEvent::Error { message } => SignalingEvent::RelayError(message),
                };
                if handler.send(event).is_err() {
                    debug!("Signaling consumer for {} went away", endpoint);
                    return;
                }
            }
            warn!("Signaling channel to {} dropped", endpoint);
            let _ = handler.send(SignalingEvent::Disconnected);
        }));
        Ok(())
    }

    /// Release the channel. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(tx) = self.outbound.take() {
            if self.room_id.take().is_some() {
                let _ = tx.send(ClientEvent::LeaveRoom);
            }
            info!("Signaling channel to {} closed", self.endpoint);
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.inbound = None;
    }

    fn emit(&self, event: ClientEvent) -> Result<(), CallError> {
        let tx = self
            .outbound
            .as_ref()
            .ok_or_else(|| CallError::ChannelUnavailable("signaling channel closed".to_string()))?;
        tx.send(event)
            .map_err(|_| CallError::ChannelUnavailable(format!("relay {} dropped the channel", self.endpoint)))
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackRelay;
    use serde_json::json;
    use std::time::Duration;

    async fn next(rx: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for signaling event")
            .expect("signaling stream ended")
    }

    async fn joined(relay: &LoopbackRelay, room: &str) -> (SignalingClient, mpsc::UnboundedReceiver<SignalingEvent>) {
        let mut client = SignalingClient::connect(relay, "loopback://relay").await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        client.on_message(tx).unwrap();
        client.join(room, None).unwrap();
        (client, rx)
    }

    #[tokio::test]
    async fn roles_presence_and_ordered_signals() {
        let relay = LoopbackRelay::new();
        let (a, mut a_rx) = joined(&relay, "demo").await;
        assert_eq!(next(&mut a_rx).await, SignalingEvent::RoomJoined(Role::Initiator));

        let (_b, mut b_rx) = joined(&relay, "demo").await;
        assert_eq!(next(&mut b_rx).await, SignalingEvent::RoomJoined(Role::Responder));
        assert_eq!(next(&mut a_rx).await, SignalingEvent::PeerPresent);
        assert_eq!(next(&mut b_rx).await, SignalingEvent::PeerPresent);

        for n in 0..3 {
            a.send(SignalPayload::new(json!({ "n": n }))).unwrap();
        }
        for n in 0..3u64 {
            match next(&mut b_rx).await {
                SignalingEvent::Signal(signal) => {
                    assert_eq!(signal.seq, n + 1);
                    assert_eq!(signal.payload.into_inner(), json!({ "n": n }));
                }
                other => panic!("Expected signal, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn single_consumer_only() {
        let relay = LoopbackRelay::new();
        let mut client = SignalingClient::connect(&relay, "loopback://relay").await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        client.on_message(tx.clone()).unwrap();
        assert!(matches!(client.on_message(tx), Err(CallError::InvalidState(_))));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_sends() {
        let relay = LoopbackRelay::new();
        let (mut client, _rx) = joined(&relay, "solo").await;
        client.close();
        client.close();
        assert!(!client.is_open());
        assert!(matches!(
            client.send(SignalPayload::new(json!({}))),
            Err(CallError::ChannelUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn unavailable_relay_is_reported() {
        let relay = LoopbackRelay::new();
        relay.set_available(false);
        let err = SignalingClient::connect(&relay, "loopback://relay").await.err().unwrap();
        assert!(matches!(err, CallError::ChannelUnavailable(_)));
    }

    #[tokio::test]
    async fn relay_shutdown_surfaces_disconnect() {
        let relay = LoopbackRelay::new();
        let (_client, mut rx) = joined(&relay, "demo").await;
        assert_eq!(next(&mut rx).await, SignalingEvent::RoomJoined(Role::Initiator));
        relay.shutdown();
        assert_eq!(next(&mut rx).await, SignalingEvent::Disconnected);
    }
}
