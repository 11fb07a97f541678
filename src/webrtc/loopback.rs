//! In-process loopback network
//!
//! A negotiation primitive for two peers living in the same process. The
//! offer/answer descriptions it produces carry the sender's endpoint and the
//! identity of the tracks it sends; media "flows" as track announcements
//! pushed straight into the other endpoint's mailbox, so replacing an
//! outbound track is observed remotely as a new track identity.

use super::{PeerTransport, PeerTransportFactory, RemoteTrack, TransportEvent};
use crate::error::CallError;
use crate::media::{MediaTrack, TrackKind};
use crate::transport::SignalPayload;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug)]
enum MediaFrame {
    Track { stream_id: String, track: RemoteTrack },
    TrackRemoved { stream_id: String, kind: TrackKind },
    Bye,
    Severed,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<String, mpsc::UnboundedSender<MediaFrame>>>,
}

/// Shared medium connecting loopback transports
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transports currently attached
    pub fn endpoints(&self) -> usize {
        self.inner.endpoints.lock().len()
    }

    /// Cut every link, as a network outage would
    pub fn sever_all(&self) {
        for tx in self.inner.endpoints.lock().values() {
            let _ = tx.send(MediaFrame::Severed);
        }
    }

    fn deliver(&self, endpoint: &str, frame: MediaFrame) -> bool {
        match self.inner.endpoints.lock().get(endpoint) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn is_reachable(&self, endpoint: &str) -> bool {
        self.inner.endpoints.lock().contains_key(endpoint)
    }
}

#[async_trait]
impl PeerTransportFactory for LoopbackNetwork {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, CallError> {
        Ok(Box::new(LoopbackTransport::new(self.clone(), events)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DescriptionType {
    Offer,
    Answer,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Description {
    #[serde(rename = "type")]
    kind: DescriptionType,
    endpoint: String,
    stream_id: String,
    tracks: Vec<RemoteTrack>,
}

#[derive(Default)]
struct LinkState {
    sending: HashMap<TrackKind, String>,
    /// Track ids the remote has been told about
    advertised: HashMap<TrackKind, String>,
    remote: Option<String>,
    offered: bool,
    connected: bool,
    closed: bool,
}

pub struct LoopbackTransport {
    network: LoopbackNetwork,
    endpoint: String,
    stream_id: String,
    state: Mutex<LinkState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    pump: JoinHandle<()>,
}

impl LoopbackTransport {
    fn new(network: LoopbackNetwork, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        let endpoint = format!("loop-{}", uuid::Uuid::new_v4());
        let (tx, mut rx) = mpsc::unbounded_channel();
        network.inner.endpoints.lock().insert(endpoint.clone(), tx);

        let pump_events = events.clone();
        let pump = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let event = match frame {
                    MediaFrame::Track { stream_id, track } => TransportEvent::RemoteTrack { stream_id, track },
                    MediaFrame::TrackRemoved { stream_id, kind } => {
                        TransportEvent::RemoteTrackRemoved { stream_id, kind }
                    }
                    MediaFrame::Bye => TransportEvent::Closed,
                    MediaFrame::Severed => TransportEvent::Failed("loopback link severed".to_string()),
                };
                if pump_events.send(event).is_err() {
                    break;
                }
            }
        });

        debug!("Loopback endpoint {} attached", endpoint);
        Self {
            network,
            endpoint,
            stream_id: uuid::Uuid::new_v4().to_string(),
            state: Mutex::new(LinkState::default()),
            events,
            pump,
        }
    }

    fn describe(&self, kind: DescriptionType, state: &mut LinkState) -> Result<SignalPayload, CallError> {
        let mut tracks = Vec::new();
        for track_kind in [TrackKind::Audio, TrackKind::Video] {
            if let Some(id) = state.sending.get(&track_kind) {
                tracks.push(RemoteTrack {
                    id: id.clone(),
                    kind: track_kind,
                });
                state.advertised.insert(track_kind, id.clone());
            }
        }
        let description = Description {
            kind,
            endpoint: self.endpoint.clone(),
            stream_id: self.stream_id.clone(),
            tracks,
        };
        serde_json::to_value(&description)
            .map(SignalPayload::new)
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to encode description: {}", e)))
    }

    fn announce_remote(&self, description: &Description) {
        if description.tracks.is_empty() {
            return;
        }
        let _ = self.events.send(TransportEvent::RemoteStream {
            stream_id: description.stream_id.clone(),
            tracks: description.tracks.clone(),
        });
    }

    fn mark_connected(&self, state: &mut LinkState) {
        if !state.connected {
            state.connected = true;
            info!("Loopback endpoint {} connected", self.endpoint);
            let _ = self.events.send(TransportEvent::Connected);
        }
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), CallError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CallError::InvalidState("transport closed".to_string()));
        }
        state.sending.insert(track.kind(), track.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SignalPayload, CallError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CallError::InvalidState("transport closed".to_string()));
        }
        state.offered = true;
        self.describe(DescriptionType::Offer, &mut state)
    }

    async fn apply_remote(&self, payload: SignalPayload) -> Result<Option<SignalPayload>, CallError> {
        let description: Description = serde_json::from_value(payload.into_inner())
            .map_err(|e| CallError::NegotiationFailed(format!("Malformed description: {}", e)))?;
        if !self.network.is_reachable(&description.endpoint) {
            return Err(CallError::NegotiationFailed(format!(
                "remote endpoint {} unreachable",
                description.endpoint
            )));
        }

        let mut state = self.state.lock();
        if state.closed {
            return Err(CallError::InvalidState("transport closed".to_string()));
        }

        match description.kind {
            DescriptionType::Offer => {
                state.remote = Some(description.endpoint.clone());
                self.announce_remote(&description);
                let answer = self.describe(DescriptionType::Answer, &mut state)?;
                self.mark_connected(&mut state);
                Ok(Some(answer))
            }
            DescriptionType::Answer => {
                if !state.offered {
                    return Err(CallError::NegotiationFailed("answer without an offer".to_string()));
                }
                state.remote = Some(description.endpoint.clone());
                self.announce_remote(&description);
                self.mark_connected(&mut state);

                // Tracks replaced while the offer was in flight
                let stale: Vec<(TrackKind, String)> = state
                    .sending
                    .iter()
                    .filter(|(kind, id)| state.advertised.get(*kind) != Some(*id))
                    .map(|(kind, id)| (*kind, id.clone()))
                    .collect();
                for (kind, id) in stale {
                    self.network.deliver(
                        &description.endpoint,
                        MediaFrame::Track {
                            stream_id: self.stream_id.clone(),
                            track: RemoteTrack { id: id.clone(), kind },
                        },
                    );
                    state.advertised.insert(kind, id);
                }
                let cleared: Vec<TrackKind> = state
                    .advertised
                    .keys()
                    .filter(|kind| !state.sending.contains_key(*kind))
                    .copied()
                    .collect();
                for kind in cleared {
                    self.network.deliver(
                        &description.endpoint,
                        MediaFrame::TrackRemoved {
                            stream_id: self.stream_id.clone(),
                            kind,
                        },
                    );
                    state.advertised.remove(&kind);
                }
                Ok(None)
            }
        }
    }

    async fn replace_track(&self, kind: TrackKind, track: &MediaTrack) -> Result<(), CallError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CallError::InvalidState("transport closed".to_string()));
        }
        if !state.sending.contains_key(&kind) {
            return Err(CallError::NoActiveSender(kind));
        }
        state.sending.insert(kind, track.id().to_string());

        if let (true, Some(remote)) = (state.connected, state.remote.clone()) {
            let delivered = self.network.deliver(
                &remote,
                MediaFrame::Track {
                    stream_id: self.stream_id.clone(),
                    track: RemoteTrack {
                        id: track.id().to_string(),
                        kind,
                    },
                },
            );
            if delivered {
                state.advertised.insert(kind, track.id().to_string());
            } else {
                warn!("Loopback endpoint {} gone, replacement not delivered", remote);
            }
        }
        Ok(())
    }

    async fn clear_track(&self, kind: TrackKind) -> Result<(), CallError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CallError::InvalidState("transport closed".to_string()));
        }
        if state.sending.remove(&kind).is_none() {
            return Err(CallError::NoActiveSender(kind));
        }

        if let (true, Some(remote)) = (state.connected, state.remote.clone()) {
            let frame = MediaFrame::TrackRemoved {
                stream_id: self.stream_id.clone(),
                kind,
            };
            if self.network.deliver(&remote, frame) {
                state.advertised.remove(&kind);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CallError> {
        let remote = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.remote.take()
        };

        self.network.inner.endpoints.lock().remove(&self.endpoint);
        if let Some(remote) = remote {
            self.network.deliver(&remote, MediaFrame::Bye);
        }
        self.pump.abort();
        debug!("Loopback endpoint {} detached", self.endpoint);
        Ok(())
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.network.inner.endpoints.lock().remove(&self.endpoint);
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use std::time::Duration;

    async fn next(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("event stream ended")
    }

    fn video() -> MediaTrack {
        MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam", None, true)
    }

    #[tokio::test]
    async fn offer_answer_connects_both_sides() {
        let network = LoopbackNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = network.create(a_tx).await.unwrap();
        let b = network.create(b_tx).await.unwrap();

        let a_video = video();
        a.add_track(&a_video).await.unwrap();
        b.add_track(&video()).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        let answer = b.apply_remote(offer).await.unwrap().expect("answer");
        assert!(a.apply_remote(answer).await.unwrap().is_none());

        match next(&mut b_rx).await {
            TransportEvent::RemoteStream { tracks, .. } => {
                assert_eq!(tracks.len(), 1);
                assert_eq!(tracks[0].id, a_video.id());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(next(&mut b_rx).await, TransportEvent::Connected);
        assert!(matches!(next(&mut a_rx).await, TransportEvent::RemoteStream { .. }));
        assert_eq!(next(&mut a_rx).await, TransportEvent::Connected);

        let screen = MediaTrack::new(TrackKind::Video, TrackSource::Display, "screen", None, true);
        a.replace_track(TrackKind::Video, &screen).await.unwrap();
        match next(&mut b_rx).await {
            TransportEvent::RemoteTrack { track, .. } => assert_eq!(track.id, screen.id()),
            other => panic!("unexpected {:?}", other),
        }

        a.clear_track(TrackKind::Video).await.unwrap();
        assert!(matches!(
            next(&mut b_rx).await,
            TransportEvent::RemoteTrackRemoved { kind: TrackKind::Video, .. }
        ));
        let err = a.replace_track(TrackKind::Video, &screen).await.unwrap_err();
        assert_eq!(err, CallError::NoActiveSender(TrackKind::Video));

        a.close().await.unwrap();
        assert_eq!(next(&mut b_rx).await, TransportEvent::Closed);
        assert_eq!(network.endpoints(), 1);
    }

    #[tokio::test]
    async fn garbage_description_fails_negotiation() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let t = network.create(tx).await.unwrap();
        let err = t
            .apply_remote(SignalPayload::new(serde_json::json!({"type": "pranswer"})))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::NegotiationFailed(_)));
    }

    #[tokio::test]
    async fn replace_without_sender() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let t = network.create(tx).await.unwrap();
        let err = t.replace_track(TrackKind::Video, &video()).await.unwrap_err();
        assert_eq!(err, CallError::NoActiveSender(TrackKind::Video));
    }
}
