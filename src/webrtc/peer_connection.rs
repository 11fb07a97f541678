//! WebRTC PeerConnection management
//!
//! Handles the creation and lifecycle of RTCPeerConnection instances and
//! exposes each one as a `PeerTransport`. Negotiation is non-trickle: every
//! description is sent once ICE gathering has completed, serialized as the
//! standard `{type, sdp}` object.

use super::{PeerTransport, PeerTransportFactory, RemoteTrack, TransportEvent};
use crate::config::WebRTCConfig;
use crate::error::CallError;
use crate::media::{MediaTrack, TrackKind};
use crate::transport::SignalPayload;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// PeerConnection factory for call sessions
pub struct PeerConnectionManager {
    config: WebRTCConfig,
}

impl PeerConnectionManager {
    /// Create a new PeerConnection manager
    pub fn new(config: WebRTCConfig) -> Self {
        Self { config }
    }

    /// Create a new PeerConnection with the configured ICE servers
    pub async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, CallError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to register codecs: {}", e)))?;

        // Interceptor registry for RTCP feedback
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = self
            .config
            .ice_servers()
            .into_iter()
            .map(|server| RTCIceServer {
                urls: server.urls,
                username: server.username.unwrap_or_default(),
                credential: server.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }
}

#[async_trait]
impl PeerTransportFactory for PeerConnectionManager {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, CallError> {
        let pc = self.create_peer_connection().await?;

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("PeerConnection state: {}", state);
            let event = match state {
                RTCPeerConnectionState::Connected => Some(TransportEvent::Connected),
                RTCPeerConnectionState::Failed => Some(TransportEvent::Failed("ICE connection failed".to_string())),
                RTCPeerConnectionState::Closed => Some(TransportEvent::Closed),
                _ => None,
            };
            if let Some(event) = event {
                let _ = state_events.send(event);
            }
            Box::pin(async {})
        }));

        let assembly = Arc::new(Mutex::new(RemoteAssembly::default()));
        let track_assembly = assembly.clone();
        let track_events = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };
            if let Some(kind) = kind {
                info!("Remote {} track {} on stream {}", kind, track.id(), track.stream_id());
                let remote = RemoteTrack { id: track.id(), kind };
                if let Some(event) = track_assembly.lock().push(track.stream_id(), remote) {
                    let _ = track_events.send(event);
                }
            }
            Box::pin(async {})
        }));

        Ok(Box::new(WebRtcTransport {
            pc,
            stream_id: format!("call-{}", uuid::Uuid::new_v4()),
            senders: Mutex::new(HashMap::new()),
            assembly,
        }))
    }
}

/// Collects the tracks announced by one remote description so they surface
/// as a single stream
#[derive(Debug, Default)]
struct RemoteAssembly {
    expected: usize,
    pending: Vec<RemoteTrack>,
}

impl RemoteAssembly {
    fn expect(&mut self, tracks: usize) {
        self.expected = tracks;
        self.pending.clear();
    }

    fn push(&mut self, stream_id: String, track: RemoteTrack) -> Option<TransportEvent> {
        if self.pending.len() >= self.expected {
            return Some(TransportEvent::RemoteTrack { stream_id, track });
        }
        self.pending.push(track);
        if self.pending.len() < self.expected {
            return None;
        }
        self.expected = 0;
        Some(TransportEvent::RemoteStream {
            stream_id,
            tracks: std::mem::take(&mut self.pending),
        })
    }
}

/// Number of audio/video sections in `sdp` the remote side sends on
fn sending_sections(sdp: &str) -> usize {
    let mut count = 0;
    let mut current: Option<bool> = None;
    for line in sdp.lines().map(str::trim_end) {
        if let Some(media) = line.strip_prefix("m=") {
            if current == Some(true) {
                count += 1;
            }
            let mut fields = media.split_whitespace();
            let kind = fields.next();
            let port = fields.next();
            current = match kind {
                Some("audio") | Some("video") => Some(port != Some("0")),
                _ => None,
            };
        } else if let Some(sends) = current.as_mut() {
            if line == "a=recvonly" || line == "a=inactive" {
                *sends = false;
            }
        }
    }
    if current == Some(true) {
        count += 1;
    }
    count
}

/// One RTCPeerConnection behind the `PeerTransport` seam
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    /// Stream label shared by every outbound track
    stream_id: String,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
    assembly: Arc<Mutex<RemoteAssembly>>,
}

impl WebRtcTransport {
    fn local_track(&self, track: &MediaTrack) -> Arc<TrackLocalStaticSample> {
        let capability = match track.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id().to_string(),
            self.stream_id.clone(),
        ))
    }

    /// Set the local description and wait for ICE gathering to finish
    async fn set_local_and_gather(&self, description: RTCSessionDescription) -> Result<SignalPayload, CallError> {
        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to set local description: {}", e)))?;
        let _ = gather_complete.recv().await;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| CallError::NegotiationFailed("local description missing".to_string()))?;
        serde_json::to_value(&local)
            .map(SignalPayload::new)
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to encode description: {}", e)))
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), CallError> {
        let local = self.local_track(track);
        let sender = self
            .pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to add {} track: {}", track.kind(), e)))?;

        // RTCP must be drained for interceptors to work
        let rtcp_sender = sender.clone();
        tokio::spawn(async move { while rtcp_sender.read_rtcp().await.is_ok() {} });

        self.senders.lock().insert(track.kind(), sender);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SignalPayload, CallError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to create offer: {}", e)))?;
        self.set_local_and_gather(offer).await
    }

    async fn apply_remote(&self, payload: SignalPayload) -> Result<Option<SignalPayload>, CallError> {
        let description: RTCSessionDescription = serde_json::from_value(payload.into_inner())
            .map_err(|e| CallError::NegotiationFailed(format!("Invalid session description: {}", e)))?;
        let is_offer = description.sdp_type == RTCSdpType::Offer;
        self.assembly.lock().expect(sending_sections(&description.sdp));

        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to set remote description: {}", e)))?;

        if !is_offer {
            return Ok(None);
        }
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to create answer: {}", e)))?;
        self.set_local_and_gather(answer).await.map(Some)
    }

    async fn replace_track(&self, kind: TrackKind, track: &MediaTrack) -> Result<(), CallError> {
        let sender = self
            .senders
            .lock()
            .get(&kind)
            .cloned()
            .ok_or(CallError::NoActiveSender(kind))?;
        let local = self.local_track(track);
        sender
            .replace_track(Some(local as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to replace {} track: {}", kind, e)))
    }

    async fn clear_track(&self, kind: TrackKind) -> Result<(), CallError> {
        let sender = self
            .senders
            .lock()
            .get(&kind)
            .cloned()
            .ok_or(CallError::NoActiveSender(kind))?;
        sender
            .replace_track(None)
            .await
            .map_err(|e| CallError::NegotiationFailed(format!("Failed to clear {} track: {}", kind, e)))
    }

    async fn close(&self) -> Result<(), CallError> {
        self.senders.lock().clear();
        self.pc.close().await.map_err(|e| {
            warn!("Failed to close peer connection: {}", e);
            CallError::NegotiationFailed(format!("Failed to close connection: {}", e))
        })
    }
}
