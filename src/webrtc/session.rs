//! Peer Session
//!
//! Owns the single direct media connection to the remote party:
//! - Negotiation start (offer for the initiator, wait for the responder)
//! - Ordered delivery of inbound negotiation payloads
//! - Outbound track replacement without renegotiation
//! - Remote stream assembly and connection state transitions
//!
//! `idle → connecting → connected → closed`, with `errored` reachable from
//! `connecting` or `connected`. An errored session is never restarted; build
//! a new one.

use super::{PeerConnectionState, PeerTransport, RemoteMediaStream, TransportEvent};
use crate::error::CallError;
use crate::media::{LocalMediaStream, MediaTrack, TrackKind};
use crate::transport::{InboundSignal, Role, SignalPayload};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Externally visible change produced by a transport event
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    State(PeerConnectionState),
    RemoteStream(RemoteMediaStream),
}

pub struct PeerSession {
    /// Unique session ID
    id: String,
    state: PeerConnectionState,
    role: Option<Role>,
    transport: Box<dyn PeerTransport>,
    /// Track references currently sent, per kind. Never stopped from here.
    sending: HashMap<TrackKind, MediaTrack>,
    remote: Option<RemoteMediaStream>,
    remote_handler: Option<mpsc::UnboundedSender<RemoteMediaStream>>,
    /// Arrival sequence number of the last accepted signal
    last_seq: u64,
}

impl PeerSession {
    pub fn new(transport: Box<dyn PeerTransport>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: PeerConnectionState::Idle,
            role: None,
            transport,
            sending: HashMap::new(),
            remote: None,
            remote_handler: None,
            last_seq: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> PeerConnectionState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn is_started(&self) -> bool {
        self.role.is_some()
    }

    pub fn remote_stream(&self) -> Option<&RemoteMediaStream> {
        self.remote.as_ref()
    }

    /// The track currently sent for `kind`
    pub fn outbound_track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.sending.get(&kind)
    }

    /// Register the consumer notified whenever the remote stream changes
    pub fn on_remote_stream(&mut self, handler: mpsc::UnboundedSender<RemoteMediaStream>) {
        self.remote_handler = Some(handler);
    }

    /// Begin negotiation. The initiator gets its first negotiation message
    /// back to forward; the responder gets `None` and waits.
    pub async fn start(&mut self, role: Role, local: &LocalMediaStream) -> Result<Option<SignalPayload>, CallError> {
        if self.role.is_some() || self.state != PeerConnectionState::Idle {
            return Err(CallError::InvalidState(format!(
                "session {} already started (state {})",
                self.id, self.state
            )));
        }
        self.role = Some(role);

        for track in local.tracks().filter(|t| t.is_live()) {
            if let Err(e) = self.transport.add_track(track).await {
                return Err(self.fail(e));
            }
            self.sending.insert(track.kind(), track.clone());
        }
        self.set_state(PeerConnectionState::Connecting);
        info!(
            "Session {} started as {} with {} outbound tracks",
            self.id,
            role,
            self.sending.len()
        );

        if !role.is_initiator() {
            return Ok(None);
        }
        match self.transport.create_offer().await {
            Ok(offer) => Ok(Some(offer)),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Feed an inbound negotiation payload. Signals must arrive with strictly
    /// increasing sequence numbers; anything else is rejected untouched.
    pub async fn handle_signal(&mut self, signal: InboundSignal) -> Result<Option<SignalPayload>, CallError> {
        match self.state {
            PeerConnectionState::Idle => {
                return Err(CallError::InvalidState(format!("session {} not started", self.id)));
            }
            PeerConnectionState::Closed | PeerConnectionState::Errored => {
                return Err(CallError::InvalidState(format!(
                    "session {} is {}",
                    self.id, self.state
                )));
            }
            PeerConnectionState::Connecting | PeerConnectionState::Connected => {}
        }

        if signal.seq <= self.last_seq {
            warn!(
                "Session {} rejected signal #{} (last accepted #{})",
                self.id, signal.seq, self.last_seq
            );
            return Err(CallError::InvalidState(format!(
                "signal #{} delivered out of order after #{}",
                signal.seq, self.last_seq
            )));
        }
        self.last_seq = signal.seq;

        debug!("Session {} applying signal #{}", self.id, signal.seq);
        match self.transport.apply_remote(signal.payload).await {
            Ok(reply) => Ok(reply),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Swap the outbound track of `kind` without renegotiating
    pub async fn replace_outbound_track(&mut self, kind: TrackKind, track: &MediaTrack) -> Result<(), CallError> {
        if self.role.is_none() || self.state.is_finished() {
            return Err(CallError::InvalidState(format!(
                "cannot replace {} track on session {} in state {}",
                kind, self.id, self.state
            )));
        }
        if !self.sending.contains_key(&kind) {
            return Err(CallError::NoActiveSender(kind));
        }

        self.transport.replace_track(kind, track).await?;
        info!("Session {} now sending {} track {}", self.id, kind, track.id());
        self.sending.insert(kind, track.clone());
        Ok(())
    }

    /// Apply a transport event. Events reaching a finished session are stale
    /// and dropped.
    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Option<SessionUpdate> {
        if self.state.is_finished() {
            debug!("Session {} ignoring {:?} in state {}", self.id, event, self.state);
            return None;
        }

        match event {
            TransportEvent::Connected => {
                if self.state != PeerConnectionState::Connecting {
                    return None;
                }
                self.set_state(PeerConnectionState::Connected);
                info!("Session {} connected", self.id);
                Some(SessionUpdate::State(PeerConnectionState::Connected))
            }
            TransportEvent::Failed(reason) => {
                error!("Session {} transport failed: {}", self.id, reason);
                self.set_state(PeerConnectionState::Errored);
                self.remote = None;
                Some(SessionUpdate::State(PeerConnectionState::Errored))
            }
            TransportEvent::Closed => {
                info!("Session {} closed by remote", self.id);
                self.set_state(PeerConnectionState::Closed);
                self.remote = None;
                Some(SessionUpdate::State(PeerConnectionState::Closed))
            }
            TransportEvent::RemoteStream { stream_id, tracks } => {
                // a description replaces the remote stream wholesale
                let next = tracks
                    .into_iter()
                    .fold(RemoteMediaStream::new(stream_id), |stream, track| stream.with_track(track));
                self.publish_remote(next)
            }
            TransportEvent::RemoteTrack { stream_id, track } => {
                let next = match &self.remote {
                    Some(current) if current.id == stream_id => current.with_track(track),
                    _ => RemoteMediaStream::new(stream_id).with_track(track),
                };
                self.publish_remote(next)
            }
            TransportEvent::RemoteTrackRemoved { stream_id, kind } => {
                let next = match &self.remote {
                    Some(current) if current.id == stream_id => current.without(kind),
                    _ => return None,
                };
                self.publish_remote(next)
            }
        }
    }

    fn publish_remote(&mut self, next: RemoteMediaStream) -> Option<SessionUpdate> {
        if self.remote.as_ref() == Some(&next) {
            return None;
        }
        debug!("Session {} remote stream {} updated", self.id, next.id);
        self.remote = Some(next.clone());
        if let Some(handler) = &self.remote_handler {
            let _ = handler.send(next.clone());
        }
        Some(SessionUpdate::RemoteStream(next))
    }

    /// Stop sending `kind` altogether, e.g. when the track it carried was
    /// released and nothing replaces it
    pub async fn clear_outbound_track(&mut self, kind: TrackKind) -> Result<(), CallError> {
        if self.role.is_none() || self.state.is_finished() {
            return Err(CallError::InvalidState(format!(
                "cannot clear {} track on session {} in state {}",
                kind, self.id, self.state
            )));
        }
        if !self.sending.contains_key(&kind) {
            return Err(CallError::NoActiveSender(kind));
        }

        self.transport.clear_track(kind).await?;
        info!("Session {} stopped sending {}", self.id, kind);
        self.sending.remove(&kind);
        Ok(())
    }

    /// Terminate the connection. Idempotent; always ends in `closed`.
    pub async fn close(&mut self) {
        if self.state == PeerConnectionState::Closed {
            return;
        }
        if let Err(e) = self.transport.close().await {
            warn!("Session {} transport close failed: {}", self.id, e);
        }
        self.set_state(PeerConnectionState::Closed);
        self.remote = None;
        self.sending.clear();
        info!("Session {} closed", self.id);
    }

    fn set_state(&mut self, state: PeerConnectionState) {
        if self.state != state {
            debug!("Session {} state change: {} -> {}", self.id, self.state, state);
            self.state = state;
        }
    }

    fn fail(&mut self, err: CallError) -> CallError {
        self.set_state(PeerConnectionState::Errored);
        self.remote = None;
        error!("Session {} negotiation failed: {}", self.id, err);
        match err {
            CallError::NegotiationFailed(_) => err,
            other => CallError::NegotiationFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaConstraints, MediaSourceManager, SyntheticDevices};
    use crate::webrtc::{LoopbackNetwork, PeerTransportFactory, RemoteTrack};
    use serde_json::json;
    use std::sync::Arc;

    async fn camera() -> LocalMediaStream {
        let manager = MediaSourceManager::new(Arc::new(SyntheticDevices::new()));
        manager.acquire(&MediaConstraints::default()).await.unwrap()
    }

    async fn session(network: &LoopbackNetwork) -> (PeerSession, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerSession::new(network.create(tx).await.unwrap()), rx)
    }

    async fn pump(session: &mut PeerSession, rx: &mut mpsc::UnboundedReceiver<TransportEvent>) {
        while let Ok(event) = rx.try_recv() {
            session.handle_transport_event(event);
        }
    }

    fn signal(seq: u64, payload: SignalPayload) -> InboundSignal {
        InboundSignal { seq, payload }
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let network = LoopbackNetwork::new();
        let (mut s, _rx) = session(&network).await;
        let local = camera().await;

        assert!(s.start(Role::Initiator, &local).await.unwrap().is_some());
        assert_eq!(s.state(), PeerConnectionState::Connecting);
        let err = s.start(Role::Initiator, &local).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState(_)));
    }

    #[tokio::test]
    async fn responder_waits_for_offer() {
        let network = LoopbackNetwork::new();
        let (mut s, _rx) = session(&network).await;
        assert!(s.start(Role::Responder, &camera().await).await.unwrap().is_none());
        assert_eq!(s.state(), PeerConnectionState::Connecting);
    }

    #[tokio::test]
    async fn close_twice_is_harmless() {
        let network = LoopbackNetwork::new();
        let (mut s, _rx) = session(&network).await;
        s.start(Role::Initiator, &camera().await).await.unwrap();
        s.close().await;
        s.close().await;
        assert_eq!(s.state(), PeerConnectionState::Closed);
        assert!(s.remote_stream().is_none());
    }

    #[tokio::test]
    async fn negotiation_connects_and_assembles_remote_stream() {
        let network = LoopbackNetwork::new();
        let (mut a, mut a_rx) = session(&network).await;
        let (mut b, mut b_rx) = session(&network).await;
        let a_local = camera().await;
        let b_local = camera().await;

        let (remote_tx, mut remote_rx) = mpsc::unbounded_channel();
        b.on_remote_stream(remote_tx);

        let offer = a.start(Role::Initiator, &a_local).await.unwrap().unwrap();
        assert!(b.start(Role::Responder, &b_local).await.unwrap().is_none());
        let answer = b.handle_signal(signal(1, offer)).await.unwrap().unwrap();
        assert!(a.handle_signal(signal(1, answer)).await.unwrap().is_none());

        pump(&mut a, &mut a_rx).await;
        pump(&mut b, &mut b_rx).await;
        assert_eq!(a.state(), PeerConnectionState::Connected);
        assert_eq!(b.state(), PeerConnectionState::Connected);

        let remote = b.remote_stream().unwrap().clone();
        assert_eq!(remote.video.as_ref().unwrap().id, a_local.video_track().unwrap().id());
        assert_eq!(remote.audio.as_ref().unwrap().id, a_local.audio_track().unwrap().id());

        let mut notified = Vec::new();
        while let Ok(stream) = remote_rx.try_recv() {
            notified.push(stream);
        }
        assert_eq!(notified, vec![remote]);
    }

    #[tokio::test]
    async fn transport_failure_drops_the_remote_stream() {
        let network = LoopbackNetwork::new();
        let (mut a, _a_rx) = session(&network).await;
        let (mut b, mut b_rx) = session(&network).await;

        let offer = a.start(Role::Initiator, &camera().await).await.unwrap().unwrap();
        b.start(Role::Responder, &camera().await).await.unwrap();
        b.handle_signal(signal(1, offer)).await.unwrap();
        pump(&mut b, &mut b_rx).await;
        assert!(b.remote_stream().is_some());

        let update = b.handle_transport_event(TransportEvent::Failed("link down".to_string()));
        assert_eq!(update, Some(SessionUpdate::State(PeerConnectionState::Errored)));
        assert!(b.remote_stream().is_none());
    }

    #[tokio::test]
    async fn replaced_track_notifies_once_more() {
        let network = LoopbackNetwork::new();
        let (mut s, _rx) = session(&network).await;
        s.start(Role::Responder, &camera().await).await.unwrap();
        let (remote_tx, mut remote_rx) = mpsc::unbounded_channel();
        s.on_remote_stream(remote_tx);

        let tracks = vec![
            RemoteTrack {
                id: "mic".to_string(),
                kind: TrackKind::Audio,
            },
            RemoteTrack {
                id: "cam".to_string(),
                kind: TrackKind::Video,
            },
        ];
        s.handle_transport_event(TransportEvent::RemoteStream {
            stream_id: "s1".to_string(),
            tracks: tracks.clone(),
        });
        // the same description again changes nothing
        assert!(s
            .handle_transport_event(TransportEvent::RemoteStream {
                stream_id: "s1".to_string(),
                tracks,
            })
            .is_none());
        s.handle_transport_event(TransportEvent::RemoteTrack {
            stream_id: "s1".to_string(),
            track: RemoteTrack {
                id: "screen".to_string(),
                kind: TrackKind::Video,
            },
        });

        let first = remote_rx.try_recv().unwrap();
        assert_eq!(first.audio.as_ref().unwrap().id, "mic");
        assert_eq!(first.video.as_ref().unwrap().id, "cam");
        let second = remote_rx.try_recv().unwrap();
        assert_eq!(second.audio.as_ref().unwrap().id, "mic");
        assert_eq!(second.video.as_ref().unwrap().id, "screen");
        assert!(remote_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn out_of_order_signal_is_rejected() {
        let network = LoopbackNetwork::new();
        let (mut a, _a_rx) = session(&network).await;
        let (mut b, _b_rx) = session(&network).await;

        let offer = a.start(Role::Initiator, &camera().await).await.unwrap().unwrap();
        b.start(Role::Responder, &camera().await).await.unwrap();
        b.handle_signal(signal(2, offer.clone())).await.unwrap();

        let err = b.handle_signal(signal(1, offer.clone())).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState(_)));
        let err = b.handle_signal(signal(2, offer)).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState(_)));
        assert_ne!(b.state(), PeerConnectionState::Errored, "rejection leaves the session intact");
    }

    #[tokio::test]
    async fn corrupt_payload_errors_the_session_for_good() {
        let network = LoopbackNetwork::new();
        let (mut s, _rx) = session(&network).await;
        s.start(Role::Responder, &camera().await).await.unwrap();

        let err = s
            .handle_signal(signal(1, SignalPayload::new(json!("not a description"))))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::NegotiationFailed(_)));
        assert_eq!(s.state(), PeerConnectionState::Errored);

        let late = TransportEvent::Connected;
        assert!(s.handle_transport_event(late).is_none());
        assert_eq!(s.state(), PeerConnectionState::Errored);
        assert!(s.handle_signal(signal(2, SignalPayload::new(json!({})))).await.is_err());

        s.close().await;
        assert_eq!(s.state(), PeerConnectionState::Closed);
    }

    #[tokio::test]
    async fn replace_requires_an_active_sender() {
        let network = LoopbackNetwork::new();
        let (mut s, _rx) = session(&network).await;
        let manager = MediaSourceManager::new(Arc::new(SyntheticDevices::new()));
        let audio_only = manager
            .acquire(&MediaConstraints {
                video_enabled: false,
                ..Default::default()
            })
            .await
            .unwrap();
        // video track exists but is muted; drop it to model "never sent"
        let audio_only = LocalMediaStream::new(audio_only.audio_track().cloned(), None);
        s.start(Role::Initiator, &audio_only).await.unwrap();

        let screen = manager.acquire_display_capture().await.unwrap();
        let err = s
            .replace_outbound_track(TrackKind::Video, screen.video_track().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err, CallError::NoActiveSender(TrackKind::Video));
    }

    #[test]
    fn remote_track_replacement_changes_identity() {
        let stream = RemoteMediaStream::new("s1").with_track(RemoteTrack {
            id: "cam".to_string(),
            kind: TrackKind::Video,
        });
        let next = stream.with_track(RemoteTrack {
            id: "screen".to_string(),
            kind: TrackKind::Video,
        });
        assert_ne!(stream, next);
        assert_eq!(next.id, "s1");
    }
}
