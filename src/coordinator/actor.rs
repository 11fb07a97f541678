//! The per-call event loop

use super::{CallDeps, CallEvent, CallState, Command, Reply};
use crate::config::MediaPreferences;
use crate::error::CallError;
use crate::media::{LocalMediaStream, MediaSourceManager, MediaTrack, RoomClaim, TrackKind};
use crate::transport::{InboundSignal, Role, SignalingClient, SignalingEvent};
use crate::webrtc::{
    PeerConnectionState, PeerSession, PeerTransportFactory, RemoteMediaStream, SessionUpdate, TransportEvent,
};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{broadcast, mpsc, watch};

/// Results of work running outside the loop, tagged with the token that was
/// current when the work started
enum Internal {
    Camera {
        token: u64,
        result: Result<LocalMediaStream, CallError>,
        reply: Option<Reply<()>>,
    },
    Capture {
        token: u64,
        result: Result<LocalMediaStream, CallError>,
    },
    CaptureEnded {
        token: u64,
    },
}

/// At most one share exists; leaving `Starting`/`Active` clears it exactly once
enum ShareState {
    Idle,
    Starting {
        token: u64,
        saved: Option<LocalMediaStream>,
        reply: Option<Reply<()>>,
    },
    Active {
        token: u64,
        capture: LocalMediaStream,
        saved: Option<LocalMediaStream>,
    },
}

pub(super) struct CallActor {
    room_id: String,
    room: Option<RoomClaim>,
    media: MediaSourceManager,
    transports: Arc<dyn PeerTransportFactory>,
    prefs: MediaPreferences,
    client: SignalingClient,
    state: watch::Sender<CallState>,
    events: broadcast::Sender<CallEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,

    role: Option<Role>,
    peer_present: bool,
    /// Stream attached (or to be attached) to the Peer Session
    local: Option<LocalMediaStream>,
    share: ShareState,
    session: Option<PeerSession>,
    transport_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    /// Signals that arrived while no live session could take them
    pending_signals: VecDeque<InboundSignal>,
    next_token: u64,
    /// Token of the camera acquisition whose result will be used
    camera_token: Option<u64>,
    left: bool,
}

impl CallActor {
    pub(super) fn new(
        deps: CallDeps,
        room: RoomClaim,
        client: SignalingClient,
        state: watch::Sender<CallState>,
        events: broadcast::Sender<CallEvent>,
    ) -> Self {
        let room_id = state.borrow().room_id.clone();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            room_id,
            room: Some(room),
            media: deps.media,
            transports: deps.transports,
            prefs: deps.preferences,
            client,
            state,
            events,
            internal_tx,
            internal_rx,
            role: None,
            peer_present: false,
            local: None,
            share: ShareState::Idle,
            session: None,
            transport_rx: None,
            pending_signals: VecDeque::new(),
            next_token: 0,
            camera_token: None,
            left: false,
        }
    }

    pub(super) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<SignalingEvent>,
    ) {
        while !self.left {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.teardown().await,
                },
                Some(event) = signals.recv() => self.handle_signaling(event).await,
                Some(event) = recv_transport(&mut self.transport_rx) => self.handle_transport(event),
                Some(event) = self.internal_rx.recv() => self.handle_internal(event).await,
            }
        }

        // Late acquisitions must not leak: stop accepting, then release
        // whatever already made it into the queue.
        self.internal_rx.close();
        while let Ok(event) = self.internal_rx.try_recv() {
            self.discard(event);
        }
        info!("Call in room {} finished", self.room_id);
    }

    async fn handle_command(&mut self, command: Command) {
        if self.left {
            match command {
                Command::Leave(reply) => {
                    let _ = reply.send(Ok(()));
                }
                Command::Toggle(_, reply) => {
                    let _ = reply.send(ended());
                }
                Command::StartScreenShare(reply)
                | Command::StopScreenShare(reply)
                | Command::SelectDevice(_, _, reply)
                | Command::Retry(reply) => {
                    let _ = reply.send(ended());
                }
            }
            return;
        }

        match command {
            Command::Toggle(kind, reply) => {
                let enabled = self.toggle(kind);
                let _ = reply.send(Ok(enabled));
            }
            Command::StartScreenShare(reply) => self.start_share(reply),
            Command::StopScreenShare(reply) => {
                let result = self.stop_share().await;
                let _ = reply.send(result);
            }
            Command::SelectDevice(kind, device_id, reply) => {
                info!("Room {}: switching {} device to {}", self.room_id, kind, device_id);
                self.prefs.set_device(kind, Some(device_id));
                self.acquire_camera(Some(reply));
            }
            Command::Retry(reply) => {
                if self.local.is_none() && self.camera_token.is_none() {
                    info!("Room {}: retrying local media acquisition", self.room_id);
                    self.acquire_camera(Some(reply));
                    return;
                }
                let result = self.retry().await;
                let _ = reply.send(result);
            }
            Command::Leave(reply) => {
                self.teardown().await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn toggle(&mut self, kind: TrackKind) -> bool {
        let enabled = !self.prefs.enabled(kind);
        self.prefs.set_enabled(kind, enabled);
        if let Some(local) = &self.local {
            self.media.set_track_enabled(local, kind, enabled);
        }
        self.state.send_modify(|s| match kind {
            TrackKind::Audio => s.audio_enabled = enabled,
            TrackKind::Video => s.video_enabled = enabled,
        });
        self.emit(CallEvent::TrackEnabled { kind, enabled });
        enabled
    }

    fn start_share(&mut self, reply: Reply<()>) {
        if !matches!(self.share, ShareState::Idle) {
            debug!("Room {}: already sharing", self.room_id);
            let _ = reply.send(Ok(()));
            return;
        }

        let token = self.token();
        self.share = ShareState::Starting {
            token,
            saved: self.local.clone(),
            reply: Some(reply),
        };
        info!("Room {}: requesting display capture", self.room_id);

        let media = self.media.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = media.acquire_display_capture().await;
            if let Err(SendError(Internal::Capture { result: Ok(capture), .. })) =
                tx.send(Internal::Capture { token, result })
            {
                media.release(&capture);
            }
        });
    }

    async fn stop_share(&mut self) -> Result<(), CallError> {
        match mem::replace(&mut self.share, ShareState::Idle) {
            ShareState::Idle => Ok(()),
            ShareState::Starting { reply, .. } => {
                // the capture result will arrive stale and be released
                info!("Room {}: screen share cancelled before capture started", self.room_id);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(CallError::InvalidState("screen share cancelled".to_string())));
                }
                Ok(())
            }
            ShareState::Active { capture, saved, .. } => {
                self.media.release(&capture);
                let result = match saved {
                    Some(camera) if camera.has_live_tracks() => self.restore_camera(camera).await,
                    saved => {
                        info!("Room {}: saved camera stream gone, acquiring a new one", self.room_id);
                        if let Some(dead) = saved {
                            self.media.release(&dead);
                        }
                        self.local = None;
                        self.publish_local();
                        self.acquire_camera(None);
                        Ok(())
                    }
                };
                self.set_sharing(false);
                result
            }
        }
    }

    async fn restore_camera(&mut self, camera: LocalMediaStream) -> Result<(), CallError> {
        self.apply_preferences(&camera);
        let result = match camera.video_track() {
            Some(video) => self.replace_outbound(TrackKind::Video, video).await,
            // the released capture must not stay on air
            None => self.clear_outbound(TrackKind::Video).await,
        };
        info!("Room {}: camera stream {} restored", self.room_id, camera.id());
        self.local = Some(camera);
        self.publish_local();
        result
    }

    async fn retry(&mut self) -> Result<(), CallError> {
        if self.local.is_none() {
            return Err(CallError::InvalidState("local media acquisition in progress".to_string()));
        }

        if let Some(session) = &self.session {
            if !session.state().is_finished() {
                return Err(CallError::InvalidState(format!(
                    "session {} is still {}",
                    session.id(),
                    session.state()
                )));
            }
        }
        if self.role.is_none() || !self.peer_present {
            return Err(CallError::InvalidState("no remote participant to reconnect to".to_string()));
        }

        if let Some(mut stale) = self.session.take() {
            info!("Room {}: replacing session {}", self.room_id, stale.id());
            stale.close().await;
        }
        self.transport_rx = None;
        self.start_session().await
    }

    async fn handle_signaling(&mut self, event: SignalingEvent) {
        if self.left {
            return;
        }
        match event {
            SignalingEvent::RoomJoined(role) => {
                if self.session_is_live() {
                    warn!("Room {}: ignoring role {} while a session is live", self.room_id, role);
                    return;
                }
                info!("Room {}: joined as {}", self.room_id, role);
                self.role = Some(role);
                self.state.send_modify(|s| s.role = Some(role));
                self.emit(CallEvent::RoleAssigned(role));

                if self.local.is_none() && self.camera_token.is_none() {
                    self.acquire_camera(None);
                }
                self.maybe_start_session().await;
            }
            SignalingEvent::PeerPresent => {
                info!("Room {}: remote participant present", self.room_id);
                self.peer_present = true;
                self.state.send_modify(|s| s.peer_present = true);
                self.emit(CallEvent::PeerPresent);
                self.maybe_start_session().await;
            }
            SignalingEvent::Signal(signal) => {
                if self.session_is_live() {
                    self.feed_signal(signal).await;
                } else {
                    debug!("Room {}: buffering signal #{}", self.room_id, signal.seq);
                    self.pending_signals.push_back(signal);
                }
            }
            SignalingEvent::PeerLeft => {
                info!("Room {}: remote participant left", self.room_id);
                self.peer_present = false;
                self.pending_signals.clear();
                if let Some(mut session) = self.session.take() {
                    session.close().await;
                }
                self.transport_rx = None;
                self.state.send_modify(|s| s.peer_present = false);
                self.emit(CallEvent::PeerLeft);
                self.set_connection(PeerConnectionState::Closed);
                self.set_remote(None);
            }
            SignalingEvent::RelayError(message) => {
                self.report(CallError::ChannelUnavailable(format!("relay error: {}", message)));
            }
            SignalingEvent::Disconnected => {
                self.report(CallError::ChannelUnavailable("signaling channel dropped".to_string()));
            }
        }
    }

    async fn feed_signal(&mut self, signal: InboundSignal) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let result = session.handle_signal(signal).await;
        let state = session.state();
        match result {
            Ok(Some(reply)) => {
                if let Err(e) = self.client.send(reply) {
                    self.report(e);
                }
            }
            Ok(None) => {}
            Err(e) => self.report(e),
        }
        if state.is_finished() {
            self.set_remote(None);
        }
        self.set_connection(state);
    }

    fn session_is_live(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.is_started() && !s.state().is_finished())
            .unwrap_or(false)
    }

    async fn maybe_start_session(&mut self) {
        if self.left || self.session.is_some() || !self.peer_present || self.role.is_none() || self.local.is_none() {
            return;
        }
        if let Err(e) = self.start_session().await {
            debug!("Room {}: session start failed: {}", self.room_id, e);
        }
    }

    async fn start_session(&mut self) -> Result<(), CallError> {
        let (Some(role), Some(local)) = (self.role, self.local.clone()) else {
            return Err(CallError::InvalidState("role or local stream missing".to_string()));
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = match self.transports.create(events_tx).await {
            Ok(transport) => transport,
            Err(e) => {
                self.report(e.clone());
                return Err(e);
            }
        };
        let mut session = PeerSession::new(transport);
        info!("Room {}: starting session {} as {}", self.room_id, session.id(), role);

        let started = session.start(role, &local).await;
        let state = session.state();
        self.session = Some(session);
        self.transport_rx = Some(events_rx);
        self.set_connection(state);

        match started {
            Ok(Some(offer)) => {
                if let Err(e) = self.client.send(offer) {
                    self.report(e.clone());
                    return Err(e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.report(e.clone());
                return Err(e);
            }
        }

        while let Some(signal) = self.pending_signals.pop_front() {
            if !self.session_is_live() {
                self.pending_signals.push_front(signal);
                break;
            }
            self.feed_signal(signal).await;
        }
        Ok(())
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.handle_transport_event(event) {
            Some(SessionUpdate::State(state)) => {
                if state == PeerConnectionState::Errored {
                    self.report(CallError::NegotiationFailed("peer connection failed".to_string()));
                }
                if state.is_finished() {
                    self.set_remote(None);
                }
                self.set_connection(state);
            }
            Some(SessionUpdate::RemoteStream(remote)) => self.set_remote(Some(remote)),
            None => {}
        }
    }

    /// Swap an outbound track if a live session is sending that kind
    async fn replace_outbound(&mut self, kind: TrackKind, track: &MediaTrack) -> Result<(), CallError> {
        if !self.session_is_live() {
            return Ok(());
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        match session.replace_outbound_track(kind, track).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Room {}: {} track replacement failed: {}", self.room_id, kind, e);
                Err(e)
            }
        }
    }

    fn acquire_camera(&mut self, reply: Option<Reply<()>>) {
        let token = self.token();
        self.camera_token = Some(token);
        let media = self.media.clone();
        let constraints = self.prefs.constraints();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = media.acquire(&constraints).await;
            if let Err(SendError(Internal::Camera { result: Ok(stream), reply, .. })) =
                tx.send(Internal::Camera { token, result, reply })
            {
                media.release(&stream);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(CallError::InvalidState("call has ended".to_string())));
                }
            }
        });
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Camera { token, result, reply } => {
                if self.left || self.camera_token != Some(token) {
                    warn!("Room {}: discarding stale camera result", self.room_id);
                    self.discard(Internal::Camera { token, result, reply });
                    return;
                }
                self.camera_token = None;
                match result {
                    Ok(stream) => {
                        self.install_camera(stream).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(Ok(()));
                        }
                    }
                    Err(e) => {
                        self.report(e.clone());
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
            }
            Internal::Capture { token, result } => {
                let current = matches!(&self.share, ShareState::Starting { token: t, .. } if *t == token);
                if self.left || !current {
                    warn!("Room {}: discarding stale capture result", self.room_id);
                    self.discard(Internal::Capture { token, result });
                    return;
                }
                let ShareState::Starting { saved, reply, .. } = mem::replace(&mut self.share, ShareState::Idle) else {
                    return;
                };
                let outcome = match result {
                    Ok(capture) => self.activate_share(token, capture, saved).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = &outcome {
                    self.report(e.clone());
                }
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            Internal::CaptureEnded { token } => {
                if matches!(&self.share, ShareState::Active { token: t, .. } if *t == token) {
                    info!("Room {}: screen capture ended by the user", self.room_id);
                    if let Err(e) = self.stop_share().await {
                        self.report(e);
                    }
                }
            }
        }
    }

    /// Put a fresh capture on air. On failure the capture is released and
    /// the camera stays attached.
    async fn activate_share(
        &mut self,
        token: u64,
        capture: LocalMediaStream,
        saved: Option<LocalMediaStream>,
    ) -> Result<(), CallError> {
        let Some(video) = capture.video_track().cloned() else {
            self.media.release(&capture);
            return Err(CallError::CaptureUnavailable("capture has no video track".to_string()));
        };

        if let Err(e) = self.replace_outbound(TrackKind::Video, &video).await {
            self.media.release(&capture);
            return Err(e);
        }

        let audio = saved.as_ref().and_then(|s| s.audio_track().cloned());
        let view = LocalMediaStream::with_id(capture.id().to_string(), audio, Some(video.clone()));
        info!("Room {}: sharing screen via {}", self.room_id, capture.id());
        self.share = ShareState::Active { token, capture, saved };
        self.local = Some(view);
        self.publish_local();
        self.set_sharing(true);

        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            video.ended().await;
            let _ = tx.send(Internal::CaptureEnded { token });
        });
        Ok(())
    }

    /// Stop sending `kind` if a live session is sending it
    async fn clear_outbound(&mut self, kind: TrackKind) -> Result<(), CallError> {
        if !self.session_is_live() {
            return Ok(());
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if session.outbound_track(kind).is_none() {
            return Ok(());
        }
        match session.clear_outbound_track(kind).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Room {}: clearing {} track failed: {}", self.room_id, kind, e);
                Err(e)
            }
        }
    }

    async fn install_camera(&mut self, stream: LocalMediaStream) {
        self.apply_preferences(&stream);

        // While sharing only the microphone goes out; the camera waits
        if let ShareState::Active { capture, saved, .. } = &mut self.share {
            let old = saved.replace(stream.clone());
            let view = LocalMediaStream::with_id(
                capture.id().to_string(),
                stream.audio_track().cloned(),
                capture.video_track().cloned(),
            );
            if let Some(old) = old {
                self.media.release(&old);
            }
            self.local = Some(view);
            if let Some(audio) = stream.audio_track() {
                if let Err(e) = self.replace_outbound(TrackKind::Audio, audio).await {
                    self.report(e);
                }
            }
            self.publish_local();
            return;
        }

        if let ShareState::Starting { saved, .. } = &mut self.share {
            *saved = Some(stream.clone());
        }
        for kind in [TrackKind::Audio, TrackKind::Video] {
            let outcome = match stream.track(kind) {
                Some(track) => self.replace_outbound(kind, track).await,
                None => self.clear_outbound(kind).await,
            };
            match outcome {
                Ok(()) | Err(CallError::NoActiveSender(_)) => {}
                Err(e) => self.report(e),
            }
        }
        if let Some(old) = self.local.replace(stream.clone()) {
            if old.id() != stream.id() {
                self.media.release(&old);
            }
        }
        self.publish_local();
        self.maybe_start_session().await;
    }

    fn apply_preferences(&self, stream: &LocalMediaStream) {
        for kind in [TrackKind::Audio, TrackKind::Video] {
            self.media.set_track_enabled(stream, kind, self.prefs.enabled(kind));
        }
    }

    /// Release whatever a result that will never be applied carries
    fn discard(&self, event: Internal) {
        match event {
            Internal::Camera { result, reply, .. } => {
                if let Ok(stream) = result {
                    self.media.release(&stream);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(Err(CallError::InvalidState("superseded".to_string())));
                }
            }
            Internal::Capture { result, .. } => {
                if let Ok(capture) = result {
                    self.media.release(&capture);
                }
            }
            Internal::CaptureEnded { .. } => {}
        }
    }

    async fn teardown(&mut self) {
        if self.left {
            return;
        }
        self.left = true;
        self.camera_token = None;
        info!("Room {}: leaving", self.room_id);

        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.transport_rx = None;
        self.client.close();
        self.pending_signals.clear();

        match mem::replace(&mut self.share, ShareState::Idle) {
            ShareState::Idle => {}
            ShareState::Starting { saved, reply, .. } => {
                if let Some(saved) = saved {
                    self.media.release(&saved);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(Err(CallError::InvalidState("call has ended".to_string())));
                }
            }
            ShareState::Active { capture, saved, .. } => {
                self.media.release(&capture);
                if let Some(saved) = saved {
                    self.media.release(&saved);
                }
            }
        }
        if let Some(local) = self.local.take() {
            self.media.release(&local);
        }

        self.room = None;
        self.state.send_modify(|s| {
            s.left = true;
            s.connection = PeerConnectionState::Closed;
            s.local_stream = None;
            s.remote_stream = None;
            s.is_screen_sharing = false;
        });
        self.emit(CallEvent::Left);
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, err: CallError) {
        error!("Room {}: {}", self.room_id, err);
        self.state.send_modify(|s| s.last_error = Some(err.clone()));
        self.emit(CallEvent::Error(err));
    }

    fn set_connection(&self, connection: PeerConnectionState) {
        let changed = self.state.send_if_modified(|s| {
            if s.connection == connection {
                return false;
            }
            s.connection = connection;
            true
        });
        if changed {
            self.emit(CallEvent::ConnectionChanged(connection));
        }
    }

    fn set_remote(&self, remote: Option<RemoteMediaStream>) {
        let changed = self.state.send_if_modified(|s| {
            if s.remote_stream == remote {
                return false;
            }
            s.remote_stream = remote.clone();
            true
        });
        if changed {
            self.emit(CallEvent::RemoteStreamChanged(remote));
        }
    }

    fn publish_local(&self) {
        let local = self.local.clone();
        self.state.send_modify(|s| s.local_stream = local.clone());
        self.emit(CallEvent::LocalStreamChanged(local));
    }

    fn set_sharing(&self, sharing: bool) {
        let changed = self.state.send_if_modified(|s| {
            if s.is_screen_sharing == sharing {
                return false;
            }
            s.is_screen_sharing = sharing;
            true
        });
        if changed {
            self.emit(CallEvent::ScreenShareChanged(sharing));
        }
    }
}

fn ended<T>() -> Result<T, CallError> {
    Err(CallError::InvalidState("call has ended".to_string()))
}

async fn recv_transport(rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
