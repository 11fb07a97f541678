//! Session Coordinator
//!
//! Composes the Signaling Client, the Media Source Manager and the Peer
//! Session into one call lifecycle. Each call runs as a single actor task
//! that processes commands, relay events, transport events and device
//! acquisition results one at a time, in arrival order. The presentation
//! layer drives it through a `CallHandle` and observes it through a watch
//! channel (`CallState`) and a broadcast channel (`CallEvent`).

mod actor;
mod state;

pub use state::{CallEvent, CallState};

use crate::config::MediaPreferences;
use crate::error::CallError;
use crate::media::{MediaSourceManager, TrackKind};
use crate::transport::{RelayConnector, SignalingClient};
use crate::webrtc::PeerTransportFactory;
use actor::CallActor;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Collaborators a call is built from
#[derive(Clone)]
pub struct CallDeps {
    pub connector: Arc<dyn RelayConnector>,
    /// Relay endpoint handed to the connector
    pub endpoint: String,
    pub media: MediaSourceManager,
    pub transports: Arc<dyn PeerTransportFactory>,
    pub preferences: MediaPreferences,
}

pub(crate) type Reply<T> = oneshot::Sender<Result<T, CallError>>;

pub(crate) enum Command {
    Toggle(TrackKind, Reply<bool>),
    StartScreenShare(Reply<()>),
    StopScreenShare(Reply<()>),
    SelectDevice(TrackKind, String, Reply<()>),
    Retry(Reply<()>),
    Leave(Reply<()>),
}

/// Presentation-layer handle to one call
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<CallState>,
    events: broadcast::Sender<CallEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CallHandle {
    /// Connect to the relay and join `room_id`. A relay that cannot be
    /// reached fails here with `ChannelUnavailable`, and a second live call
    /// in the same room on the same devices with `InvalidState`. Everything
    /// after the join happens asynchronously and is published as state.
    pub async fn join(deps: CallDeps, room_id: &str, nickname: Option<String>) -> Result<Self, CallError> {
        let room = deps.media.claim_room(room_id)?;
        let mut client = SignalingClient::connect(deps.connector.as_ref(), &deps.endpoint).await?;
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        client.on_message(signal_tx)?;
        client.join(room_id, nickname.as_deref())?;

        let initial = CallState::new(
            room_id,
            nickname,
            deps.preferences.audio_enabled,
            deps.preferences.video_enabled,
        );
        let (state_tx, state_rx) = watch::channel(initial);
        let (events_tx, _) = broadcast::channel(256);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let actor = CallActor::new(deps, room, client, state_tx, events_tx.clone());
        let task = tokio::spawn(actor.run(command_rx, signal_rx));
        info!("Call in room {} started", room_id);

        Ok(Self {
            commands: command_tx,
            state: state_rx,
            events: events_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Current snapshot
    pub fn state(&self) -> CallState {
        self.state.borrow().clone()
    }

    /// Watch every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    /// Stream of individual changes from now on
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Flip microphone mute; returns the new enabled flag
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::Toggle(TrackKind::Audio, reply)).await
    }

    /// Flip camera mute; returns the new enabled flag
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::Toggle(TrackKind::Video, reply)).await
    }

    /// Send the screen instead of the camera. Resolves once the capture is
    /// on air; already sharing is a no-op.
    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        self.request(Command::StartScreenShare).await
    }

    /// Return to the camera. No-op when not sharing.
    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        self.request(Command::StopScreenShare).await
    }

    /// Switch the camera or microphone mid-call
    pub async fn select_device(&self, kind: TrackKind, device_id: &str) -> Result<(), CallError> {
        self.request(|reply| Command::SelectDevice(kind, device_id.to_string(), reply))
            .await
    }

    /// Replace a failed Peer Session with a fresh one, or re-acquire local
    /// media after a device failure
    pub async fn retry(&self) -> Result<(), CallError> {
        self.request(Command::Retry).await
    }

    /// Tear the call down. Safe from any state, any number of times.
    pub async fn leave(&self) -> Result<(), CallError> {
        let result = match self.request(Command::Leave).await {
            // the actor is gone: it has already torn down
            Err(CallError::InvalidState(_)) if self.commands.is_closed() => Ok(()),
            other => other,
        };
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        result
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| CallError::InvalidState("call has ended".to_string()))?;
        rx.await
            .map_err(|_| CallError::InvalidState("call has ended".to_string()))?
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if self.commands.is_closed() {
            return;
        }
        debug!("Call handle dropped, leaving room {}", self.state.borrow().room_id);
        let (reply, _) = oneshot::channel();
        let _ = self.commands.send(Command::Leave(reply));
    }
}
