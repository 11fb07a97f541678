//! p2p-call - Main entry point
//!
//! Command-line front end for the call core: joins a room over a WebSocket
//! relay and drives the call from stdin, or runs a self-contained demo call.

mod args;

use args::Args;
use clap::Parser;
use log::{error, info, warn};
use p2p_call_core::config::{random_nickname, Config};
use p2p_call_core::coordinator::{CallDeps, CallEvent, CallHandle, CallState};
use p2p_call_core::media::{MediaSourceManager, SyntheticDevices, TrackKind};
use p2p_call_core::transport::{LoopbackRelay, WebSocketConnector};
use p2p_call_core::webrtc::{LoopbackNetwork, PeerTransportFactory};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();
    let loaded = args.load_config();

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = match (&loaded, args.verbose) {
        (_, true) => "debug".to_string(),
        (Ok(cfg), false) => cfg.logging.level.clone(),
        (Err(_), false) => "info".to_string(),
    };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("P2P_CALL_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .filter_module("webrtc_srtp", log::LevelFilter::Error)
        .init();

    info!("p2p-call v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = match loaded {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };
    args.apply_overrides(&mut config);

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    if args.demo {
        return run_demo(&config).await;
    }

    let nickname = config.user.nickname.clone().unwrap_or_else(random_nickname);
    let devices = Arc::new(SyntheticDevices::new());
    let media = MediaSourceManager::new(devices);
    for device in media.enumerate_devices().await? {
        info!("{} input: {} ({})", device.kind, device.label, device.device_id);
    }

    let deps = CallDeps {
        connector: Arc::new(WebSocketConnector::new(&config.signaling)),
        endpoint: config.signaling.url.clone(),
        media,
        transports: peer_transports(&config)?,
        preferences: config.media_preferences(),
    };

    info!("Joining room {} at {} as {}", args.room, config.signaling.url, nickname);
    let call = match CallHandle::join(deps, &args.room, Some(nickname)).await {
        Ok(call) => call,
        Err(e) => {
            error!("Could not join: {}", e);
            return Err(e.into());
        }
    };

    info!("Commands: a = mute/unmute, v = camera on/off, s = share screen, S = stop sharing,");
    info!("          d <audio|video> <device-id> = switch device, r = retry, q = leave");

    let mut events = call.events();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                if !run_command(&call, line.trim()).await {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(CallEvent::Left) => break,
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => warn!("Missed {} call events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    call.leave().await?;
    info!("Left room {}", args.room);
    Ok(())
}

/// Returns false when the user asked to leave
async fn run_command(call: &CallHandle, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let result = match parts.next() {
        Some("a") => call.toggle_audio().await.map(|on| info!("Microphone {}", on_off(on))),
        Some("v") => call.toggle_video().await.map(|on| info!("Camera {}", on_off(on))),
        Some("s") => call.start_screen_share().await,
        Some("S") => call.stop_screen_share().await,
        Some("r") => call.retry().await,
        Some("d") => match (parts.next(), parts.next()) {
            (Some("audio"), Some(id)) => call.select_device(TrackKind::Audio, id).await,
            (Some("video"), Some(id)) => call.select_device(TrackKind::Video, id).await,
            _ => {
                warn!("Usage: d <audio|video> <device-id>");
                Ok(())
            }
        },
        Some("q") => return false,
        Some(other) => {
            warn!("Unknown command: {}", other);
            Ok(())
        }
        None => Ok(()),
    };
    if let Err(e) = result {
        error!("{}", e);
    }
    true
}

fn log_event(event: &CallEvent) {
    match event {
        CallEvent::RoleAssigned(role) => info!("Joined as {}", role),
        CallEvent::PeerPresent => info!("Remote participant joined"),
        CallEvent::PeerLeft => info!("Remote participant left"),
        CallEvent::ConnectionChanged(state) => info!("Connection {}", state),
        CallEvent::RemoteStreamChanged(Some(remote)) => info!(
            "Receiving stream {} (audio: {}, video: {})",
            remote.id,
            remote.audio.is_some(),
            remote.video.is_some()
        ),
        CallEvent::RemoteStreamChanged(None) => info!("Remote stream gone"),
        CallEvent::ScreenShareChanged(sharing) => info!("Screen sharing {}", on_off(*sharing)),
        CallEvent::Error(e) => error!("{} ({})", e, e.code()),
        CallEvent::LocalStreamChanged(_) | CallEvent::TrackEnabled { .. } | CallEvent::Left => {}
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

#[cfg(feature = "webrtc-streaming")]
fn peer_transports(config: &Config) -> Result<Arc<dyn PeerTransportFactory>, Box<dyn std::error::Error>> {
    use p2p_call_core::webrtc::PeerConnectionManager;
    Ok(Arc::new(PeerConnectionManager::new(config.webrtc.clone())))
}

#[cfg(not(feature = "webrtc-streaming"))]
fn peer_transports(_config: &Config) -> Result<Arc<dyn PeerTransportFactory>, Box<dyn std::error::Error>> {
    Err("built without the webrtc-streaming feature; only --demo is available".into())
}

/// Two participants in one process: connect, share the screen, stop, leave
async fn run_demo(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Running in-process demo call");
    let relay = LoopbackRelay::new();
    let network = LoopbackNetwork::new();

    let mut calls = Vec::new();
    for name in ["Alice", "Bob"] {
        let deps = CallDeps {
            connector: Arc::new(relay.clone()),
            endpoint: "loopback://demo".to_string(),
            media: MediaSourceManager::new(Arc::new(SyntheticDevices::new())),
            transports: Arc::new(network.clone()),
            preferences: config.media_preferences(),
        };
        calls.push(CallHandle::join(deps, "demo", Some(name.to_string())).await?);
        // the first joiner becomes the initiator
        wait_until(&calls[calls.len() - 1], |s| s.role.is_some()).await?;
    }
    let (alice, bob) = (&calls[0], &calls[1]);

    wait_until(alice, |s| s.is_connected() && s.remote_stream.is_some()).await?;
    wait_until(bob, |s| s.is_connected() && s.remote_stream.is_some()).await?;
    info!("Demo: both sides connected");

    alice.start_screen_share().await?;
    let screen = alice
        .state()
        .local_stream
        .and_then(|s| s.video_track().map(|t| t.id().to_string()));
    wait_until(bob, |s| {
        s.remote_stream.as_ref().and_then(|r| r.video.as_ref()).map(|t| t.id.clone()) == screen
    })
    .await?;
    info!("Demo: Bob now receives Alice's screen");

    alice.stop_screen_share().await?;
    info!("Demo: Alice is back on camera");

    alice.leave().await?;
    wait_until(bob, |s| !s.peer_present).await?;
    bob.leave().await?;
    info!("Demo finished");
    Ok(())
}

async fn wait_until(
    call: &CallHandle,
    pred: impl Fn(&CallState) -> bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut rx = call.subscribe();
    let wait = async {
        loop {
            if pred(&rx.borrow_and_update()) {
                return true;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    };
    match tokio::time::timeout(Duration::from_secs(10), wait).await {
        Ok(true) => Ok(()),
        Ok(false) => Err("call ended unexpectedly".into()),
        Err(_) => Err("timed out waiting for the demo call".into()),
    }
}
