//! WebSocket relay connector
//!
//! Opens the signaling socket and bridges it to the channel pair the
//! Signaling Client works with: one task writes outbound events (plus
//! keepalive pings), one task parses inbound text frames.

use super::protocol::{ClientEvent, ServerEvent};
use super::signaling_client::{RelayConnector, RelayLink};
use crate::config::SignalingConfig;
use crate::error::CallError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Connects to a relay over `ws://` or `wss://`
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    /// Interval between keepalive pings; zero disables them
    ping_interval: Duration,
    /// Give up on the handshake after this long
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(config: &SignalingConfig) -> Self {
        Self {
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn open(&self, endpoint: &str) -> Result<RelayLink, CallError> {
        let (ws_stream, _) = time::timeout(self.connect_timeout, connect_async(endpoint))
            .await
            .map_err(|_| CallError::ChannelUnavailable(format!("timed out connecting to {}", endpoint)))?
            .map_err(|e| CallError::ChannelUnavailable(format!("websocket connect to {} failed: {}", endpoint, e)))?;
        info!("Signaling WebSocket connected to {}", endpoint);

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerEvent>();

        // Writer: ends (with a close frame) once the client drops its sender
        let ping_interval = self.ping_interval;
        tokio::spawn(async move {
            let mut keepalive = (!ping_interval.is_zero()).then(|| time::interval(ping_interval));
            loop {
                let event = tokio::select! {
                    event = outbound_rx.recv() => event,
                    _ = tick(&mut keepalive) => {
                        if write.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };
                let Some(event) = event else {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                match event.to_json() {
                    Ok(text) => {
                        if write.send(Message::Text(text)).await.is_err() {
                            warn!("Signaling WebSocket write failed");
                            break;
                        }
                    }
                    Err(e) => error!("Dropping outbound relay message: {}", e),
                }
            }
            debug!("Signaling writer finished");
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::from_json(&text) {
                        Ok(event) => {
                            if inbound_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("{}", e),
                    },
                    Ok(Message::Binary(data)) => {
                        debug!("Ignoring binary signaling frame: {} bytes", data.len());
                    }
                    Ok(Message::Close(_)) => {
                        info!("Relay closed the signaling channel");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Signaling WebSocket error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(RelayLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
            reader: Some(reader),
        })
    }
}

async fn tick(interval: &mut Option<time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalingConfig;

    #[tokio::test]
    async fn unreachable_relay_is_channel_unavailable() {
        let config = SignalingConfig {
            url: "ws://127.0.0.1:1".to_string(),
            ping_interval_secs: 0,
            connect_timeout_secs: 2,
        };
        let connector = WebSocketConnector::new(&config);
        let err = connector.open(&config.url).await.err().unwrap();
        assert!(matches!(err, CallError::ChannelUnavailable(_)));
    }
}
