//! In-memory signaling relay
//!
//! Behaves like the production relay for two-party rooms: the first member
//! of a room is the initiator, the second the responder; both are told when
//! the room holds two members; signals are forwarded to the other member;
//! a departure is announced to the remaining member, who is promoted to
//! initiator so a later joiner can be negotiated with.

use super::protocol::{ClientEvent, ServerEvent};
use super::signaling_client::{RelayConnector, RelayLink};
use crate::error::CallError;
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

const ROOM_CAPACITY: usize = 2;

struct Member {
    id: u64,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

struct RelayInner {
    rooms: Mutex<HashMap<String, Vec<Member>>>,
    next_member: AtomicU64,
    available: AtomicBool,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct LoopbackRelay {
    inner: Arc<RelayInner>,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(RelayInner {
                rooms: Mutex::new(HashMap::new()),
                next_member: AtomicU64::new(1),
                available: AtomicBool::new(true),
                shutdown,
            }),
        }
    }

    /// Refuse (or accept again) new connections
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn room_size(&self, room_id: &str) -> usize {
        self.inner.rooms.lock().get(room_id).map(Vec::len).unwrap_or(0)
    }

    /// Drop every connection without a goodbye
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.rooms.lock().clear();
    }
}

impl Default for LoopbackRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayConnector for LoopbackRelay {
    async fn open(&self, endpoint: &str) -> Result<RelayLink, CallError> {
        if !self.inner.available.load(Ordering::SeqCst) || *self.inner.shutdown.borrow() {
            return Err(CallError::ChannelUnavailable(format!("relay {} refused connection", endpoint)));
        }

        let id = self.inner.next_member.fetch_add(1, Ordering::SeqCst);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(member_loop(self.inner.clone(), id, out_rx, in_tx));

        debug!("Loopback relay member {} connected", id);
        Ok(RelayLink {
            outbound: out_tx,
            inbound: in_rx,
            reader: None,
        })
    }
}

async fn member_loop(
    inner: Arc<RelayInner>,
    id: u64,
    mut rx: mpsc::UnboundedReceiver<ClientEvent>,
    tx: mpsc::UnboundedSender<ServerEvent>,
) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut room: Option<String> = None;

    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = shutdown.changed() => {
                debug!("Loopback relay dropping member {}", id);
                return;
            }
        };
        let Some(event) = event else { break };

        match event {
            ClientEvent::JoinRoom { room_id, nickname } => {
                if room.is_some() {
                    let _ = tx.send(ServerEvent::Error {
                        message: "already in a room".to_string(),
                    });
                    continue;
                }
                let mut rooms = inner.rooms.lock();
                let members = rooms.entry(room_id.clone()).or_default();
                if members.len() >= ROOM_CAPACITY {
                    let _ = tx.send(ServerEvent::Error {
                        message: format!("room {} is full", room_id),
                    });
                    continue;
                }
                let is_initiator = members.is_empty();
                members.push(Member { id, tx: tx.clone() });
                let _ = tx.send(ServerEvent::RoomJoined { is_initiator });
                if members.len() == ROOM_CAPACITY {
                    for member in members.iter() {
                        let _ = member.tx.send(ServerEvent::PeerPresent);
                    }
                }
                info!(
                    "Loopback relay: member {} ({}) joined {}",
                    id,
                    nickname.as_deref().unwrap_or("anonymous"),
                    room_id
                );
                room = Some(room_id);
            }
            ClientEvent::PeerSignal { payload } => {
                let Some(room_id) = room.as_deref() else { continue };
                let rooms = inner.rooms.lock();
                if let Some(members) = rooms.get(room_id) {
                    for member in members.iter().filter(|m| m.id != id) {
                        let _ = member.tx.send(ServerEvent::PeerSignal {
                            payload: payload.clone(),
                        });
                    }
                }
            }
            ClientEvent::LeaveRoom => {
                if let Some(room_id) = room.take() {
                    leave(&inner, id, &room_id);
                }
            }
        }
    }

    if let Some(room_id) = room {
        leave(&inner, id, &room_id);
    }
}

fn leave(inner: &RelayInner, id: u64, room_id: &str) {
    let mut rooms = inner.rooms.lock();
    let Some(members) = rooms.get_mut(room_id) else { return };
    members.retain(|m| m.id != id);
    for member in members.iter() {
        let _ = member.tx.send(ServerEvent::PeerLeft);
        let _ = member.tx.send(ServerEvent::RoomJoined { is_initiator: true });
    }
    if members.is_empty() {
        rooms.remove(room_id);
    }
    info!("Loopback relay: member {} left {}", id, room_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn connect(relay: &LoopbackRelay) -> RelayLink {
        relay.open("loopback://relay").await.unwrap()
    }

    async fn next(link: &mut RelayLink) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), link.inbound.recv())
            .await
            .expect("timed out")
            .expect("link closed")
    }

    fn join(link: &RelayLink, room: &str) {
        link.outbound
            .send(ClientEvent::JoinRoom {
                room_id: room.to_string(),
                nickname: None,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn third_member_is_refused() {
        let relay = LoopbackRelay::new();
        let mut links = Vec::new();
        for _ in 0..3 {
            let link = connect(&relay).await;
            join(&link, "demo");
            links.push(link);
        }
        let mut third = links.pop().unwrap();
        assert!(matches!(next(&mut third).await, ServerEvent::Error { .. }));
        assert_eq!(relay.room_size("demo"), 2);
    }

    #[tokio::test]
    async fn remaining_member_is_promoted() {
        let relay = LoopbackRelay::new();
        let mut a = connect(&relay).await;
        join(&a, "demo");
        let b = connect(&relay).await;
        join(&b, "demo");

        assert_eq!(next(&mut a).await, ServerEvent::RoomJoined { is_initiator: true });
        assert_eq!(next(&mut a).await, ServerEvent::PeerPresent);

        drop(b);
        assert_eq!(next(&mut a).await, ServerEvent::PeerLeft);
        assert_eq!(next(&mut a).await, ServerEvent::RoomJoined { is_initiator: true });
        assert_eq!(relay.room_size("demo"), 1);
    }
}
