//! Room membership and message routing
//!
//! The broker never looks inside negotiation payloads. `offer`, `answer` and
//! `ice` messages are forwarded to every other member of the named room with
//! only `roomId` normalized to a string; everything else about them is opaque.

use crate::store::{ConnId, Membership, Peer, Room, RoomStore};
use peerdrop_core::generate_room_code;
use peerdrop_core::protocol::SignalMessage;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};

/// Routing-relevant fields of an incoming message
struct Envelope {
    kind: String,
    room_id: Option<String>,
    peer_id: Option<String>,
    from: Option<String>,
}

impl Envelope {
    /// Extract the envelope, normalizing a numeric `roomId` to a string in place
    fn parse(value: &mut Value) -> Option<Self> {
        let obj = value.as_object_mut()?;
        let kind = obj.get("type")?.as_str()?.to_string();

        let room_id = match obj.get("roomId") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        if let Some(id) = &room_id {
            obj.insert("roomId".to_string(), Value::String(id.clone()));
        }

        let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
        Some(Self {
            kind,
            room_id,
            peer_id: text("peerId"),
            from: text("from"),
        })
    }
}

/// A registered connection: its id and the queue feeding its socket
#[derive(Debug, Clone)]
pub struct BrokerConnection {
    pub id: ConnId,
    tx: mpsc::UnboundedSender<String>,
}

impl BrokerConnection {
    fn reply(&self, msg: &SignalMessage) {
        match serde_json::to_string(msg) {
            Ok(text) => {
                let _ = self.tx.send(text);
            }
            Err(e) => tracing::error!("Failed to encode {} reply: {}", msg.kind(), e),
        }
    }
}

pub struct Broker {
    store: Mutex<Box<dyn RoomStore>>,
    next_conn: AtomicU64,
    max_room_peers: Option<usize>,
}

impl Broker {
    pub fn new(store: impl RoomStore + 'static, max_room_peers: Option<usize>) -> Self {
        Self {
            store: Mutex::new(Box::new(store)),
            next_conn: AtomicU64::new(1),
            max_room_peers,
        }
    }

    /// Register a connection whose outgoing frames go to `tx`
    pub fn connect(&self, tx: mpsc::UnboundedSender<String>) -> BrokerConnection {
        BrokerConnection {
            id: self.next_conn.fetch_add(1, Ordering::SeqCst),
            tx,
        }
    }

    /// Handle one text frame. Invalid input is logged and dropped.
    pub async fn handle_text(&self, conn: &BrokerConnection, text: &str) {
        let mut value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Dropping unparseable message from conn {}: {}", conn.id, e);
                return;
            }
        };
        let Some(envelope) = Envelope::parse(&mut value) else {
            tracing::warn!("Dropping message without a type from conn {}", conn.id);
            return;
        };
        tracing::debug!("conn {} sent {}", conn.id, envelope.kind);

        match envelope.kind.as_str() {
            "join-room" => self.join(conn, envelope).await,
            "offer" | "answer" | "ice" => self.relay(conn, envelope, &value).await,
            "leave" => self.leave(conn.id).await,
            other => tracing::warn!("Dropping unknown message type {:?}", other),
        }
    }

    /// Remove the connection from its room, if any
    pub async fn disconnect(&self, conn: &BrokerConnection) {
        self.leave(conn.id).await;
    }

    pub async fn room_exists(&self, room_id: &str) -> bool {
        self.store.lock().await.get_room(room_id).is_some()
    }

    /// Peer ids in join order; empty when the room does not exist
    pub async fn room_peers(&self, room_id: &str) -> Vec<String> {
        self.store
            .lock()
            .await
            .get_room(room_id)
            .map(|room| room.peer_ids())
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.store.lock().await.room_count()
    }

    async fn join(&self, conn: &BrokerConnection, envelope: Envelope) {
        let Some(peer_id) = envelope.peer_id else {
            tracing::warn!("Dropping join-room without peerId from conn {}", conn.id);
            return;
        };

        let mut store = self.store.lock().await;
        let room_id = match envelope.room_id {
            Some(id) => id,
            None => loop {
                let code = generate_room_code();
                if store.get_room(&code).is_none() {
                    break code;
                }
            },
        };

        // Refuse before touching the current membership, so a full room
        // does not cost the connection its old one
        if let (Some(max), Some(target)) = (self.max_room_peers, store.get_room(&room_id)) {
            let rejoining = target.peer(&peer_id).is_some();
            let others = target.peers.iter().filter(|p| p.conn != conn.id).count();
            if !rejoining && others >= max {
                tracing::warn!("Room {} is full, refusing {}", room_id, peer_id);
                return;
            }
        }

        // A connection lives in at most one room
        if let Some(current) = store.membership(conn.id) {
            if current.room_id != room_id || current.peer_id != peer_id {
                remove_member(&mut **store, conn.id);
            }
        }

        let mut room = store.get_room(&room_id).unwrap_or_else(|| {
            tracing::info!("Room {} created", room_id);
            Room::new(room_id.clone())
        });
        let peer = Peer {
            id: peer_id.clone(),
            conn: conn.id,
            tx: conn.tx.clone(),
        };
        match room.peers.iter_mut().find(|p| p.id == peer_id) {
            // Rejoin under the same id: keep the join position, swap the socket
            Some(existing) => {
                if existing.conn != conn.id {
                    store.clear_membership(existing.conn);
                }
                *existing = peer;
            }
            None => room.peers.push(peer),
        }
        store.set_membership(
            conn.id,
            Membership {
                room_id: room_id.clone(),
                peer_id: peer_id.clone(),
            },
        );

        let announce = SignalMessage::PeerJoined {
            room_id: room_id.clone(),
            peer_id: peer_id.clone(),
        };
        match serde_json::to_string(&announce) {
            Ok(text) => room
                .peers
                .iter()
                .filter(|p| p.id != peer_id)
                .for_each(|p| p.send(&text)),
            Err(e) => tracing::error!("Failed to encode peer-joined: {}", e),
        }
        conn.reply(&SignalMessage::JoinedRoom {
            room_id: room_id.clone(),
        });

        tracing::info!(
            "{} joined room {} ({} peers)",
            peer_id,
            room_id,
            room.peers.len()
        );
        store.put_room(room);
    }

    async fn relay(&self, conn: &BrokerConnection, envelope: Envelope, value: &Value) {
        let Some(room_id) = envelope.room_id else {
            tracing::warn!("Dropping {} without roomId", envelope.kind);
            return;
        };
        let store = self.store.lock().await;
        let Some(room) = store.get_room(&room_id) else {
            tracing::warn!("Dropping {} for unknown room {}", envelope.kind, room_id);
            return;
        };

        let text = value.to_string();
        let mut delivered = 0;
        for peer in &room.peers {
            let is_sender = peer.conn == conn.id || envelope.from.as_deref() == Some(peer.id.as_str());
            if !is_sender {
                peer.send(&text);
                delivered += 1;
            }
        }
        tracing::debug!(
            "Relayed {} in room {} to {} peers",
            envelope.kind,
            room_id,
            delivered
        );
    }

    async fn leave(&self, conn: ConnId) {
        let mut store = self.store.lock().await;
        remove_member(&mut **store, conn);
    }
}

/// Drop `conn` from its room, tell the others and delete the room once empty
fn remove_member(store: &mut dyn RoomStore, conn: ConnId) {
    let Some(Membership { room_id, peer_id }) = store.clear_membership(conn) else {
        return;
    };
    let Some(mut room) = store.get_room(&room_id) else {
        return;
    };

    // A rejoin from another socket may already own this peer id
    let before = room.peers.len();
    room.peers.retain(|p| !(p.id == peer_id && p.conn == conn));
    if room.peers.len() == before {
        return;
    }
    tracing::info!("{} left room {}", peer_id, room_id);

    if room.peers.is_empty() {
        store.delete_room(&room_id);
        tracing::info!("Room {} removed", room_id);
        return;
    }

    match serde_json::to_string(&SignalMessage::PeerLeft {
        peer_id: peer_id.clone(),
    }) {
        Ok(text) => room.peers.iter().for_each(|p| p.send(&text)),
        Err(e) => tracing::error!("Failed to encode peer-left: {}", e),
    }
    store.put_room(room);
}
