//! Room storage
//!
//! The broker only touches rooms through [`RoomStore`], always while holding
//! its state lock, so implementations need no synchronization of their own.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Identifies one WebSocket connection
pub type ConnId = u64;

/// A member of a room and the queue feeding its socket
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: String,
    pub conn: ConnId,
    pub tx: mpsc::UnboundedSender<String>,
}

impl Peer {
    /// Queue a text frame for this peer; a closed socket is ignored
    pub fn send(&self, text: &str) {
        if self.tx.send(text.to_string()).is_err() {
            tracing::debug!("Peer {} socket already closed", self.id);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    /// Members in join order; peer ids are unique
    pub peers: Vec<Peer>,
    /// Unix time in milliseconds
    pub created_at: u64,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            id: id.into(),
            peers: Vec::new(),
            created_at,
        }
    }

    pub fn peer(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == peer_id)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.id.clone()).collect()
    }
}

/// Which room a connection is in, under which peer id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub room_id: String,
    pub peer_id: String,
}

pub trait RoomStore: Send {
    fn get_room(&self, room_id: &str) -> Option<Room>;

    fn put_room(&mut self, room: Room);

    fn delete_room(&mut self, room_id: &str) -> bool;

    fn membership(&self, conn: ConnId) -> Option<Membership>;

    fn set_membership(&mut self, conn: ConnId, membership: Membership);

    fn clear_membership(&mut self, conn: ConnId) -> Option<Membership>;

    fn room_count(&self) -> usize;
}

#[derive(Debug, Default)]
pub struct MemoryRoomStore {
    rooms: HashMap<String, Room>,
    members: HashMap<ConnId, Membership>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoomStore for MemoryRoomStore {
    fn get_room(&self, room_id: &str) -> Option<Room> {
        self.rooms.get(room_id).cloned()
    }

    fn put_room(&mut self, room: Room) {
        self.rooms.insert(room.id.clone(), room);
    }

    fn delete_room(&mut self, room_id: &str) -> bool {
        self.rooms.remove(room_id).is_some()
    }

    fn membership(&self, conn: ConnId) -> Option<Membership> {
        self.members.get(&conn).cloned()
    }

    fn set_membership(&mut self, conn: ConnId, membership: Membership) {
        self.members.insert(conn, membership);
    }

    fn clear_membership(&mut self, conn: ConnId) -> Option<Membership> {
        self.members.remove(&conn)
    }

    fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
