//! Live connection registry and per-room fan-out.
//!
//! Every socket is registered with a bounded outbound queue. Broadcasting
//! serializes the event once and `try_send`s it to each connection in the
//! room, so one slow reader can only lose its own frames; it never stalls
//! the sender or the rest of the room.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use coderoom_common::ServerEvent;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type ConnId = u64;

struct Connection {
    user_id: Option<String>,
    tx: mpsc::Sender<String>,
    rooms: BTreeSet<String>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnId, Connection>,
    rooms: HashMap<String, BTreeSet<ConnId>>,
}

pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    // A panic while holding the lock leaves the maps consistent (every
    // mutation is a single insert/remove), so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a connection. The receiver yields serialized frames to write
    /// to the socket.
    pub fn register(&self, user_id: Option<String>) -> (ConnId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.write().connections.insert(
            id,
            Connection {
                user_id,
                tx,
                rooms: BTreeSet::new(),
            },
        );
        (id, rx)
    }

    /// Drop a connection and return the rooms it was present in.
    pub fn unregister(&self, conn: ConnId) -> Vec<String> {
        let mut inner = self.write();
        let Some(connection) = inner.connections.remove(&conn) else {
            return Vec::new();
        };
        for room in &connection.rooms {
            if let Some(members) = inner.rooms.get_mut(room) {
                members.remove(&conn);
                if members.is_empty() {
                    inner.rooms.remove(room);
                }
            }
        }
        connection.rooms.into_iter().collect()
    }

    /// Add the connection to a room's broadcast set. Returns false if the
    /// connection is not registered.
    pub fn join_room(&self, conn: ConnId, room_id: &str) -> bool {
        let mut inner = self.write();
        let Some(connection) = inner.connections.get_mut(&conn) else {
            return false;
        };
        connection.rooms.insert(room_id.to_string());
        inner
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(conn);
        true
    }

    pub fn leave_room(&self, conn: ConnId, room_id: &str) {
        let mut inner = self.write();
        if let Some(connection) = inner.connections.get_mut(&conn) {
            connection.rooms.remove(room_id);
        }
        if let Some(members) = inner.rooms.get_mut(room_id) {
            members.remove(&conn);
            if members.is_empty() {
                inner.rooms.remove(room_id);
            }
        }
    }

    pub fn is_in_room(&self, conn: ConnId, room_id: &str) -> bool {
        self.read()
            .rooms
            .get(room_id)
            .is_some_and(|members| members.contains(&conn))
    }

    /// Whether `user_id` is present in the room through a connection other
    /// than `except`.
    pub fn user_has_other_connection(&self, room_id: &str, user_id: &str, except: ConnId) -> bool {
        let inner = self.read();
        inner.rooms.get(room_id).is_some_and(|members| {
            members.iter().any(|id| {
                *id != except
                    && inner
                        .connections
                        .get(id)
                        .and_then(|c| c.user_id.as_deref())
                        == Some(user_id)
            })
        })
    }

    /// Connections present in a room, in ascending id order.
    #[cfg(test)]
    pub fn connections_in(&self, room_id: &str) -> Vec<ConnId> {
        self.read()
            .rooms
            .get(room_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    /// Queue an event for a single connection.
    pub fn send_to(&self, conn: ConnId, event: &ServerEvent) -> bool {
        let Some(frame) = encode(event) else {
            return false;
        };
        let inner = self.read();
        match inner.connections.get(&conn) {
            Some(connection) => deliver(conn, &connection.tx, frame, event.name()),
            None => false,
        }
    }

    /// Queue an event for every connection in the room except `exclude`.
    /// Returns how many connections accepted the frame.
    pub fn broadcast(&self, room_id: &str, event: &ServerEvent, exclude: Option<ConnId>) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };
        let inner = self.read();
        let Some(members) = inner.rooms.get(room_id) else {
            return 0;
        };

        let mut delivered = 0;
        for id in members {
            if Some(*id) == exclude {
                continue;
            }
            if let Some(connection) = inner.connections.get(id)
                && deliver(*id, &connection.tx, frame.clone(), event.name())
            {
                delivered += 1;
            }
        }
        debug!(room_id, event = event.name(), delivered, "[presence] broadcast");
        delivered
    }
}

fn encode(event: &ServerEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(event = event.name(), "[presence] failed to serialize event: {}", e);
            None
        }
    }
}

fn deliver(conn: ConnId, tx: &mpsc::Sender<String>, frame: String, event: &str) -> bool {
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(conn, event, "[presence] outbound queue full, dropping frame");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(conn, event, "[presence] connection closed, dropping frame");
            false
        }
    }
}
