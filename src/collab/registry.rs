//! Room registry: creation, membership and ownership on top of the database.
//!
//! Mutations for one room are serialized by an async per-room lock held by
//! the caller across the database call and any follow-up broadcast, so the
//! roster a room sees always matches the order memberships changed in.

use std::sync::Arc;

use coderoom_common::{Participant, Room, RoomMembership};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::db::{DbHandle, LeaveOutcome};
use crate::errors::CollabError;

pub type RoomGuard = OwnedMutexGuard<()>;

/// Length of generated room identifiers.
pub const ROOM_ID_LEN: usize = 8;

pub fn generate_room_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(ROOM_ID_LEN);
    id
}

pub struct RoomRegistry {
    db: DbHandle,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RoomRegistry {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            locks: DashMap::new(),
        }
    }

    /// Acquire the mutation lock for one room.
    pub async fn lock_room(&self, room_id: &str) -> RoomGuard {
        let lock = self
            .locks
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Forget the lock of a room nobody is waiting on. Call after the guard
    /// has been dropped.
    pub fn release_lock(&self, room_id: &str) {
        self.locks
            .remove_if(room_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub async fn ensure_room(&self, room_id: &str, owner_id: &str) -> Result<Room, CollabError> {
        let (room_id, owner_id) = (room_id.to_string(), owner_id.to_string());
        self.db
            .call(move |db| db.ensure_room(&room_id, &owner_id))
            .await
            .map_err(CollabError::Database)
    }

    /// Create the room if needed and add the membership, atomically.
    pub async fn join(&self, room_id: &str, user_id: &str) -> Result<Room, CollabError> {
        let (room_id, user_id) = (room_id.to_string(), user_id.to_string());
        self.db
            .call(move |db| db.ensure_and_join(&room_id, &user_id))
            .await
            .map_err(CollabError::Database)
    }

    /// Remove the membership; the room is deleted when its last member
    /// leaves.
    pub async fn leave(&self, room_id: &str, user_id: &str) -> Result<LeaveOutcome, CollabError> {
        let (room_id, user_id) = (room_id.to_string(), user_id.to_string());
        self.db
            .call(move |db| db.leave(&room_id, &user_id))
            .await
            .map_err(CollabError::Database)
    }

    pub async fn is_owner(&self, room_id: &str, user_id: &str) -> Result<bool, CollabError> {
        let (room_id, user_id) = (room_id.to_string(), user_id.to_string());
        self.db
            .call(move |db| db.is_owner(&room_id, &user_id))
            .await
            .map_err(CollabError::Database)
    }

    pub async fn get_room(&self, room_id: &str) -> Result<Room, CollabError> {
        let id = room_id.to_string();
        self.db
            .call(move |db| db.get_room(&id))
            .await
            .map_err(CollabError::Database)?
            .ok_or_else(|| CollabError::RoomNotFound {
                room_id: room_id.to_string(),
            })
    }

    pub async fn rooms_for_user(&self, user_id: &str) -> Result<Vec<RoomMembership>, CollabError> {
        let user_id = user_id.to_string();
        self.db
            .call(move |db| db.rooms_for_user(&user_id))
            .await
            .map_err(CollabError::Database)
    }

    /// Current participants with their ownership flags, in join order.
    pub async fn roster(&self, room_id: &str) -> Result<Vec<Participant>, CollabError> {
        let room_id = room_id.to_string();
        self.db
            .call(move |db| db.roster(&room_id))
            .await
            .map_err(CollabError::Database)
    }
}
