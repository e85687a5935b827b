use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use coderoom_common::*;
use rusqlite::{Connection, OptionalExtension, params};

/// Async-safe handle to the room database.
///
/// Wraps `RoomDb` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, keeping synchronous SQLite I/O off the
/// async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<RoomDb>>,
}

impl DbHandle {
    pub fn new(db: RoomDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RoomDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup, CLI
    /// commands and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, RoomDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Outcome of a membership removal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub membership_removed: bool,
    pub room_deleted: bool,
}

/// Current time in the format stored in every timestamp column.
pub fn timestamp_now() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

pub struct RoomDb {
    conn: Connection,
}

impl RoomDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    email TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    avatar TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    token_hash TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS rooms (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    owner_id TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS memberships (
                    user_id TEXT NOT NULL,
                    room_id TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                    joined_at TEXT NOT NULL,
                    PRIMARY KEY (user_id, room_id)
                );

                CREATE TABLE IF NOT EXISTS activities (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    room_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    action TEXT NOT NULL,
                    timestamp TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS chat_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    room_id TEXT NOT NULL,
                    sender_id TEXT NOT NULL,
                    message TEXT NOT NULL,
                    timestamp TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_memberships_room ON memberships(room_id);
                CREATE INDEX IF NOT EXISTS idx_activities_user ON activities(user_id, timestamp);
                CREATE INDEX IF NOT EXISTS idx_chat_history_room ON chat_history(room_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Users & sessions ──────────────────────────────────────────────

    /// Insert a user. Returns `None` when the e-mail is already registered.
    pub fn create_user(&self, email: &str, name: &str, avatar: Option<&str>) -> Result<Option<User>> {
        let id = uuid::Uuid::new_v4().to_string();
        let avatar = avatar
            .map(str::to_string)
            .unwrap_or_else(|| User::default_avatar(name));
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO users (id, email, name, avatar) VALUES (?1, ?2, ?3, ?4)",
                params![id, email, name, avatar],
            )
            .context("Failed to insert user")?;
        if inserted == 0 {
            return Ok(None);
        }
        self.get_user(&id)?
            .context("User not found after insert")
            .map(Some)
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, email, name, avatar FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        name: row.get(2)?,
                        avatar: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query user")
    }

    pub fn create_session(&self, user_id: &str, token_hash: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sessions (token_hash, user_id) VALUES (?1, ?2)",
                params![token_hash, user_id],
            )
            .context("Failed to insert session")?;
        Ok(())
    }

    pub fn user_for_token_hash(&self, token_hash: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT u.id, u.email, u.name, u.avatar
                 FROM sessions s JOIN users u ON s.user_id = u.id
                 WHERE s.token_hash = ?1",
                params![token_hash],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        name: row.get(2)?,
                        avatar: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to resolve session")
    }

    // ── Rooms & membership ────────────────────────────────────────────

    pub fn get_room(&self, id: &str) -> Result<Option<Room>> {
        self.conn
            .query_row(
                "SELECT id, name, created_at, owner_id FROM rooms WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Room {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                        owner_id: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query room")
    }

    /// Create the room owned by `user_id` unless it already exists. An
    /// existing room is returned untouched; its owner is never replaced.
    pub fn ensure_room(&self, room_id: &str, user_id: &str) -> Result<Room> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO rooms (id, name, created_at, owner_id) VALUES (?1, ?2, ?3, ?4)",
                params![room_id, Room::display_name(room_id), timestamp_now(), user_id],
            )
            .context("Failed to insert room")?;
        self.get_room(room_id)?.context("Room not found after insert")
    }

    /// Idempotent membership insert. The room must exist.
    pub fn join(&self, room_id: &str, user_id: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO memberships (user_id, room_id, joined_at) VALUES (?1, ?2, ?3)",
                params![user_id, room_id, timestamp_now()],
            )
            .context("Failed to insert membership")?;
        Ok(())
    }

    /// `ensure_room` followed by `join` in a single transaction.
    pub fn ensure_and_join(&self, room_id: &str, user_id: &str) -> Result<Room> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin join transaction")?;
        let room = self.ensure_room(room_id, user_id)?;
        self.join(room_id, user_id)?;
        tx.commit().context("Failed to commit join transaction")?;
        Ok(room)
    }

    /// Remove the membership and delete the room if it is left empty. Both
    /// steps commit together, so of two racing leavers exactly one observes
    /// the count reaching zero.
    pub fn leave(&self, room_id: &str, user_id: &str) -> Result<LeaveOutcome> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin leave transaction")?;
        let removed = self
            .conn
            .execute(
                "DELETE FROM memberships WHERE user_id = ?1 AND room_id = ?2",
                params![user_id, room_id],
            )
            .context("Failed to delete membership")?;
        let remaining = self.member_count(room_id)?;
        let mut room_deleted = false;
        if remaining == 0 {
            room_deleted = self
                .conn
                .execute("DELETE FROM rooms WHERE id = ?1", params![room_id])
                .context("Failed to delete room")?
                > 0;
        }
        tx.commit().context("Failed to commit leave transaction")?;
        Ok(LeaveOutcome {
            membership_removed: removed > 0,
            room_deleted,
        })
    }

    pub fn is_owner(&self, room_id: &str, user_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM rooms WHERE id = ?1 AND owner_id = ?2",
                params![room_id, user_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check room owner")?;
        Ok(found.is_some())
    }

    pub fn member_count(&self, room_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM memberships WHERE room_id = ?1",
                params![room_id],
                |row| row.get(0),
            )
            .context("Failed to count members")
    }

    pub fn rooms_for_user(&self, user_id: &str) -> Result<Vec<RoomMembership>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT r.id, r.name, m.joined_at
                 FROM memberships m JOIN rooms r ON m.room_id = r.id
                 WHERE m.user_id = ?1 ORDER BY m.rowid",
            )
            .context("Failed to prepare rooms_for_user")?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(RoomMembership {
                    room_id: row.get(0)?,
                    name: row.get(1)?,
                    joined_at: row.get(2)?,
                })
            })
            .context("Failed to query memberships")?;
        let mut rooms = Vec::new();
        for row in rows {
            rooms.push(row.context("Failed to read membership row")?);
        }
        Ok(rooms)
    }

    /// Participants of a room in join order. `is_owner` compares each member
    /// against the stored owner only.
    pub fn roster(&self, room_id: &str) -> Result<Vec<Participant>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT u.id, u.name, u.avatar, r.owner_id = u.id AS is_owner
                 FROM memberships m
                 JOIN users u ON m.user_id = u.id
                 JOIN rooms r ON m.room_id = r.id
                 WHERE m.room_id = ?1
                 ORDER BY m.rowid",
            )
            .context("Failed to prepare roster")?;
        let rows = stmt
            .query_map(params![room_id], |row| {
                Ok(Participant {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    avatar: row.get(2)?,
                    is_owner: row.get(3)?,
                })
            })
            .context("Failed to query roster")?;
        let mut participants = Vec::new();
        for row in rows {
            participants.push(row.context("Failed to read roster row")?);
        }
        Ok(participants)
    }

    // ── Activity & chat log ───────────────────────────────────────────

    pub fn append_activity(
        &self,
        room_id: &str,
        user_id: &str,
        action: ActivityAction,
        timestamp: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO activities (room_id, user_id, action, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![room_id, user_id, action.as_str(), timestamp],
            )
            .context("Failed to insert activity")?;
        Ok(())
    }

    /// Most recent activities of a user, newest first.
    pub fn recent_activities(&self, user_id: &str, limit: u32) -> Result<Vec<ActivityRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, room_id, user_id, action, timestamp FROM activities
                 WHERE user_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
            )
            .context("Failed to prepare recent_activities")?;
        let rows = stmt
            .query_map(params![user_id, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query activities")?;
        let mut activities = Vec::new();
        for row in rows {
            let (id, room_id, user_id, action, timestamp) =
                row.context("Failed to read activity row")?;
            let action = action.parse::<ActivityAction>().map_err(|e| anyhow::anyhow!(e))?;
            activities.push(ActivityRecord {
                id,
                room_id,
                user_id,
                action,
                timestamp,
            });
        }
        Ok(activities)
    }

    pub fn append_chat(
        &self,
        room_id: &str,
        sender_id: &str,
        message: &str,
        timestamp: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO chat_history (room_id, sender_id, message, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![room_id, sender_id, message, timestamp],
            )
            .context("Failed to insert chat message")?;
        Ok(())
    }

    pub fn chat_history(&self, room_id: &str) -> Result<Vec<ChatMessage>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, room_id, sender_id, message, timestamp FROM chat_history
                 WHERE room_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare chat_history")?;
        let rows = stmt
            .query_map(params![room_id], |row| {
                Ok(ChatMessage {
                    id: row.get(0)?,
                    room_id: row.get(1)?,
                    sender_id: row.get(2)?,
                    message: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })
            .context("Failed to query chat history")?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.context("Failed to read chat row")?);
        }
        Ok(messages)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).context("Failed to execute raw SQL")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_users(names: &[&str]) -> (RoomDb, Vec<User>) {
        let db = RoomDb::new_in_memory().unwrap();
        let users = names
            .iter()
            .map(|n| {
                db.create_user(&format!("{}@example.com", n), n, None)
                    .unwrap()
                    .unwrap()
            })
            .collect();
        (db, users)
    }

    #[test]
    fn test_new_on_disk_is_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rooms.db");
        {
            let db = RoomDb::new(&path).unwrap();
            db.create_user("a@example.com", "a", None).unwrap().unwrap();
        }
        let db = RoomDb::new(&path).unwrap();
        assert!(db.create_user("a@example.com", "a", None).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_email_is_reported_as_none() {
        let (db, _) = db_with_users(&["ada"]);
        assert!(db.create_user("ada@example.com", "other", None).unwrap().is_none());
    }

    #[test]
    fn test_session_lookup() {
        let (db, users) = db_with_users(&["ada"]);
        db.create_session(&users[0].id, "digest").unwrap();
        assert_eq!(db.user_for_token_hash("digest").unwrap(), Some(users[0].clone()));
        assert!(db.user_for_token_hash("other").unwrap().is_none());
    }

    #[test]
    fn test_ensure_room_keeps_first_owner() {
        let (db, users) = db_with_users(&["ada", "bob"]);
        let first = db.ensure_room("r1", &users[0].id).unwrap();
        let second = db.ensure_room("r1", &users[1].id).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.owner_id, users[0].id);
        assert_eq!(second.name, "Room r1");
    }

    #[test]
    fn test_join_twice_creates_one_membership() {
        let (db, users) = db_with_users(&["ada"]);
        db.ensure_and_join("r1", &users[0].id).unwrap();
        db.ensure_and_join("r1", &users[0].id).unwrap();
        assert_eq!(db.member_count("r1").unwrap(), 1);
    }

    #[test]
    fn test_leave_last_member_deletes_room() {
        let (db, users) = db_with_users(&["ada", "bob"]);
        db.ensure_and_join("r1", &users[0].id).unwrap();
        db.ensure_and_join("r1", &users[1].id).unwrap();

        let first = db.leave("r1", &users[0].id).unwrap();
        assert!(first.membership_removed);
        assert!(!first.room_deleted);
        assert!(db.get_room("r1").unwrap().is_some());

        let second = db.leave("r1", &users[1].id).unwrap();
        assert!(second.room_deleted);
        assert!(db.get_room("r1").unwrap().is_none());
    }

    #[test]
    fn test_leave_nonexistent_room_is_noop() {
        let (db, users) = db_with_users(&["ada"]);
        let outcome = db.leave("ghost", &users[0].id).unwrap();
        assert_eq!(
            outcome,
            LeaveOutcome {
                membership_removed: false,
                room_deleted: false
            }
        );
    }

    #[test]
    fn test_is_owner() {
        let (db, users) = db_with_users(&["ada", "bob"]);
        db.ensure_and_join("r1", &users[0].id).unwrap();
        db.ensure_and_join("r1", &users[1].id).unwrap();
        assert!(db.is_owner("r1", &users[0].id).unwrap());
        assert!(!db.is_owner("r1", &users[1].id).unwrap());
        assert!(!db.is_owner("ghost", &users[0].id).unwrap());
    }

    #[test]
    fn test_roster_flags_only_stored_owner_in_join_order() {
        let (db, users) = db_with_users(&["ada", "bob", "cy"]);
        db.ensure_and_join("r1", &users[1].id).unwrap();
        db.ensure_and_join("r1", &users[0].id).unwrap();
        db.ensure_and_join("r1", &users[2].id).unwrap();

        let roster = db.roster("r1").unwrap();
        let ids: Vec<&str> = roster.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec![users[1].id.as_str(), users[0].id.as_str(), users[2].id.as_str()]);
        let owners: Vec<bool> = roster.iter().map(|p| p.is_owner).collect();
        assert_eq!(owners, vec![true, false, false]);
    }

    #[test]
    fn test_rooms_for_user() {
        let (db, users) = db_with_users(&["ada"]);
        db.ensure_and_join("r1", &users[0].id).unwrap();
        db.ensure_and_join("r2", &users[0].id).unwrap();
        let rooms = db.rooms_for_user(&users[0].id).unwrap();
        let ids: Vec<&str> = rooms.iter().map(|r| r.room_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
        assert_eq!(rooms[1].name, "Room r2");
    }

    #[test]
    fn test_recent_activities_newest_first_and_limited() {
        let (db, users) = db_with_users(&["ada"]);
        let uid = &users[0].id;
        db.append_activity("r1", uid, ActivityAction::Joined, "2024-01-01 00:00:00.000").unwrap();
        db.append_activity("r1", uid, ActivityAction::EditedCode, "2024-01-01 00:00:01.000").unwrap();
        db.append_activity("r1", uid, ActivityAction::EditedCode, "2024-01-01 00:00:02.000").unwrap();

        let recent = db.recent_activities(uid, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].timestamp, "2024-01-01 00:00:02.000");
        assert_eq!(recent[1].action, ActivityAction::EditedCode);
    }

    #[test]
    fn test_chat_history_is_append_only_in_order() {
        let (db, _) = db_with_users(&[]);
        db.append_chat("r1", AI_SENDER, "answer", "t1").unwrap();
        db.append_chat("r1", "u1", "question", "t2").unwrap();
        let history = db.chat_history("r1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].sender_id, "AI");
        assert_eq!(history[1].message, "question");
    }

    #[tokio::test]
    async fn test_db_handle_call_runs_closure() {
        let handle = DbHandle::new(RoomDb::new_in_memory().unwrap());
        let user = handle
            .call(|db| db.create_user("ada@example.com", "ada", None))
            .await
            .unwrap()
            .unwrap();
        let fetched = handle
            .call(move |db| db.get_user(&user.id))
            .await
            .unwrap();
        assert!(fetched.is_some());
    }
}
