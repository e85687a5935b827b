//! Append-only activity and chat log writer.
//!
//! Handlers enqueue records and move on; a single background task drains the
//! queue in batches and writes them to the database. A failed write is
//! retried once, then logged and dropped. Nothing here ever reaches a room's
//! live traffic.

use coderoom_common::ActivityAction;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::db::{DbHandle, RoomDb, timestamp_now};

const MAX_BATCH: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Activity {
        room_id: String,
        user_id: String,
        action: ActivityAction,
        timestamp: String,
    },
    Chat {
        room_id: String,
        sender_id: String,
        message: String,
        timestamp: String,
    },
}

impl Record {
    fn write(&self, db: &RoomDb) -> anyhow::Result<()> {
        match self {
            Self::Activity {
                room_id,
                user_id,
                action,
                timestamp,
            } => db.append_activity(room_id, user_id, *action, timestamp),
            Self::Chat {
                room_id,
                sender_id,
                message,
                timestamp,
            } => db.append_chat(room_id, sender_id, message, timestamp),
        }
    }

    fn room_id(&self) -> &str {
        match self {
            Self::Activity { room_id, .. } | Self::Chat { room_id, .. } => room_id,
        }
    }
}

enum Command {
    Append(Record),
    Flush(oneshot::Sender<()>),
}

/// Cheap, cloneable handle to the writer task.
#[derive(Clone)]
pub struct Recorder {
    tx: mpsc::UnboundedSender<Command>,
}

impl Recorder {
    /// Start the writer task. It exits once every `Recorder` clone is dropped
    /// and the queue is drained.
    pub fn spawn(db: DbHandle) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(db, rx));
        (Self { tx }, handle)
    }

    pub fn activity(&self, room_id: &str, user_id: &str, action: ActivityAction) {
        self.enqueue(Record::Activity {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            action,
            timestamp: timestamp_now(),
        });
    }

    pub fn chat(&self, room_id: &str, sender_id: &str, message: &str) {
        self.enqueue(Record::Chat {
            room_id: room_id.to_string(),
            sender_id: sender_id.to_string(),
            message: message.to_string(),
            timestamp: timestamp_now(),
        });
    }

    fn enqueue(&self, record: Record) {
        if self.tx.send(Command::Append(record)).is_err() {
            warn!("[recorder] writer stopped, record dropped");
        }
    }

    /// Wait until everything enqueued before this call has been written (or
    /// dropped after its retry).
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_writer(db: DbHandle, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut batch = Vec::new();
    let mut waiters = Vec::new();

    while let Some(command) = rx.recv().await {
        push(command, &mut batch, &mut waiters);
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(command) => push(command, &mut batch, &mut waiters),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            write_batch(&db, std::mem::take(&mut batch)).await;
        }
        for waiter in waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
    debug!("[recorder] writer stopped");
}

fn push(command: Command, batch: &mut Vec<Record>, waiters: &mut Vec<oneshot::Sender<()>>) {
    match command {
        Command::Append(record) => batch.push(record),
        Command::Flush(done) => waiters.push(done),
    }
}

async fn write_batch(db: &DbHandle, batch: Vec<Record>) {
    let count = batch.len();
    let result = db
        .call(move |db| {
            let mut dropped = Vec::new();
            for record in batch {
                if let Err(first) = record.write(db) {
                    if let Err(second) = record.write(db) {
                        dropped.push((record, format!("{:#} (first attempt: {:#})", second, first)));
                    }
                }
            }
            Ok(dropped)
        })
        .await;

    match result {
        Ok(dropped) => {
            for (record, error) in &dropped {
                warn!(room_id = record.room_id(), "[recorder] dropped record after retry: {}", error);
            }
            debug!(written = count - dropped.len(), dropped = dropped.len(), "[recorder] batch flushed");
        }
        Err(e) => warn!(count, "[recorder] batch lost: {:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (DbHandle, String) {
        let db = RoomDb::new_in_memory().unwrap();
        let user = db.create_user("ada@example.com", "Ada", None).unwrap().unwrap();
        db.ensure_and_join("r1", &user.id).unwrap();
        (DbHandle::new(db), user.id)
    }

    #[tokio::test]
    async fn test_records_are_written_in_order() {
        let (db, user) = setup();
        let (recorder, _handle) = Recorder::spawn(db.clone());

        recorder.activity("r1", &user, ActivityAction::Joined);
        recorder.activity("r1", &user, ActivityAction::EditedCode);
        recorder.chat("r1", &user, "first");
        recorder.chat("r1", &user, "second");
        recorder.flush().await;

        let guard = db.lock_sync().unwrap();
        let activities = guard.recent_activities(&user, 20).unwrap();
        assert_eq!(activities.len(), 2);
        assert_eq!(activities[0].action, ActivityAction::EditedCode);
        assert_eq!(activities[1].action, ActivityAction::Joined);

        let chat = guard.chat_history("r1").unwrap();
        let messages: Vec<_> = chat.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_large_backlog_is_fully_written() {
        let (db, user) = setup();
        let (recorder, _handle) = Recorder::spawn(db.clone());
        for i in 0..(MAX_BATCH * 3 + 7) {
            recorder.chat("r1", &user, &format!("m{}", i));
        }
        recorder.flush().await;
        let count = db.lock_sync().unwrap().chat_history("r1").unwrap().len();
        assert_eq!(count, MAX_BATCH * 3 + 7);
    }

    #[tokio::test]
    async fn test_failed_writes_are_dropped_without_stopping_writer() {
        let (db, user) = setup();
        let (recorder, _handle) = Recorder::spawn(db.clone());
        db.lock_sync().unwrap().execute_raw("DROP TABLE activities").unwrap();

        recorder.activity("r1", &user, ActivityAction::Joined);
        recorder.chat("r1", &user, "still saved");
        recorder.flush().await;

        let chat = db.lock_sync().unwrap().chat_history("r1").unwrap();
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].message, "still saved");
    }

    #[tokio::test]
    async fn test_writer_exits_when_handles_dropped() {
        let (db, _user) = setup();
        let (recorder, handle) = Recorder::spawn(db);
        drop(recorder);
        handle.await.unwrap();
    }
}
