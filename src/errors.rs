//! Typed error hierarchy for the collaboration server.
//!
//! `CollabError` covers every failure a room event handler can hit. Handlers
//! never let one escape to the socket loop: each variant is turned into a
//! reply to the caller (`unauthorized` or `error`) or a log line.

use coderoom_common::ValidationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollabError {
    /// Caller has no authenticated session.
    #[error("Please login")]
    Unauthorized,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Frame that is not a known `{"event", "data"}` pair.
    #[error("Malformed event: {0}")]
    MalformedFrame(String),

    #[error("Join room {room_id} before sending events to it")]
    NotInRoom { room_id: String },

    #[error("Room {room_id} not found")]
    RoomNotFound { room_id: String },

    /// Duplicate unique key, e.g. an e-mail that is already registered.
    #[error("{0}")]
    IntegrityConflict(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CollabError {
    /// Message safe to show to the connection that triggered the error.
    pub fn client_message(&self) -> String {
        match self {
            Self::Database(_) | Self::Other(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}
