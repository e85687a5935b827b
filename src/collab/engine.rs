//! Room event handling.
//!
//! `RoomEngine` ties the registry, the live connection set, the sandbox, the
//! recorder and the assistant together. Every inbound event goes through
//! [`RoomEngine::handle_event`]; failures are answered to the calling
//! connection only and never escape to the socket loop.

use std::sync::Arc;

use coderoom_common::{
    AI_SENDER, ActivityAction, ClientEvent, Participant, Room, ServerEvent, User,
    ValidationError, validate_room_id,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::assistant::{Assistant, DISABLED_MESSAGE, failure_message};
use super::auth::Session;
use super::db::LeaveOutcome;
use super::presence::{ConnId, ConnectionRegistry};
use super::recorder::Recorder;
use super::registry::{RoomRegistry, generate_room_id};
use super::sandbox::Sandbox;
use crate::errors::CollabError;

/// Why a user is leaving a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// `leave_room_event` sent on this connection.
    Left(ConnId),
    /// This connection closed. Membership is kept while another connection
    /// of the same user is present in the room.
    Closed(ConnId),
    /// Leave requested outside a socket.
    Request,
}

pub struct RoomEngine {
    registry: RoomRegistry,
    connections: ConnectionRegistry,
    recorder: Recorder,
    sandbox: Sandbox,
    assistant: Option<Arc<dyn Assistant>>,
}

impl RoomEngine {
    pub fn new(
        registry: RoomRegistry,
        connections: ConnectionRegistry,
        recorder: Recorder,
        sandbox: Sandbox,
        assistant: Option<Arc<dyn Assistant>>,
    ) -> Self {
        Self {
            registry,
            connections,
            recorder,
            sandbox,
            assistant,
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Register a new live connection for `user` (or an anonymous one).
    pub fn connect(&self, user: Option<User>) -> (Session, mpsc::Receiver<String>) {
        let (conn_id, rx) = self
            .connections
            .register(user.as_ref().map(|u| u.id.clone()));
        debug!(conn_id, user = ?user.as_ref().map(|u| &u.id), "[engine] connection registered");
        (Session { conn_id, user }, rx)
    }

    /// Parse one text frame. Anonymous sessions are refused before the frame
    /// is looked at.
    pub fn decode(&self, session: &Session, frame: &str) -> Result<ClientEvent, CollabError> {
        session.require_user()?;
        serde_json::from_str(frame).map_err(|e| CollabError::MalformedFrame(e.to_string()))
    }

    /// Handle one event, replying to the caller on failure.
    pub async fn handle_event(&self, session: &Session, event: ClientEvent) {
        let name = event.name();
        debug!(conn_id = session.conn_id, event = name, room_id = event.room_id(), "[engine] handling event");
        let result = match event {
            ClientEvent::Join { room_id } => self.join(session, &room_id).await,
            ClientEvent::LeaveRoom { room_id } => self.leave(session, &room_id).await,
            ClientEvent::TextChange { room_id, content } => {
                self.text_change(session, &room_id, content)
            }
            ClientEvent::RunCode {
                room_id,
                code,
                input,
            } => self.run_code(session, &room_id, &code, &input).await,
            ClientEvent::GeneralChatMessage { room_id, message } => {
                self.chat(session, &room_id, &message)
            }
            ClientEvent::ChatbotRequest {
                room_id,
                query,
                code,
            } => self.chatbot(session, &room_id, &query, &code).await,
        };
        if let Err(err) = result {
            debug!(conn_id = session.conn_id, event = name, "[engine] event rejected: {}", err);
            self.reject(session, &err);
        }
    }

    /// Send the reply for a failed event to the calling connection.
    pub fn reject(&self, session: &Session, err: &CollabError) {
        let event = match err {
            CollabError::Unauthorized => ServerEvent::Unauthorized {
                msg: err.to_string(),
            },
            CollabError::Database(_) | CollabError::Other(_) => {
                warn!(conn_id = session.conn_id, "[engine] event failed: {:#}", err);
                ServerEvent::Error {
                    msg: err.client_message(),
                }
            }
            _ => ServerEvent::Error {
                msg: err.client_message(),
            },
        };
        self.connections.send_to(session.conn_id, &event);
    }

    pub async fn join(&self, session: &Session, room_id: &str) -> Result<(), CollabError> {
        let user = session.require_user()?;
        let room_id = validate_room_id(room_id)?;

        let guard = self.registry.lock_room(room_id).await;
        let result = async {
            self.registry.join(room_id, &user.id).await?;
            self.connections.join_room(session.conn_id, room_id);
            self.broadcast_roster(room_id, &user.id).await
        }
        .await;
        drop(guard);
        self.registry.release_lock(room_id);
        result?;

        info!(room_id, user_id = %user.id, "[engine] user joined room");
        self.recorder.activity(room_id, &user.id, ActivityAction::Joined);
        Ok(())
    }

    pub async fn leave(&self, session: &Session, room_id: &str) -> Result<(), CollabError> {
        let user = session.require_user()?;
        let room_id = validate_room_id(room_id)?;
        self.depart(user, room_id, Departure::Left(session.conn_id))
            .await?;
        Ok(())
    }

    /// Remove `user` from the room, deleting it if it ends up empty, and
    /// broadcast the new roster to whoever is still present.
    pub async fn depart(
        &self,
        user: &User,
        room_id: &str,
        departure: Departure,
    ) -> Result<LeaveOutcome, CollabError> {
        let guard = self.registry.lock_room(room_id).await;
        let result = async {
            match departure {
                Departure::Left(conn) => self.connections.leave_room(conn, room_id),
                Departure::Closed(conn) => {
                    if self
                        .connections
                        .user_has_other_connection(room_id, &user.id, conn)
                    {
                        return Ok(LeaveOutcome::default());
                    }
                }
                Departure::Request => {}
            }
            let outcome = self.registry.leave(room_id, &user.id).await?;
            self.broadcast_roster(room_id, &user.id).await?;
            Ok::<_, CollabError>(outcome)
        }
        .await;
        drop(guard);
        self.registry.release_lock(room_id);

        let outcome = result?;
        if outcome.room_deleted {
            info!(room_id, "[engine] last member left, room deleted");
        } else if outcome.membership_removed {
            info!(room_id, user_id = %user.id, "[engine] user left room");
        }
        Ok(outcome)
    }

    pub fn text_change(
        &self,
        session: &Session,
        room_id: &str,
        content: Value,
    ) -> Result<(), CollabError> {
        let user = session.require_user()?;
        let room_id = self.present_room(session, room_id)?;
        self.connections.broadcast(
            room_id,
            &ServerEvent::RemoteChange {
                content,
                sender: user.id.clone(),
            },
            Some(session.conn_id),
        );
        self.recorder
            .activity(room_id, &user.id, ActivityAction::EditedCode);
        Ok(())
    }

    pub async fn run_code(
        &self,
        session: &Session,
        room_id: &str,
        code: &str,
        input: &str,
    ) -> Result<(), CollabError> {
        let user = session.require_user()?;
        let room_id = self.present_room(session, room_id)?;

        let result = self.sandbox.execute(code, input).await;
        debug!(room_id, user_id = %user.id, failed = result.is_error(), "[engine] code run finished");
        self.connections.broadcast(
            room_id,
            &ServerEvent::CodeOutput {
                output: result.into_message(),
                sender: user.id.clone(),
            },
            None,
        );
        Ok(())
    }

    pub fn chat(&self, session: &Session, room_id: &str, message: &str) -> Result<(), CollabError> {
        let user = session.require_user()?;
        let room_id = validate_room_id(room_id)?;
        if message.trim().is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        let room_id = self.present_room(session, room_id)?;
        self.connections.broadcast(
            room_id,
            &ServerEvent::NewGeneralChatMessage {
                sender_name: user.name.clone(),
                message: message.to_string(),
            },
            None,
        );
        Ok(())
    }

    pub async fn chatbot(
        &self,
        session: &Session,
        room_id: &str,
        query: &str,
        code: &str,
    ) -> Result<(), CollabError> {
        let user = session.require_user()?;
        let room_id = self.present_room(session, room_id)?;

        let response = match &self.assistant {
            None => ServerEvent::ChatbotResponse {
                user_name: AI_SENDER.to_string(),
                query: query.to_string(),
                ai_response: DISABLED_MESSAGE.to_string(),
            },
            Some(assistant) => match assistant.ask(query, code).await {
                Ok(answer) => {
                    self.recorder.chat(room_id, AI_SENDER, &answer);
                    self.recorder.chat(room_id, &user.id, query);
                    ServerEvent::ChatbotResponse {
                        user_name: user.name.clone(),
                        query: query.to_string(),
                        ai_response: answer,
                    }
                }
                Err(e) => {
                    warn!(room_id, model = assistant.model(), "[engine] assistant request failed: {}", e);
                    ServerEvent::ChatbotResponse {
                        user_name: AI_SENDER.to_string(),
                        query: query.to_string(),
                        ai_response: failure_message(&e, assistant.model()),
                    }
                }
            },
        };
        self.connections.broadcast(room_id, &response, None);
        Ok(())
    }

    /// Clean up after a closed socket. For every room the user is a member
    /// of, and not still present in through another connection, the user
    /// leaves as if they had sent `leave_room_event`.
    pub async fn disconnect(&self, session: &Session) {
        let present = self.connections.unregister(session.conn_id);
        let Some(user) = &session.user else {
            return;
        };

        let rooms = match self.registry.rooms_for_user(&user.id).await {
            Ok(memberships) => memberships.into_iter().map(|m| m.room_id).collect(),
            Err(e) => {
                warn!(user_id = %user.id, "[engine] could not list memberships on disconnect: {}", e);
                present
            }
        };

        for room_id in rooms {
            if let Err(e) = self
                .depart(user, &room_id, Departure::Closed(session.conn_id))
                .await
            {
                warn!(room_id = %room_id, user_id = %user.id, "[engine] disconnect cleanup failed: {}", e);
            }
        }
        debug!(conn_id = session.conn_id, "[engine] connection closed");
    }

    /// Join a room outside of a socket (HTTP). A missing or blank id gets a
    /// generated one.
    pub async fn admit(&self, user: &User, room_id: Option<&str>) -> Result<Room, CollabError> {
        let room_id = match room_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => generate_room_id(),
        };

        let guard = self.registry.lock_room(&room_id).await;
        let result = async {
            let room = self.registry.join(&room_id, &user.id).await?;
            self.broadcast_roster(&room_id, &user.id).await?;
            Ok::<_, CollabError>(room)
        }
        .await;
        drop(guard);
        self.registry.release_lock(&room_id);
        result
    }

    pub async fn compute_roster(&self, room_id: &str) -> Result<Vec<Participant>, CollabError> {
        self.registry.roster(room_id).await
    }

    async fn broadcast_roster(&self, room_id: &str, sender: &str) -> Result<(), CollabError> {
        let participants = self.compute_roster(room_id).await?;
        self.connections.broadcast(
            room_id,
            &ServerEvent::ParticipantsUpdate {
                participants,
                sender: sender.to_string(),
            },
            None,
        );
        Ok(())
    }

    /// Validate `room_id` and require this connection to have joined it.
    fn present_room<'a>(&self, session: &Session, room_id: &'a str) -> Result<&'a str, CollabError> {
        let room_id = validate_room_id(room_id)?;
        if !self.connections.is_in_room(session.conn_id, room_id) {
            return Err(CollabError::NotInRoom {
                room_id: room_id.to_string(),
            });
        }
        Ok(room_id)
    }
}
