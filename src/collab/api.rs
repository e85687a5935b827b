use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use coderoom_common::{ActivityRecord, Participant, Room, RoomMembership, User};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::auth::{authenticate, bearer_token, issue_session};
use super::db::DbHandle;
use super::engine::{Departure, RoomEngine};
use crate::errors::CollabError;

/// Activities returned with the profile view.
const PROFILE_ACTIVITY_LIMIT: u32 = 20;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub engine: Arc<RoomEngine>,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payload types ──────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub name: String,
    pub avatar: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct RegisterResponse {
    pub user: User,
    pub token: String,
}

#[derive(Deserialize, Default)]
pub struct CreateRoomRequest {
    #[serde(default)]
    pub room_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct RoomView {
    #[serde(flatten)]
    pub room: Room,
    pub is_owner: bool,
}

#[derive(Serialize, Deserialize)]
pub struct ProfileView {
    pub user: User,
    pub rooms: Vec<RoomMembership>,
    pub activities: Vec<ActivityRecord>,
}

#[derive(Serialize, Deserialize)]
pub struct LeaveView {
    pub left: bool,
    pub room_deleted: bool,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<CollabError> for ApiError {
    fn from(err: CollabError) -> Self {
        match err {
            CollabError::Unauthorized => ApiError::Unauthorized(err.to_string()),
            CollabError::RoomNotFound { .. } => ApiError::NotFound(err.to_string()),
            CollabError::IntegrityConflict(msg) => ApiError::Conflict(msg),
            CollabError::Validation(_)
            | CollabError::MalformedFrame(_)
            | CollabError::NotInRoom { .. } => ApiError::BadRequest(err.to_string()),
            CollabError::Database(_) | CollabError::Other(_) => {
                warn!("[api] request failed: {:#}", err);
                ApiError::Internal(err.client_message())
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        CollabError::Database(err).into()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/users", post(register_user))
        .route("/api/profile", get(get_profile))
        .route("/api/rooms", post(create_room))
        .route("/api/rooms/{id}", get(get_room))
        .route("/api/rooms/{id}/participants", get(get_participants))
        .route("/api/rooms/{id}/leave", post(leave_room))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

async fn require_user(state: &SharedState, headers: &HeaderMap) -> Result<User, ApiError> {
    authenticate(&state.db, bearer_token(headers))
        .await?
        .ok_or_else(|| CollabError::Unauthorized.into())
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !email.contains(' '),
        None => false,
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn register_user(
    State(state): State<SharedState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = req.email.trim().to_lowercase();
    let name = req.name.trim().to_string();
    if !looks_like_email(&email) {
        return Err(ApiError::BadRequest("A valid email is required".into()));
    }
    if name.is_empty() {
        return Err(ApiError::BadRequest("name is required".into()));
    }

    let avatar = req.avatar.filter(|a| !a.trim().is_empty());
    let user = state
        .db
        .call(move |db| db.create_user(&email, &name, avatar.as_deref()))
        .await?
        .ok_or_else(|| CollabError::IntegrityConflict("Email already registered".into()))?;
    let token = issue_session(&state.db, &user.id).await?;

    Ok((StatusCode::CREATED, Json(RegisterResponse { user, token })))
}

async fn get_profile(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<ProfileView>, ApiError> {
    let user = require_user(&state, &headers).await?;
    let user_id = user.id.clone();
    let (rooms, activities) = state
        .db
        .call(move |db| {
            Ok((
                db.rooms_for_user(&user_id)?,
                db.recent_activities(&user_id, PROFILE_ACTIVITY_LIMIT)?,
            ))
        })
        .await?;
    Ok(Json(ProfileView {
        user,
        rooms,
        activities,
    }))
}

async fn create_room(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateRoomRequest>,
) -> Result<Json<RoomView>, ApiError> {
    let user = require_user(&state, &headers).await?;
    let room = state.engine.admit(&user, req.room_id.as_deref()).await?;
    let is_owner = room.owner_id == user.id;
    Ok(Json(RoomView { room, is_owner }))
}

async fn get_room(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<RoomView>, ApiError> {
    let user = require_user(&state, &headers).await?;
    let room = state.engine.registry().get_room(&id).await?;
    let is_owner = state.engine.registry().is_owner(&id, &user.id).await?;
    Ok(Json(RoomView { room, is_owner }))
}

async fn get_participants(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<Participant>>, ApiError> {
    require_user(&state, &headers).await?;
    state.engine.registry().get_room(&id).await?;
    Ok(Json(state.engine.compute_roster(&id).await?))
}

async fn leave_room(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<LeaveView>, ApiError> {
    let user = require_user(&state, &headers).await?;
    let outcome = state.engine.depart(&user, &id, Departure::Request).await?;
    Ok(Json(LeaveView {
        left: outcome.membership_removed,
        room_deleted: outcome.room_deleted,
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────
