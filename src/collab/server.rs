use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::api::{self, AppState, SharedState};
use super::assistant::{Assistant, OllamaAssistant};
use super::db::{DbHandle, RoomDb};
use super::engine::RoomEngine;
use super::presence::ConnectionRegistry;
use super::recorder::Recorder;
use super::registry::RoomRegistry;
use super::sandbox::Sandbox;
use super::ws;
use crate::config::ServerConfig;

/// How long shutdown waits for the recorder writer after the final flush.
const RECORDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the full application router with the JSON API and the room socket.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open the database at the configured path, creating parent directories.
pub fn open_database(config: &ServerConfig) -> Result<RoomDb> {
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    RoomDb::new(&config.db_path).context("Failed to initialize room database")
}

/// Wire the engine and shared state around an open database. The returned
/// handle is the recorder's writer task.
pub fn build_state(db: DbHandle, config: &ServerConfig) -> Result<(SharedState, Recorder, JoinHandle<()>)> {
    let (recorder, writer) = Recorder::spawn(db.clone());

    let assistant: Option<Arc<dyn Assistant>> = if config.assistant.enabled {
        let client = OllamaAssistant::new(&config.assistant)
            .context("Failed to build assistant HTTP client")?;
        info!(url = %config.assistant.url, model = %config.assistant.model, "assistant relay enabled");
        Some(Arc::new(client))
    } else {
        None
    };

    let engine = RoomEngine::new(
        RoomRegistry::new(db.clone()),
        ConnectionRegistry::new(config.outbound_queue),
        recorder.clone(),
        Sandbox::from_config(config.sandbox.clone()),
        assistant,
    );
    let state = Arc::new(AppState {
        db,
        engine: Arc::new(engine),
    });
    Ok((state, recorder, writer))
}

/// Start the server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let db = DbHandle::new(open_database(&config)?);
    let (state, recorder, writer) = build_state(db, &config)?;

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!("coderoom listening on http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    drain_recorder(recorder, writer, RECORDER_DRAIN_TIMEOUT).await;
    info!("server shut down gracefully");
    Ok(())
}

/// Flush pending records and wait up to `grace` for the writer task to end.
/// Upgraded sockets still hold the engine, and with it a recorder clone, so
/// the writer may outlive the listener. Returns whether it finished.
pub async fn drain_recorder(recorder: Recorder, writer: JoinHandle<()>, grace: Duration) -> bool {
    recorder.flush().await;
    drop(recorder);
    match tokio::time::timeout(grace, writer).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("recorder task ended abnormally: {}", e);
            true
        }
        Err(_) => {
            warn!("recorder still in use by open connections, not waiting for it");
            false
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use coderoom_common::ActivityAction;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let db = DbHandle::new(RoomDb::new_in_memory().unwrap());
        let (state, _recorder, _writer) = build_state(db, &ServerConfig::default()).unwrap();
        build_router(state)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let app = test_router();
        let req = Request::builder()
            .uri("/ws?token=abc")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let app = test_router();
        let req = Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_enabled_assistant_builds() {
        let db = DbHandle::new(RoomDb::new_in_memory().unwrap());
        let mut config = ServerConfig::default();
        config.assistant.enabled = true;
        assert!(build_state(db, &config).is_ok());
    }

    #[tokio::test]
    async fn test_drain_recorder_returns_while_engine_is_still_held() {
        let db = DbHandle::new(RoomDb::new_in_memory().unwrap());
        let (state, recorder, writer) = build_state(db.clone(), &ServerConfig::default()).unwrap();
        // An open socket task keeps its own engine handle past shutdown.
        let socket_engine = state.engine.clone();
        socket_engine
            .recorder()
            .activity("r1", "u1", ActivityAction::Joined);

        let finished = tokio::time::timeout(
            Duration::from_secs(3),
            drain_recorder(recorder, writer, Duration::from_millis(100)),
        )
        .await
        .expect("drain_recorder must not wait on live engine handles");
        assert!(!finished);

        let activities = db.lock_sync().unwrap().recent_activities("u1", 20).unwrap();
        assert_eq!(activities.len(), 1);
        drop(socket_engine);
    }

    #[tokio::test]
    async fn test_drain_recorder_waits_for_writer_once_released() {
        let db = DbHandle::new(RoomDb::new_in_memory().unwrap());
        let (state, recorder, writer) = build_state(db, &ServerConfig::default()).unwrap();
        drop(state);
        assert!(drain_recorder(recorder, writer, Duration::from_secs(3)).await);
    }

    #[test]
    fn test_open_database_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            db_path: dir.path().join("nested").join("rooms.db"),
            ..ServerConfig::default()
        };
        open_database(&config).unwrap();
        assert!(config.db_path.exists());
    }
}
