use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use coderoom_common::ClientEvent;
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::api::{ApiError, SharedState};
use super::auth::{Session, authenticate};
use super::engine::RoomEngine;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

// ── WebSocket handler ────────────────────────────────────────────────

/// Upgrade to a room socket. A missing or unknown token still connects, as
/// an anonymous session whose every event is answered with `unauthorized`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let user = authenticate(&state.db, query.token.as_deref()).await?;
    let engine = state.engine.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let (session, rx) = engine.connect(user);
        let (sender, receiver) = socket.split();
        run_socket_loop(&engine, &session, sender, receiver, rx).await;
        engine.disconnect(&session).await;
    }))
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines outbound queue forwarding, client frame handling, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    engine: &Arc<RoomEngine>,
    session: &Session,
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: mpsc::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!(conn_id = session.conn_id, "[ws] pong timeout");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Outbound queue ──────────────────────────────────────
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if sender.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // ── Client frames ───────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(engine, session, text.as_str()).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary and Ping frames carry no room events
                    }
                    Some(Err(e)) => {
                        debug!(conn_id = session.conn_id, "[ws] receive error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

/// Decode and handle one text frame. Code runs and assistant requests are
/// spawned so a slow one does not hold up the connection's other events.
async fn dispatch(engine: &Arc<RoomEngine>, session: &Session, frame: &str) {
    let event = match engine.decode(session, frame) {
        Ok(event) => event,
        Err(err) => {
            engine.reject(session, &err);
            return;
        }
    };

    if is_long_running(&event) {
        let engine = engine.clone();
        let session = session.clone();
        tokio::spawn(async move {
            engine.handle_event(&session, event).await;
        });
    } else {
        engine.handle_event(session, event).await;
    }
}

fn is_long_running(event: &ClientEvent) -> bool {
    matches!(
        event,
        ClientEvent::RunCode { .. } | ClientEvent::ChatbotRequest { .. }
    )
}

// ── Tests ────────────────────────────────────────────────────────────
