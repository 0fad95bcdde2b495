//! services/api/src/web/ws_handler.rs
//!
//! This is the main entry point and control loop for a chat WebSocket.
//! One session runs three workers: the read loop below, a writer that owns
//! the socket sink, and the keep-alive pinger.

use crate::web::{
    keepalive_task::keepalive_process,
    protocol::{ChatEntry, Outbound},
    registry::SessionHandle,
    state::{AppState, SessionContext},
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension,
};
use bytes::Bytes;
use couple_chat_core::Identity;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::{fmt::Display, sync::Arc};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

/// The handler for upgrading HTTP requests to WebSocket connections.
/// Upgrades are only accepted from the configured browser origin.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    headers: HeaderMap,
) -> Response {
    // 1. Check the page origin; CORS does not apply to upgrades.
    if !origin_allowed(&headers, &app_state.config.allowed_origin) {
        warn!(
            identity = %identity,
            origin = ?headers.get(header::ORIGIN),
            "WebSocket upgrade from a foreign origin rejected"
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    // 2. Hand the socket over to the session workers.
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, identity))
}

fn origin_allowed(headers: &HeaderMap, allowed: &str) -> bool {
    headers
        .get(header::ORIGIN)
        .and_then(|origin| origin.to_str().ok())
        .is_some_and(|origin| origin == allowed)
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, identity: Identity) {
    info!(identity = %identity, "New WebSocket connection established");

    let (sink, stream) = socket.split();
    let (session, rx) = SessionHandle::new(identity);
    let writer = tokio::spawn(writer_process(sink, rx, session.clone()));

    run_session(app_state, session, stream).await;

    if let Err(e) = writer.await {
        error!(identity = %identity, "Writer task panicked: {:?}", e);
    }
    info!(identity = %identity, "WebSocket connection closed");
}

/// Drains the session's queue onto the socket until the session is closed.
/// A failed write closes the session.
pub async fn writer_process<S>(mut sink: S, mut rx: UnboundedReceiver<Outbound>, session: SessionHandle)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        let frame = tokio::select! {
            _ = session.token().cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let message = match frame.to_json() {
            Ok(Some(json)) => Message::Text(json.into()),
            Ok(None) => Message::Ping(Bytes::new()),
            Err(e) => {
                error!(identity = %session.identity(), "Failed to serialize frame: {}", e);
                continue;
            }
        };

        if let Err(e) = sink.send(message).await {
            warn!(identity = %session.identity(), "Socket write failed: {}", e);
            session.close();
            break;
        }
    }

    if let Err(e) = sink.close().await {
        debug!(identity = %session.identity(), "Socket close failed: {}", e);
    }
}

/// Registers the session, establishes its context, replays history, then relays
/// inbound frames until the socket ends or the session is closed.
pub async fn run_session<S>(app_state: Arc<AppState>, session: SessionHandle, mut inbound: S)
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    // --- 1. Registration Phase ---
    let identity = session.identity();
    app_state.registry.register(session.clone()).await;

    if session.send(Outbound::identity(identity)).is_err() {
        end_session(&app_state, &session).await;
        return;
    }

    // --- 2. Establishment Phase ---
    let ctx = match SessionContext::establish(&app_state, identity).await {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!(identity = %identity, "Session has no connection, closing: {}", e);
            end_session(&app_state, &session).await;
            return;
        }
    };
    info!(identity = %identity, connection_id = %ctx.connection_id(), order = ?ctx.order, "Session established");

    send_history(&app_state, &session, &ctx).await;

    // --- 3. Keep-alive Worker ---
    let keepalive_token = session.token().child_token();
    let keepalive = tokio::spawn(keepalive_process(
        session.clone(),
        app_state.config.keepalive_interval,
        keepalive_token.clone(),
    ));

    // --- 4. Read Loop ---
    loop {
        tokio::select! {
            _ = session.token().cancelled() => {
                info!(identity = %identity, "Session closed or superseded");
                break;
            }
            next = inbound.next() => match next {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<Vec<ChatEntry>>(text.as_str()) {
                        Ok(entries) => app_state.relay.handle_inbound(&ctx, entries).await,
                        Err(e) => warn!(identity = %identity, "Skipping unparseable chat frame: {}", e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(identity = %identity, "Client disconnected");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(identity = %identity, "Socket read failed: {}", e);
                    break;
                }
            }
        }
    }

    // --- 5. Cleanup Phase ---
    keepalive_token.cancel();
    if let Err(e) = keepalive.await {
        error!(identity = %identity, "Keep-alive task panicked: {:?}", e);
    }
    end_session(&app_state, &session).await;
}

/// Sends the stored backlog as one frame, then the question still awaiting this party's answer.
async fn send_history(app_state: &AppState, session: &SessionHandle, ctx: &SessionContext) {
    match app_state
        .messages
        .list_by_connection(ctx.pairing.first, ctx.pairing.second)
        .await
    {
        Ok(messages) if !messages.is_empty() => {
            let backlog = messages.into_iter().map(ChatEntry::from).collect();
            if session.send(Outbound::Chat(backlog)).is_err() {
                return;
            }
        }
        Ok(_) => {}
        Err(e) => error!(connection_id = %ctx.connection_id(), "Failed to load chat backlog: {}", e),
    }

    if let Some(question) = app_state.questions.pending_question(ctx).await {
        let _ = session.send(Outbound::single(question));
    }
}

async fn end_session(app_state: &AppState, session: &SessionHandle) {
    session.close();
    app_state.registry.release(session).await;
}
