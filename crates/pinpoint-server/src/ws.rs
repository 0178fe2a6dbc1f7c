use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pinpoint_core::error::GameError;
use pinpoint_core::identity::Identity;
use pinpoint_core::lobby::LobbyId;
use pinpoint_core::net::messages::ServerMessage;
use pinpoint_core::net::protocol::encode_server_message;

use crate::auth::bearer_from_headers;
use crate::error::AppError;
use crate::hub::{Attached, Inbound, Session};
use crate::rate_limit::TokenBucket;
use crate::state::{AppState, ConnectionGuard};

/// `GET /ws/lobbies/{id}`. The bearer token comes from the `Authorization`
/// header or, for browsers, a `token` query parameter.
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(lobby_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let token = bearer_from_headers(&headers)
        .or_else(|| params.get("token").map(String::as_str))
        .ok_or_else(|| GameError::Unauthorized("missing bearer token".to_string()))?;
    let identity = state.verifier.verify(token)?;

    let lobby_id = LobbyId::parse(&lobby_id)
        .ok_or_else(|| GameError::not_found(format!("lobby {lobby_id}")))?;
    state.orchestrator.require(&lobby_id).await?;

    let max_ws = state.config.limits.max_ws_connections;
    let Some(guard) = ConnectionGuard::try_acquire(&state.ws_connection_count, max_ws) else {
        tracing::warn!(max = max_ws, "WS connection limit reached");
        return Err(GameError::Transient("connection limit reached".to_string()).into());
    };

    let max_frame = state.config.limits.max_frame_bytes;
    Ok(ws
        .max_message_size(max_frame.saturating_mul(2))
        .on_upgrade(move |socket| handle_socket(socket, state, lobby_id, identity, guard))
        .into_response())
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    lobby_id: LobbyId,
    identity: Identity,
    _guard: ConnectionGuard,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Attached { session, outbound } = match state.hub.attach(&lobby_id, &identity).await {
        Ok(attached) => attached,
        Err(e) => {
            tracing::warn!(lobby = %lobby_id, user_id = identity.user_id, error = %e, "Attach rejected");
            if let Ok(text) = encode_server_message(&ServerMessage::error(&e)) {
                let _ = ws_sender.send(Message::Text(text.into())).await;
            }
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        },
    };

    let writer = spawn_writer(ws_sender, outbound, session.cancel.clone());

    tokio::select! {
        () = read_loop(&mut ws_receiver, &state, &session) => {},
        () = session.cancel.cancelled() => {
            tracing::debug!(connection = %session.connection_id, "Connection closed by server");
        },
    }

    state.hub.detach(session.connection_id).await;
    if let Err(e) = writer.await {
        tracing::debug!(connection = %session.connection_id, error = %e, "Writer task ended abnormally");
    }
    tracing::info!(
        lobby = %lobby_id,
        user_id = identity.user_id,
        connection = %session.connection_id,
        "Connection closed"
    );
}

/// Forward queued frames to the socket. On cancellation, frames already
/// queued are still flushed before the close frame.
fn spawn_writer(
    mut ws_sender: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                frame = rx.recv() => frame,
                () = cancel.cancelled() => None,
            };
            let Some(frame) = frame else { break };
            if ws_sender.send(to_message(frame)).await.is_err() {
                cancel.cancel();
                return;
            }
        }
        while let Ok(frame) = rx.try_recv() {
            if ws_sender.send(to_message(frame)).await.is_err() {
                return;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    })
}

fn to_message(frame: Bytes) -> Message {
    match String::from_utf8(frame.to_vec()) {
        Ok(text) => Message::Text(text.into()),
        Err(e) => Message::Binary(e.into_bytes().into()),
    }
}

async fn read_loop(
    ws_receiver: &mut futures::stream::SplitStream<WebSocket>,
    state: &AppState,
    conn: &Session,
) {
    let limits = &state.config.limits;
    let mut rate_limiter = TokenBucket::per_second(limits.ws_rate_limit_per_sec);

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };

        if text.is_empty() {
            continue;
        }

        // Drop oversized frames
        if text.len() > limits.max_frame_bytes {
            tracing::warn!(connection = %conn.connection_id, size = text.len(), "Oversized frame dropped");
            continue;
        }

        if !rate_limiter.allow() {
            tracing::warn!(connection = %conn.connection_id, user_id = conn.user_id, "Rate limited");
            continue;
        }

        if state.hub.dispatch(conn, text.as_str()).await == Inbound::Close {
            break;
        }
    }
}
