//! WebSocket handler for client sessions.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;

use chat_relay_common::{ErrorNotice, SessionRequest, TIMEOUT_NOTICE};

use super::transcript::{PendingExchange, Transcript};
use crate::auth::{bearer_token, AuthError, Identity};
use crate::error::Error;
use crate::AppState;

const INVALID_JSON: &str = "Invalid JSON format";
const CHAT_CREATE_FAILED: &str = "Failed to add chat to user.";
const CHAT_NOT_FOUND: &str = "Chat not found";
const QUERY_FAILED: &str = "Model query failed.";

/// WebSocket upgrade handler.
///
/// A bearer header, when present, must be valid before the upgrade is
/// accepted. Without it the token is taken from the session message.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let identity = match bearer_token(&headers) {
        Ok(Some(token)) => match state.verifier.verify(token) {
            Ok(identity) => Some(identity),
            Err(e) => return Error::Unauthorized(e).into_response(),
        },
        Ok(None) => None,
        Err(e) => return Error::Unauthorized(e).into_response(),
    };

    ws.on_upgrade(move |socket| handle_session(socket, state, identity))
}

/// Serve one query on an upgraded connection.
async fn handle_session(socket: WebSocket, state: Arc<AppState>, identity: Option<Identity>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let handshake_timeout = state.config.session.handshake_timeout();
    let request = match timeout(handshake_timeout, ws_rx.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<SessionRequest>(&text) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Failed to parse session message: {}", e);
                let _ = send_error(&mut ws_tx, INVALID_JSON).await;
                return;
            }
        },
        Ok(Some(Ok(_))) => {
            tracing::warn!("Expected text message to start session");
            let _ = send_error(&mut ws_tx, INVALID_JSON).await;
            return;
        }
        Ok(Some(Err(e))) => {
            tracing::warn!("WebSocket error before session start: {}", e);
            return;
        }
        Ok(None) => {
            tracing::info!("Connection closed before session start");
            return;
        }
        Err(_) => {
            tracing::warn!("Session start timeout");
            let _ = send_error(&mut ws_tx, "Session start timeout").await;
            return;
        }
    };

    if let Err(msg) = request.validate() {
        let _ = send_error(&mut ws_tx, msg).await;
        return;
    }

    let identity = match resolve_identity(&state, identity, &request) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!("Session authentication failed: {}", e);
            let _ = send_error(&mut ws_tx, &format!("Unauthorized: {}", e)).await;
            return;
        }
    };

    let chat_id = match resolve_chat(&state, &identity, request.chat_id()) {
        Ok(chat_id) => chat_id,
        Err(msg) => {
            let _ = send_error(&mut ws_tx, msg).await;
            return;
        }
    };

    tracing::info!(
        chat_id = %chat_id,
        user = %identity.username,
        "Received query: {}",
        request.query
    );

    let mut handle = state
        .queue
        .submit(request.query.clone(), Some(chat_id.clone()))
        .await;
    let exchange = PendingExchange {
        chat_id,
        query: request.query,
    };

    let idle_timeout = state.config.session.idle_timeout();
    let mut transcript = Transcript::default();

    loop {
        match timeout(idle_timeout, handle.next_token()).await {
            Ok(Some(token)) => {
                let finished = transcript.push(&token);
                if let Err(e) = send_within(&mut ws_tx, Message::Text(token), idle_timeout).await {
                    tracing::warn!(request_id = %handle.id(), "Failed to send token to client: {}", e);
                    if finished {
                        exchange.persist(state.store.clone(), transcript.answer().to_string());
                    } else {
                        exchange.drain(state.store.clone(), handle, transcript);
                    }
                    return;
                }
                if finished {
                    exchange.persist(state.store.clone(), transcript.answer().to_string());
                    break;
                }
            }
            Ok(None) => {
                tracing::warn!(
                    request_id = %handle.id(),
                    phase = ?handle.phase(),
                    "Request ended without an answer"
                );
                let notice = ErrorNotice::new(QUERY_FAILED).to_json();
                let _ = send_within(&mut ws_tx, Message::Text(notice), idle_timeout).await;
                break;
            }
            Err(_) => {
                tracing::warn!(request_id = %handle.id(), "No token within {:?}", idle_timeout);
                exchange.drain(state.store.clone(), handle, transcript);
                let notice = Message::Text(TIMEOUT_NOTICE.to_string());
                let _ = send_within(&mut ws_tx, notice, idle_timeout).await;
                break;
            }
        }
    }

    let _ = timeout(idle_timeout, ws_tx.close()).await;
}

/// Identity from the upgrade header, or else from the message token.
fn resolve_identity(
    state: &AppState,
    from_header: Option<Identity>,
    request: &SessionRequest,
) -> Result<Identity, AuthError> {
    if let Some(identity) = from_header {
        return Ok(identity);
    }
    match request.token.as_deref() {
        Some(token) => state.verifier.verify(token),
        None => Err(AuthError::MissingHeader),
    }
}

/// Use the named conversation if the caller owns it, or start a new one.
fn resolve_chat(
    state: &AppState,
    identity: &Identity,
    chat_id: Option<&str>,
) -> Result<String, &'static str> {
    match chat_id {
        Some(id) => match state.store.get_conversation(id) {
            Ok(Some(conversation)) if conversation.owner == identity.username => Ok(id.to_string()),
            Ok(_) => {
                tracing::warn!(chat_id = %id, user = %identity.username, "Chat not found for user");
                Err(CHAT_NOT_FOUND)
            }
            Err(e) => {
                tracing::error!(chat_id = %id, "Failed to load chat: {}", e);
                Err(CHAT_NOT_FOUND)
            }
        },
        None => state.store.create_conversation(&identity.username).map_err(|e| {
            tracing::error!(user = %identity.username, "Failed to create chat: {}", e);
            CHAT_CREATE_FAILED
        }),
    }
}

/// Send one frame, giving up when the client stops reading.
async fn send_within<S>(sink: &mut S, message: Message, limit: Duration) -> Result<(), String>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match timeout(limit, sink.send(message)).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(format!("client did not read within {:?}", limit)),
    }
}

/// Send an error notice over WebSocket.
async fn send_error<S>(sink: &mut S, message: &str) -> Result<(), S::Error>
where
    S: SinkExt<Message> + Unpin,
{
    sink.send(Message::Text(ErrorNotice::new(message).to_json()))
        .await
}
