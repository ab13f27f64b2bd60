use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};

use crate::error::{Error, Result};
use crate::models::{Conversation, ConversationSummary};
use crate::AppState;

/// GET /conversations - conversations owned by the caller
async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationSummary>>> {
    let identity = state.verifier.authenticate(&headers)?;
    let conversations = state.store.list_conversations(&identity.username)?;
    Ok(Json(conversations))
}

/// GET /conversations/:id - one conversation with its exchanges
async fn get_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Conversation>> {
    let identity = state.verifier.authenticate(&headers)?;

    // Someone else's conversation is reported the same as a missing one.
    match state.store.get_conversation(&id)? {
        Some(conversation) if conversation.owner == identity.username => Ok(Json(conversation)),
        _ => Err(Error::ConversationNotFound(id)),
    }
}

/// DELETE /conversations/:id - remove a conversation owned by the caller
async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let identity = state.verifier.authenticate(&headers)?;

    match state.store.get_conversation(&id)? {
        Some(conversation) if conversation.owner == identity.username => {
            state.store.delete_conversation(&id)?;
            tracing::info!(chat_id = %id, user = %identity.username, "Conversation deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        _ => Err(Error::ConversationNotFound(id)),
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/conversations", get(list_conversations))
        .route(
            "/conversations/:id",
            get(get_conversation).delete(delete_conversation),
        )
        .with_state(state)
}
