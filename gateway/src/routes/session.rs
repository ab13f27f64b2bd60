use std::sync::Arc;

use axum::{routing::get, Router};

use crate::session::ws_handler;
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}
