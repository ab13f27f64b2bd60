pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod queue;
pub mod routes;
pub mod session;
pub mod store;
pub mod test_util;

pub use auth::{Identity, TokenVerifier};
pub use backend::InferenceBackend;
pub use config::Config;
pub use queue::{AdmissionQueue, QueueWorker, RequestHandle, StreamRelay};
pub use store::{ConversationStore, SqliteConversationStore};

use std::sync::Arc;

use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub queue: Arc<AdmissionQueue>,
    pub store: Arc<dyn ConversationStore>,
    pub verifier: TokenVerifier,
    /// Backend identifier reported on /health.
    pub backend_type: &'static str,
}

impl AppState {
    /// Wire the queue, relay and verifier for `backend` and `store`.
    ///
    /// The queue's sweep loop is not started; see [`AdmissionQueue::start`].
    pub fn new(
        config: Config,
        backend: Arc<dyn InferenceBackend>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        let backend_type = backend.backend_type();
        let relay = StreamRelay::new(
            backend,
            config.backend.dial_timeout(),
            config.backend.query_timeout(),
        );
        let queue = Arc::new(AdmissionQueue::new(&config.queue, relay));
        let verifier = TokenVerifier::new(&config.auth.jwt_secret);

        Self {
            config,
            queue,
            store,
            verifier,
            backend_type,
        }
    }
}

/// Build the HTTP and WebSocket router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health::router(state.clone()))
        .merge(routes::session::router(state.clone()))
        .merge(routes::conversations::router(state))
        .layer(middleware::from_fn(logging::request_logger))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
