use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use chat_relay_gateway::{backend, build_router, logging, AppState, Config, SqliteConversationStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    logging::init_tracing(&config.logging.level);

    tracing::info!("Starting chat-relay gateway");

    let backend = backend::from_config(&config.backend);
    tracing::info!(
        "Using {} backend at {} (model {})",
        backend.backend_type(),
        config.backend.base_url,
        config.backend.model
    );

    let store = Arc::new(SqliteConversationStore::new(&config.database.url)?);
    let state = Arc::new(AppState::new(config.clone(), backend, store));

    let shutdown = CancellationToken::new();
    let worker = state.queue.start(shutdown.clone());

    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    worker.stop().await;
    tracing::info!("Gateway stopped");

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
    shutdown.cancel();
}
