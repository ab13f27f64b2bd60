//! Error types for the chat client.

use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to connect to gateway: {0}")]
    Connect(#[source] tungstenite::Error),

    #[error("Gateway connection timed out")]
    ConnectTimeout,

    #[error("Invalid gateway request: {0}")]
    InvalidRequest(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
