//! Inference backend abstraction layer.
//!
//! This module defines the `InferenceBackend` trait that abstracts the token
//! streaming service behind the relay. A backend hands out connections; a
//! connection runs one query and yields its answer as a stream of token
//! strings that ends with [`END_MARKER`](chat_relay_common::END_MARKER).
//!
//! Connections are released by dropping them.

mod ollama;
mod simulated;

pub use ollama::OllamaBackend;
pub use simulated::SimulatedBackend;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::config::{BackendConfig, BackendKind};

/// Tokens of one answer, in generation order.
pub type TokenStream = BoxStream<'static, Result<String, BackendError>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Backend unreachable: {0}")]
    Unreachable(String),
    #[error("Backend rejected query: {0}")]
    Rejected(String),
    #[error("Stream error: {0}")]
    Stream(String),
}

/// A token-streaming inference service.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Identifier for this backend type (e.g., "ollama").
    fn backend_type(&self) -> &'static str;

    /// Establish a connection to the service.
    async fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError>;
}

/// An established connection to an inference backend.
#[async_trait]
pub trait BackendConnection: Send {
    /// Issue a query and return its token stream.
    async fn open_stream(&mut self, query: &str) -> Result<TokenStream, BackendError>;
}

/// Build the backend selected in configuration.
pub fn from_config(config: &BackendConfig) -> Arc<dyn InferenceBackend> {
    match config.kind {
        BackendKind::Ollama => Arc::new(OllamaBackend::new(&config.base_url, &config.model)),
        BackendKind::Simulated => Arc::new(SimulatedBackend::new(&config.simulated_reply)),
    }
}
