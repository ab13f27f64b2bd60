//! Canned backend for running the gateway without a model server.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

use chat_relay_common::END_MARKER;

use super::{BackendConnection, BackendError, InferenceBackend, TokenStream};

/// Answers every query with the same reply, streamed word by word.
pub struct SimulatedBackend {
    reply: String,
    token_delay: Duration,
}

impl SimulatedBackend {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            token_delay: Duration::ZERO,
        }
    }

    /// Pause between tokens, to mimic generation speed.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }
}

#[async_trait]
impl InferenceBackend for SimulatedBackend {
    fn backend_type(&self) -> &'static str {
        "simulated"
    }

    async fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError> {
        Ok(Box::new(SimulatedConnection {
            reply: self.reply.clone(),
            token_delay: self.token_delay,
        }))
    }
}

struct SimulatedConnection {
    reply: String,
    token_delay: Duration,
}

#[async_trait]
impl BackendConnection for SimulatedConnection {
    async fn open_stream(&mut self, query: &str) -> Result<TokenStream, BackendError> {
        tracing::debug!("Simulating answer for query: {}", query);

        let mut tokens = split_reply(&self.reply);
        tokens.push(END_MARKER.to_string());

        let delay = self.token_delay;
        let stream = stream::iter(tokens).then(move |token| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, BackendError>(token)
        });

        Ok(stream.boxed())
    }
}

/// Split on spaces, keeping each space attached to the preceding word so the
/// tokens concatenate back to the original reply.
fn split_reply(reply: &str) -> Vec<String> {
    reply.split_inclusive(' ').map(str::to_string).collect()
}
