use std::sync::Arc;

use chat_relay_common::END_MARKER;

use crate::queue::RequestHandle;
use crate::store::ConversationStore;

/// Answer text accumulated from a token stream.
#[derive(Debug, Default)]
pub struct Transcript {
    answer: String,
    finished: bool,
}

impl Transcript {
    /// Record a token. Returns true when it is the end marker.
    pub fn push(&mut self, token: &str) -> bool {
        if token == END_MARKER {
            self.finished = true;
        } else {
            self.answer.push_str(token);
        }
        self.finished
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// A finished query waiting to be written to its conversation.
pub struct PendingExchange {
    pub chat_id: String,
    pub query: String,
}

impl PendingExchange {
    /// Write the exchange in the background. Failures are logged only.
    pub fn persist(self, store: Arc<dyn ConversationStore>, answer: String) {
        tokio::task::spawn_blocking(move || {
            match store.append_exchange(&self.chat_id, &self.query, &answer) {
                Ok(()) => tracing::debug!(chat_id = %self.chat_id, "Saved exchange"),
                Err(e) => tracing::error!(
                    chat_id = %self.chat_id,
                    "Failed to update chat: {}",
                    e
                ),
            }
        });
    }

    /// Keep reading `handle` after the client is gone so the relay is never
    /// held up, and save the exchange if the answer completes.
    pub fn drain(self, store: Arc<dyn ConversationStore>, mut handle: RequestHandle, mut transcript: Transcript) {
        tokio::spawn(async move {
            while let Some(token) = handle.next_token().await {
                if transcript.push(&token) {
                    break;
                }
            }

            if transcript.is_finished() {
                tracing::info!(request_id = %handle.id(), "Answer completed after client left");
                self.persist(store, transcript.answer);
            } else {
                tracing::info!(request_id = %handle.id(), "Detached request ended without an answer");
            }
        });
    }
}
