//! WebSocket client for gateway sessions.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use chat_relay_common::{ServerFrame, SessionRequest};

use crate::config::GatewayConfig;
use crate::error::{Error, Result};

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The end marker arrived.
    Completed,
    /// The gateway gave up waiting for the backend.
    TimedOut,
    /// The gateway reported an error.
    Failed(String),
    /// The connection closed without a final frame.
    Disconnected,
}

/// Text received during a session and how it ended.
#[derive(Debug, Clone)]
pub struct Reply {
    pub text: String,
    pub outcome: Outcome,
}

/// Gateway session client. Each call to [`ask`](Self::ask) opens one
/// connection and carries one query.
pub struct ChatClient {
    config: GatewayConfig,
}

impl ChatClient {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Send `query` and stream the answer, calling `on_token` as tokens arrive.
    pub async fn ask<F>(&self, query: &str, chat_id: Option<&str>, mut on_token: F) -> Result<Reply>
    where
        F: FnMut(&str),
    {
        let mut request = self
            .config
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(Error::Connect)?;

        let mut message = SessionRequest::new(query);
        if let Some(id) = chat_id {
            message = message.with_chat_id(id);
        }
        if let Some(token) = &self.config.token {
            if self.config.token_in_message {
                message = message.with_token(token.clone());
            } else {
                let value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| Error::InvalidRequest(e.to_string()))?;
                request.headers_mut().insert(AUTHORIZATION, value);
            }
        }

        tracing::debug!("Connecting to gateway at {}", self.config.ws_url);
        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let ws_stream = match timeout(connect_timeout, connect_async(request)).await {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => return Err(Error::Connect(e)),
            Err(_) => return Err(Error::ConnectTimeout),
        };
        let (mut write, mut read) = ws_stream.split();

        let json = serde_json::to_string(&message)?;
        write.send(Message::Text(json)).await?;

        let mut text = String::new();
        let outcome = loop {
            match read.next().await {
                Some(Ok(Message::Text(frame))) => match ServerFrame::parse(&frame) {
                    ServerFrame::Token(token) => {
                        on_token(&token);
                        text.push_str(&token);
                    }
                    ServerFrame::End => break Outcome::Completed,
                    ServerFrame::Timeout => break Outcome::TimedOut,
                    ServerFrame::Error(message) => break Outcome::Failed(message),
                },
                Some(Ok(Message::Ping(data))) => {
                    write.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(_))) | None => break Outcome::Disconnected,
                Some(Ok(_)) => {} // Ignore binary, pong, etc.
                Some(Err(e)) => return Err(e.into()),
            }
        };

        // The gateway closes its side right after the last frame.
        let _ = write.close().await;

        Ok(Reply { text, outcome })
    }
}
