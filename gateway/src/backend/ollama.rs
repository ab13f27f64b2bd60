//! Ollama streaming backend.

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use chat_relay_common::END_MARKER;

use super::{BackendConnection, BackendError, InferenceBackend, TokenStream};

/// Streams answers from an Ollama server's `/api/generate` endpoint.
pub struct OllamaBackend {
    http_client: Client,
    base_url: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

// ============================================================================
// Ollama API types
// ============================================================================

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

/// One NDJSON line of a streamed `/api/generate` response.
#[derive(Debug, Deserialize)]
struct OllamaGenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaVersionResponse {
    #[serde(default)]
    version: Option<String>,
}

// ============================================================================
// InferenceBackend implementation
// ============================================================================

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn backend_type(&self) -> &'static str {
        "ollama"
    }

    async fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError> {
        let url = format!("{}/api/version", self.base_url);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Unreachable(format!(
                "Ollama returned {}",
                response.status()
            )));
        }

        let version = response
            .json::<OllamaVersionResponse>()
            .await
            .ok()
            .and_then(|v| v.version);
        tracing::debug!(
            "Connected to Ollama at {} (version {})",
            self.base_url,
            version.as_deref().unwrap_or("unknown")
        );

        Ok(Box::new(OllamaConnection {
            http_client: self.http_client.clone(),
            base_url: self.base_url.clone(),
            model: self.model.clone(),
        }))
    }
}

struct OllamaConnection {
    http_client: Client,
    base_url: String,
    model: String,
}

#[async_trait]
impl BackendConnection for OllamaConnection {
    async fn open_stream(&mut self, query: &str) -> Result<TokenStream, BackendError> {
        let url = format!("{}/api/generate", self.base_url);
        let request = OllamaGenerateRequest {
            model: &self.model,
            prompt: query,
            stream: true,
        };

        tracing::debug!("Sending streaming request to Ollama: {} model={}", url, self.model);

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Rejected(format!("{}: {}", status, body)));
        }

        Ok(decode_generate_stream(response.bytes_stream()))
    }
}

// ============================================================================
// NDJSON decoding
// ============================================================================

/// Accumulates bytes and splits them into complete lines.
///
/// Splitting happens on raw bytes so multi-byte characters cut across
/// network chunks are reassembled before UTF-8 decoding.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line[..pos]).into_owned())
    }

    /// Whatever is left once the body has ended without a final newline.
    fn take_rest(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

struct GenerateStream<S> {
    bytes: Pin<Box<S>>,
    lines: LineBuffer,
    ready: VecDeque<Result<String, BackendError>>,
    finished: bool,
}

impl<S> GenerateStream<S> {
    fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        match serde_json::from_str::<OllamaGenerateChunk>(line) {
            Ok(chunk) => {
                if let Some(error) = chunk.error {
                    self.fail(BackendError::Stream(error));
                    return;
                }
                // Only a `done` chunk may produce the end marker.
                if chunk.response == END_MARKER {
                    tracing::debug!("Dropping model fragment equal to the end marker");
                } else if !chunk.response.is_empty() {
                    self.ready.push_back(Ok(chunk.response));
                }
                if chunk.done {
                    self.ready.push_back(Ok(END_MARKER.to_string()));
                    self.finished = true;
                }
            }
            Err(e) => self.fail(BackendError::Stream(format!("Invalid chunk: {}", e))),
        }
    }

    fn fail(&mut self, error: BackendError) {
        self.ready.push_back(Err(error));
        self.finished = true;
    }
}

/// Turn a streamed `/api/generate` body into a token stream.
///
/// A body that ends before a `done` chunk simply ends the stream; the relay
/// treats the missing end marker as an abrupt termination.
fn decode_generate_stream<S, E>(bytes: S) -> TokenStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = GenerateStream {
        bytes: Box::pin(bytes),
        lines: LineBuffer::default(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            if let Some(line) = state.lines.next_line() {
                state.handle_line(&line);
                continue;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.lines.push(&chunk),
                Some(Err(e)) => state.fail(BackendError::Stream(e.to_string())),
                None => match state.lines.take_rest() {
                    Some(rest) => {
                        state.handle_line(&rest);
                        state.finished = true;
                    }
                    None => state.finished = true,
                },
            }
        }
    })
    .boxed()
}
