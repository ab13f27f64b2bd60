//! Runs one backend streaming call for one admitted request.
//!
//! The relay moves a request through
//! `Dispatched → Connecting → Streaming → {Completed | Failed}`. Both the dial
//! timeout and the query timeout force a transition to `Failed`, so no request
//! stays in `Streaming` forever.
//!
//! On every path the request's output channel is closed exactly once, after
//! the last token the relay will ever produce, and the backend connection is
//! dropped before `run` returns.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::{timeout, timeout_at, Instant};

use chat_relay_common::END_MARKER;

use super::pending::{PendingRequest, RequestPhase};
use crate::backend::{BackendConnection, BackendError, InferenceBackend};

/// Why a relay ended without delivering the end marker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("Backend unreachable: {0}")]
    Unreachable(BackendError),
    #[error("Backend dial timed out after {0:?}")]
    DialTimeout(Duration),
    #[error("Backend query failed: {0}")]
    Query(BackendError),
    #[error("Backend stream failed: {0}")]
    Stream(BackendError),
    #[error("Backend stream ended without end marker")]
    Truncated,
    #[error("Backend query timed out after {0:?}")]
    QueryTimeout(Duration),
}

/// Result of one relay run.
#[derive(Debug, Clone)]
pub enum RelayOutcome {
    /// End marker delivered after `tokens` answer tokens.
    Completed { tokens: usize },
    /// Backend failed; the consumer sees the channel close without the marker.
    Failed(RelayError),
    /// The consumer dropped its handle; streaming stopped early.
    Abandoned,
}

impl RelayOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RelayOutcome::Completed { .. })
    }
}

/// Relays a backend token stream into request output channels.
#[derive(Clone)]
pub struct StreamRelay {
    backend: Arc<dyn InferenceBackend>,
    dial_timeout: Duration,
    query_timeout: Duration,
}

impl StreamRelay {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        dial_timeout: Duration,
        query_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            dial_timeout,
            query_timeout,
        }
    }

    pub fn backend_type(&self) -> &'static str {
        self.backend.backend_type()
    }

    /// Execute the backend call for `request` and forward its output.
    pub async fn run(&self, request: &mut PendingRequest) -> RelayOutcome {
        request.set_phase(RequestPhase::Connecting);
        tracing::debug!(request_id = %request.id(), "Connecting to {} backend", self.backend_type());

        let connection = match timeout(self.dial_timeout, self.backend.connect()).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                tracing::warn!(request_id = %request.id(), "Backend connection failed: {}", e);
                return self.fail(request, RelayError::Unreachable(e));
            }
            Err(_) => {
                tracing::warn!(
                    request_id = %request.id(),
                    "Backend connection timed out after {:?}",
                    self.dial_timeout
                );
                return self.fail(request, RelayError::DialTimeout(self.dial_timeout));
            }
        };

        let deadline = Instant::now() + self.query_timeout;
        let outcome = match timeout_at(deadline, forward(connection, request)).await {
            Ok(outcome) => outcome,
            Err(_) => RelayOutcome::Failed(RelayError::QueryTimeout(self.query_timeout)),
        };

        request.close_output();
        match &outcome {
            RelayOutcome::Completed { tokens } => {
                request.set_phase(RequestPhase::Completed);
                tracing::info!(request_id = %request.id(), tokens, "Finished query");
            }
            RelayOutcome::Failed(e) => {
                request.set_phase(RequestPhase::Failed);
                tracing::warn!(request_id = %request.id(), "Relay failed: {}", e);
            }
            RelayOutcome::Abandoned => {
                request.set_phase(RequestPhase::Failed);
                tracing::info!(request_id = %request.id(), "Consumer went away, relay stopped");
            }
        }
        outcome
    }

    fn fail(&self, request: &mut PendingRequest, error: RelayError) -> RelayOutcome {
        request.close_output();
        request.set_phase(RequestPhase::Failed);
        RelayOutcome::Failed(error)
    }
}

/// Stream tokens from an open connection into the request's output.
///
/// Takes the connection by value so it is dropped when this future completes
/// or is cancelled by the query deadline.
async fn forward(
    mut connection: Box<dyn BackendConnection>,
    request: &mut PendingRequest,
) -> RelayOutcome {
    let mut stream = match connection.open_stream(request.query()).await {
        Ok(stream) => stream,
        Err(e) => return RelayOutcome::Failed(RelayError::Query(e)),
    };
    request.set_phase(RequestPhase::Streaming);

    let mut tokens = 0usize;
    while let Some(item) = stream.next().await {
        let token = match item {
            Ok(token) => token,
            Err(e) => return RelayOutcome::Failed(RelayError::Stream(e)),
        };

        let is_end = token == END_MARKER;
        tracing::trace!(request_id = %request.id(), "Received token: {:?}", token);

        if request.send(token).await.is_err() {
            return RelayOutcome::Abandoned;
        }
        if is_end {
            return RelayOutcome::Completed { tokens };
        }
        tokens += 1;
    }

    RelayOutcome::Failed(RelayError::Truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{ScriptedBackend, Step};

    fn relay(backend: &Arc<ScriptedBackend>) -> StreamRelay {
        StreamRelay::new(
            backend.clone(),
            Duration::from_millis(100),
            Duration::from_millis(300),
        )
    }

    async fn drain(handle: &mut crate::queue::RequestHandle) -> Vec<String> {
        let mut tokens = Vec::new();
        while let Some(token) = handle.next_token().await {
            tokens.push(token);
        }
        tokens
    }

    #[tokio::test]
    async fn test_completed_stream_forwards_in_order() {
        let backend = Arc::new(ScriptedBackend::tokens(&["a", "b", "[END]"]));
        let (mut request, mut handle) = PendingRequest::new("q".to_string(), None, 10);

        let outcome = relay(&backend).run(&mut request).await;

        assert!(matches!(outcome, RelayOutcome::Completed { tokens: 2 }));
        assert!(request.is_output_closed());
        assert_eq!(drain(&mut handle).await, vec!["a", "b", "[END]"]);
        assert_eq!(handle.phase(), RequestPhase::Completed);
        assert_eq!(backend.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_closes_empty() {
        let backend = Arc::new(ScriptedBackend::unreachable());
        let (mut request, mut handle) = PendingRequest::new("q".to_string(), None, 10);

        let outcome = relay(&backend).run(&mut request).await;

        assert!(matches!(outcome, RelayOutcome::Failed(RelayError::Unreachable(_))));
        assert!(drain(&mut handle).await.is_empty());
        assert_eq!(handle.phase(), RequestPhase::Failed);
    }

    #[tokio::test]
    async fn test_dial_timeout_closes_empty() {
        let backend = Arc::new(ScriptedBackend::tokens(&["a", "[END]"]).with_connect_delay(Duration::from_secs(5)));
        let (mut request, mut handle) = PendingRequest::new("q".to_string(), None, 10);

        let outcome = relay(&backend).run(&mut request).await;

        assert!(matches!(outcome, RelayOutcome::Failed(RelayError::DialTimeout(_))));
        assert!(drain(&mut handle).await.is_empty());
        assert_eq!(backend.queries().len(), 0);
    }

    #[tokio::test]
    async fn test_mid_stream_error_closes_without_marker() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Step::Token("a".to_string()),
            Step::Error("connection reset".to_string()),
            Step::Token("[END]".to_string()),
        ]));
        let (mut request, mut handle) = PendingRequest::new("q".to_string(), None, 10);

        let outcome = relay(&backend).run(&mut request).await;

        assert!(matches!(outcome, RelayOutcome::Failed(RelayError::Stream(_))));
        assert_eq!(drain(&mut handle).await, vec!["a"]);
        assert_eq!(backend.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_stalled_stream_hits_query_timeout() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Step::Token("a".to_string()),
            Step::Stall,
        ]));
        let (mut request, mut handle) = PendingRequest::new("q".to_string(), None, 10);

        let outcome = relay(&backend).run(&mut request).await;

        assert!(matches!(outcome, RelayOutcome::Failed(RelayError::QueryTimeout(_))));
        assert_eq!(drain(&mut handle).await, vec!["a"]);
        assert_eq!(backend.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_stream_ending_without_marker_is_truncated() {
        let backend = Arc::new(ScriptedBackend::tokens(&["a", "b"]));
        let (mut request, mut handle) = PendingRequest::new("q".to_string(), None, 10);

        let outcome = relay(&backend).run(&mut request).await;

        assert!(matches!(outcome, RelayOutcome::Failed(RelayError::Truncated)));
        assert_eq!(drain(&mut handle).await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_rejected_query_fails() {
        let backend = Arc::new(ScriptedBackend::rejecting("model not found"));
        let (mut request, mut handle) = PendingRequest::new("q".to_string(), None, 10);

        let outcome = relay(&backend).run(&mut request).await;

        assert!(matches!(outcome, RelayOutcome::Failed(RelayError::Query(_))));
        assert!(drain(&mut handle).await.is_empty());
        assert_eq!(backend.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_backpressure_delivers_every_token() {
        let script: Vec<String> = (0..50).map(|i| format!("t{} ", i)).chain(["[END]".to_string()]).collect();
        let script_refs: Vec<&str> = script.iter().map(String::as_str).collect();
        let backend = Arc::new(ScriptedBackend::tokens(&script_refs));
        let (mut request, mut handle) = PendingRequest::new("q".to_string(), None, 2);

        let consumer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(token) = handle.next_token().await {
                tokio::time::sleep(Duration::from_millis(1)).await;
                seen.push(token);
            }
            seen
        });

        let outcome = StreamRelay::new(backend.clone(), Duration::from_secs(1), Duration::from_secs(10))
            .run(&mut request)
            .await;

        assert!(matches!(outcome, RelayOutcome::Completed { tokens: 50 }));
        assert_eq!(consumer.await.unwrap(), script);
    }

    #[tokio::test]
    async fn test_consumer_gone_abandons() {
        let backend = Arc::new(ScriptedBackend::tokens(&["a", "b", "[END]"]));
        let (mut request, handle) = PendingRequest::new("q".to_string(), None, 10);
        drop(handle);

        let outcome = relay(&backend).run(&mut request).await;

        assert!(matches!(outcome, RelayOutcome::Abandoned));
        assert_eq!(backend.open_connections(), 0);
    }
}
