//! One in-flight query and its delivery channel.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Lifecycle of a request, observable through its [`RequestHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    /// Waiting in the admission queue.
    Queued,
    /// Admitted; a relay task has been launched.
    Dispatched,
    /// Relay is establishing the backend connection.
    Connecting,
    /// Backend accepted the query and is producing tokens.
    Streaming,
    /// End marker delivered.
    Completed,
    /// Relay ended without delivering the end marker.
    Failed,
    /// Waited past the grace period and was dropped without dispatch.
    Evicted,
}

impl RequestPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestPhase::Completed | RequestPhase::Failed | RequestPhase::Evicted
        )
    }
}

/// Producer side of a request: held by the queue until dispatch, then by the
/// relay task that serves it.
#[derive(Debug)]
pub struct PendingRequest {
    id: Uuid,
    query: String,
    correlation_id: Option<String>,
    created_at: Instant,
    active: bool,
    complete: bool,
    output: Option<mpsc::Sender<String>>,
    phase: watch::Sender<RequestPhase>,
}

/// Consumer side of a request, returned by submission.
#[derive(Debug)]
pub struct RequestHandle {
    id: Uuid,
    correlation_id: Option<String>,
    output: mpsc::Receiver<String>,
    phase: watch::Receiver<RequestPhase>,
}

/// The output channel was closed by the consumer going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("request output is closed")]
pub struct OutputClosed;

impl PendingRequest {
    /// Create a request and the handle that drains it.
    pub(crate) fn new(
        query: String,
        correlation_id: Option<String>,
        capacity: usize,
    ) -> (Self, RequestHandle) {
        let id = Uuid::new_v4();
        // mpsc::channel panics on zero capacity.
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (phase_tx, phase_rx) = watch::channel(RequestPhase::Queued);

        let request = Self {
            id,
            query,
            correlation_id: correlation_id.clone(),
            created_at: Instant::now(),
            active: false,
            complete: false,
            output: Some(tx),
            phase: phase_tx,
        };
        let handle = RequestHandle {
            id,
            correlation_id,
            output: rx,
            phase: phase_rx,
        };
        (request, handle)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Waited longer than `grace` without being admitted.
    pub fn is_stale(&self, now: Instant, grace: Duration) -> bool {
        !self.active && self.age(now) > grace
    }

    pub fn is_output_closed(&self) -> bool {
        self.output.is_none()
    }

    /// Enqueue a token, waiting while the consumer is behind.
    pub async fn send(&self, token: String) -> Result<(), OutputClosed> {
        match &self.output {
            Some(tx) => tx.send(token).await.map_err(|_| OutputClosed),
            None => Err(OutputClosed),
        }
    }

    /// Close the output channel. Only the first call has any effect.
    pub fn close_output(&mut self) {
        self.output.take();
    }

    pub fn set_phase(&self, phase: RequestPhase) {
        // No receiver left just means nobody is watching.
        let _ = self.phase.send(phase);
    }

    pub(crate) fn mark_dispatched(&mut self) {
        self.active = true;
        self.set_phase(RequestPhase::Dispatched);
    }

    /// Close without dispatching.
    pub(crate) fn evict(&mut self) {
        self.close_output();
        self.set_phase(RequestPhase::Evicted);
    }

    /// Record the end of the relay: inactive first, then complete.
    pub(crate) fn mark_finished(&mut self) {
        self.active = false;
        self.complete = true;
    }
}

impl RequestHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Next token, or `None` once the producer has closed the channel and
    /// everything enqueued before that has been read.
    pub async fn next_token(&mut self) -> Option<String> {
        self.output.recv().await
    }

    pub fn phase(&self) -> RequestPhase {
        *self.phase.borrow()
    }

    /// Wait until the request reaches a terminal phase.
    pub async fn wait_terminal(&mut self) -> RequestPhase {
        let current = *self.phase.borrow_and_update();
        if current.is_terminal() {
            return current;
        }
        match self.phase.wait_for(|phase| phase.is_terminal()).await {
            Ok(phase) => *phase,
            // Sender dropped without a terminal phase: the relay task died.
            Err(_) => RequestPhase::Failed,
        }
    }
}
