//! Admission queue for backend queries.
//!
//! Requests wait in the queue until the sweep loop admits them. The loop wakes
//! on a fixed interval and whenever a request is submitted or a relay
//! finishes. Each pass runs under one lock acquisition and, in sequence order:
//!
//! 1. drops requests that are already complete,
//! 2. evicts requests that waited longer than the grace period,
//! 3. admits requests while fewer than `max_active` relays are running,
//! 4. keeps the rest waiting.
//!
//! Admitted requests leave the queue and are owned by their relay task, which
//! is spawned after the lock is released.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::pending::{PendingRequest, RequestHandle};
use super::relay::{RelayOutcome, StreamRelay};
use crate::config::QueueConfig;

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
    pub max_active: usize,
    pub peak_active: usize,
    pub admitted_total: u64,
    pub evicted_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<PendingRequest>,
    active_count: usize,
    peak_active: usize,
    admitted_total: u64,
    evicted_total: u64,
    completed_total: u64,
    failed_total: u64,
}

/// Bounded-concurrency admission queue in front of a [`StreamRelay`].
pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    relay: StreamRelay,
    max_active: usize,
    grace_period: Duration,
    scan_interval: Duration,
    output_capacity: usize,
}

/// Running sweep loop. Dropping it leaves the loop running until its token is
/// cancelled.
pub struct QueueWorker {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl QueueWorker {
    /// Cancel the sweep loop and wait for it to exit.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!("Admission sweep task ended abnormally: {}", e);
        }
    }
}

impl AdmissionQueue {
    pub fn new(config: &QueueConfig, relay: StreamRelay) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            relay,
            max_active: config.max_active,
            grace_period: config.grace_period(),
            scan_interval: config.scan_interval(),
            output_capacity: config.output_capacity,
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// Enqueue a query. Returns immediately; no backend work happens here.
    pub async fn submit(&self, query: String, correlation_id: Option<String>) -> RequestHandle {
        let (request, handle) = PendingRequest::new(query, correlation_id, self.output_capacity);
        tracing::debug!(
            request_id = %request.id(),
            chat_id = ?request.correlation_id(),
            "Queued request"
        );

        self.state.lock().await.pending.push(request);
        self.notify.notify_one();
        handle
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            pending: state.pending.len(),
            active: state.active_count,
            max_active: self.max_active,
            peak_active: state.peak_active,
            admitted_total: state.admitted_total,
            evicted_total: state.evicted_total,
            completed_total: state.completed_total,
            failed_total: state.failed_total,
        }
    }

    /// Spawn the sweep loop.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> QueueWorker {
        let queue = Arc::clone(self);
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { queue.run(token).await });
        QueueWorker { shutdown, handle }
    }

    /// Sweep until `shutdown` is cancelled. Requests still waiting at exit keep
    /// their output channels open.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            max_active = self.max_active,
            grace_period_ms = self.grace_period.as_millis() as u64,
            "Admission queue started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.scan_interval) => {}
            }

            let admitted = self.sweep(Instant::now()).await;
            for request in admitted {
                self.launch(request);
            }
        }

        tracing::info!("Admission queue stopped");
    }

    /// One pass over the waiting requests. Returns the admitted ones.
    async fn sweep(&self, now: Instant) -> Vec<PendingRequest> {
        let mut state = self.state.lock().await;
        let mut admitted = Vec::new();
        let mut retained = Vec::with_capacity(state.pending.len());

        for mut request in std::mem::take(&mut state.pending) {
            if request.is_complete() {
                continue;
            }
            if request.is_stale(now, self.grace_period) {
                tracing::info!(
                    request_id = %request.id(),
                    waited_ms = request.age(now).as_millis() as u64,
                    "Evicting request that waited past the grace period"
                );
                request.evict();
                state.evicted_total += 1;
                continue;
            }
            if !request.is_active() && state.active_count < self.max_active {
                request.mark_dispatched();
                state.active_count += 1;
                state.admitted_total += 1;
                state.peak_active = state.peak_active.max(state.active_count);
                admitted.push(request);
                continue;
            }
            retained.push(request);
        }

        state.pending = retained;
        if !admitted.is_empty() {
            tracing::debug!(
                admitted = admitted.len(),
                active = state.active_count,
                waiting = state.pending.len(),
                "Sweep admitted requests"
            );
        }
        admitted
    }

    /// Run the relay for an admitted request in its own task.
    ///
    /// The relay runs in an inner task so that a panic inside it still
    /// releases the admission slot.
    fn launch(self: &Arc<Self>, mut request: PendingRequest) {
        let queue = Arc::clone(self);
        let request_id = request.id();
        let relay = self.relay.clone();

        tokio::spawn(async move {
            let result = tokio::spawn(async move {
                let outcome = relay.run(&mut request).await;
                (request, outcome)
            })
            .await;
            queue.finish(request_id, result).await;
        });
    }

    async fn finish(
        &self,
        request_id: Uuid,
        result: Result<(PendingRequest, RelayOutcome), JoinError>,
    ) {
        let mut state = self.state.lock().await;
        state.active_count = state.active_count.saturating_sub(1);

        match result {
            Ok((mut request, outcome)) => {
                request.mark_finished();
                if outcome.is_completed() {
                    state.completed_total += 1;
                } else {
                    state.failed_total += 1;
                }
            }
            Err(e) => {
                tracing::error!(request_id = %request_id, "Relay task panicked: {}", e);
                state.failed_total += 1;
            }
        }
        drop(state);

        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RequestPhase;
    use crate::test_util::{ScriptedBackend, Step};

    fn queue_config(max_active: usize, grace_ms: u64) -> QueueConfig {
        QueueConfig {
            max_active,
            grace_period_ms: grace_ms,
            scan_interval_ms: 20,
            output_capacity: 10,
        }
    }

    fn queue_with(backend: &Arc<ScriptedBackend>, config: QueueConfig) -> Arc<AdmissionQueue> {
        let relay = StreamRelay::new(
            backend.clone(),
            Duration::from_millis(200),
            Duration::from_secs(5),
        );
        Arc::new(AdmissionQueue::new(&config, relay))
    }

    async fn collect(mut handle: RequestHandle) -> Vec<String> {
        let mut tokens = Vec::new();
        while let Some(token) = handle.next_token().await {
            tokens.push(token);
        }
        tokens
    }

    async fn wait_idle(queue: &AdmissionQueue) {
        for _ in 0..200 {
            let stats = queue.stats().await;
            if stats.active == 0 && stats.pending == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue did not drain: {:?}", queue.stats().await);
    }

    #[tokio::test]
    async fn test_submit_does_not_touch_backend() {
        let backend = Arc::new(ScriptedBackend::tokens(&["a", "[END]"]));
        let queue = queue_with(&backend, queue_config(5, 5_000));

        let handle = queue.submit("hello".to_string(), Some("c1".to_string())).await;

        assert_eq!(handle.phase(), RequestPhase::Queued);
        assert_eq!(handle.correlation_id(), Some("c1"));
        assert_eq!(queue.stats().await.pending, 1);
        assert_eq!(backend.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_precedence() {
        let backend = Arc::new(ScriptedBackend::tokens(&["[END]"]));
        let queue = queue_with(&backend, queue_config(1, 1_000));

        let _old = queue.submit("old".to_string(), None).await;
        let _first = queue.submit("first".to_string(), None).await;
        let _second = queue.submit("second".to_string(), None).await;

        // A pass in the future: everything is past the grace period and is
        // evicted, nothing is admitted.
        let admitted = queue.sweep(Instant::now() + Duration::from_secs(2)).await;
        assert!(admitted.is_empty());
        let stats = queue.stats().await;
        assert_eq!(stats.evicted_total, 3);
        assert_eq!(stats.pending, 0);

        let _a = queue.submit("a".to_string(), None).await;
        let _b = queue.submit("b".to_string(), None).await;
        let admitted = queue.sweep(Instant::now()).await;
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].query(), "a");
        assert!(admitted[0].is_active());

        let stats = queue.stats().await;
        assert_eq!(stats.active, 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_tokens_delivered_in_order_with_single_end_marker() {
        let backend = Arc::new(ScriptedBackend::tokens(&["The ", "answer ", "is ", "42", "[END]"]));
        let queue = queue_with(&backend, queue_config(5, 5_000));
        let worker = queue.start(CancellationToken::new());

        let handle = queue.submit("question".to_string(), None).await;
        let tokens = collect(handle).await;

        assert_eq!(tokens, vec!["The ", "answer ", "is ", "42", "[END]"]);
        assert_eq!(tokens.iter().filter(|t| *t == "[END]").count(), 1);
        assert_eq!(backend.queries(), vec!["question".to_string()]);

        wait_idle(&queue).await;
        assert_eq!(queue.stats().await.completed_total, 1);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_eight_requests_with_ceiling_of_five() {
        let backend = Arc::new(
            ScriptedBackend::tokens(&["x", "[END]"]).with_token_delay(Duration::from_millis(100)),
        );
        let queue = queue_with(&backend, queue_config(5, 5_000));
        let worker = queue.start(CancellationToken::new());

        let mut handles = Vec::new();
        for i in 0..8 {
            handles.push(queue.submit(format!("q{}", i), None).await);
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        let stats = queue.stats().await;
        assert_eq!(stats.active, 5);
        assert_eq!(stats.pending, 3);

        let results = futures_util::future::join_all(handles.into_iter().map(collect)).await;
        for tokens in results {
            assert_eq!(tokens, vec!["x", "[END]"]);
        }

        wait_idle(&queue).await;
        let stats = queue.stats().await;
        assert_eq!(stats.peak_active, 5);
        assert_eq!(stats.admitted_total, 8);
        assert_eq!(stats.completed_total, 8);
        assert!(backend.peak_connections() <= 5);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_submissions_dispatch_at_most_once() {
        let backend = Arc::new(
            ScriptedBackend::tokens(&["y", "[END]"]).with_token_delay(Duration::from_millis(5)),
        );
        let queue = queue_with(&backend, queue_config(3, 10_000));
        let worker = queue.start(CancellationToken::new());

        let submitters: Vec<_> = (0..20)
            .map(|i| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.submit(format!("q{}", i), None).await })
            })
            .collect();

        let mut handles = Vec::new();
        for submitter in submitters {
            handles.push(submitter.await.unwrap());
        }
        let results = futures_util::future::join_all(handles.into_iter().map(collect)).await;
        assert!(results.iter().all(|tokens| tokens == &["y", "[END]"]));

        wait_idle(&queue).await;
        let stats = queue.stats().await;
        assert!(stats.peak_active <= 3);
        assert_eq!(stats.admitted_total, 20);

        let mut queries = backend.queries();
        queries.sort();
        queries.dedup();
        assert_eq!(queries.len(), 20);
        assert_eq!(backend.connect_count(), 20);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_starved_request_is_evicted() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Step::Sleep(Duration::from_secs(3)),
            Step::Token("[END]".to_string()),
        ]));
        let queue = queue_with(&backend, queue_config(1, 1_000));
        let worker = queue.start(CancellationToken::new());

        let _busy = queue.submit("busy".to_string(), None).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.stats().await.active, 1);

        let started = Instant::now();
        let mut starved = queue.submit("starved".to_string(), None).await;
        assert_eq!(starved.next_token().await, None);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(starved.wait_terminal().await, RequestPhase::Evicted);

        let stats = queue.stats().await;
        assert_eq!(stats.evicted_total, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(backend.queries(), vec!["busy".to_string()]);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_dial_failure_releases_slot() {
        let backend = Arc::new(ScriptedBackend::unreachable());
        let queue = queue_with(&backend, queue_config(2, 5_000));
        let worker = queue.start(CancellationToken::new());

        let mut handle = queue.submit("q".to_string(), None).await;
        assert_eq!(handle.next_token().await, None);
        assert_eq!(handle.wait_terminal().await, RequestPhase::Failed);

        wait_idle(&queue).await;
        let stats = queue.stats().await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.failed_total, 1);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_panicking_relay_releases_slot() {
        let backend = Arc::new(ScriptedBackend::new(vec![Step::Panic]));
        let queue = queue_with(&backend, queue_config(1, 5_000));
        let worker = queue.start(CancellationToken::new());

        let mut handle = queue.submit("q".to_string(), None).await;
        assert_eq!(handle.next_token().await, None);
        assert_eq!(handle.wait_terminal().await, RequestPhase::Failed);

        wait_idle(&queue).await;
        assert_eq!(queue.stats().await.failed_total, 1);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_leaves_waiting_outputs_open() {
        let backend = Arc::new(ScriptedBackend::tokens(&["[END]"]));
        let queue = queue_with(&backend, queue_config(0, 60_000));
        let worker = queue.start(CancellationToken::new());

        let mut handle = queue.submit("q".to_string(), None).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.stop().await;

        assert_eq!(queue.stats().await.pending, 1);
        assert_eq!(handle.phase(), RequestPhase::Queued);
        let read = tokio::time::timeout(Duration::from_millis(50), handle.next_token()).await;
        assert!(read.is_err(), "output should still be open");
        assert_eq!(backend.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_wakes_sweep_before_interval() {
        let backend = Arc::new(
            ScriptedBackend::tokens(&["[END]"]).with_token_delay(Duration::from_millis(50)),
        );
        let config = QueueConfig {
            scan_interval_ms: 60_000,
            ..queue_config(1, 120_000)
        };
        let queue = queue_with(&backend, config);
        let worker = queue.start(CancellationToken::new());

        let first = queue.submit("first".to_string(), None).await;
        let second = queue.submit("second".to_string(), None).await;

        // The second request only gets the slot when the first relay finishes,
        // which must wake the loop long before the next tick.
        let both = tokio::time::timeout(
            Duration::from_secs(2),
            futures_util::future::join(collect(first), collect(second)),
        )
        .await
        .unwrap();
        assert_eq!(both.0, vec!["[END]"]);
        assert_eq!(both.1, vec!["[END]"]);
        assert_eq!(queue.stats().await.peak_active, 1);
        worker.stop().await;
    }
}
