//! Helpers shared by unit and integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};

use crate::backend::{BackendConnection, BackendError, InferenceBackend, TokenStream};
use crate::config::{
    AuthConfig, BackendConfig, BackendKind, Config, DatabaseConfig, LoggingConfig, QueueConfig,
    ServerConfig, SessionConfig,
};
use crate::store::SqliteConversationStore;
use crate::{AppState, TokenVerifier};

pub const TEST_SECRET: &str = "test-secret";

/// One scripted event of a backend answer.
#[derive(Debug, Clone)]
pub enum Step {
    Token(String),
    /// Fail the stream with a receive error.
    Error(String),
    /// Pause without producing anything.
    Sleep(Duration),
    /// Never produce anything again.
    Stall,
    Panic,
}

/// Backend that replays a fixed script for every query and counts what the
/// relay does with it.
pub struct ScriptedBackend {
    steps: Vec<Step>,
    connect_error: Option<String>,
    reject: Option<String>,
    connect_delay: Duration,
    token_delay: Duration,
    connects: AtomicUsize,
    open: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    queries: Arc<Mutex<Vec<String>>>,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            connect_error: None,
            reject: None,
            connect_delay: Duration::ZERO,
            token_delay: Duration::ZERO,
            connects: AtomicUsize::new(0),
            open: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            queries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn tokens(tokens: &[&str]) -> Self {
        Self::new(tokens.iter().map(|t| Step::Token(t.to_string())).collect())
    }

    /// Every connection attempt fails.
    pub fn unreachable() -> Self {
        let mut backend = Self::new(Vec::new());
        backend.connect_error = Some("connection refused".to_string());
        backend
    }

    /// Connections succeed but every query is refused.
    pub fn rejecting(reason: &str) -> Self {
        let mut backend = Self::new(Vec::new());
        backend.reject = Some(reason.to_string());
        backend
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Connections handed out and not yet dropped.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Most connections ever open at the same time.
    pub fn peak_connections(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Queries issued, in order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn backend_type(&self) -> &'static str {
        "scripted"
    }

    async fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if let Some(reason) = &self.connect_error {
            return Err(BackendError::Unreachable(reason.clone()));
        }

        let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_open, Ordering::SeqCst);

        Ok(Box::new(ScriptedConnection {
            steps: self.steps.clone(),
            reject: self.reject.clone(),
            token_delay: self.token_delay,
            open: self.open.clone(),
            queries: self.queries.clone(),
        }))
    }
}

struct ScriptedConnection {
    steps: Vec<Step>,
    reject: Option<String>,
    token_delay: Duration,
    open: Arc<AtomicUsize>,
    queries: Arc<Mutex<Vec<String>>>,
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendConnection for ScriptedConnection {
    async fn open_stream(&mut self, query: &str) -> Result<TokenStream, BackendError> {
        if let Ok(mut queries) = self.queries.lock() {
            queries.push(query.to_string());
        }
        if let Some(reason) = &self.reject {
            return Err(BackendError::Rejected(reason.clone()));
        }

        let delay = self.token_delay;
        let stream = stream::iter(self.steps.clone()).filter_map(move |step| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match step {
                Step::Token(token) => Some(Ok(token)),
                Step::Error(message) => Some(Err(BackendError::Stream(message))),
                Step::Sleep(pause) => {
                    tokio::time::sleep(pause).await;
                    None
                }
                Step::Stall => futures_util::future::pending().await,
                Step::Panic => panic!("scripted backend panic"),
            }
        });

        Ok(stream.boxed())
    }
}

/// Configuration with short timeouts and an in-memory database.
pub fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        queue: QueueConfig {
            max_active: 5,
            grace_period_ms: 5_000,
            scan_interval_ms: 20,
            output_capacity: 10,
        },
        backend: BackendConfig {
            kind: BackendKind::Simulated,
            dial_timeout_secs: 1,
            query_timeout_secs: 5,
            ..BackendConfig::default()
        },
        session: SessionConfig {
            idle_timeout_secs: 2,
            handshake_timeout_secs: 2,
        },
        auth: AuthConfig {
            jwt_secret: TEST_SECRET.to_string(),
        },
        database: DatabaseConfig {
            url: ":memory:".to_string(),
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
        },
    }
}

/// State backed by `backend` and a fresh in-memory store.
pub fn create_test_state(
    config: Config,
    backend: Arc<dyn InferenceBackend>,
) -> (Arc<AppState>, Arc<SqliteConversationStore>) {
    let store = Arc::new(
        SqliteConversationStore::new(&config.database.url).expect("Failed to open test database"),
    );
    let state = Arc::new(AppState::new(config, backend, store.clone()));
    (state, store)
}

/// A token for `username` valid for one hour, signed with [`TEST_SECRET`].
pub fn mint_token(username: &str) -> String {
    let expires_at = (Utc::now().timestamp() + 3600) as u64;
    TokenVerifier::new(TEST_SECRET)
        .issue(username, expires_at)
        .expect("Failed to encode JWT")
}

/// A token for `username` that expired an hour ago.
pub fn mint_expired_token(username: &str) -> String {
    let expires_at = (Utc::now().timestamp() - 3600) as u64;
    TokenVerifier::new(TEST_SECRET)
        .issue(username, expires_at)
        .expect("Failed to encode JWT")
}
