//! Configuration for the gateway.

use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Admission queue tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Ceiling on concurrently running backend queries.
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    /// How long a request may wait unadmitted before it is evicted.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Interval of the sweep loop.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Capacity of each request's token channel.
    #[serde(default = "default_output_capacity")]
    pub output_capacity: usize,
}

impl QueueConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_active: default_max_active(),
            grace_period_ms: default_grace_period_ms(),
            scan_interval_ms: default_scan_interval_ms(),
            output_capacity: default_output_capacity(),
        }
    }
}

/// Which inference backend the relay talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Ollama,
    Simulated,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default = "default_backend_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
    /// Reply streamed by the simulated backend.
    #[serde(default = "default_simulated_reply")]
    pub simulated_reply: String,
}

impl BackendConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            base_url: default_backend_url(),
            model: default_model(),
            dial_timeout_secs: default_dial_timeout(),
            query_timeout_secs: default_query_timeout(),
            simulated_reply: default_simulated_reply(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Maximum wait for the next token before the client is told to give up.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Maximum wait for the client's request message after upgrade.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with whatever issues client tokens.
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_active() -> usize {
    5
}
fn default_grace_period_ms() -> u64 {
    5_000
}
fn default_scan_interval_ms() -> u64 {
    500
}
fn default_output_capacity() -> usize {
    10
}
fn default_backend_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "llama3.2".to_string()
}
fn default_dial_timeout() -> u64 {
    60
}
fn default_query_timeout() -> u64 {
    120
}
fn default_simulated_reply() -> String {
    "Simulated response".to_string()
}
fn default_idle_timeout() -> u64 {
    60
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_database_url() -> String {
    "sqlite:./data/conversations.db".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (GATEWAY__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Parse configuration from a TOML string layered over the defaults.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        ConfigLoader::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_queue_config() {
        let queue = QueueConfig::default();
        assert_eq!(queue.max_active, 5);
        assert_eq!(queue.grace_period(), Duration::from_secs(5));
        assert_eq!(queue.scan_interval(), Duration::from_millis(500));
        assert_eq!(queue.output_capacity, 10);
    }

    #[test]
    fn test_default_timeouts() {
        let backend = BackendConfig::default();
        assert_eq!(backend.dial_timeout(), Duration::from_secs(60));
        assert_eq!(backend.query_timeout(), Duration::from_secs(120));
        assert_eq!(backend.kind, BackendKind::Ollama);

        let session = SessionConfig::default();
        assert_eq!(session.idle_timeout(), Duration::from_secs(60));
        assert_eq!(session.handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_from_toml_layers_over_defaults() {
        let config = Config::from_toml(
            r#"
            [auth]
            jwt_secret = "s3cret"

            [queue]
            max_active = 2

            [backend]
            kind = "simulated"
            "#,
        )
        .unwrap();

        assert_eq!(config.auth.jwt_secret, "s3cret");
        assert_eq!(config.queue.max_active, 2);
        assert_eq!(config.queue.grace_period_ms, 5_000);
        assert_eq!(config.backend.kind, BackendKind::Simulated);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.url, "sqlite:./data/conversations.db");
    }

    #[test]
    fn test_missing_secret_is_an_error() {
        assert!(Config::from_toml("[queue]\nmax_active = 3\n").is_err());
    }
}
