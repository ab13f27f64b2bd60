//! Configuration for the chat client.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the chat client.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Conversation to continue. Absent starts a new one.
    #[serde(default)]
    pub chat_id: Option<String>,
}

/// Gateway WebSocket connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Bearer token for the session.
    #[serde(default)]
    pub token: Option<String>,
    /// Send the token inside the session message instead of as a header.
    #[serde(default)]
    pub token_in_message: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            token: None,
            token_in_message: false,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

// Default values
fn default_ws_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (CHAT__SECTION__KEY format)
    /// 2. chat.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::builder()
            .add_source(File::with_name("chat").required(false))
            .add_source(
                Environment::with_prefix("CHAT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_gateway_config() {
        let gateway = GatewayConfig::default();
        assert_eq!(gateway.ws_url, "ws://127.0.0.1:8080/ws");
        assert_eq!(gateway.connect_timeout_secs, 10);
        assert!(gateway.token.is_none());
        assert!(!gateway.token_in_message);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = ConfigLoader::builder()
            .add_source(File::from_str(
                "chat_id = \"abc\"\n[gateway]\ntoken = \"t\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.chat_id.as_deref(), Some("abc"));
        assert_eq!(config.gateway.token.as_deref(), Some("t"));
        assert_eq!(config.gateway.ws_url, "ws://127.0.0.1:8080/ws");
    }
}
