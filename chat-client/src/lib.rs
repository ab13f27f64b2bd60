//! Terminal client for the chat-relay gateway.

pub mod client;
pub mod config;
pub mod error;

pub use client::{ChatClient, Outcome, Reply};
pub use config::{Config, GatewayConfig};
pub use error::{Error, Result};
