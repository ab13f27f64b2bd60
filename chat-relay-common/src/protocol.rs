//! Client-facing session protocol.
//!
//! A session is one WebSocket connection carrying exactly one query.
//!
//! # Flow
//!
//! 1. Client connects to the gateway `/ws` endpoint (optionally with an
//!    `Authorization: Bearer` header)
//! 2. Client sends a single [`SessionRequest`] as a JSON text frame
//! 3. Gateway streams the answer back as plain text frames, one token each
//! 4. The last frame is [`END_MARKER`] when the answer completed normally,
//!    otherwise [`TIMEOUT_NOTICE`] or a JSON [`ErrorNotice`]
//!
//! Outbound frames are not JSON-wrapped so that tokens can be rendered as they
//! arrive. [`ServerFrame::parse`] classifies a received frame.

use serde::{Deserialize, Serialize};

/// Final frame of a successfully completed answer.
pub const END_MARKER: &str = "[END]";

/// Frame sent when no token arrived within the session idle window.
pub const TIMEOUT_NOTICE: &str = "Timeout: no response received.";

/// The single inbound message of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Prompt text.
    pub query: String,
    /// Existing conversation to append to. Absent or empty starts a new one.
    #[serde(default, rename = "chatid", skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    /// Bearer token, for clients that cannot set headers on the upgrade request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl SessionRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            chat_id: None,
            token: None,
        }
    }

    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Conversation id, treating an empty string as absent.
    pub fn chat_id(&self) -> Option<&str> {
        self.chat_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Check the message is usable before it is queued.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.query.trim().is_empty() {
            return Err("query cannot be empty");
        }
        Ok(())
    }
}

/// Error frame body: `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub error: String,
}

impl ErrorNotice {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // A struct with one String field always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"error\":\"{}\"}}", self.error))
    }
}

/// An outbound frame as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Token(String),
    End,
    Timeout,
    Error(String),
}

impl ServerFrame {
    /// Classify a text frame received from the gateway.
    pub fn parse(text: &str) -> Self {
        if text == END_MARKER {
            return ServerFrame::End;
        }
        if text == TIMEOUT_NOTICE {
            return ServerFrame::Timeout;
        }
        if text.starts_with('{') {
            if let Ok(notice) = serde_json::from_str::<ErrorNotice>(text) {
                return ServerFrame::Error(notice.error);
            }
        }
        ServerFrame::Token(text.to_string())
    }

    /// Whether no further frames follow this one.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ServerFrame::Token(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_request_wire_names() {
        let json = r#"{"query":"hello","chatid":"abc"}"#;
        let request: SessionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.query, "hello");
        assert_eq!(request.chat_id(), Some("abc"));
        assert!(request.token.is_none());

        let out = serde_json::to_value(SessionRequest::new("hi").with_token("t")).unwrap();
        assert_eq!(out, serde_json::json!({"query": "hi", "token": "t"}));
    }

    #[test]
    fn test_empty_chat_id_is_absent() {
        let request = SessionRequest::new("hello").with_chat_id("");
        assert_eq!(request.chat_id(), None);
    }

    #[test]
    fn test_validate_rejects_blank_query() {
        assert!(SessionRequest::new("  ").validate().is_err());
        assert!(SessionRequest::new("why is the sky blue").validate().is_ok());
    }

    #[test]
    fn test_missing_query_is_malformed() {
        let result = serde_json::from_str::<SessionRequest>(r#"{"chatid":"abc"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_frames() {
        assert_eq!(ServerFrame::parse("[END]"), ServerFrame::End);
        assert_eq!(ServerFrame::parse(TIMEOUT_NOTICE), ServerFrame::Timeout);
        assert_eq!(
            ServerFrame::parse(&ErrorNotice::new("Invalid JSON format").to_json()),
            ServerFrame::Error("Invalid JSON format".to_string())
        );
        assert_eq!(
            ServerFrame::parse(" world"),
            ServerFrame::Token(" world".to_string())
        );
        // A token that merely looks like JSON stays a token.
        assert_eq!(
            ServerFrame::parse("{\"a\":1}"),
            ServerFrame::Token("{\"a\":1}".to_string())
        );
    }

    #[test]
    fn test_terminal_frames() {
        assert!(ServerFrame::End.is_terminal());
        assert!(ServerFrame::Timeout.is_terminal());
        assert!(ServerFrame::Error("x".to_string()).is_terminal());
        assert!(!ServerFrame::Token("x".to_string()).is_terminal());
    }
}
