use chrono::{DateTime, Utc};
use serde::Serialize;

/// One query and the answer the backend streamed for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exchange {
    pub query: String,
    pub answer: String,
    pub created_at: DateTime<Utc>,
}

/// A conversation with its exchanges in the order they were appended.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    /// Username of the caller that created it
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub exchanges: Vec<Exchange>,
}

/// Listing entry for a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub exchange_count: usize,
}
