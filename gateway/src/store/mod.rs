//! Conversation persistence.
//!
//! The session handler creates a conversation for a session that does not
//! name one and appends each completed exchange to it.

mod sqlite;

pub use sqlite::SqliteConversationStore;

use crate::models::{Conversation, ConversationSummary};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Conversation not found: {0}")]
    NotFound(String),
}

/// Storage for conversations and their exchanges.
pub trait ConversationStore: Send + Sync {
    /// Create an empty conversation owned by `owner`. Returns its id.
    fn create_conversation(&self, owner: &str) -> Result<String, StoreError>;

    /// Append one exchange to an existing conversation.
    fn append_exchange(&self, id: &str, query: &str, answer: &str) -> Result<(), StoreError>;

    fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    /// Conversations owned by `owner`, newest first.
    fn list_conversations(&self, owner: &str) -> Result<Vec<ConversationSummary>, StoreError>;

    /// Remove a conversation and its exchanges. Returns false if it did not exist.
    fn delete_conversation(&self, id: &str) -> Result<bool, StoreError>;
}
