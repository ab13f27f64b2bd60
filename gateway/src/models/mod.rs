pub mod conversation;

pub use conversation::{Conversation, ConversationSummary, Exchange};
