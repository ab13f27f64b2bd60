//! Client sessions: one WebSocket connection, one query, one streamed answer.

mod transcript;
mod ws;

pub use transcript::{PendingExchange, Transcript};
pub use ws::ws_handler;
