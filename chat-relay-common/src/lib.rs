//! chat-relay Common Types
//!
//! Wire types shared by the gateway and its clients.

pub mod protocol;

pub use protocol::{ErrorNotice, ServerFrame, SessionRequest, END_MARKER, TIMEOUT_NOTICE};
