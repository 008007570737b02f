//! Two-party conversation messaging: the REST message store and the relay
//! room that broadcasts new messages.

pub mod api;
pub mod room;

pub use api::{ChatError, MessageApi};
pub use room::ConversationRoom;
