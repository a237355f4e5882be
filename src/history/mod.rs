//! Conversation history and its durable storage

mod carryover;
mod conversation;
mod lock;
mod store;

pub use carryover::carryover_turns;
pub use conversation::{
    Conversation, Role, Turn, generate_conversation_id, validate_conversation_id,
    with_unique_suffix,
};
pub use lock::KeyedLocks;
pub use store::{ConversationSummary, FileHistoryStore, HistoryStore, MemoryHistoryStore};
