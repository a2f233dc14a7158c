//! Transcript storage
//!
//! A transcript is the ordered, append-only message log of one conversation.
//! Stores do no business logic beyond enforcing that order: ownership checks,
//! titles and locking are the orchestrator's job.

mod jsonl;
mod memory;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;

use serde::{Deserialize, Serialize};
use sheerwater_ai::Message;
use std::sync::Arc;

use crate::error::StoreError;

/// Conversation metadata, without messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    /// Milliseconds since the epoch
    pub created_at: i64,
    /// Timestamp of the latest message, or `created_at` if none
    pub updated_at: i64,
    pub message_count: usize,
}

/// Persistent, per-conversation message log
pub trait TranscriptStore: Send + Sync {
    /// Create an empty conversation owned by `user_id` and return its id
    fn create(&self, user_id: &str) -> Result<String, StoreError>;

    /// All messages in append order
    fn load(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;

    /// Append one message. Returns only once the message is durable.
    ///
    /// Fails with [`StoreError::OutOfOrder`] if the message is older than the
    /// last one stored.
    fn append(&self, conversation_id: &str, message: &Message) -> Result<(), StoreError>;

    /// Metadata for a conversation, `None` if it does not exist
    fn get_conversation(&self, conversation_id: &str) -> Result<Option<ConversationInfo>, StoreError>;

    /// A user's conversations, most recently updated first
    fn list_conversations(&self, user_id: &str, limit: usize) -> Result<Vec<ConversationInfo>, StoreError>;

    fn set_title(&self, conversation_id: &str, title: &str) -> Result<(), StoreError>;

    fn delete(&self, conversation_id: &str) -> Result<(), StoreError>;
}

/// Type alias for a shared transcript store
pub type SharedTranscriptStore = Arc<dyn TranscriptStore>;

pub(crate) fn check_order(
    conversation_id: &str,
    last: Option<i64>,
    message: &Message,
) -> Result<(), StoreError> {
    match last {
        Some(last) if message.timestamp() < last => Err(StoreError::OutOfOrder {
            conversation_id: conversation_id.to_string(),
            timestamp: message.timestamp(),
            last,
        }),
        _ => Ok(()),
    }
}
