//! Conversation store contract and its value types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::message::{ConversationContext, Message, Metadata};
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("conversation `{0}` not found")]
    NotFound(String),

    #[error("conversation `{0}` is closed")]
    Closed(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("malformed record `{key}`: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConversationError>;

/// Summary figures for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationStats {
    pub conversation_id: String,
    pub message_count: usize,
    pub participant_count: usize,
    pub duration_secs: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle and history of conversations.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Open a conversation seeded with `seed`. Sender and recipient become
    /// participants; `agent_id` / `agent_persona` are taken from `metadata`.
    async fn create(&self, seed: &Message, metadata: Metadata) -> Result<ConversationContext>;

    async fn get(&self, conversation_id: &str) -> Result<Option<ConversationContext>>;

    /// Append `message` to the history and touch the activity timestamps.
    ///
    /// Fails with [`ConversationError::NotFound`] for an unknown id and
    /// [`ConversationError::Closed`] once the conversation was closed.
    async fn update(&self, conversation_id: &str, message: &Message) -> Result<()>;

    /// Active conversations, for one participant or across the store.
    async fn list_active(&self, participant_id: Option<&str>) -> Result<Vec<ConversationContext>>;

    /// Mark a conversation inactive and drop it from participants' indexes.
    async fn close(&self, conversation_id: &str) -> Result<()>;

    /// The last `limit` messages, oldest first.
    async fn get_history(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>>;

    async fn stats(&self, conversation_id: &str) -> Result<Option<ConversationStats>>;

    /// The name of this conversation store implementation.
    fn name(&self) -> &str;
}
