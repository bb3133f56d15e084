//! Conversation lifecycle: contexts, participant indexes and message history.

pub mod default;
pub mod keys;
pub mod traits;

pub use default::DefaultConversationStore;
pub use traits::{ConversationError, ConversationStats, ConversationStore};

use crate::storage::Storage;
use std::sync::Arc;

/// Create a conversation store persisted through `storage`.
pub fn create_conversation_store(storage: Arc<dyn Storage>) -> Arc<dyn ConversationStore> {
    Arc::new(DefaultConversationStore::new(storage))
}
