//! Conversation store persisted through the storage abstraction.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use super::keys;
use super::traits::{ConversationError, ConversationStats, ConversationStore, Result};
use crate::message::{ConversationContext, Message, Metadata, META_AGENT_ID, META_AGENT_PERSONA};
use crate::storage::{KeyLocks, Storage};

pub struct DefaultConversationStore {
    storage: Arc<dyn Storage>,
    /// Serializes writers of each participant's active index.
    index_locks: KeyLocks,
}

impl DefaultConversationStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            index_locks: KeyLocks::new(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    async fn save_context(&self, context: &ConversationContext) -> Result<()> {
        let key = keys::context_key(&context.conversation_id);
        let value = serde_json::to_value(context)
            .map_err(|source| ConversationError::Serialization { key: key.clone(), source })?;
        self.storage.set(&key, value, None).await?;
        Ok(())
    }

    async fn append_message(&self, conversation_id: &str, message: &Message) -> Result<()> {
        let key = keys::messages_key(conversation_id);
        let mut stored = message.clone();
        stored.conversation_id.get_or_insert_with(|| conversation_id.to_string());
        let value = serde_json::to_value(&stored)
            .map_err(|source| ConversationError::Serialization { key: key.clone(), source })?;
        self.storage.append_to_list(&key, value).await?;
        Ok(())
    }

    async fn touch_activity(&self, conversation_id: &str) -> Result<()> {
        self.storage
            .set(
                &keys::last_activity_key(conversation_id),
                keys::encode_timestamp(Utc::now()),
                None,
            )
            .await?;
        Ok(())
    }

    async fn require(&self, conversation_id: &str) -> Result<ConversationContext> {
        self.get(conversation_id)
            .await?
            .ok_or_else(|| ConversationError::NotFound(conversation_id.to_string()))
    }

    /// Rewrite a participant's index without `conversation_id`.
    async fn prune_index(&self, participant_id: &str, conversation_id: &str) -> Result<()> {
        let key = keys::active_index_key(participant_id);
        let _guard = self.index_locks.acquire(&key).await;
        let entries = self.storage.get_list(&key, 0, -1).await?;
        if !entries.iter().any(|v| v.as_str() == Some(conversation_id)) {
            return Ok(());
        }

        self.storage.delete(&key).await?;
        for entry in entries
            .into_iter()
            .filter(|v| v.as_str() != Some(conversation_id))
        {
            self.storage.append_to_list(&key, entry).await?;
        }
        Ok(())
    }

    async fn load_active(&self, ids: Vec<String>) -> Result<Vec<ConversationContext>> {
        let mut seen = HashSet::new();
        let mut active = Vec::new();
        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(context) = self.get(&id).await? {
                if context.is_active {
                    active.push(context);
                }
            }
        }
        Ok(active)
    }
}

fn participants(seed: &Message) -> Vec<String> {
    let mut ids: Vec<String> = Vec::with_capacity(2);
    for id in [&seed.sender_id, &seed.recipient_id] {
        if !id.is_empty() && !ids.contains(id) {
            ids.push(id.clone());
        }
    }
    ids
}

fn meta_string(metadata: &Metadata, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl ConversationStore for DefaultConversationStore {
    async fn create(&self, seed: &Message, metadata: Metadata) -> Result<ConversationContext> {
        let now = Utc::now();
        let context = ConversationContext {
            conversation_id: uuid::Uuid::new_v4().to_string(),
            participant_ids: participants(seed),
            created_at: now,
            updated_at: now,
            agent_id: meta_string(&metadata, META_AGENT_ID),
            agent_persona: meta_string(&metadata, META_AGENT_PERSONA),
            metadata,
            is_active: true,
        };
        let id = context.conversation_id.as_str();

        self.save_context(&context).await?;
        {
            let index = keys::active_index_key(&seed.sender_id);
            let _guard = self.index_locks.acquire(&index).await;
            self.storage.append_to_list(&index, Value::from(id)).await?;
        }
        self.append_message(id, seed).await?;
        self.touch_activity(id).await?;

        tracing::info!(
            conversation_id = %id,
            sender = %seed.sender_id,
            agent = ?context.agent_id,
            "conversation created"
        );
        Ok(context)
    }

    async fn get(&self, conversation_id: &str) -> Result<Option<ConversationContext>> {
        let key = keys::context_key(conversation_id);
        let Some(value) = self.storage.get(&key).await? else {
            return Ok(None);
        };
        let context = serde_json::from_value(value)
            .map_err(|source| ConversationError::Serialization { key, source })?;
        Ok(Some(context))
    }

    async fn update(&self, conversation_id: &str, message: &Message) -> Result<()> {
        let mut context = self.require(conversation_id).await?;
        if !context.is_active {
            return Err(ConversationError::Closed(conversation_id.to_string()));
        }
        context.updated_at = Utc::now();
        self.save_context(&context).await?;
        self.append_message(conversation_id, message).await?;
        self.touch_activity(conversation_id).await?;

        tracing::debug!(
            conversation_id,
            message_id = %message.id,
            "conversation updated"
        );
        Ok(())
    }

    async fn list_active(&self, participant_id: Option<&str>) -> Result<Vec<ConversationContext>> {
        let ids: Vec<String> = match participant_id {
            Some(participant) => self
                .storage
                .get_list(&keys::active_index_key(participant), 0, -1)
                .await?
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            None => self
                .storage
                .list_keys(keys::CONTEXT_PATTERN)
                .await?
                .iter()
                .filter_map(|k| keys::id_from_context_key(k).map(str::to_string))
                .collect(),
        };
        self.load_active(ids).await
    }

    async fn close(&self, conversation_id: &str) -> Result<()> {
        let mut context = self.require(conversation_id).await?;
        context.is_active = false;
        context.updated_at = Utc::now();
        self.save_context(&context).await?;

        for participant in &context.participant_ids {
            self.prune_index(participant, conversation_id).await?;
        }

        tracing::info!(conversation_id, "conversation closed");
        Ok(())
    }

    async fn get_history(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let start = -i64::try_from(limit).unwrap_or(i64::MAX);
        let entries = self
            .storage
            .get_list(&keys::messages_key(conversation_id), start, -1)
            .await?;

        Ok(entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<Message>(entry) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!(conversation_id, "skipping malformed history entry: {e}");
                    None
                }
            })
            .collect())
    }

    async fn stats(&self, conversation_id: &str) -> Result<Option<ConversationStats>> {
        let Some(context) = self.get(conversation_id).await? else {
            return Ok(None);
        };
        let message_count = self
            .storage
            .get_list(&keys::messages_key(conversation_id), 0, -1)
            .await?
            .len();

        Ok(Some(ConversationStats {
            conversation_id: context.conversation_id,
            message_count,
            participant_count: context.participant_ids.len(),
            duration_secs: (context.updated_at - context.created_at).num_seconds(),
            is_active: context.is_active,
            created_at: context.created_at,
            updated_at: context.updated_at,
        }))
    }

    fn name(&self) -> &str {
        "default"
    }
}
