//! Storage key layout shared by the conversation store and the router.

use chrono::{DateTime, Utc};

const CONVERSATION_PREFIX: &str = "conversation:";
const CONTEXT_SUFFIX: &str = ":context";

/// Matches every conversation context record.
pub const CONTEXT_PATTERN: &str = "conversation:*:context";

pub fn context_key(conversation_id: &str) -> String {
    format!("{CONVERSATION_PREFIX}{conversation_id}{CONTEXT_SUFFIX}")
}

pub fn messages_key(conversation_id: &str) -> String {
    format!("{CONVERSATION_PREFIX}{conversation_id}:messages")
}

pub fn last_activity_key(conversation_id: &str) -> String {
    format!("{CONVERSATION_PREFIX}{conversation_id}:last_activity")
}

/// Ordered list of conversation ids a participant has started; newest last.
pub fn active_index_key(participant_id: &str) -> String {
    format!("active_conversations:{participant_id}")
}

/// Recover the conversation id from a [`context_key`].
pub fn id_from_context_key(key: &str) -> Option<&str> {
    key.strip_prefix(CONVERSATION_PREFIX)?
        .strip_suffix(CONTEXT_SUFFIX)
        .filter(|id| !id.is_empty())
}

/// Encoding of the `last_activity` scalar.
pub fn encode_timestamp(at: DateTime<Utc>) -> serde_json::Value {
    serde_json::Value::String(at.to_rfc3339())
}

pub fn decode_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
