//! Message and conversation context value types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Free-form metadata attached to messages, decisions and conversations.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Metadata flag marking a message as system-originated.
pub const META_IS_SYSTEM: &str = "is_system";
/// Metadata key naming the conversation a message replies to.
pub const META_REPLY_TO_CONVERSATION: &str = "reply_to_conversation";
/// Metadata flag explicitly requesting a new conversation.
pub const META_START_CONVERSATION: &str = "start_conversation";
/// Metadata key binding a conversation to an agent.
pub const META_AGENT_ID: &str = "agent_id";
/// Metadata key selecting an agent persona for a conversation.
pub const META_AGENT_PERSONA: &str = "agent_persona";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Audio,
    Video,
    File,
    System,
}

/// Processing state of a message.
///
/// `Received -> Queued -> Processing -> {Processed | Failed | Ignored}`.
/// `Failed` is also reachable from `Received` and `Queued` when a fault hits
/// before the message reaches an agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Received,
    Queued,
    Processing,
    Processed,
    Failed,
    Ignored,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::Failed | Self::Ignored)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use MessageStatus::{Failed, Ignored, Processed, Processing, Queued, Received};
        matches!(
            (self, next),
            (Received, Queued | Failed)
                | (Queued, Processing | Ignored | Failed)
                | (Processing, Processed | Failed)
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::Ignored => "ignored",
        };
        f.write_str(s)
    }
}

/// A single message flowing through the interceptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl Message {
    /// Build a fresh text message with a random id and the current timestamp.
    pub fn new(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            content: content.into(),
            kind: MessageType::Text,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
            status: MessageStatus::Received,
            conversation_id: None,
        }
    }

    pub fn with_kind(mut self, kind: MessageType) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the metadata flag `key` is set to a truthy value.
    pub fn flag(&self, key: &str) -> bool {
        match self.metadata.get(key) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => {
                matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
            }
            Some(serde_json::Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
            _ => false,
        }
    }

    /// String-valued metadata lookup. Empty strings are treated as absent.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// Returns `false` and leaves the status untouched otherwise.
    pub fn transition(&mut self, next: MessageStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            tracing::warn!(
                message_id = %self.id,
                from = %self.status,
                to = %next,
                "rejected message status transition"
            );
            false
        }
    }
}

/// Persisted state of one conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationContext {
    pub conversation_id: String,
    pub participant_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub agent_persona: Option<String>,
}

fn default_active() -> bool {
    true
}

impl ConversationContext {
    pub fn has_participant(&self, participant_id: &str) -> bool {
        self.participant_ids.iter().any(|p| p == participant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine_is_linear() {
        use MessageStatus::*;
        assert!(Received.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Processing));
        assert!(Queued.can_transition_to(Ignored));
        assert!(Processing.can_transition_to(Processed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Processing.can_transition_to(Queued));
        assert!(!Processed.can_transition_to(Processing));
        assert!(!Ignored.can_transition_to(Queued));
        assert!(!Received.can_transition_to(Processed));
        assert!(Processed.is_terminal() && Failed.is_terminal() && Ignored.is_terminal());
    }

    #[test]
    fn transition_rejects_going_backwards() {
        let mut msg = Message::new("user_123", "assistant", "hello");
        assert!(msg.transition(MessageStatus::Queued));
        assert!(msg.transition(MessageStatus::Processing));
        assert!(!msg.transition(MessageStatus::Queued));
        assert_eq!(msg.status, MessageStatus::Processing);
    }

    #[test]
    fn message_serializes_with_lowercase_enums() {
        let msg = Message::new("user_123", "assistant", "hello").with_kind(MessageType::Image);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["status"], "received");
        assert!(json["conversation_id"].is_null());
    }

    #[test]
    fn message_survives_json_round_trip() {
        let mut msg = Message::new("user_123", "assistant", "hello")
            .with_metadata("channel", "sms")
            .with_metadata(META_IS_SYSTEM, false);
        msg.conversation_id = Some("c-1".into());
        msg.status = MessageStatus::Processed;

        let back: Message = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn context_survives_json_round_trip() {
        let now = Utc::now();
        let ctx = ConversationContext {
            conversation_id: "c-1".into(),
            participant_ids: vec!["user_123".into(), "assistant".into()],
            created_at: now,
            updated_at: now,
            metadata: Metadata::from([("topic".to_string(), serde_json::json!("billing"))]),
            is_active: true,
            agent_id: Some("support".into()),
            agent_persona: None,
        };
        let back: ConversationContext =
            serde_json::from_value(serde_json::to_value(&ctx).unwrap()).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn flag_accepts_common_truthy_encodings() {
        let msg = Message::new("a", "b", "")
            .with_metadata("x", true)
            .with_metadata("y", "yes")
            .with_metadata("z", 1)
            .with_metadata("n", "no");
        assert!(msg.flag("x"));
        assert!(msg.flag("y"));
        assert!(msg.flag("z"));
        assert!(!msg.flag("n"));
        assert!(!msg.flag("missing"));
    }

    #[test]
    fn meta_str_ignores_empty_and_non_strings() {
        let msg = Message::new("a", "b", "")
            .with_metadata(META_REPLY_TO_CONVERSATION, "")
            .with_metadata("num", 3);
        assert!(msg.meta_str(META_REPLY_TO_CONVERSATION).is_none());
        assert!(msg.meta_str("num").is_none());
    }
}
