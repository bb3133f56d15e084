//! Routing traits and types for deciding whether and where a message goes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::message::{Message, Metadata};

/// Outcome of routing one message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub should_process: bool,
    /// Existing conversation to continue.
    pub conversation_id: Option<String>,
    pub create_new_conversation: bool,
    pub reason: String,
    /// Merged into the context of a newly created conversation.
    #[serde(default)]
    pub metadata: Metadata,
}

impl RoutingDecision {
    pub fn decline(reason: impl Into<String>) -> Self {
        Self {
            should_process: false,
            reason: reason.into(),
            ..Self::default()
        }
    }

    pub fn continue_with(conversation_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            should_process: true,
            conversation_id: Some(conversation_id.into()),
            reason: reason.into(),
            ..Self::default()
        }
    }

    pub fn create_new(reason: impl Into<String>) -> Self {
        Self {
            should_process: true,
            create_new_conversation: true,
            reason: reason.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Where a matching custom rule sends the message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    #[default]
    NewConversation,
    Conversation(String),
}

impl RuleTarget {
    pub fn decision(&self, reason: impl Into<String>) -> RoutingDecision {
        match self {
            Self::NewConversation => RoutingDecision::create_new(reason),
            Self::Conversation(id) => RoutingDecision::continue_with(id.clone(), reason),
        }
    }
}

/// What a rule matches on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    SystemMessage,
    ExplicitReply,
    Keyword { keywords: Vec<String> },
    Pattern { pattern: String },
    Predicate,
}

/// Inspectable summary of a registered rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleDescriptor {
    pub name: String,
    pub priority: i32,
    #[serde(flatten)]
    pub kind: RuleKind,
    pub target: Option<RuleTarget>,
    pub builtin: bool,
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("rule name `{0}` is reserved for a built-in rule")]
    ReservedRuleName(String),

    #[error("invalid routing pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("keyword rule needs at least one non-empty keyword")]
    EmptyKeywords,
}

/// A single routing rule. Higher priority is evaluated first.
pub trait RoutingRule: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32;

    /// `Ok(None)` when the rule does not apply to `message`.
    fn evaluate(&self, message: &Message) -> anyhow::Result<Option<RoutingDecision>>;

    fn describe(&self) -> RuleDescriptor;
}

/// Decides whether and where an incoming message is processed.
#[async_trait]
pub trait MessageRouter: Send + Sync {
    /// Route a message. Never fails: evaluation errors become a declining
    /// decision carrying the error text.
    async fn route(&self, message: &Message) -> RoutingDecision;

    /// Register a rule, replacing any custom rule with the same name.
    async fn add_rule(&self, rule: Arc<dyn RoutingRule>) -> Result<(), RoutingError>;

    /// Remove a custom rule by name. Returns whether one was removed.
    async fn remove_rule(&self, name: &str) -> Result<bool, RoutingError>;

    /// Registered rules in evaluation order.
    async fn list_rules(&self) -> Vec<RuleDescriptor>;

    /// The name of this router implementation.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_constructors() {
        let d = RoutingDecision::decline("nope");
        assert!(!d.should_process && d.conversation_id.is_none() && !d.create_new_conversation);

        let d = RoutingDecision::continue_with("c-1", "reply");
        assert!(d.should_process);
        assert_eq!(d.conversation_id.as_deref(), Some("c-1"));

        let d = RoutingDecision::create_new("hello").with_metadata("agent_id", "support");
        assert!(d.create_new_conversation);
        assert_eq!(d.metadata["agent_id"], "support");
    }

    #[test]
    fn target_maps_to_decision() {
        assert!(RuleTarget::NewConversation.decision("x").create_new_conversation);
        let d = RuleTarget::Conversation("desk".into()).decision("x");
        assert_eq!(d.conversation_id.as_deref(), Some("desk"));
        assert!(!d.create_new_conversation);
    }

    #[test]
    fn descriptor_serializes_flat() {
        let desc = RuleDescriptor {
            name: "keyword_rule_buy".into(),
            priority: 75,
            kind: RuleKind::Keyword {
                keywords: vec!["buy".into()],
            },
            target: Some(RuleTarget::NewConversation),
            builtin: false,
        };
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["kind"], "keyword");
        assert_eq!(json["keywords"][0], "buy");
        assert_eq!(json["target"], "new_conversation");
    }
}
