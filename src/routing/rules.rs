//! Built-in and custom routing rule kinds.

use regex::{Regex, RegexBuilder};
use std::sync::Arc;

use super::traits::{RoutingDecision, RoutingError, RoutingRule, RuleDescriptor, RuleKind, RuleTarget};
use crate::message::{Message, META_IS_SYSTEM, META_REPLY_TO_CONVERSATION};

pub const SYSTEM_RULE_NAME: &str = "ignore_system";
pub const SYSTEM_RULE_PRIORITY: i32 = 100;
pub const EXPLICIT_REPLY_RULE_NAME: &str = "existing_conversation";
pub const EXPLICIT_REPLY_RULE_PRIORITY: i32 = 90;

/// Names custom rules may not take.
pub const RESERVED_RULE_NAMES: &[&str] = &[SYSTEM_RULE_NAME, EXPLICIT_REPLY_RULE_NAME];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_RULE_NAMES.contains(&name)
}

/// Declines anything flagged `is_system`.
pub struct SystemMessageRule;

impl RoutingRule for SystemMessageRule {
    fn name(&self) -> &str {
        SYSTEM_RULE_NAME
    }

    fn priority(&self) -> i32 {
        SYSTEM_RULE_PRIORITY
    }

    fn evaluate(&self, message: &Message) -> anyhow::Result<Option<RoutingDecision>> {
        Ok(message
            .flag(META_IS_SYSTEM)
            .then(|| RoutingDecision::decline("system message ignored")))
    }

    fn describe(&self) -> RuleDescriptor {
        RuleDescriptor {
            name: SYSTEM_RULE_NAME.into(),
            priority: SYSTEM_RULE_PRIORITY,
            kind: RuleKind::SystemMessage,
            target: None,
            builtin: true,
        }
    }
}

/// Continues the conversation named in `reply_to_conversation`.
pub struct ExplicitReplyRule;

impl RoutingRule for ExplicitReplyRule {
    fn name(&self) -> &str {
        EXPLICIT_REPLY_RULE_NAME
    }

    fn priority(&self) -> i32 {
        EXPLICIT_REPLY_RULE_PRIORITY
    }

    fn evaluate(&self, message: &Message) -> anyhow::Result<Option<RoutingDecision>> {
        Ok(message
            .meta_str(META_REPLY_TO_CONVERSATION)
            .map(|id| RoutingDecision::continue_with(id, "continuing existing conversation")))
    }

    fn describe(&self) -> RuleDescriptor {
        RuleDescriptor {
            name: EXPLICIT_REPLY_RULE_NAME.into(),
            priority: EXPLICIT_REPLY_RULE_PRIORITY,
            kind: RuleKind::ExplicitReply,
            target: None,
            builtin: true,
        }
    }
}

/// Fires when the content contains any keyword, ignoring case.
pub struct KeywordRule {
    name: String,
    keywords: Vec<String>,
    target: RuleTarget,
    priority: i32,
}

impl KeywordRule {
    /// Named `keyword_rule_<first keyword>`. Blank keywords are dropped.
    pub fn new(
        keywords: impl IntoIterator<Item = impl Into<String>>,
        target: RuleTarget,
        priority: i32,
    ) -> Result<Self, RoutingError> {
        let keywords: Vec<String> = keywords
            .into_iter()
            .map(|k| k.into().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        let first = keywords.first().ok_or(RoutingError::EmptyKeywords)?;
        Ok(Self {
            name: format!("keyword_rule_{first}"),
            keywords,
            target,
            priority,
        })
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl RoutingRule for KeywordRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn evaluate(&self, message: &Message) -> anyhow::Result<Option<RoutingDecision>> {
        let content = message.content.to_lowercase();
        Ok(self
            .keywords
            .iter()
            .find(|k| content.contains(k.as_str()))
            .map(|k| self.target.decision(format!("keyword match: {k}"))))
    }

    fn describe(&self) -> RuleDescriptor {
        RuleDescriptor {
            name: self.name.clone(),
            priority: self.priority,
            kind: RuleKind::Keyword {
                keywords: self.keywords.clone(),
            },
            target: Some(self.target.clone()),
            builtin: false,
        }
    }
}

/// Fires when a case-insensitive regex finds a match in the content.
pub struct PatternRule {
    name: String,
    pattern: String,
    regex: Regex,
    target: RuleTarget,
    priority: i32,
}

impl PatternRule {
    /// Named `pattern_rule_<first 20 chars of pattern>`.
    pub fn new(pattern: &str, target: RuleTarget, priority: i32) -> Result<Self, RoutingError> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| RoutingError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
        let short: String = pattern.chars().take(20).collect();
        Ok(Self {
            name: format!("pattern_rule_{short}"),
            pattern: pattern.to_string(),
            regex,
            target,
            priority,
        })
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl RoutingRule for PatternRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn evaluate(&self, message: &Message) -> anyhow::Result<Option<RoutingDecision>> {
        Ok(self
            .regex
            .is_match(&message.content)
            .then(|| self.target.decision(format!("pattern match: {}", self.pattern))))
    }

    fn describe(&self) -> RuleDescriptor {
        RuleDescriptor {
            name: self.name.clone(),
            priority: self.priority,
            kind: RuleKind::Pattern {
                pattern: self.pattern.clone(),
            },
            target: Some(self.target.clone()),
            builtin: false,
        }
    }
}

/// Arbitrary message test used by [`PredicateRule`].
pub trait MessagePredicate: Send + Sync {
    fn matches(&self, message: &Message) -> anyhow::Result<bool>;
}

impl<F> MessagePredicate for F
where
    F: Fn(&Message) -> anyhow::Result<bool> + Send + Sync,
{
    fn matches(&self, message: &Message) -> anyhow::Result<bool> {
        self(message)
    }
}

pub struct PredicateRule {
    name: String,
    predicate: Arc<dyn MessagePredicate>,
    target: RuleTarget,
    priority: i32,
}

impl PredicateRule {
    pub fn new(
        name: impl Into<String>,
        predicate: Arc<dyn MessagePredicate>,
        target: RuleTarget,
        priority: i32,
    ) -> Self {
        Self {
            name: name.into(),
            predicate,
            target,
            priority,
        }
    }
}

impl RoutingRule for PredicateRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn evaluate(&self, message: &Message) -> anyhow::Result<Option<RoutingDecision>> {
        let matched = self
            .predicate
            .matches(message)
            .map_err(|e| e.context(format!("predicate rule `{}` failed", self.name)))?;
        Ok(matched.then(|| self.target.decision(format!("predicate match: {}", self.name))))
    }

    fn describe(&self) -> RuleDescriptor {
        RuleDescriptor {
            name: self.name.clone(),
            priority: self.priority,
            kind: RuleKind::Predicate,
            target: Some(self.target.clone()),
            builtin: false,
        }
    }
}
