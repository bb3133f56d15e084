//! Rule-based router backed by storage-tracked conversation activity.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use regex::Regex;
use std::cmp::Reverse;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use super::rules::{
    is_reserved, ExplicitReplyRule, KeywordRule, MessagePredicate, PatternRule, PredicateRule,
    SystemMessageRule,
};
use super::traits::{MessageRouter, RoutingDecision, RoutingError, RoutingRule, RuleDescriptor, RuleTarget};
use crate::config::RoutingConfig;
use crate::conversation::keys;
use crate::message::{Message, META_START_CONVERSATION};
use crate::storage::Storage;

/// Metadata key recording which rule produced a decision.
pub const META_ROUTING_RULE: &str = "routing_rule";

const DEFAULT_INACTIVITY_WINDOW: Duration = Duration::from_secs(30 * 60);
const DEFAULT_RULE_PRIORITY: i32 = 50;

const CONVERSATION_STARTERS: &[&str] = &[
    r"^(hi|hello|hey|start)",
    r"^(help|assist)",
    r"(new conversation|new chat)",
];

fn starter_patterns() -> &'static [Regex] {
    static STARTERS: OnceLock<Vec<Regex>> = OnceLock::new();
    STARTERS.get_or_init(|| {
        CONVERSATION_STARTERS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

/// Whether a message with no other routing should open a conversation.
///
/// Greeting, help and "new chat" phrases match, as does an explicit
/// `start_conversation` flag. Any other non-empty content also matches.
pub fn should_start_conversation(message: &Message) -> bool {
    let content = message.content.to_lowercase();
    if starter_patterns().iter().any(|re| re.is_match(&content)) {
        return true;
    }
    if message.flag(META_START_CONVERSATION) {
        return true;
    }
    !message.content.trim().is_empty()
}

/// Evaluates rules in descending priority, first match wins, then falls back
/// to the sender's recent conversation or a new one.
pub struct RuleRouter {
    storage: Arc<dyn Storage>,
    /// Kept sorted by descending priority; equal priorities keep insertion order.
    rules: Mutex<Vec<Arc<dyn RoutingRule>>>,
    inactivity_window: Duration,
    default_priority: i32,
}

impl RuleRouter {
    /// A router holding only the built-in rules.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let router = Self {
            storage,
            rules: Mutex::new(Vec::new()),
            inactivity_window: DEFAULT_INACTIVITY_WINDOW,
            default_priority: DEFAULT_RULE_PRIORITY,
        };
        router.insert(Arc::new(SystemMessageRule));
        router.insert(Arc::new(ExplicitReplyRule));
        router
    }

    /// Built-ins plus the keyword and pattern routes from `config`.
    pub fn from_config(storage: Arc<dyn Storage>, config: &RoutingConfig) -> Result<Self, RoutingError> {
        let router = Self::new(storage)
            .with_inactivity_window(Duration::from_secs(config.inactivity_timeout_secs))
            .with_default_priority(config.default_rule_priority);

        for route in &config.keyword_routes {
            let priority = route.priority.unwrap_or(router.default_priority);
            let rule = KeywordRule::new(route.keywords.iter().cloned(), route.target.clone(), priority)?;
            router.register(Arc::new(rule))?;
        }
        for route in &config.pattern_routes {
            let priority = route.priority.unwrap_or(router.default_priority);
            let rule = PatternRule::new(&route.pattern, route.target.clone(), priority)?;
            router.register(Arc::new(rule))?;
        }
        Ok(router)
    }

    #[must_use]
    pub fn with_inactivity_window(mut self, window: Duration) -> Self {
        self.inactivity_window = window;
        self
    }

    #[must_use]
    pub fn with_default_priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn default_priority(&self) -> i32 {
        self.default_priority
    }

    /// Register an arbitrary predicate at the default priority.
    pub fn register_predicate(
        &self,
        name: &str,
        predicate: Arc<dyn MessagePredicate>,
        target: RuleTarget,
    ) -> Result<(), RoutingError> {
        self.register(Arc::new(PredicateRule::new(
            name,
            predicate,
            target,
            self.default_priority,
        )))
    }

    fn register(&self, rule: Arc<dyn RoutingRule>) -> Result<(), RoutingError> {
        if is_reserved(rule.name()) {
            return Err(RoutingError::ReservedRuleName(rule.name().to_string()));
        }
        self.insert(rule);
        Ok(())
    }

    fn insert(&self, rule: Arc<dyn RoutingRule>) {
        let name = rule.name().to_string();
        let priority = rule.priority();
        let mut rules = self.rules.lock();
        // Replace existing rule with the same name
        rules.retain(|r| r.name() != name);
        rules.push(rule);
        rules.sort_by_key(|r| Reverse(r.priority()));
        drop(rules);
        tracing::info!(rule = %name, priority, "routing rule added");
    }

    /// Most recent entry of the sender's active-conversation index.
    async fn find_active_conversation(&self, sender_id: &str) -> anyhow::Result<Option<String>> {
        let latest = self
            .storage
            .get_list(&keys::active_index_key(sender_id), -1, -1)
            .await
            .context("active conversation lookup failed")?;
        Ok(latest
            .into_iter()
            .next()
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    async fn is_recently_active(&self, conversation_id: &str) -> anyhow::Result<bool> {
        let Some(raw) = self
            .storage
            .get(&keys::last_activity_key(conversation_id))
            .await
            .context("last activity lookup failed")?
        else {
            return Ok(false);
        };
        let Some(last) = keys::decode_timestamp(&raw) else {
            tracing::warn!(conversation_id, "unreadable last_activity timestamp");
            return Ok(false);
        };
        let window = TimeDelta::from_std(self.inactivity_window).unwrap_or(TimeDelta::MAX);
        Ok(Utc::now().signed_duration_since(last) < window)
    }

    async fn try_route(&self, message: &Message) -> anyhow::Result<RoutingDecision> {
        let existing = self.find_active_conversation(&message.sender_id).await?;

        let rules: Vec<Arc<dyn RoutingRule>> = self.rules.lock().clone();
        for rule in rules {
            if let Some(decision) = rule.evaluate(message)? {
                tracing::info!(message_id = %message.id, rule = %rule.name(), "message routed by rule");
                return Ok(decision.with_metadata(META_ROUTING_RULE, rule.name()));
            }
        }

        if let Some(conversation_id) = existing {
            if self.is_recently_active(&conversation_id).await? {
                return Ok(RoutingDecision::continue_with(
                    conversation_id,
                    "continuing active conversation",
                ));
            }
        }

        if should_start_conversation(message) {
            return Ok(RoutingDecision::create_new("starting new conversation"));
        }

        Ok(RoutingDecision::decline("no routing rule matched"))
    }
}

#[async_trait]
impl MessageRouter for RuleRouter {
    async fn route(&self, message: &Message) -> RoutingDecision {
        match self.try_route(message).await {
            Ok(decision) => {
                tracing::debug!(
                    message_id = %message.id,
                    should_process = decision.should_process,
                    reason = %decision.reason,
                    "routing decision"
                );
                decision
            }
            Err(e) => {
                tracing::error!(message_id = %message.id, "Error routing message: {e:#}");
                RoutingDecision::decline(format!("routing error: {e:#}"))
            }
        }
    }

    async fn add_rule(&self, rule: Arc<dyn RoutingRule>) -> Result<(), RoutingError> {
        self.register(rule)
    }

    async fn remove_rule(&self, name: &str) -> Result<bool, RoutingError> {
        if is_reserved(name) {
            return Err(RoutingError::ReservedRuleName(name.to_string()));
        }
        let mut rules = self.rules.lock();
        let before = rules.len();
        rules.retain(|r| r.name() != name);
        Ok(rules.len() != before)
    }

    async fn list_rules(&self) -> Vec<RuleDescriptor> {
        self.rules.lock().iter().map(|r| r.describe()).collect()
    }

    fn name(&self) -> &str {
        "rules"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{META_IS_SYSTEM, META_REPLY_TO_CONVERSATION};
    use crate::storage::{InMemoryStorage, StorageError};
    use serde_json::{json, Value};

    fn router() -> (Arc<InMemoryStorage>, RuleRouter) {
        let storage = Arc::new(InMemoryStorage::new());
        (storage.clone(), RuleRouter::new(storage))
    }

    async fn seed_conversation(storage: &InMemoryStorage, sender: &str, id: &str, age: TimeDelta) {
        storage
            .append_to_list(&keys::active_index_key(sender), json!(id))
            .await
            .unwrap();
        storage
            .set(
                &keys::last_activity_key(id),
                keys::encode_timestamp(Utc::now() - age),
                None,
            )
            .await
            .unwrap();
    }

    fn keyword(words: &[&str], target: RuleTarget, priority: i32) -> Arc<dyn RoutingRule> {
        Arc::new(KeywordRule::new(words.iter().copied(), target, priority).unwrap())
    }

    #[tokio::test]
    async fn builtins_are_registered_in_priority_order() {
        let (_, router) = router();
        let rules = router.list_rules().await;
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name, "ignore_system");
        assert_eq!(rules[0].priority, 100);
        assert_eq!(rules[1].name, "existing_conversation");
        assert!(rules.iter().all(|r| r.builtin));
    }

    #[tokio::test]
    async fn new_sender_greeting_creates_conversation() {
        let (_, router) = router();
        let decision = router.route(&Message::new("user_123", "assistant", "hello")).await;
        assert!(decision.should_process);
        assert!(decision.create_new_conversation);
        assert!(decision.conversation_id.is_none());
    }

    #[tokio::test]
    async fn system_message_declines_despite_custom_rules() {
        let (_, router) = router();
        router
            .add_rule(keyword(&["status"], RuleTarget::NewConversation, 50))
            .await
            .unwrap();
        router
            .register_predicate(
                "everything",
                Arc::new(|_: &Message| -> anyhow::Result<bool> { Ok(true) }),
                RuleTarget::NewConversation,
            )
            .unwrap();

        let msg = Message::new("sys", "assistant", "status report").with_metadata(META_IS_SYSTEM, true);
        let decision = router.route(&msg).await;
        assert!(!decision.should_process);
        assert!(decision.reason.contains("system"));
    }

    #[tokio::test]
    async fn explicit_reply_continues_named_conversation() {
        let (_, router) = router();
        let msg = Message::new("u", "bot", "thanks").with_metadata(META_REPLY_TO_CONVERSATION, "c-42");
        let decision = router.route(&msg).await;
        assert_eq!(decision.conversation_id.as_deref(), Some("c-42"));
        assert!(!decision.create_new_conversation);
        assert_eq!(decision.metadata[META_ROUTING_RULE], "existing_conversation");
    }

    #[tokio::test]
    async fn higher_priority_rule_fires_first_on_next_call() {
        let (_, router) = router();
        router
            .add_rule(keyword(&["refund"], RuleTarget::Conversation("billing".into()), 40))
            .await
            .unwrap();
        let msg = Message::new("u", "bot", "refund please");
        assert_eq!(router.route(&msg).await.conversation_id.as_deref(), Some("billing"));

        router
            .add_rule(Arc::new(
                KeywordRule::new(["refund"], RuleTarget::Conversation("escalations".into()), 95)
                    .unwrap()
                    .with_name("urgent_refunds"),
            ))
            .await
            .unwrap();
        assert_eq!(
            router.route(&msg).await.conversation_id.as_deref(),
            Some("escalations")
        );

        let priorities: Vec<i32> = router.list_rules().await.iter().map(|r| r.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort_by_key(|p| Reverse(*p));
        assert_eq!(priorities, sorted);
    }

    #[tokio::test]
    async fn equal_priorities_keep_registration_order() {
        let (_, router) = router();
        router
            .add_rule(keyword(&["a"], RuleTarget::Conversation("first".into()), 50))
            .await
            .unwrap();
        router
            .add_rule(Arc::new(
                KeywordRule::new(["a"], RuleTarget::Conversation("second".into()), 50)
                    .unwrap()
                    .with_name("second"),
            ))
            .await
            .unwrap();
        let decision = router.route(&Message::new("u", "bot", "a")).await;
        assert_eq!(decision.conversation_id.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn same_name_replaces_rule() {
        let (_, router) = router();
        router
            .add_rule(keyword(&["buy"], RuleTarget::NewConversation, 50))
            .await
            .unwrap();
        router
            .add_rule(keyword(&["buy"], RuleTarget::Conversation("sales".into()), 60))
            .await
            .unwrap();

        let rules = router.list_rules().await;
        assert_eq!(rules.iter().filter(|r| r.name == "keyword_rule_buy").count(), 1);
        let decision = router.route(&Message::new("u", "bot", "buy")).await;
        assert_eq!(decision.conversation_id.as_deref(), Some("sales"));
    }

    #[tokio::test]
    async fn builtin_names_are_reserved() {
        let (_, router) = router();
        let err = router
            .add_rule(Arc::new(
                KeywordRule::new(["x"], RuleTarget::NewConversation, 10)
                    .unwrap()
                    .with_name("ignore_system"),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::ReservedRuleName(_)));
        assert!(router.remove_rule("existing_conversation").await.is_err());
        assert_eq!(router.list_rules().await.len(), 2);
    }

    #[tokio::test]
    async fn remove_rule_by_name() {
        let (_, router) = router();
        router
            .add_rule(keyword(&["sale"], RuleTarget::NewConversation, 50))
            .await
            .unwrap();
        assert!(router.remove_rule("keyword_rule_sale").await.unwrap());
        assert!(!router.remove_rule("keyword_rule_sale").await.unwrap());
    }

    #[tokio::test]
    async fn recent_conversation_is_continued() {
        let (storage, router) = router();
        seed_conversation(&storage, "user_123", "c-1", TimeDelta::minutes(5)).await;

        let decision = router.route(&Message::new("user_123", "bot", "and another thing")).await;
        assert_eq!(decision.conversation_id.as_deref(), Some("c-1"));
        assert!(!decision.create_new_conversation);
    }

    #[tokio::test]
    async fn stale_conversation_starts_a_new_one() {
        let (storage, router) = router();
        seed_conversation(&storage, "user_123", "c-1", TimeDelta::minutes(31)).await;

        let decision = router.route(&Message::new("user_123", "bot", "hello again")).await;
        assert!(decision.create_new_conversation);
        assert!(decision.conversation_id.is_none());
    }

    #[tokio::test]
    async fn inactivity_window_is_configurable() {
        let storage = Arc::new(InMemoryStorage::new());
        let router = RuleRouter::new(storage.clone()).with_inactivity_window(Duration::from_secs(60));
        seed_conversation(&storage, "u", "c-1", TimeDelta::seconds(90)).await;
        assert!(router.route(&Message::new("u", "bot", "x")).await.create_new_conversation);
    }

    #[tokio::test]
    async fn latest_index_entry_wins() {
        let (storage, router) = router();
        seed_conversation(&storage, "u", "old", TimeDelta::minutes(1)).await;
        seed_conversation(&storage, "u", "new", TimeDelta::minutes(1)).await;
        let decision = router.route(&Message::new("u", "bot", "x")).await;
        assert_eq!(decision.conversation_id.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn blank_message_is_declined() {
        let (_, router) = router();
        let decision = router.route(&Message::new("u", "bot", "   ")).await;
        assert!(!decision.should_process);
        assert_eq!(decision.reason, "no routing rule matched");
    }

    #[tokio::test]
    async fn start_flag_opens_conversation_for_empty_content() {
        let (_, router) = router();
        let msg = Message::new("u", "bot", "").with_metadata(META_START_CONVERSATION, true);
        assert!(router.route(&msg).await.create_new_conversation);
    }

    #[test]
    fn starter_heuristics() {
        assert!(should_start_conversation(&Message::new("u", "b", "Hey there")));
        assert!(should_start_conversation(&Message::new("u", "b", "HELP me")));
        assert!(should_start_conversation(&Message::new("u", "b", "let's start a new chat")));
        assert!(should_start_conversation(&Message::new("u", "b", "anything at all")));
        assert!(!should_start_conversation(&Message::new("u", "b", "")));
    }

    #[tokio::test]
    async fn failing_predicate_becomes_decline() {
        let (_, router) = router();
        router
            .register_predicate(
                "broken",
                Arc::new(|_: &Message| -> anyhow::Result<bool> { anyhow::bail!("regex table corrupt") }),
                RuleTarget::NewConversation,
            )
            .unwrap();
        let decision = router.route(&Message::new("u", "bot", "hello")).await;
        assert!(!decision.should_process);
        assert!(decision.reason.contains("regex table corrupt"));
    }

    struct UnavailableStorage;

    #[async_trait]
    impl Storage for UnavailableStorage {
        async fn get(&self, _key: &str) -> crate::storage::Result<Option<Value>> {
            Err(StorageError::backend("test", "connection refused"))
        }
        async fn set(&self, _key: &str, _v: Value, _ttl: Option<u64>) -> crate::storage::Result<()> {
            Err(StorageError::backend("test", "connection refused"))
        }
        async fn delete(&self, _key: &str) -> crate::storage::Result<()> {
            Ok(())
        }
        async fn exists(&self, _key: &str) -> crate::storage::Result<bool> {
            Ok(false)
        }
        async fn list_keys(&self, _pattern: &str) -> crate::storage::Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn append_to_list(&self, _key: &str, _v: Value) -> crate::storage::Result<()> {
            Err(StorageError::backend("test", "connection refused"))
        }
        async fn get_list(&self, _key: &str, _s: i64, _e: i64) -> crate::storage::Result<Vec<Value>> {
            Err(StorageError::backend("test", "connection refused"))
        }
        fn name(&self) -> &str {
            "unavailable"
        }
    }

    #[tokio::test]
    async fn storage_failure_becomes_decline() {
        let router = RuleRouter::new(Arc::new(UnavailableStorage));
        let decision = router.route(&Message::new("u", "bot", "hello")).await;
        assert!(!decision.should_process);
        assert!(decision.reason.contains("connection refused"));
    }

    #[tokio::test]
    async fn from_config_registers_routes() {
        let storage = Arc::new(InMemoryStorage::new());
        let config: RoutingConfig = toml::from_str(
            r#"
default_rule_priority = 45

[[keyword_routes]]
keywords = ["support", "issue"]
priority = 80

[[pattern_routes]]
pattern = "^ticket-\\d+"
target = { conversation = "desk" }
"#,
        )
        .unwrap();

        let router = RuleRouter::from_config(storage, &config).unwrap();
        let rules = router.list_rules().await;
        let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "ignore_system",
                "existing_conversation",
                "keyword_rule_support",
                r"pattern_rule_^ticket-\d+"
            ]
        );
        assert_eq!(rules[3].priority, 45);

        let decision = router.route(&Message::new("u", "bot", "TICKET-7 update")).await;
        assert_eq!(decision.conversation_id.as_deref(), Some("desk"));
    }

    #[tokio::test]
    async fn from_config_rejects_bad_pattern() {
        let mut config = RoutingConfig::default();
        config.pattern_routes.push(crate::config::PatternRoute {
            pattern: "[".into(),
            target: RuleTarget::NewConversation,
            priority: None,
        });
        let result = RuleRouter::from_config(Arc::new(InMemoryStorage::new()), &config);
        assert!(matches!(result, Err(RoutingError::InvalidPattern { .. })));
    }
}
