//! Message routing: decides whether a message is processed and which
//! conversation it belongs to.

pub mod default;
pub mod rules;
pub mod traits;

pub use default::{should_start_conversation, RuleRouter, META_ROUTING_RULE};
pub use rules::{
    ExplicitReplyRule, KeywordRule, MessagePredicate, PatternRule, PredicateRule, SystemMessageRule,
};
pub use traits::{
    MessageRouter, RoutingDecision, RoutingError, RoutingRule, RuleDescriptor, RuleKind, RuleTarget,
};

use crate::config::RoutingConfig;
use crate::storage::Storage;
use std::sync::Arc;

/// Create the rule router described by `config`.
pub fn create_router(
    storage: Arc<dyn Storage>,
    config: &RoutingConfig,
) -> Result<Arc<dyn MessageRouter>, RoutingError> {
    Ok(Arc::new(RuleRouter::from_config(storage, config)?))
}
