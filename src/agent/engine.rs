//! Engine-backed agent and a keyword-scripted engine.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use super::traits::{Agent, Persona, ResponseEngine};
use crate::conversation::ConversationStore;
use crate::message::{ConversationContext, Message};

const DEFAULT_HISTORY_LIMIT: usize = 50;

/// An agent with an id and persona that delegates text generation to a
/// [`ResponseEngine`], feeding it recent conversation history.
pub struct EngineAgent {
    id: String,
    persona: Persona,
    engine: Option<Arc<dyn ResponseEngine>>,
    conversations: Option<Arc<dyn ConversationStore>>,
    history_limit: usize,
}

impl EngineAgent {
    pub fn new(id: impl Into<String>, persona: Persona) -> Self {
        Self {
            id: id.into(),
            persona,
            engine: None,
            conversations: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    #[must_use]
    pub fn with_engine(mut self, engine: Arc<dyn ResponseEngine>) -> Self {
        tracing::info!(agent = %self.id, engine = engine.name(), "agent engine configured");
        self.engine = Some(engine);
        self
    }

    /// Read history from `conversations` before each reply.
    #[must_use]
    pub fn with_history(mut self, conversations: Arc<dyn ConversationStore>, limit: usize) -> Self {
        self.conversations = Some(conversations);
        self.history_limit = limit;
        self
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    async fn history(&self, message: &Message, conversation_id: &str) -> Result<Vec<Message>> {
        let mut history = match &self.conversations {
            Some(store) => store
                .get_history(conversation_id, self.history_limit)
                .await
                .with_context(|| format!("failed to load history for {conversation_id}"))?,
            None => Vec::new(),
        };
        if history.last().map(|m| m.id.as_str()) != Some(message.id.as_str()) {
            history.push(message.clone());
        }
        Ok(history)
    }
}

#[async_trait]
impl Agent for EngineAgent {
    async fn process(
        &self,
        message: &Message,
        context: &ConversationContext,
    ) -> Result<Option<Message>> {
        let Some(engine) = &self.engine else {
            bail!("no response engine configured for agent `{}`", self.id);
        };

        let history = self.history(message, &context.conversation_id).await?;
        let content = engine
            .generate(message, &history, &self.persona)
            .await
            .with_context(|| format!("engine `{}` failed", engine.name()))?;

        let mut reply = Message::new(self.id.as_str(), message.sender_id.as_str(), content)
            .with_metadata("engine", engine.name());
        reply.conversation_id = Some(context.conversation_id.clone());

        tracing::info!(
            agent = %self.id,
            conversation_id = %context.conversation_id,
            "agent generated response"
        );
        Ok(Some(reply))
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// Canned replies selected by keyword, for tests and local runs.
pub struct ScriptedEngine {
    /// Checked in insertion order; first keyword contained in the message wins.
    responses: Vec<(String, String)>,
    fallback: Option<String>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            responses: Vec::new(),
            fallback: None,
        }
    }

    #[must_use]
    pub fn with_response(mut self, keyword: impl Into<String>, reply: impl Into<String>) -> Self {
        self.responses.push((keyword.into().to_lowercase(), reply.into()));
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseEngine for ScriptedEngine {
    async fn generate(&self, message: &Message, _history: &[Message], persona: &Persona) -> Result<String> {
        let content = message.content.to_lowercase();
        let text = self
            .responses
            .iter()
            .find(|(keyword, _)| content.contains(keyword.as_str()))
            .map(|(_, reply)| reply.clone())
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| format!("I received your message: '{}'.", message.content));

        if persona.name.is_empty() {
            Ok(text)
        } else {
            Ok(format!("[{}]: {text}", persona.name))
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
