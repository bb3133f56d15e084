//! Agent traits: the capability that turns a message plus conversation
//! context into a reply.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::message::{ConversationContext, Message};

/// Produces replies for messages routed into a conversation.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Generate a reply to `message`. `Ok(None)` means the agent chose not to answer.
    ///
    /// Fails when the agent has no way to generate responses.
    async fn process(&self, message: &Message, context: &ConversationContext)
        -> Result<Option<Message>>;

    /// Identifier conversations bind to via `agent_id`.
    fn id(&self) -> &str;
}

/// Text generation backend behind an agent (LLM client, canned replies, ...).
#[async_trait]
pub trait ResponseEngine: Send + Sync {
    /// Reply text for `message`. `history` is oldest first and ends with `message`.
    async fn generate(&self, message: &Message, history: &[Message], persona: &Persona)
        -> Result<String>;

    fn name(&self) -> &str;
}

/// How an agent presents itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub role: String,
    pub personality: String,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl Persona {
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        personality: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            personality: personality.into(),
            instructions: None,
        }
    }

    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// System prompt rendered from the persona fields.
    pub fn system_prompt(&self) -> String {
        let mut prompt = format!("You are {}, a {}.\nPersonality: {}\n", self.name, self.role, self.personality);
        if let Some(instructions) = &self.instructions {
            prompt.push_str(&format!("Instructions: {instructions}\n"));
        }
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_includes_optional_instructions() {
        let persona = Persona::new("Ada", "support engineer", "patient");
        assert_eq!(
            persona.system_prompt(),
            "You are Ada, a support engineer.\nPersonality: patient\n"
        );
        let persona = persona.with_instructions("Never promise refunds");
        assert!(persona.system_prompt().ends_with("Instructions: Never promise refunds\n"));
    }
}
