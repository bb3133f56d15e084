//! Core message types shared by storage, routing and the interceptor.

pub mod types;

pub use types::{
    ConversationContext, Message, MessageStatus, MessageType, Metadata, META_AGENT_ID,
    META_AGENT_PERSONA, META_IS_SYSTEM, META_REPLY_TO_CONVERSATION, META_START_CONVERSATION,
};
