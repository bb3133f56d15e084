//! Agents: the response-generating collaborators the interceptor delegates to.

pub mod engine;
pub mod traits;

pub use engine::{EngineAgent, ScriptedEngine};
pub use traits::{Agent, Persona, ResponseEngine};
