//! Core logic including the agent loop, tool registry, model gateway,
//! conversation state and transcript persistence.

#![deny(missing_docs)]
#![deny(clippy::missing_safety_doc)]

#[macro_use]
extern crate tracing;

mod agent;
pub mod conversation;
mod gateway;
pub mod tool;
pub mod transcript;

pub use agent::{AgentBuilder, AgentError, AgentLoop, LoopConfig, RunReport};
pub use conversation::{Conversation, ToolCall, ToolOutcome, Turn};
pub use gateway::{AgentDecision, Gateway, GatewayError};
