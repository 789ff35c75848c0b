use std::sync::Arc;

use toolloop_model::ModelProvider;

use super::{AgentLoop, LoopConfig};
use crate::conversation::Turn;
use crate::gateway::Gateway;
use crate::tool::{RegistryError, Tool, ToolRegistry};

/// [`AgentLoop`] builder.
pub struct AgentBuilder {
    gateway: Gateway,
    tools: ToolRegistry,
    config: LoopConfig,
    on_turn: Option<super::TurnFn>,
}

impl AgentBuilder {
    /// Creates a new builder with the specified model provider.
    #[inline]
    pub fn with_model_provider<P: ModelProvider + 'static>(
        provider: P,
    ) -> Self {
        Self::with_gateway(Gateway::new(provider))
    }

    /// Creates a new builder over an existing gateway.
    #[inline]
    pub fn with_gateway(gateway: Gateway) -> Self {
        Self {
            gateway,
            tools: ToolRegistry::new(),
            config: LoopConfig::default(),
            on_turn: None,
        }
    }

    /// Sets the system prompt sent ahead of every conversation.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.gateway = self.gateway.with_system_prompt(prompt);
        self
    }

    /// Replaces the tool registry.
    #[inline]
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Registers a tool.
    #[inline]
    pub fn with_tool<T: Tool>(mut self, tool: T) -> Result<Self, RegistryError> {
        self.tools.register(tool)?;
        Ok(self)
    }

    /// Sets the loop configuration.
    #[inline]
    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    /// Attaches a callback to be invoked after every appended turn.
    #[inline]
    pub fn on_turn(
        mut self,
        on_turn: impl Fn(&Turn) + Send + Sync + 'static,
    ) -> Self {
        self.on_turn = Some(Arc::new(on_turn));
        self
    }

    /// Attaches a callback to receive the model's text as it streams in.
    #[inline]
    pub fn on_transcript(
        mut self,
        on_transcript: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.gateway = self.gateway.on_delta(on_transcript);
        self
    }

    /// Builds the agent.
    #[inline]
    pub fn build(self) -> AgentLoop {
        let AgentBuilder {
            gateway,
            tools,
            config,
            on_turn,
        } = self;
        AgentLoop {
            gateway,
            tools,
            config,
            on_turn,
        }
    }
}
