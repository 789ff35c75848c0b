use std::mem;

use tokio_util::sync::CancellationToken;
use toolloop_core::tool::RegistryError;
use toolloop_core::transcript::{TranscriptError, TranscriptStore};
use toolloop_core::conversation::CANCELLED_CALL_REASON;
use toolloop_core::{
    AgentBuilder, AgentError, AgentLoop, Conversation, LoopConfig, Turn,
};
use toolloop_model::ModelProvider;

use crate::tools::arithmetic_tools;

/// How a session treats earlier messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Memory {
    /// Every message starts a new conversation.
    Stateless,
    /// Messages accumulate into one conversation.
    #[default]
    Persistent,
}

/// Errors from building a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A tool could not be registered.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The saved conversation could not be loaded.
    #[error(transparent)]
    Transcript(#[from] TranscriptError),
}

/// A session builder.
///
/// See [`Session`].
pub struct SessionBuilder {
    agent_builder: AgentBuilder,
    arithmetic_tools: bool,
    memory: Memory,
    store: Option<Box<dyn TranscriptStore>>,
}

impl SessionBuilder {
    /// Creates a session builder with a specified model provider.
    pub fn with_model_provider<M: ModelProvider + 'static>(
        provider: M,
    ) -> Self {
        let agent_builder = AgentBuilder::with_model_provider(provider);
        Self {
            agent_builder,
            arithmetic_tools: true,
            memory: Memory::default(),
            store: None,
        }
    }

    /// Sets the system prompt for the agent.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.agent_builder = self.agent_builder.with_system_prompt(prompt);
        self
    }

    /// Sets the loop configuration.
    #[inline]
    pub fn with_loop_config(mut self, config: LoopConfig) -> Self {
        self.agent_builder = self.agent_builder.with_config(config);
        self
    }

    /// Enables or disables the built-in arithmetic tools (enabled by
    /// default).
    #[inline]
    pub fn with_arithmetic_tools(mut self, enabled: bool) -> Self {
        self.arithmetic_tools = enabled;
        self
    }

    /// Sets how the session treats earlier messages.
    #[inline]
    pub fn with_memory(mut self, memory: Memory) -> Self {
        self.memory = memory;
        self
    }

    /// Sets where the conversation is loaded from and saved to.
    #[inline]
    pub fn with_transcript_store(
        mut self,
        store: impl TranscriptStore + 'static,
    ) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Attaches a callback to be invoked after every appended turn.
    #[inline]
    pub fn on_turn(
        mut self,
        on_turn: impl Fn(&Turn) + Send + Sync + 'static,
    ) -> Self {
        self.agent_builder = self.agent_builder.on_turn(on_turn);
        self
    }

    /// Attaches a callback to be invoked when a transcript is generated.
    #[inline]
    pub fn on_transcript(
        mut self,
        on_transcript: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.agent_builder = self.agent_builder.on_transcript(on_transcript);
        self
    }

    /// Builds a new session, loading the saved conversation if a store is
    /// set.
    pub fn build(self) -> Result<Session, SessionError> {
        let mut agent_builder = self.agent_builder;
        if self.arithmetic_tools {
            for tool in arithmetic_tools() {
                agent_builder = agent_builder.with_tool(tool)?;
            }
        }

        let mut conversation = match &self.store {
            Some(store) => store.load()?,
            None => Conversation::new(),
        };
        let closed = conversation.close_pending_calls(CANCELLED_CALL_REASON);
        if closed > 0 {
            warn!("closed {closed} unanswered tool call(s) of the saved chat");
        }
        if !conversation.is_empty() {
            info!("resuming a conversation of {} turn(s)", conversation.len());
        }

        Ok(Session {
            agent: agent_builder.build(),
            conversation,
            memory: self.memory,
            store: self.store,
        })
    }
}

/// A chat session, like a window that displays messages and has a input box.
///
/// The session holds a fully configured agent and the conversation so far.
pub struct Session {
    agent: AgentLoop,
    conversation: Conversation,
    memory: Memory,
    store: Option<Box<dyn TranscriptStore>>,
}

impl Session {
    /// Sends a message and runs the agent until it answers.
    ///
    /// The turns appended by the run are kept even if it fails, so a later
    /// [`save`](Self::save) records them.
    pub async fn send_message(
        &mut self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let mut conversation = match self.memory {
            Memory::Stateless => Conversation::new(),
            Memory::Persistent => mem::take(&mut self.conversation),
        };
        conversation.push_user(message);

        let report = self.agent.run(conversation, cancel).await;
        debug!(
            "run finished after {} round trip(s), {} turn(s) in total",
            report.round_trips,
            report.conversation.len()
        );
        self.conversation = report.conversation;
        report.outcome
    }

    /// Saves the conversation, if the session has a store.
    pub fn save(&self) -> Result<(), TranscriptError> {
        match &self.store {
            Some(store) => store.save(&self.conversation),
            None => Ok(()),
        }
    }

    /// Returns the conversation so far.
    #[inline]
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Returns the agent driving this session.
    #[inline]
    pub fn agent(&self) -> &AgentLoop {
        &self.agent
    }

    /// Returns how the session treats earlier messages.
    #[inline]
    pub fn memory(&self) -> Memory {
        self.memory
    }
}
