mod builder;
mod state;

use std::sync::Arc;
use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tokio_util::sync::CancellationToken;

use crate::conversation::{AppendError, Conversation, Turn};
use crate::gateway::{Gateway, GatewayError};
use crate::tool::ToolRegistry;
pub use builder::AgentBuilder;

pub(crate) type TurnFn = Arc<dyn Fn(&Turn) + Send + Sync>;

/// Limits and switches of an [`AgentLoop`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopConfig {
    /// How many tool batches a single run may execute.
    pub max_round_trips: usize,
    /// How many times a transiently failed model request is retried.
    pub max_retries: usize,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound of the delay between retries.
    pub max_backoff: Duration,
    /// Runs all calls of a batch concurrently. Results are still appended
    /// in call order.
    pub parallel_tool_calls: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_round_trips: 25,
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            parallel_tool_calls: false,
        }
    }
}

impl LoopConfig {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// The reason a run did not produce a final answer.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The conversation has no user turn to answer.
    #[error("the conversation has no user input")]
    NoUserInput,
    /// The model request failed and retrying would not help.
    #[error("model request failed: {0}")]
    Gateway(#[source] GatewayError),
    /// The model request kept failing transiently.
    #[error("model request failed after {retries} retries: {last_error}")]
    RetriesExhausted {
        /// Number of retries made, equal to the configured maximum.
        retries: usize,
        /// The error of the final attempt.
        #[source]
        last_error: GatewayError,
    },
    /// The model asked for more tool batches than allowed.
    #[error("exceeded the limit of {limit} tool round trips")]
    LoopBudgetExceeded {
        /// The configured limit.
        limit: usize,
    },
    /// The model emitted tool calls that cannot be recorded.
    #[error("malformed model decision: {0}")]
    MalformedDecision(#[source] AppendError),
    /// The run was cancelled through its token.
    #[error("the run was cancelled")]
    Cancelled,
}

/// Everything a run hands back to its caller.
#[derive(Debug)]
pub struct RunReport {
    /// The conversation with every turn appended during the run, including
    /// the turns of a failed run.
    pub conversation: Conversation,
    /// The final answer, or why there is none.
    pub outcome: Result<String, AgentError>,
    /// Number of tool batches executed.
    pub round_trips: usize,
}

/// The agent loop, which alternates between asking the model for a decision
/// and running the tools it requests.
///
/// An agent holds no conversation. Each [`run`](Self::run) takes one by
/// value and returns it in the report, so a single agent can serve any
/// number of conversations one after another, or concurrently.
pub struct AgentLoop {
    gateway: Gateway,
    tools: ToolRegistry,
    config: LoopConfig,
    on_turn: Option<TurnFn>,
}

impl AgentLoop {
    /// Returns the registered tools.
    #[inline]
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Returns the loop configuration.
    #[inline]
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Runs the loop on `conversation` until the model gives a final answer,
    /// a failure occurs, or `cancel` is triggered.
    ///
    /// The conversation must contain at least one user turn. The final
    /// assistant turn is appended to the returned conversation.
    pub async fn run(
        &self,
        conversation: Conversation,
        cancel: &CancellationToken,
    ) -> RunReport {
        state::Run::new(self, conversation, cancel).drive().await
    }

    fn notify_turn(&self, turn: &Turn) {
        if let Some(on_turn) = &self.on_turn {
            on_turn(turn);
        }
    }
}
