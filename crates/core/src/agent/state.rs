use std::collections::VecDeque;

use backoff::backoff::Backoff;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use toolloop_model::ModelTool;

use super::{AgentError, AgentLoop, RunReport};
use crate::conversation::{Conversation, ToolCall, ToolOutcome, Turn};
use crate::gateway::AgentDecision;
use crate::tool::ToolResult;

#[derive(Debug)]
enum LoopState {
    AwaitingModel,
    ExecutingTools(Vec<ToolCall>),
    Done(String),
    Failed(AgentError),
}

/// A single run of the loop, owning the conversation until it finishes.
pub(super) struct Run<'a> {
    agent: &'a AgentLoop,
    conversation: Conversation,
    declarations: Vec<ModelTool>,
    round_trips: usize,
    cancel: &'a CancellationToken,
}

impl<'a> Run<'a> {
    pub fn new(
        agent: &'a AgentLoop,
        conversation: Conversation,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            agent,
            conversation,
            declarations: agent.tools.list_declarations(),
            round_trips: 0,
            cancel,
        }
    }

    pub async fn drive(mut self) -> RunReport {
        let mut state = if self.conversation.has_user_turn() {
            LoopState::AwaitingModel
        } else {
            LoopState::Failed(AgentError::NoUserInput)
        };

        let outcome = loop {
            if self.cancel.is_cancelled()
                && matches!(
                    state,
                    LoopState::AwaitingModel | LoopState::ExecutingTools(_)
                )
            {
                state = LoopState::Failed(AgentError::Cancelled);
            }
            trace!("loop state: {state:?}");

            state = match state {
                LoopState::AwaitingModel => self.await_model().await,
                LoopState::ExecutingTools(calls) => {
                    self.execute_tools(calls).await
                }
                LoopState::Done(text) => break Ok(text),
                LoopState::Failed(err) => break Err(err),
            };
        };

        if let Err(err) = &outcome {
            debug!("run failed: {err}");
        }
        RunReport {
            conversation: self.conversation,
            outcome,
            round_trips: self.round_trips,
        }
    }

    async fn await_model(&mut self) -> LoopState {
        let agent = self.agent;
        let config = &agent.config;
        let mut backoff = config.backoff();
        let mut retries = 0;
        loop {
            let decided = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return LoopState::Failed(AgentError::Cancelled);
                }
                decided = agent
                    .gateway
                    .decide(&self.conversation, &self.declarations) => decided,
            };

            let err = match decided {
                Ok(decision) => return self.accept_decision(decision),
                Err(err) if err.is_transient() => err,
                Err(err) => return LoopState::Failed(AgentError::Gateway(err)),
            };
            if retries >= config.max_retries {
                return LoopState::Failed(AgentError::RetriesExhausted {
                    retries,
                    last_error: err,
                });
            }

            retries += 1;
            let delay = backoff.next_backoff().unwrap_or(config.max_backoff);
            warn!(
                "model request failed ({err}), retry {retries}/{} in {delay:?}",
                config.max_retries
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return LoopState::Failed(AgentError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn accept_decision(&mut self, decision: AgentDecision) -> LoopState {
        match decision {
            AgentDecision::Final(text) => {
                let turn = Turn::assistant(text.clone());
                match self.append(turn) {
                    Ok(()) => LoopState::Done(text),
                    Err(err) => LoopState::Failed(err),
                }
            }
            AgentDecision::Invoke { text, calls } => {
                let limit = self.agent.config.max_round_trips;
                if self.round_trips >= limit {
                    return LoopState::Failed(AgentError::LoopBudgetExceeded {
                        limit,
                    });
                }
                let turn = Turn::Assistant {
                    text,
                    tool_calls: calls.clone(),
                };
                match self.append(turn) {
                    Ok(()) => LoopState::ExecutingTools(calls),
                    Err(err) => LoopState::Failed(err),
                }
            }
        }
    }

    async fn execute_tools(&mut self, calls: Vec<ToolCall>) -> LoopState {
        self.round_trips += 1;
        debug!(
            "executing {} tool call(s), round trip {}",
            calls.len(),
            self.round_trips
        );

        let agent = self.agent;
        let spawn = |call: &ToolCall| {
            let fut = agent.tools.invoke(&call.tool_name, &call.arguments);
            AbortOnDropHandle::new(tokio::spawn(fut))
        };
        // Handles dropped on an early return abort their tasks.
        let mut spawned: VecDeque<_> = if agent.config.parallel_tool_calls {
            calls.iter().map(spawn).collect()
        } else {
            VecDeque::new()
        };

        for call in calls {
            if self.cancel.is_cancelled() {
                return LoopState::Failed(AgentError::Cancelled);
            }
            let handle = match spawned.pop_front() {
                Some(handle) => handle,
                None => spawn(&call),
            };
            let joined = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return LoopState::Failed(AgentError::Cancelled);
                }
                joined = handle => joined,
            };

            let outcome = tool_outcome(&call, joined);
            let turn = Turn::ToolResult {
                call_id: call.id,
                tool_name: call.tool_name,
                outcome,
            };
            if let Err(err) = self.append(turn) {
                return LoopState::Failed(err);
            }
        }
        LoopState::AwaitingModel
    }

    fn append(&mut self, turn: Turn) -> Result<(), AgentError> {
        self.conversation
            .append(turn)
            .map_err(AgentError::MalformedDecision)?;
        if let Some(turn) = self.conversation.last() {
            self.agent.notify_turn(turn);
        }
        Ok(())
    }
}

fn tool_outcome(
    call: &ToolCall,
    joined: Result<ToolResult, JoinError>,
) -> ToolOutcome {
    match joined {
        Ok(Ok(output)) => ToolOutcome::Success(output),
        Ok(Err(err)) => {
            debug!("tool `{}` failed: {err}", call.tool_name);
            ToolOutcome::Failure(err.to_string())
        }
        Err(err) if err.is_panic() => {
            error!("tool `{}` panicked", call.tool_name);
            ToolOutcome::Failure(format!(
                "Execution error: tool `{}` panicked",
                call.tool_name
            ))
        }
        Err(err) => ToolOutcome::Failure(format!(
            "Execution error: tool `{}` did not finish: {err}",
            call.tool_name
        )),
    }
}
