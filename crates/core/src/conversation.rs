//! Conversation-related types.

use std::borrow::Cow;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use toolloop_model::{ModelMessage, ToolCallRequest, ToolCallResult};

/// The failure reason given to tool calls that were abandoned before
/// producing a result.
pub const CANCELLED_CALL_REASON: &str = "cancelled";

/// A request from the model to invoke a named tool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier of this call, unique within a conversation.
    pub id: String,
    /// Name of the tool to invoke.
    pub tool_name: String,
    /// Arguments of the call, expected to be an object mapping parameter
    /// names to values.
    pub arguments: Value,
}

impl From<ToolCallRequest> for ToolCall {
    #[inline]
    fn from(req: ToolCallRequest) -> Self {
        Self {
            id: req.id,
            tool_name: req.name,
            arguments: req.arguments,
        }
    }
}

impl From<&ToolCall> for ToolCallRequest {
    #[inline]
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
        }
    }
}

/// What a tool call produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "content", rename_all = "snake_case")]
pub enum ToolOutcome {
    /// The tool returned normally.
    Success(String),
    /// The call could not be completed, the payload describes why.
    Failure(String),
}

impl ToolOutcome {
    /// Returns `true` if this outcome carries an error payload.
    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, ToolOutcome::Failure(_))
    }

    /// Returns the text handed back to the model.
    pub fn content(&self) -> Cow<'_, str> {
        match self {
            ToolOutcome::Success(content) => Cow::Borrowed(content),
            ToolOutcome::Failure(reason) => {
                Cow::Owned(format!("Error: {reason}"))
            }
        }
    }
}

/// One message-equivalent unit in a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Turn {
    /// Input from the user.
    User {
        /// The input text.
        text: String,
    },
    /// Output from the model.
    Assistant {
        /// Text produced by the model, may be empty when it only requested
        /// tools.
        text: String,
        /// Tool calls requested by the model, in emitted order.
        tool_calls: Vec<ToolCall>,
    },
    /// The result of one tool call.
    ToolResult {
        /// Id of the call this result answers.
        call_id: String,
        /// Name of the tool that was requested.
        tool_name: String,
        /// Result or error payload.
        outcome: ToolOutcome,
    },
}

impl Turn {
    /// Creates a user turn.
    #[inline]
    pub fn user<S: Into<String>>(text: S) -> Self {
        Turn::User { text: text.into() }
    }

    /// Creates an assistant turn without tool calls.
    #[inline]
    pub fn assistant<S: Into<String>>(text: S) -> Self {
        Turn::Assistant {
            text: text.into(),
            tool_calls: vec![],
        }
    }

    /// Returns the text of a user or assistant turn, or the content of a
    /// tool result.
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            Turn::User { text } | Turn::Assistant { text, .. } => {
                Cow::Borrowed(text)
            }
            Turn::ToolResult { outcome, .. } => outcome.content(),
        }
    }

    pub(crate) fn to_model_message(&self) -> ModelMessage {
        match self {
            Turn::User { text } => ModelMessage::User(text.clone()),
            Turn::Assistant { text, tool_calls } => ModelMessage::Assistant {
                content: text.clone(),
                tool_calls: tool_calls.iter().map(Into::into).collect(),
            },
            Turn::ToolResult {
                call_id,
                tool_name,
                outcome,
            } => ModelMessage::Tool(ToolCallResult {
                id: call_id.clone(),
                name: tool_name.clone(),
                content: outcome.content().into_owned(),
            }),
        }
    }
}

/// The reason a turn was refused by [`Conversation::append`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AppendError {
    /// An assistant turn reused a tool call id.
    #[error("tool call id `{0}` is already used in this conversation")]
    DuplicateCallId(String),
    /// A tool result references a call that no preceding assistant turn made.
    #[error("tool result references unknown call id `{0}`")]
    UnknownCallId(String),
}

/// An ordered, append-only log of turns.
///
/// Turns can only be added at the end, and are never edited or removed.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct Conversation {
    turns: Vec<Turn>,
    call_ids: HashSet<String>,
}

impl Conversation {
    /// Creates an empty conversation.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a conversation by appending the turns in order.
    pub fn from_turns<I>(turns: I) -> Result<Self, AppendError>
    where
        I: IntoIterator<Item = Turn>,
    {
        let mut conversation = Self::new();
        for turn in turns {
            conversation.append(turn)?;
        }
        Ok(conversation)
    }

    /// Appends a turn at the end of the conversation.
    ///
    /// Fails if an assistant turn reuses a tool call id, or if a tool result
    /// does not answer a call made by a preceding assistant turn. The
    /// conversation is left untouched on failure.
    pub fn append(&mut self, turn: Turn) -> Result<(), AppendError> {
        match &turn {
            Turn::User { .. } => {}
            Turn::Assistant { tool_calls, .. } => {
                let mut seen = HashSet::with_capacity(tool_calls.len());
                for call in tool_calls {
                    if self.call_ids.contains(&call.id)
                        || !seen.insert(call.id.as_str())
                    {
                        return Err(AppendError::DuplicateCallId(
                            call.id.clone(),
                        ));
                    }
                }
                self.call_ids
                    .extend(tool_calls.iter().map(|call| call.id.clone()));
            }
            Turn::ToolResult { call_id, .. } => {
                if !self.call_ids.contains(call_id) {
                    return Err(AppendError::UnknownCallId(call_id.clone()));
                }
            }
        }
        self.turns.push(turn);
        Ok(())
    }

    /// Appends a user turn, which is always accepted.
    ///
    /// Tool calls still unanswered at this point, as left by a cancelled
    /// run, are first closed with [`CANCELLED_CALL_REASON`] so that every
    /// call is followed by its result.
    pub fn push_user<S: Into<String>>(&mut self, text: S) {
        self.close_pending_calls(CANCELLED_CALL_REASON);
        self.turns.push(Turn::user(text));
    }

    /// Returns the tool calls that no tool result answers yet, in the order
    /// they were made.
    pub fn pending_calls(&self) -> Vec<&ToolCall> {
        let answered: HashSet<&str> = self
            .turns
            .iter()
            .filter_map(|turn| match turn {
                Turn::ToolResult { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();

        let mut pending = vec![];
        for turn in &self.turns {
            if let Turn::Assistant { tool_calls, .. } = turn {
                pending.extend(
                    tool_calls
                        .iter()
                        .filter(|call| !answered.contains(call.id.as_str())),
                );
            }
        }
        pending
    }

    /// Answers every pending tool call with a failure carrying `reason`.
    ///
    /// Returns the number of results appended.
    pub fn close_pending_calls(&mut self, reason: &str) -> usize {
        let closing: Vec<_> = self
            .pending_calls()
            .into_iter()
            .map(|call| Turn::ToolResult {
                call_id: call.id.clone(),
                tool_name: call.tool_name.clone(),
                outcome: ToolOutcome::Failure(reason.to_owned()),
            })
            .collect();
        let count = closing.len();
        if count > 0 {
            debug!("closing {count} unanswered tool call(s): {reason}");
        }
        self.turns.extend(closing);
        count
    }

    /// Returns all turns in order.
    #[inline]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Returns the last turn, if any.
    #[inline]
    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Returns the number of turns.
    #[inline]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Returns `true` if the conversation has no turns.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Returns `true` if at least one turn comes from the user.
    #[inline]
    pub fn has_user_turn(&self) -> bool {
        self.turns.iter().any(|t| matches!(t, Turn::User { .. }))
    }

    /// Consumes the conversation and returns its turns.
    #[inline]
    pub fn into_turns(self) -> Vec<Turn> {
        self.turns
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_owned(),
            tool_name: "add".to_owned(),
            arguments: json!({ "a": 1, "b": 2 }),
        }
    }

    fn result(id: &str) -> Turn {
        Turn::ToolResult {
            call_id: id.to_owned(),
            tool_name: "add".to_owned(),
            outcome: ToolOutcome::Success("3".to_owned()),
        }
    }

    #[test]
    fn test_append_keeps_order() {
        let mut conversation = Conversation::new();
        let turns = vec![
            Turn::user("hi"),
            Turn::Assistant {
                text: String::new(),
                tool_calls: vec![call("c1"), call("c2")],
            },
            result("c2"),
            result("c1"),
            Turn::assistant("done"),
        ];
        for (idx, turn) in turns.iter().enumerate() {
            conversation.append(turn.clone()).unwrap();
            // Earlier turns are never touched by later appends.
            assert_eq!(conversation.turns(), &turns[..=idx]);
        }
        assert_eq!(conversation.len(), 5);
        assert!(conversation.has_user_turn());
    }

    #[test]
    fn test_rejects_unknown_call_id() {
        let mut conversation =
            Conversation::from_turns([Turn::user("hi")]).unwrap();
        let err = conversation.append(result("nope")).unwrap_err();
        assert_eq!(err, AppendError::UnknownCallId("nope".to_owned()));
        assert_eq!(conversation.len(), 1);
    }

    #[test]
    fn test_rejects_duplicate_call_ids() {
        let mut conversation = Conversation::new();
        let err = conversation
            .append(Turn::Assistant {
                text: String::new(),
                tool_calls: vec![call("c1"), call("c1")],
            })
            .unwrap_err();
        assert_eq!(err, AppendError::DuplicateCallId("c1".to_owned()));
        assert!(conversation.is_empty());

        conversation
            .append(Turn::Assistant {
                text: String::new(),
                tool_calls: vec![call("c1")],
            })
            .unwrap();
        let err = conversation
            .append(Turn::Assistant {
                text: String::new(),
                tool_calls: vec![call("c1")],
            })
            .unwrap_err();
        assert_eq!(err, AppendError::DuplicateCallId("c1".to_owned()));
        assert_eq!(conversation.len(), 1);
    }

    #[test]
    fn test_push_user_closes_pending_calls() {
        let mut conversation = Conversation::from_turns([
            Turn::user("hi"),
            Turn::Assistant {
                text: String::new(),
                tool_calls: vec![call("c1"), call("c2"), call("c3")],
            },
            result("c2"),
        ])
        .unwrap();
        let pending: Vec<_> = conversation
            .pending_calls()
            .iter()
            .map(|call| call.id.as_str())
            .collect();
        assert_eq!(pending, ["c1", "c3"]);

        conversation.push_user("next");
        assert!(conversation.pending_calls().is_empty());
        let cancelled = ToolOutcome::Failure(CANCELLED_CALL_REASON.to_owned());
        assert_eq!(
            conversation.turns()[3..],
            [
                Turn::ToolResult {
                    call_id: "c1".to_owned(),
                    tool_name: "add".to_owned(),
                    outcome: cancelled.clone(),
                },
                Turn::ToolResult {
                    call_id: "c3".to_owned(),
                    tool_name: "add".to_owned(),
                    outcome: cancelled,
                },
                Turn::user("next"),
            ]
        );

        // Nothing left to close.
        assert_eq!(conversation.close_pending_calls("again"), 0);
    }

    #[test]
    fn test_failure_content() {
        let outcome = ToolOutcome::Failure("boom".to_owned());
        assert!(outcome.is_failure());
        assert_eq!(outcome.content(), "Error: boom");

        let turn = Turn::ToolResult {
            call_id: "c1".to_owned(),
            tool_name: "add".to_owned(),
            outcome,
        };
        let ModelMessage::Tool(result) = turn.to_model_message() else {
            panic!("expected a tool message");
        };
        assert_eq!(result.content, "Error: boom");
        assert_eq!(result.name, "add");
    }
}
