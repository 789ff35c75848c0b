use serde::{Deserialize, Serialize};

use super::TranscriptError;
use crate::conversation::{Conversation, ToolCall, ToolOutcome, Turn};

const HEADER: &str = "Your Conversation History:";
const FOOTER: &str = "End of Conversation History.";
const USER_PREFIX: &str = "User:";
const AI_PREFIX: &str = "AI:";
const AI_CALL_PREFIX: &str = "AI-Call:";
const TOOL_PREFIX: &str = "Tool:";

#[derive(Serialize, Deserialize)]
struct AssistantCallRecord {
    text: String,
    tool_calls: Vec<ToolCall>,
}

#[derive(Serialize, Deserialize)]
struct ToolResultRecord {
    call_id: String,
    tool_name: String,
    outcome: ToolOutcome,
}

/// Renders a conversation in the transcript text format, one line per turn.
pub fn render_transcript(
    conversation: &Conversation,
) -> Result<String, TranscriptError> {
    let mut out = String::new();
    out.push_str(HEADER);
    out.push('\n');
    for turn in conversation.turns() {
        let line = match turn {
            Turn::User { text } => {
                format!("{USER_PREFIX} {}", escape(text))
            }
            Turn::Assistant { text, tool_calls } if tool_calls.is_empty() => {
                format!("{AI_PREFIX} {}", escape(text))
            }
            Turn::Assistant { text, tool_calls } => {
                let record = AssistantCallRecord {
                    text: text.clone(),
                    tool_calls: tool_calls.clone(),
                };
                let json = serde_json::to_string(&record)?;
                format!("{AI_CALL_PREFIX} {json}")
            }
            Turn::ToolResult {
                call_id,
                tool_name,
                outcome,
            } => {
                let record = ToolResultRecord {
                    call_id: call_id.clone(),
                    tool_name: tool_name.clone(),
                    outcome: outcome.clone(),
                };
                let json = serde_json::to_string(&record)?;
                format!("{TOOL_PREFIX} {json}")
            }
        };
        out.push_str(&line);
        out.push('\n');
    }
    out.push('\n');
    out.push_str(FOOTER);
    out.push('\n');
    Ok(out)
}

/// Reads a conversation from the transcript text format.
///
/// Reading is permissive: unknown or broken lines are skipped, and so are
/// turns that would break the conversation (e.g. a tool result for a call
/// that was never made).
pub fn parse_transcript(text: &str) -> Conversation {
    let mut conversation = Conversation::new();
    for (idx, line) in text.lines().enumerate() {
        let Some(turn) = parse_line(line) else {
            let line = line.trim();
            if !line.is_empty() && line != HEADER && line != FOOTER {
                debug!("skipping unrecognized transcript line {}", idx + 1);
            }
            continue;
        };
        if let Err(err) = conversation.append(turn) {
            warn!("dropping transcript line {}: {err}", idx + 1);
        }
    }
    conversation
}

fn parse_line(line: &str) -> Option<Turn> {
    if let Some(rest) = line.strip_prefix(USER_PREFIX) {
        return Some(Turn::user(unescape(rest.trim())));
    }
    if let Some(rest) = line.strip_prefix(AI_CALL_PREFIX) {
        let record: AssistantCallRecord = parse_json(rest)?;
        return Some(Turn::Assistant {
            text: record.text,
            tool_calls: record.tool_calls,
        });
    }
    if let Some(rest) = line.strip_prefix(AI_PREFIX) {
        return Some(Turn::assistant(unescape(rest.trim())));
    }
    if let Some(rest) = line.strip_prefix(TOOL_PREFIX) {
        let record: ToolResultRecord = parse_json(rest)?;
        return Some(Turn::ToolResult {
            call_id: record.call_id,
            tool_name: record.tool_name,
            outcome: record.outcome,
        });
    }
    None
}

fn parse_json<T: for<'de> Deserialize<'de>>(json: &str) -> Option<T> {
    match serde_json::from_str(json.trim()) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!("skipping unparsable transcript record: {err}");
            None
        }
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            // Unknown escapes are kept as written.
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
