//! Ordered, append-only conversation log.
//!
//! The transcript is the only conversational state sent to the model. Turns are
//! never edited or removed once appended, and the first turn is always the
//! system prompt.

use crate::tools::ToolCallRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnContent {
    Text {
        text: String,
    },
    /// Assistant turn that requested tools. Kept so the conversation can be
    /// replayed to the model with matching tool-call ids.
    ToolCalls {
        text: Option<String>,
        calls: Vec<ToolCallRequest>,
    },
    ToolOutput {
        success: bool,
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        structured: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: TurnContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Turn {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text_turn(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text_turn(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text_turn(Role::Assistant, text)
    }

    pub fn assistant_tool_calls(text: Option<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: TurnContent::ToolCalls {
                text: text.filter(|t| !t.trim().is_empty()),
                calls,
            },
            tool_call_id: None,
        }
    }

    pub fn tool_success(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::tool_output(call_id, true, output, None)
    }

    pub fn tool_failure(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::tool_output(call_id, false, output, None)
    }

    pub fn tool_output(
        call_id: impl Into<String>,
        success: bool,
        output: impl Into<String>,
        structured: Option<Value>,
    ) -> Self {
        Self {
            role: Role::ToolResult,
            content: TurnContent::ToolOutput {
                success,
                output: output.into(),
                structured,
            },
            tool_call_id: Some(call_id.into()),
        }
    }

    fn text_turn(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: TurnContent::Text { text: text.into() },
            tool_call_id: None,
        }
    }

    /// Text of a plain text turn, `None` for tool-call records and tool output.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            TurnContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Storage for one session's transcript. Implementations must preserve
/// append order and never mutate stored turns.
pub trait TranscriptStore: Send + Sync {
    fn append(&mut self, turn: Turn);

    fn snapshot(&self) -> Vec<Turn>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unbounded in-memory transcript. Lives as long as the session.
#[derive(Debug, Clone)]
pub struct InMemoryTranscript {
    turns: Vec<Turn>,
}

impl InMemoryTranscript {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::system(system_prompt)],
        }
    }
}

impl TranscriptStore for InMemoryTranscript {
    fn append(&mut self, turn: Turn) {
        if turn.role == Role::System {
            tracing::debug!("Appending an additional system turn to the transcript");
        }
        self.turns.push(turn);
    }

    fn snapshot(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    fn len(&self) -> usize {
        self.turns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_transcript_starts_with_system_turn() {
        let transcript = InMemoryTranscript::new("You are a helpful Gmail assistant.");
        assert_eq!(transcript.len(), 1);
        assert!(!transcript.is_empty());
        let first = &transcript.snapshot()[0];
        assert_eq!(first.role, Role::System);
        assert_eq!(first.text(), Some("You are a helpful Gmail assistant."));
    }

    #[test]
    fn append_preserves_order_and_earlier_snapshots() {
        let mut transcript = InMemoryTranscript::new("sys");
        transcript.append(Turn::user("any unread mail?"));
        let before = transcript.snapshot();

        let call = ToolCallRequest {
            call_id: "call_1".into(),
            tool_name: "search_emails".into(),
            arguments: json!({"query": "is:unread"}),
        };
        transcript.append(Turn::assistant_tool_calls(None, vec![call]));
        transcript.append(Turn::tool_success("call_1", "2 results"));
        transcript.append(Turn::assistant("You have 2 unread emails."));

        let after = transcript.snapshot();
        assert_eq!(after.len(), 5);
        assert_eq!(&after[..before.len()], &before[..]);
        let roles: Vec<Role> = after.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::System,
                Role::User,
                Role::Assistant,
                Role::ToolResult,
                Role::Assistant
            ]
        );
        assert_eq!(after[3].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn blank_tool_call_text_is_dropped() {
        let turn = Turn::assistant_tool_calls(Some("  ".into()), vec![]);
        assert_eq!(
            turn.content,
            TurnContent::ToolCalls {
                text: None,
                calls: vec![]
            }
        );
        assert!(turn.text().is_none());
    }

    #[test]
    fn turn_serializes_with_role_and_kind() {
        let value = serde_json::to_value(Turn::tool_failure("c1", "timed out")).unwrap();
        assert_eq!(value["role"], "tool_result");
        assert_eq!(value["content"]["kind"], "tool_output");
        assert_eq!(value["content"]["success"], false);
        assert_eq!(value["tool_call_id"], "c1");
    }
}
