use crate::agent::transcript::{Role, Turn, TurnContent};
use crate::providers::{ChatMessage, ChatResponse, ToolCall, ToolResultMessage};
use crate::tools::ToolCallRequest;
use serde_json::Value;

/// Translates between transcript turns and the provider's native tool-calling
/// message shapes.
pub struct NativeToolDispatcher;

impl NativeToolDispatcher {
    /// Tool calls requested by a completion, in the order the model emitted them.
    pub fn parse_response(response: &ChatResponse) -> Vec<ToolCallRequest> {
        response
            .tool_calls
            .iter()
            .map(|tc| ToolCallRequest {
                call_id: tc.id.clone(),
                tool_name: tc.name.clone(),
                arguments: parse_arguments(&tc.name, &tc.arguments),
            })
            .collect()
    }

    pub fn to_provider_messages(history: &[Turn]) -> Vec<ChatMessage> {
        history
            .iter()
            .map(|turn| match (&turn.role, &turn.content) {
                (_, TurnContent::ToolCalls { text, calls }) => {
                    let tool_calls: Vec<ToolCall> = calls
                        .iter()
                        .map(|call| ToolCall {
                            id: call.call_id.clone(),
                            name: call.tool_name.clone(),
                            arguments: call.arguments.to_string(),
                        })
                        .collect();
                    let payload = serde_json::json!({
                        "content": text,
                        "tool_calls": tool_calls,
                    });
                    ChatMessage::assistant(payload.to_string())
                }
                (
                    _,
                    TurnContent::ToolOutput {
                        success, output, ..
                    },
                ) => {
                    let result = ToolResultMessage {
                        tool_call_id: turn
                            .tool_call_id
                            .clone()
                            .unwrap_or_else(|| "unknown".to_string()),
                        content: if *success {
                            output.clone()
                        } else {
                            format!("Error: {output}")
                        },
                    };
                    ChatMessage::tool(
                        serde_json::json!({
                            "tool_call_id": result.tool_call_id,
                            "content": result.content,
                        })
                        .to_string(),
                    )
                }
                (Role::System, TurnContent::Text { text }) => ChatMessage::system(text.clone()),
                (Role::User, TurnContent::Text { text }) => ChatMessage::user(text.clone()),
                (_, TurnContent::Text { text }) => ChatMessage::assistant(text.clone()),
            })
            .collect()
    }
}

fn parse_arguments(tool: &str, raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            tracing::warn!(
                tool = %tool,
                "Tool call arguments are not a JSON object; wrapping as {{\"input\": ...}}"
            );
            serde_json::json!({ "input": other })
        }
        Err(e) => {
            tracing::warn!(
                tool = %tool,
                error = %e,
                "Failed to parse native tool call arguments as JSON; defaulting to empty object"
            );
            Value::Object(serde_json::Map::new())
        }
    }
}
