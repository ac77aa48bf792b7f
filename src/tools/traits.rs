use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Description of a tool exposed by the tool server, as sent to the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    /// Set by the confirmation policy at discovery time. Mutating tools only
    /// run after an explicit yes from the user.
    #[serde(default)]
    pub mutating: bool,
}

/// Successful output of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Text content blocks joined with newlines.
    pub output: String,
    /// Structured content, when the server returns any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
}

impl ToolResult {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            structured: None,
        }
    }
}

/// A tool invocation requested by the model, with arguments already parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}
