//! Provider-facing message and stream types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message in provider wire shape (Chat Completions style).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: &str, content: &str) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            reasoning_content: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: &str) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: &str) -> Self {
        Self::plain("assistant", content)
    }

    /// Assistant message that declares tool calls (required before the tool
    /// results that answer them).
    pub fn assistant_tool_calls(content: &str, calls: Vec<WireToolCall>) -> Self {
        Self {
            role: "assistant".into(),
            content: if content.is_empty() {
                None
            } else {
                Some(content.into())
            },
            reasoning_content: None,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// Tool result message answering `tool_call_id`.
    pub fn tool(tool_call_id: &str, content: &str) -> Self {
        Self {
            role: "tool".into(),
            content: Some(content.into()),
            reasoning_content: None,
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Fully-formed tool call in wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: WireFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFunctionCall {
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

impl WireToolCall {
    pub fn new(id: &str, name: &str, arguments: &str) -> Self {
        Self {
            id: id.into(),
            call_type: "function".into(),
            function: WireFunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Tool schema bound into a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
}

/// Normalized streaming tool-call fragment.
///
/// Providers stream tool calls in pieces keyed by a per-message index; `id`
/// and `name` may arrive late or repeatedly (final value wins for names),
/// `args_fragment` accumulates into a JSON string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name_fragment: Option<String>,
    pub args_fragment: Option<String>,
}

/// Token usage from a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Normalized events from a provider stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCallDelta(ToolCallDelta),
    Usage(Usage),
    Error(String),
    Done,
}
