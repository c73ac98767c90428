//! Message and record types for the dialog store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// A reconstructed tool call on an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Lazy reference to an out-of-band tool result; the only thing a tool
/// message carries inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultRef {
    pub tool_call_id: String,
    pub tool_name: String,
    /// `success` or `error`.
    pub status: String,
    pub size_bytes: u64,
    pub summary: String,
    /// First lines of the result, at most 500 characters, cut on a line
    /// boundary.
    pub truncated_preview: String,
    /// Key into the tool-result store (the tool_call_id).
    pub result_ref: String,
}

/// One message in the dense, append-only per-dialog sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub idx: i64,
    pub role: MessageRole,
    pub content: String,
    /// Snapshot taken immediately before this user message was processed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    /// Session active when the user message arrived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResultRef>,
    pub created_at: String,
}

/// Append-only audit record of a file mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEditRecord {
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    pub message_idx: i64,
    pub created_at: String,
}

/// Reasoning block linked to the assistant message that follows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningBlock {
    pub id: i64,
    pub message_idx: i64,
    pub content: String,
    pub created_at: String,
}

/// Metadata row for the tool-results listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultMeta {
    pub tool_call_id: String,
    pub tool_name: String,
    pub status: String,
    pub size_bytes: u64,
    pub summary: String,
    pub created_at: String,
}

/// Persisted dialog summary substituted for the summarized prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogSummary {
    pub summary_text: String,
    pub summarized_count: i64,
    pub updated_at: String,
}

/// Accumulated token usage for a dialog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialogUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
}
