//! Stream event taxonomy for the chat SSE pipeline.
//!
//! Wire names are part of the client contract:
//! `user`, `chat_start`, `chat`, `chat_end`, `reasoning_start`, `reasoning`,
//! `reasoning_end`, `summary_start`, `summary_end`, `tool_call`, `file_edit`,
//! `error`, `done`.
//!
//! Ordering contract:
//! - `chat_start`/`chat_end` and `reasoning_start`/`reasoning_end` form
//!   properly nested brackets that never interleave with each other.
//! - `tool_call` only appears outside chat brackets (after `chat_end`).
//! - An `error` is followed by exactly one `done`; `done` terminates every
//!   stream, successful or not.

use serde::Serialize;
use serde_json::Value;

/// Events produced by the agent loop and forwarded to clients as SSE frames.
///
/// Every variant carries the owning `dialog_id`; text-bearing variants carry
/// `content`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    /// Echo of the ingested user message, with the checkpoint taken
    /// immediately before processing and the session active at that moment.
    #[serde(rename = "user")]
    User {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        checkpoint: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<String>,
        dialog_id: String,
    },

    /// Opens an assistant text segment.
    #[serde(rename = "chat_start")]
    ChatStart { dialog_id: String },

    /// Assistant text chunk.
    #[serde(rename = "chat")]
    Chat { content: String, dialog_id: String },

    /// Closes the assistant text segment (before tool calls or end of turn).
    #[serde(rename = "chat_end")]
    ChatEnd { dialog_id: String },

    #[serde(rename = "reasoning_start")]
    ReasoningStart { dialog_id: String },

    /// Reasoning-trace chunk.
    #[serde(rename = "reasoning")]
    Reasoning { content: String, dialog_id: String },

    #[serde(rename = "reasoning_end")]
    ReasoningEnd { dialog_id: String },

    /// History summarization brackets. Emitted even when the summarizer
    /// decides nothing needs doing.
    #[serde(rename = "summary_start")]
    SummaryStart { dialog_id: String },

    #[serde(rename = "summary_end")]
    SummaryEnd { dialog_id: String },

    /// A tool invocation is starting. Emitted once per call, in the order
    /// the model issued them, never inside a chat bracket.
    #[serde(rename = "tool_call")]
    ToolCall {
        name: String,
        args: Value,
        dialog_id: String,
    },

    /// A file was created, modified or deleted by a tool.
    #[serde(rename = "file_edit")]
    FileEdit {
        file: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        diff: Option<String>,
        dialog_id: String,
    },

    /// Stream failure. Always followed by exactly one `done`.
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "content")]
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        dialog_id: String,
    },

    /// Final event of every stream.
    #[serde(rename = "done")]
    Done { dialog_id: String },
}

impl AgentEvent {
    pub fn user(
        content: impl Into<String>,
        checkpoint: Option<String>,
        session: Option<String>,
        dialog_id: impl Into<String>,
    ) -> Self {
        Self::User {
            content: content.into(),
            checkpoint,
            session,
            dialog_id: dialog_id.into(),
        }
    }

    pub fn chat(content: impl Into<String>, dialog_id: impl Into<String>) -> Self {
        Self::Chat {
            content: content.into(),
            dialog_id: dialog_id.into(),
        }
    }

    pub fn error(message: impl Into<String>, dialog_id: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: None,
            dialog_id: dialog_id.into(),
        }
    }

    /// Error with a wire code from the taxonomy (`shutdown`, `dialog_busy`, ...).
    pub fn error_with_code(
        message: impl Into<String>,
        code: impl Into<String>,
        dialog_id: impl Into<String>,
    ) -> Self {
        Self::Error {
            message: message.into(),
            code: Some(code.into()),
            dialog_id: dialog_id.into(),
        }
    }

    pub fn done(dialog_id: impl Into<String>) -> Self {
        Self::Done {
            dialog_id: dialog_id.into(),
        }
    }

    /// Wire name of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::ChatStart { .. } => "chat_start",
            Self::Chat { .. } => "chat",
            Self::ChatEnd { .. } => "chat_end",
            Self::ReasoningStart { .. } => "reasoning_start",
            Self::Reasoning { .. } => "reasoning",
            Self::ReasoningEnd { .. } => "reasoning_end",
            Self::SummaryStart { .. } => "summary_start",
            Self::SummaryEnd { .. } => "summary_end",
            Self::ToolCall { .. } => "tool_call",
            Self::FileEdit { .. } => "file_edit",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    /// Serialize to an SSE data frame payload.
    pub fn to_sse_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }
}
