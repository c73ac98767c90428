//! Dialog persistence: messages, reasoning, tool results, file edits,
//! summaries and usage.

pub mod store;
pub mod summarization;
pub mod tool_results;
pub mod types;

pub use store::{DialogStore, HistoryPage};
pub use tool_results::ToolResultStore;
pub use types::{
    DialogSummary, DialogUsage, FileEditRecord, MessageRole, ReasoningBlock, StoredMessage,
    ToolCallRecord, ToolResultMeta, ToolResultRef,
};
