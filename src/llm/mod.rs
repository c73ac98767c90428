//! LLM provider abstraction.
//!
//! A [`ChatProvider`] streams chat completions with tools bound and routes
//! workloads to models. Tool-call fragments from the stream are normalized
//! to [`ToolCallDelta`]; the agent loop does the reassembly.

pub mod openai;
pub mod sse_decoder;
pub mod types;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use openai::OpenAiProvider;
pub use types::{
    ChatMessage, StreamEvent, ToolCallDelta, ToolDefinition, Usage, WireFunctionCall, WireToolCall,
};

/// What a request is for; providers may route workloads to different models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    /// The main agent turn.
    Agent,
    /// Summaries, dialog titles and other cheap auxiliary generations.
    Summarization,
}

/// Vendor-neutral chat capability.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Model id the provider would use for `workload`.
    fn model_for(&self, workload: Workload) -> String;

    /// Stream a completion; the receiver yields normalized [`StreamEvent`]s
    /// and always terminates with `Done` (or `Error` then `Done`).
    async fn generate_stream(
        &self,
        workload: Workload,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<mpsc::Receiver<StreamEvent>>;

    /// Non-streaming completion without tools; used by the summarizer and
    /// title generation.
    async fn generate(&self, workload: Workload, messages: &[ChatMessage]) -> Result<String>;
}
