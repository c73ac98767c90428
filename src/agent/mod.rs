//! The agent loop: LLM stream -> events -> tool execution, iterated until
//! the model answers without tool calls.
//!
//! Streaming segmentation: `chat_start` on the first text chunk, `chat_end`
//! when the assistant segment closes (before tool calls or end of turn);
//! reasoning bookended independently. Tool-call fragments accumulate by
//! stream index; names take the latest value, argument strings concatenate
//! and are parsed once the message ends. Cancellation is observed at every
//! stream chunk and closes any open bracket before the loop returns.

pub mod context;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dialogs::ToolCallRecord;
use crate::events::AgentEvent;
use crate::llm::{ChatMessage, ChatProvider, StreamEvent, ToolDefinition, Workload};
use crate::tools::executor::ToolExecutor;
use crate::tools::ToolContext;

pub use context::{CodeContext, ContextBuilder, FileContext};

/// Iteration cap for one user turn.
pub const MAX_TOOL_ITERATIONS: usize = 10;

/// Terminal outcomes of a turn that are not plain success.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("turn cancelled")]
    Cancelled,
    #[error("tool_loop_exceeded")]
    ToolLoopExceeded,
    #[error("{0}")]
    Provider(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// In-flight tool call being reassembled from stream deltas.
#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    args: String,
}

/// Output of one streamed LLM response.
#[derive(Debug, Default)]
struct StreamOutcome {
    text: String,
    reasoning: String,
    calls: Vec<PendingCall>,
    provider_error: Option<String>,
}

pub struct AgentLoop {
    provider: Arc<dyn ChatProvider>,
    executor: Arc<ToolExecutor>,
}

impl AgentLoop {
    pub fn new(provider: Arc<dyn ChatProvider>, executor: Arc<ToolExecutor>) -> Self {
        Self { provider, executor }
    }

    /// Drive one user turn to completion.
    ///
    /// `conversation` is the prepared prompt (system + history, user message
    /// last); `tools` the schemas to bind. Events flow through
    /// `ctx.events`; messages and reasoning are persisted as segments
    /// complete.
    pub async fn run_turn(
        &self,
        ctx: &Arc<ToolContext>,
        mut conversation: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> Result<(), AgentError> {
        for iteration in 0..MAX_TOOL_ITERATIONS {
            debug!(iteration, messages = conversation.len(), "LLM streaming");
            let outcome = self.stream_one_response(ctx, &conversation, &tools).await?;

            if let Some(error) = outcome.provider_error {
                // Keep whatever the model already produced.
                self.persist_assistant(ctx, &outcome.text, &outcome.reasoning, &[])
                    .await;
                return Err(AgentError::Provider(error));
            }

            if outcome.calls.is_empty() {
                self.persist_assistant(ctx, &outcome.text, &outcome.reasoning, &[])
                    .await;
                info!(iteration, "Turn completed without further tool calls");
                return Ok(());
            }

            // Reconstruct records; malformed argument JSON is preserved as a
            // string so the executor synthesizes a validation tool_error
            // without invoking anything.
            let records: Vec<ToolCallRecord> = outcome
                .calls
                .iter()
                .map(|call| {
                    let args = serde_json::from_str::<Value>(&call.args)
                        .ok()
                        .filter(Value::is_object)
                        .unwrap_or_else(|| Value::String(call.args.clone()));
                    ToolCallRecord {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        args,
                    }
                })
                .collect();

            self.persist_assistant(ctx, &outcome.text, &outcome.reasoning, &records)
                .await;

            // Extend the provider conversation: assistant tool-call message
            // first, then one tool message per result (inline body for this
            // turn only).
            let wire_calls = outcome
                .calls
                .iter()
                .map(|call| {
                    crate::llm::WireToolCall::new(
                        &call.id,
                        &call.name,
                        if call.args.is_empty() { "{}" } else { &call.args },
                    )
                })
                .collect();
            conversation.push(ChatMessage::assistant_tool_calls(&outcome.text, wire_calls));

            let results = self.executor.execute_batch(records, ctx).await;
            for result in &results {
                conversation.push(ChatMessage::tool(
                    &result.call.id,
                    &result.result.to_string(),
                ));
            }

            if ctx.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
        }

        warn!(max = MAX_TOOL_ITERATIONS, "Tool loop exceeded iteration cap");
        Err(AgentError::ToolLoopExceeded)
    }

    /// Stream one LLM response, forwarding chat/reasoning events and
    /// accumulating tool-call deltas.
    async fn stream_one_response(
        &self,
        ctx: &Arc<ToolContext>,
        conversation: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<StreamOutcome, AgentError> {
        let mut rx = self
            .provider
            .generate_stream(Workload::Agent, conversation, tools)
            .await
            .map_err(|e| AgentError::Provider(e.to_string()))?;

        let dialog_id = ctx.dialog_id.clone();
        let mut outcome = StreamOutcome::default();
        let mut pending: BTreeMap<usize, PendingCall> = BTreeMap::new();
        let mut chat_open = false;
        let mut reasoning_open = false;
        let mut usage_total = crate::llm::Usage::default();

        let close_brackets = |chat_open: &mut bool, reasoning_open: &mut bool| {
            let mut events = Vec::new();
            if *reasoning_open {
                *reasoning_open = false;
                events.push(AgentEvent::ReasoningEnd {
                    dialog_id: dialog_id.clone(),
                });
            }
            if *chat_open {
                *chat_open = false;
                events.push(AgentEvent::ChatEnd {
                    dialog_id: dialog_id.clone(),
                });
            }
            events
        };

        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = ctx.cancel.cancelled() => {
                    // Abort the stream but close open brackets first.
                    for event in close_brackets(&mut chat_open, &mut reasoning_open) {
                        ctx.emit(event).await;
                    }
                    self.persist_assistant(ctx, &outcome.text, &outcome.reasoning, &[])
                        .await;
                    return Err(AgentError::Cancelled);
                }
            };
            let Some(event) = event else {
                break;
            };

            match event {
                StreamEvent::TextDelta(delta) => {
                    if !chat_open {
                        chat_open = true;
                        ctx.emit(AgentEvent::ChatStart {
                            dialog_id: dialog_id.clone(),
                        })
                        .await;
                    }
                    outcome.text.push_str(&delta);
                    ctx.emit(AgentEvent::chat(delta, dialog_id.clone())).await;
                }
                StreamEvent::ReasoningDelta(delta) => {
                    if !reasoning_open {
                        reasoning_open = true;
                        ctx.emit(AgentEvent::ReasoningStart {
                            dialog_id: dialog_id.clone(),
                        })
                        .await;
                    }
                    outcome.reasoning.push_str(&delta);
                    ctx.emit(AgentEvent::Reasoning {
                        content: delta,
                        dialog_id: dialog_id.clone(),
                    })
                    .await;
                }
                StreamEvent::ToolCallDelta(delta) => {
                    let call = pending.entry(delta.index).or_default();
                    if let Some(id) = delta.id {
                        if !id.is_empty() {
                            call.id = id;
                        }
                    }
                    if let Some(name) = delta.name_fragment {
                        if !name.is_empty() {
                            // Final value wins.
                            call.name = name;
                        }
                    }
                    if let Some(args) = delta.args_fragment {
                        call.args.push_str(&args);
                    }
                }
                StreamEvent::Usage(usage) => {
                    usage_total.prompt_tokens += usage.prompt_tokens;
                    usage_total.completion_tokens += usage.completion_tokens;
                }
                StreamEvent::Error(error) => {
                    outcome.provider_error = Some(error);
                    break;
                }
                StreamEvent::Done => break,
            }
        }

        for event in close_brackets(&mut chat_open, &mut reasoning_open) {
            ctx.emit(event).await;
        }

        if usage_total.prompt_tokens > 0 || usage_total.completion_tokens > 0 {
            let model = self.provider.model_for(Workload::Agent);
            if let Err(e) = ctx
                .store
                .upsert_usage(
                    &ctx.dialog_id,
                    usage_total.prompt_tokens as i64,
                    usage_total.completion_tokens as i64,
                    Some(&model),
                )
                .await
            {
                warn!(error = %e, "Failed to persist usage");
            }
        }

        // Calls without an id cannot be answered and are dropped.
        outcome.calls = pending
            .into_values()
            .filter(|call| {
                if call.id.is_empty() || call.name.is_empty() {
                    warn!(name = %call.name, "Dropping tool call without id");
                    false
                } else {
                    true
                }
            })
            .collect();
        Ok(outcome)
    }

    /// Persist an assistant message plus its reasoning block (if any).
    async fn persist_assistant(
        &self,
        ctx: &Arc<ToolContext>,
        text: &str,
        reasoning: &str,
        tool_calls: &[ToolCallRecord],
    ) {
        if text.is_empty() && tool_calls.is_empty() {
            if !reasoning.is_empty() {
                let idx = ctx.store.count_messages(&ctx.dialog_id).await.unwrap_or(0);
                if let Err(e) = ctx.store.save_reasoning(&ctx.dialog_id, idx, reasoning).await {
                    warn!(error = %e, "Failed to persist reasoning");
                }
            }
            return;
        }
        match ctx
            .store
            .add_assistant_message(&ctx.dialog_id, text, tool_calls)
            .await
        {
            Ok(idx) => {
                if !reasoning.is_empty() {
                    if let Err(e) = ctx.store.save_reasoning(&ctx.dialog_id, idx, reasoning).await
                    {
                        warn!(error = %e, "Failed to persist reasoning");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to persist assistant message"),
        }
    }
}
