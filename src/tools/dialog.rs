//! Dialog-scoped tools: lazy result retrieval and title generation.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext, ToolError};
use crate::dialogs::MessageRole;
use crate::llm::{ChatMessage, Workload};

// ---- get_tool_result ----

pub struct GetToolResultTool;

#[async_trait]
impl Tool for GetToolResultTool {
    fn name(&self) -> &'static str {
        "get_tool_result"
    }

    fn description(&self) -> &'static str {
        "Load the full stored result of a tool call from an earlier turn."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "tool_call_id": {"type": "string", "description": "Id of the earlier tool call"}
            },
            "required": ["tool_call_id"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let tool_call_id = args
            .get("tool_call_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ToolError::Validation("missing required argument: tool_call_id".into())
            })?;

        // Results of the current turn are already inline in the conversation.
        if ctx.is_current_turn_call(tool_call_id) {
            return Err(ToolError::Validation(
                "not for current-turn calls".into(),
            ));
        }
        let result = ctx
            .results
            .get(tool_call_id)
            .map_err(|_| ToolError::NotFound(format!("tool result not found: {tool_call_id}")))?;
        Ok(json!({
            "type": "get_tool_result_result",
            "tool_call_id": tool_call_id,
            "result": result,
        }))
    }
}

// ---- generate_dialog_title ----

pub struct GenerateDialogTitleTool;

#[async_trait]
impl Tool for GenerateDialogTitleTool {
    fn name(&self) -> &'static str {
        "generate_dialog_title"
    }

    fn description(&self) -> &'static str {
        "Generate and persist a short title for this dialog. Call once, after the first exchange."
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let messages = ctx
            .store
            .get_messages(&ctx.dialog_id, Some(6))
            .await
            .map_err(ToolError::from)?;
        let mut transcript = String::new();
        for message in &messages {
            match message.role {
                MessageRole::User => {
                    transcript.push_str(&format!("User: {}\n", message.content));
                }
                MessageRole::Assistant if !message.content.is_empty() => {
                    transcript.push_str(&format!("Assistant: {}\n", message.content));
                }
                _ => {}
            }
        }
        if transcript.is_empty() {
            return Err(ToolError::Validation(
                "dialog has no messages to title".into(),
            ));
        }

        let request = vec![
            ChatMessage::system(
                "Produce a dialog title of at most six words. Reply with the title only, \
                 no quotes, no trailing punctuation.",
            ),
            ChatMessage::user(&transcript),
        ];
        let title = ctx
            .provider
            .generate(Workload::Summarization, &request)
            .await
            .map_err(|e| ToolError::ExecFailed(format!("title generation failed: {e}")))?
            .trim()
            .trim_matches('"')
            .to_string();
        if title.is_empty() {
            return Err(ToolError::ExecFailed("empty title generated".into()));
        }

        ctx.project
            .upsert_dialog_meta(&ctx.dialog_id, Some(title.clone()), None, None)
            .map_err(ToolError::from)?;

        Ok(json!({
            "type": "dialog_title_result",
            "title": title,
        }))
    }
}
