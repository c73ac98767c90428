//! Prompt assembly: system prompt, persisted summary, message window and
//! formatted code context.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::dialogs::{MessageRole, StoredMessage};
use crate::llm::{ChatMessage, WireToolCall};

/// Editor state shipped with a chat request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<FileContext>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub open_files: Vec<FileContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContext {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<String>,
}

/// Builds the message list for one LLM call.
pub struct ContextBuilder {
    workdir: String,
    ide: Option<String>,
}

impl ContextBuilder {
    pub fn new(workdir: &str, ide: Option<String>) -> Self {
        Self {
            workdir: workdir.to_string(),
            ide,
        }
    }

    /// The system prompt: identity, environment, tool guidance.
    pub fn system_prompt(&self) -> String {
        let os = std::env::consts::OS;
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "sh".into());
        let ide = self.ide.as_deref().unwrap_or("unknown");
        format!(
            "You are AgentSmithy, a coding assistant working inside the user's project.\n\
             \n\
             Environment:\n\
             - Working directory: {workdir}\n\
             - Operating system: {os}\n\
             - Shell: {shell}\n\
             - IDE: {ide}\n\
             \n\
             You have tools for reading, writing and searching files, running shell \
             commands, and fetching web content. Paths are relative to the working \
             directory. Make changes with write_to_file or replace_in_file rather than \
             shell redirection so edits are tracked. Tool results from earlier turns are \
             stored; use get_tool_result with a tool_call_id to reload one instead of \
             re-running the tool. Keep answers concise and concrete.",
            workdir = self.workdir,
        )
    }

    /// Format the editor context block, if any.
    fn format_code_context(context: &CodeContext) -> Option<String> {
        let mut out = String::new();
        if let Some(current) = &context.current_file {
            out.push_str(&format!(
                "Currently open file: {} ({})\n",
                current.path,
                current.language.as_deref().unwrap_or("unknown"),
            ));
            if let Some(selection) = &current.selection {
                out.push_str(&format!("Selected text:\n```\n{selection}\n```\n"));
            }
            if let Some(content) = &current.content {
                out.push_str(&format!("Content:\n```\n{content}\n```\n"));
            }
        }
        if !context.open_files.is_empty() {
            out.push_str("Other open files: ");
            out.push_str(
                &context
                    .open_files
                    .iter()
                    .map(|f| f.path.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            );
            out.push('\n');
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Assemble the provider message list.
    ///
    /// `history` already includes the new user message (appended by the chat
    /// service before the loop starts). With a summary present, `history`
    /// holds only the trailing window.
    pub fn build_messages(
        &self,
        summary: Option<&str>,
        history: &[StoredMessage],
        code_context: Option<&CodeContext>,
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(&self.system_prompt())];

        if let Some(summary) = summary {
            if !summary.is_empty() {
                messages.push(ChatMessage::system(&format!(
                    "Summary of the earlier conversation:\n{summary}"
                )));
            }
        }

        if let Some(context_text) = code_context.and_then(Self::format_code_context) {
            messages.push(ChatMessage::system(&format!(
                "Editor context:\n{context_text}"
            )));
        }

        for message in history {
            match message.role {
                MessageRole::User => messages.push(ChatMessage::user(&message.content)),
                MessageRole::System => messages.push(ChatMessage::system(&message.content)),
                MessageRole::Assistant => {
                    if message.tool_calls.is_empty() {
                        messages.push(ChatMessage::assistant(&message.content));
                    } else {
                        let calls = message
                            .tool_calls
                            .iter()
                            .map(|call| {
                                WireToolCall::new(
                                    &call.id,
                                    &call.name,
                                    &call.args.to_string(),
                                )
                            })
                            .collect();
                        messages.push(ChatMessage::assistant_tool_calls(&message.content, calls));
                    }
                }
                MessageRole::Tool => {
                    // History carries only the lazy reference; the model can
                    // reload the body with get_tool_result.
                    if let Some(reference) = &message.tool_result {
                        let content = json!({
                            "tool_call_id": reference.tool_call_id,
                            "tool_name": reference.tool_name,
                            "status": reference.status,
                            "metadata": {
                                "size_bytes": reference.size_bytes,
                                "summary": reference.summary,
                                "truncated_preview": reference.truncated_preview,
                            },
                            "result_ref": reference.result_ref,
                        });
                        messages.push(ChatMessage::tool(
                            &reference.tool_call_id,
                            &content.to_string(),
                        ));
                    }
                }
            }
        }

        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialogs::ToolCallRecord;

    fn stored(role: MessageRole, content: &str) -> StoredMessage {
        StoredMessage {
            idx: 0,
            role,
            content: content.into(),
            checkpoint_id: None,
            session_name: None,
            tool_calls: Vec::new(),
            tool_result: None,
            created_at: String::new(),
        }
    }

    #[test]
    fn system_prompt_mentions_environment() {
        let builder = ContextBuilder::new("/work/project", Some("vscode".into()));
        let prompt = builder.system_prompt();
        assert!(prompt.contains("/work/project"));
        assert!(prompt.contains("vscode"));
    }

    #[test]
    fn summary_is_injected_before_history() {
        let builder = ContextBuilder::new("/w", None);
        let history = vec![stored(MessageRole::User, "continue")];
        let messages = builder.build_messages(Some("did things"), &history, None);
        assert_eq!(messages[0].role, "system");
        assert!(messages[1].content.as_deref().unwrap().contains("did things"));
        assert_eq!(messages.last().unwrap().role, "user");
    }

    #[test]
    fn assistant_tool_calls_become_wire_calls() {
        let builder = ContextBuilder::new("/w", None);
        let mut message = stored(MessageRole::Assistant, "");
        message.tool_calls = vec![ToolCallRecord {
            id: "call_9".into(),
            name: "read_file".into(),
            args: json!({"path": "a.txt"}),
        }];
        let messages = builder.build_messages(None, &[message], None);
        let assistant = messages.last().unwrap();
        let calls = assistant.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_9");
        assert_eq!(calls[0].function.name, "read_file");
    }

    #[test]
    fn code_context_formats_selection() {
        let builder = ContextBuilder::new("/w", None);
        let context = CodeContext {
            current_file: Some(FileContext {
                path: "src/app.ts".into(),
                language: Some("typescript".into()),
                content: None,
                selection: Some("const x = 1".into()),
            }),
            open_files: vec![],
        };
        let messages = builder.build_messages(None, &[], Some(&context));
        let context_msg = &messages[1];
        assert!(context_msg.content.as_deref().unwrap().contains("src/app.ts"));
        assert!(context_msg.content.as_deref().unwrap().contains("const x = 1"));
    }
}
