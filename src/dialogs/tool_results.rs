//! Out-of-band storage for full tool results.
//!
//! The message history only carries a lazy [`ToolResultRef`]; the complete
//! structured JSON lives here, one file pair per call:
//! `tool_results/<tool_call_id>.json` (body) and `<tool_call_id>.meta.json`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;

use super::types::{ToolResultMeta, ToolResultRef};

/// Preview budget for the inline reference.
pub const PREVIEW_MAX_CHARS: usize = 500;

/// File-backed store for one dialog's tool results.
pub struct ToolResultStore {
    dir: PathBuf,
}

impl ToolResultStore {
    pub fn new(dialog_dir: &Path) -> Self {
        Self {
            dir: dialog_dir.join("tool_results"),
        }
    }

    fn body_path(&self, tool_call_id: &str) -> PathBuf {
        self.dir.join(format!("{tool_call_id}.json"))
    }

    fn meta_path(&self, tool_call_id: &str) -> PathBuf {
        self.dir.join(format!("{tool_call_id}.meta.json"))
    }

    /// Persist a full result and return the lazy reference for the message
    /// stream.
    pub fn store(
        &self,
        tool_call_id: &str,
        tool_name: &str,
        args: &Value,
        result: &Value,
    ) -> Result<ToolResultRef> {
        std::fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_string(result)?;
        let size_bytes = body.len() as u64;
        let status = result_status(result);
        let summary = summarize_result(tool_name, args, result);
        let meta = ToolResultMeta {
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            status: status.clone(),
            size_bytes,
            summary: summary.clone(),
            created_at: Utc::now().to_rfc3339(),
        };

        std::fs::write(self.body_path(tool_call_id), &body)?;
        std::fs::write(
            self.meta_path(tool_call_id),
            serde_json::to_string_pretty(&meta)?,
        )?;

        Ok(ToolResultRef {
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            status,
            size_bytes,
            summary,
            truncated_preview: truncated_preview(result),
            result_ref: tool_call_id.to_string(),
        })
    }

    /// Load a full result body.
    pub fn get(&self, tool_call_id: &str) -> Result<Value> {
        let text = std::fs::read_to_string(self.body_path(tool_call_id))
            .with_context(|| format!("tool result not found: {tool_call_id}"))?;
        serde_json::from_str(&text).context("parsing stored tool result")
    }

    pub fn get_metadata(&self, tool_call_id: &str) -> Result<ToolResultMeta> {
        let text = std::fs::read_to_string(self.meta_path(tool_call_id))
            .with_context(|| format!("tool result metadata not found: {tool_call_id}"))?;
        serde_json::from_str(&text).context("parsing tool result metadata")
    }

    pub fn exists(&self, tool_call_id: &str) -> bool {
        self.body_path(tool_call_id).exists()
    }
}

fn result_status(result: &Value) -> String {
    let is_error = result
        .get("type")
        .and_then(Value::as_str)
        .map(|t| t == "tool_error" || t.contains("error"))
        .unwrap_or(false);
    if is_error { "error" } else { "success" }.to_string()
}

/// Preview of a result: whole lines only, at most [`PREVIEW_MAX_CHARS`].
pub fn truncated_preview(result: &Value) -> String {
    let text = match result {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    };
    if text.chars().count() <= PREVIEW_MAX_CHARS {
        return text;
    }
    let mut preview = String::new();
    for line in text.lines() {
        // +1 for the newline that joins lines.
        if preview.chars().count() + line.chars().count() + 1 > PREVIEW_MAX_CHARS {
            break;
        }
        preview.push_str(line);
        preview.push('\n');
    }
    if preview.is_empty() {
        // Single overlong line: hard character cut.
        preview = text.chars().take(PREVIEW_MAX_CHARS).collect();
    }
    preview
}

/// Human-readable one-liner per tool kind, shown in history listings.
pub fn summarize_result(tool_name: &str, args: &Value, result: &Value) -> String {
    fn arg_str<'a>(args: &'a Value, key: &str) -> &'a str {
        args.get(key).and_then(Value::as_str).unwrap_or("")
    }

    match tool_name {
        "read_file" => {
            let path = arg_str(args, "path");
            let lines = result
                .get("content")
                .and_then(Value::as_str)
                .map(|c| c.lines().count())
                .unwrap_or(0);
            format!("Read file: {path} ({lines} lines)")
        }
        "write_to_file" => format!("Wrote file: {}", arg_str(args, "path")),
        "replace_in_file" => format!("Replaced in file: {}", arg_str(args, "path")),
        "delete_file" => format!("Deleted file: {}", arg_str(args, "path")),
        "list_files" => {
            let count = result
                .get("files")
                .and_then(Value::as_array)
                .map(|f| f.len())
                .unwrap_or(0);
            format!("Listed {count} entries in {}", arg_str(args, "path"))
        }
        "search_files" => {
            let matches = result
                .get("matches")
                .and_then(Value::as_array)
                .map(|m| m.len())
                .unwrap_or(0);
            let files = result
                .get("files_matched")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            format!("Found {matches} matches in {files} files")
        }
        "run_command" => {
            let code = result.get("exit_code").and_then(Value::as_i64).unwrap_or(-1);
            let len = result
                .get("stdout")
                .and_then(Value::as_str)
                .map(|s| s.len())
                .unwrap_or(0);
            format!("Exit {code}, {len} chars")
        }
        "web_search" => format!("Searched web: {}", arg_str(args, "query")),
        "web_fetch" => format!("Fetched: {}", arg_str(args, "url")),
        "get_tool_result" => format!("Loaded result {}", arg_str(args, "tool_call_id")),
        "generate_dialog_title" => "Generated dialog title".to_string(),
        other => other.to_string(),
    }
}
