//! File tools: read, write, replace, delete, list, search.
//!
//! Mutating tools follow the edit discipline: snapshot originals with
//! `start_edit`, write, then `finalize` (or `abort` on failure, restoring the
//! original bytes), stage the path, and report a unified diff in the result.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use ignore::WalkBuilder;
use regex::RegexBuilder;
use serde_json::{json, Value};

use super::{Tool, ToolContext, ToolError};
use crate::versioning::diff::unified_diff;

/// Maximum file size `read_file` returns (1MB).
const MAX_READ_SIZE: u64 = 1024 * 1024;

/// Cap on search hits per invocation.
const MAX_SEARCH_RESULTS: usize = 200;

fn arg_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::Validation(format!("missing required argument: {key}")))
}

/// Resolve `path` inside the project root, rejecting traversal outside it.
fn resolve_path(ctx: &ToolContext, path: &str) -> Result<PathBuf, ToolError> {
    let root = ctx.project_root();
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    // Normalize lexically so traversal is caught even for paths that do not
    // exist yet.
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(ToolError::Permission(format!(
                        "path escapes project root: {path}"
                    )));
                }
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    if !normalized.starts_with(&root) {
        return Err(ToolError::Permission(format!(
            "path escapes project root: {path}"
        )));
    }
    Ok(normalized)
}

fn rel_display(ctx: &ToolContext, abs: &Path) -> String {
    abs.strip_prefix(ctx.project_root())
        .unwrap_or(abs)
        .to_string_lossy()
        .replace('\\', "/")
}

// ---- read_file ----

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read the contents of a file in the project."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path relative to the project root"}
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let path = arg_str(&args, "path")?;
        let abs = resolve_path(ctx, path)?;
        let meta = std::fs::metadata(&abs)
            .map_err(|_| ToolError::NotFound(format!("file not found: {path}")))?;
        if !meta.is_file() {
            return Err(ToolError::Validation(format!("not a file: {path}")));
        }
        if meta.len() > MAX_READ_SIZE {
            return Err(ToolError::Validation(format!(
                "file too large to read ({} bytes, limit {MAX_READ_SIZE})",
                meta.len()
            )));
        }
        let content = std::fs::read_to_string(&abs)?;
        Ok(json!({
            "type": "read_file_result",
            "path": rel_display(ctx, &abs),
            "content": content,
            "lines": content.lines().count(),
        }))
    }
}

// ---- write_to_file ----

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &'static str {
        "write_to_file"
    }

    fn description(&self) -> &'static str {
        "Write complete content to a file (create or overwrite)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path to write"},
                "content": {"type": "string", "description": "Complete file content"}
            },
            "required": ["path", "content"]
        })
    }

    fn mutated_path(&self, args: &Value) -> Option<String> {
        args.get("path").and_then(Value::as_str).map(String::from)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let path = arg_str(&args, "path")?;
        let content = arg_str(&args, "content")?;
        let abs = resolve_path(ctx, path)?;
        let rel = rel_display(ctx, &abs);

        let old_content = std::fs::read_to_string(&abs).ok();
        let snapshot = ctx.versioning.start_edit([abs.as_path()]);

        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::write(&abs, content) {
            Ok(()) => snapshot.finalize(),
            Err(e) => {
                snapshot.abort();
                return Err(e.into());
            }
        }
        ctx.versioning.stage_file(&abs).await?;

        let diff = unified_diff(&rel, old_content.as_deref().unwrap_or(""), content);
        Ok(json!({
            "type": "write_file_result",
            "path": rel,
            "file": abs.to_string_lossy(),
            "content": content,
            "diff": diff,
            "created": old_content.is_none(),
        }))
    }
}

// ---- replace_in_file ----

pub struct ReplaceInFileTool;

#[async_trait]
impl Tool for ReplaceInFileTool {
    fn name(&self) -> &'static str {
        "replace_in_file"
    }

    fn description(&self) -> &'static str {
        "Replace an exact text fragment in a file."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path to edit"},
                "search": {"type": "string", "description": "Exact text to find"},
                "replace": {"type": "string", "description": "Replacement text"},
                "replace_all": {"type": "boolean", "description": "Replace every occurrence (default: first only)"}
            },
            "required": ["path", "search", "replace"]
        })
    }

    fn mutated_path(&self, args: &Value) -> Option<String> {
        args.get("path").and_then(Value::as_str).map(String::from)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let path = arg_str(&args, "path")?;
        let search = arg_str(&args, "search")?;
        let replace = arg_str(&args, "replace")?;
        let replace_all = args
            .get("replace_all")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if search.is_empty() {
            return Err(ToolError::Validation("search must not be empty".into()));
        }

        let abs = resolve_path(ctx, path)?;
        let rel = rel_display(ctx, &abs);
        let old_content = std::fs::read_to_string(&abs)
            .map_err(|_| ToolError::NotFound(format!("file not found: {path}")))?;

        let occurrences = old_content.matches(search).count();
        if occurrences == 0 {
            return Err(ToolError::Validation(format!(
                "search text not found in {rel}"
            )));
        }
        let new_content = if replace_all {
            old_content.replace(search, replace)
        } else {
            old_content.replacen(search, replace, 1)
        };

        let snapshot = ctx.versioning.start_edit([abs.as_path()]);
        match std::fs::write(&abs, &new_content) {
            Ok(()) => snapshot.finalize(),
            Err(e) => {
                snapshot.abort();
                return Err(e.into());
            }
        }
        ctx.versioning.stage_file(&abs).await?;

        let diff = unified_diff(&rel, &old_content, &new_content);
        Ok(json!({
            "type": "replace_file_result",
            "path": rel,
            "file": abs.to_string_lossy(),
            "content": new_content,
            "diff": diff,
            "replaced": if replace_all { occurrences } else { 1 },
        }))
    }
}

// ---- delete_file ----

pub struct DeleteFileTool;

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &'static str {
        "delete_file"
    }

    fn description(&self) -> &'static str {
        "Delete a file from the workspace (non-recursive)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path of the file to delete"}
            },
            "required": ["path"]
        })
    }

    fn mutated_path(&self, args: &Value) -> Option<String> {
        args.get("path").and_then(Value::as_str).map(String::from)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let path = arg_str(&args, "path")?;
        let abs = resolve_path(ctx, path)?;
        let rel = rel_display(ctx, &abs);

        let old_content = std::fs::read_to_string(&abs).ok();
        if abs.exists() {
            if !abs.is_file() {
                return Err(ToolError::Validation(format!(
                    "not a file (directories are not deletable): {path}"
                )));
            }
            let snapshot = ctx.versioning.start_edit([abs.as_path()]);
            match std::fs::remove_file(&abs) {
                Ok(()) => snapshot.finalize(),
                Err(e) => {
                    snapshot.abort();
                    return Err(e.into());
                }
            }
        }
        ctx.versioning.stage_file_deletion(&abs).await?;

        let diff = old_content
            .as_deref()
            .map(|old| unified_diff(&rel, old, ""));
        Ok(json!({
            "type": "delete_file_result",
            "path": rel,
            "file": abs.to_string_lossy(),
            "diff": diff,
        }))
    }
}

// ---- list_files ----

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &'static str {
        "list_files"
    }

    fn description(&self) -> &'static str {
        "List directory entries, honoring ignore rules."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory to list (default: project root)"},
                "recursive": {"type": "boolean", "description": "Recurse into subdirectories"}
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let path = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let recursive = args
            .get("recursive")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let abs = resolve_path(ctx, path)?;
        if !abs.is_dir() {
            return Err(ToolError::NotFound(format!("directory not found: {path}")));
        }

        let mut files = Vec::new();
        let walker = WalkBuilder::new(&abs)
            .max_depth(if recursive { None } else { Some(1) })
            .hidden(false)
            .git_ignore(true)
            .filter_entry(|e| {
                !matches!(e.file_name().to_str(), Some(".agentsmithy") | Some(".git"))
            })
            .build();
        for entry in walker.flatten() {
            if entry.depth() == 0 {
                continue;
            }
            let meta = entry.metadata().ok();
            files.push(json!({
                "name": rel_display(ctx, entry.path()),
                "is_dir": meta.as_ref().map(|m| m.is_dir()).unwrap_or(false),
                "size": meta.map(|m| m.len()).unwrap_or(0),
            }));
        }

        Ok(json!({
            "type": "list_files_result",
            "path": rel_display(ctx, &abs),
            "files": files,
            "total": files.len(),
        }))
    }
}

// ---- search_files ----

pub struct SearchFilesTool;

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &'static str {
        "search_files"
    }

    fn description(&self) -> &'static str {
        "Search file contents with a regular expression."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Regular expression to search for"},
                "path": {"type": "string", "description": "Directory to search (default: project root)"},
                "case_insensitive": {"type": "boolean"}
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let pattern = arg_str(&args, "pattern")?;
        let path = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let case_insensitive = args
            .get("case_insensitive")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let abs = resolve_path(ctx, path)?;

        let regex = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| ToolError::Validation(format!("invalid pattern: {e}")))?;

        let mut matches = Vec::new();
        let mut files_matched = 0u64;
        let walker = WalkBuilder::new(&abs)
            .hidden(false)
            .git_ignore(true)
            .filter_entry(|e| {
                !matches!(e.file_name().to_str(), Some(".agentsmithy") | Some(".git"))
            })
            .build();
        'files: for entry in walker.flatten() {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let mut matched_this_file = false;
            for (line_number, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    if !matched_this_file {
                        matched_this_file = true;
                        files_matched += 1;
                    }
                    matches.push(json!({
                        "file": rel_display(ctx, entry.path()),
                        "line": line_number + 1,
                        "content": line.chars().take(400).collect::<String>(),
                    }));
                    if matches.len() >= MAX_SEARCH_RESULTS {
                        break 'files;
                    }
                }
            }
        }

        Ok(json!({
            "type": "search_files_result",
            "pattern": pattern,
            "matches": matches,
            "files_matched": files_matched,
            "truncated": matches.len() >= MAX_SEARCH_RESULTS,
        }))
    }
}
