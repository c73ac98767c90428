//! Shell command execution with a bounded wall-clock timeout.
//!
//! `run_command` never stages files: changes it makes are picked up by the
//! next checkpoint's workdir scan and by `get_staged_files`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{Tool, ToolContext, ToolError};

/// Output kept per stream (8KB); middles are elided.
const MAX_OUTPUT_SIZE: usize = 8 * 1024;

fn truncate_output(output: &str) -> (String, bool) {
    if output.len() <= MAX_OUTPUT_SIZE {
        return (output.to_string(), false);
    }
    let head_size = (MAX_OUTPUT_SIZE * 3) / 4;
    let tail_size = MAX_OUTPUT_SIZE / 5;
    let head: String = output.chars().take(head_size).collect();
    let tail: String = output
        .chars()
        .rev()
        .take(tail_size)
        .collect::<String>()
        .chars()
        .rev()
        .collect();
    let omitted = output.len().saturating_sub(head.len() + tail.len());
    (
        format!("{head}\n... [{omitted} bytes omitted] ...\n{tail}"),
        true,
    )
}

pub struct RunCommandTool;

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &'static str {
        "run_command"
    }

    fn description(&self) -> &'static str {
        "Run a shell command in the project directory and capture its output."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command to run"},
                "timeout_secs": {"type": "integer", "description": "Wall-clock limit in seconds"}
            },
            "required": ["command"]
        })
    }

    fn needs_workdir_lock(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Validation("missing required argument: command".into()))?;
        let timeout_secs = args
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(ctx.command_timeout_secs);

        let mut child = Command::new("sh")
            .args(["-c", command])
            .current_dir(ctx.project_root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::ExecFailed(format!("failed to spawn shell: {e}")))?;

        let output = tokio::select! {
            result = child.wait_with_output() => {
                result.map_err(|e| ToolError::ExecFailed(e.to_string()))?
            }
            _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                // kill_on_drop reaps the subprocess.
                return Err(ToolError::Timeout(format!(
                    "command timed out after {timeout_secs}s: {command}"
                )));
            }
            _ = ctx.cancel.cancelled() => {
                return Err(ToolError::Cancelled(format!("command cancelled: {command}")));
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let (stdout, stdout_truncated) =
            truncate_output(&String::from_utf8_lossy(&output.stdout));
        let (stderr, stderr_truncated) =
            truncate_output(&String::from_utf8_lossy(&output.stderr));

        Ok(json!({
            "type": "run_command_result",
            "command": command,
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
            "truncated": stdout_truncated || stderr_truncated,
        }))
    }
}
