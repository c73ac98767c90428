//! Concurrent tool dispatch for one assistant message.
//!
//! Calls dispatch in parallel; contention is resolved by locks instead of a
//! scheduler: every file-mutating tool holds a per-path exclusive lock,
//! `run_command` holds a global workdir lock. `tool_call` events fire at the
//! start of execution in the order the model emitted the calls, and results
//! are post-processed in that same order, so `file_edit` events and tool
//! messages never reorder.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ToolContext, ToolRegistry};
use crate::dialogs::{ToolCallRecord, ToolResultRef};
use crate::events::AgentEvent;
use crate::tools::ToolError;

/// Result of one executed call.
pub struct ToolOutcome {
    pub call: ToolCallRecord,
    /// Full structured result (or `tool_error`), shown inline to the model.
    pub result: Value,
    /// Lazy reference persisted into history.
    pub result_ref: ToolResultRef,
}

/// Per-path lock table, created on demand.
#[derive(Default)]
struct PathLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PathLocks {
    async fn get(&self, path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    path_locks: PathLocks,
    workdir_lock: Arc<Mutex<()>>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            path_locks: PathLocks::default(),
            workdir_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Execute one batch of calls from a single assistant message.
    ///
    /// Emits `tool_call` events up front (model order), runs the calls
    /// concurrently, then post-processes results in model order: `file_edit`
    /// events, RAG updates, result storage and history append.
    pub async fn execute_batch(
        &self,
        calls: Vec<ToolCallRecord>,
        ctx: &Arc<ToolContext>,
    ) -> Vec<ToolOutcome> {
        for call in &calls {
            ctx.mark_current_turn_call(&call.id);
            ctx.emit(AgentEvent::ToolCall {
                name: call.name.clone(),
                args: call.args.clone(),
                dialog_id: ctx.dialog_id.clone(),
            })
            .await;
        }

        let futures = calls
            .into_iter()
            .map(|call| self.run_one(call, ctx.clone()));
        let executed = futures::future::join_all(futures).await;

        let mut outcomes = Vec::with_capacity(executed.len());
        for (call, result) in executed {
            let outcome = self.finish_call(call, result, ctx).await;
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn run_one(
        &self,
        call: ToolCallRecord,
        ctx: Arc<ToolContext>,
    ) -> (ToolCallRecord, Value) {
        let name = call.name.clone();

        let Some(tool) = self.registry.get(&name) else {
            let error = ToolError::NotFound(format!("unknown tool: {name}"));
            return (call, error.to_value(&name));
        };

        if ctx.cancel.is_cancelled() {
            let error = ToolError::Cancelled("turn cancelled".into());
            return (call, error.to_value(&name));
        }

        if !call.args.is_object() {
            let error = ToolError::Validation("tool arguments must be a JSON object".into());
            return (call, error.to_value(&name));
        }

        // Lock ordering: workdir lock first, then the path lock. Only
        // run_command takes the former and only file mutators the latter, so
        // the pair never deadlocks.
        let _workdir_guard = if tool.needs_workdir_lock() {
            Some(self.workdir_lock.lock().await)
        } else {
            None
        };
        let _path_guard = match tool.mutated_path(&call.args) {
            Some(path) => Some(self.path_locks.get(&path).await.lock_owned().await),
            None => None,
        };

        debug!(tool = %name, call_id = %call.id, "Executing tool");
        let result = match tool.execute(call.args.clone(), &ctx).await {
            Ok(result) => result,
            Err(error) => {
                debug!(tool = %name, code = error.code(), error = %error, "Tool failed");
                error.to_value(&name)
            }
        };
        (call, result)
    }

    /// Ordered post-processing of one finished call.
    async fn finish_call(
        &self,
        call: ToolCallRecord,
        result: Value,
        ctx: &Arc<ToolContext>,
    ) -> ToolOutcome {
        let result_type = result.get("type").and_then(Value::as_str).unwrap_or("");

        // File mutations: notify the client and keep RAG in step.
        if matches!(
            result_type,
            "write_file_result" | "replace_file_result" | "delete_file_result"
        ) {
            let file = result
                .get("file")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let diff = result
                .get("diff")
                .and_then(Value::as_str)
                .map(String::from);

            if !file.is_empty() {
                ctx.emit(AgentEvent::FileEdit {
                    file: file.clone(),
                    diff: diff.clone(),
                    dialog_id: ctx.dialog_id.clone(),
                })
                .await;

                let message_idx = ctx
                    .store
                    .count_messages(&ctx.dialog_id)
                    .await
                    .unwrap_or(0);
                if let Err(e) = ctx
                    .store
                    .save_file_edit(&ctx.dialog_id, &file, diff.as_deref(), None, message_idx)
                    .await
                {
                    warn!(error = %e, "Failed to record file edit");
                }

                let path = Path::new(&file);
                if result_type == "delete_file_result" {
                    if let Err(e) = ctx.rag.remove_file(path).await {
                        warn!(error = %e, "Failed to drop file from RAG index");
                    }
                } else if let Some(content) = result.get("content").and_then(Value::as_str) {
                    if let Err(e) = ctx.rag.index_file(path, content).await {
                        warn!(error = %e, "Failed to reindex mutated file");
                    }
                }
            }
        }

        // Reads feed the index too: the agent has seen this content.
        if result_type == "read_file_result" {
            if let (Some(path), Some(content)) = (
                result.get("path").and_then(Value::as_str),
                result.get("content").and_then(Value::as_str),
            ) {
                let abs = ctx.project_root().join(path);
                if let Err(e) = ctx.rag.index_file(&abs, content).await {
                    warn!(error = %e, "Failed to index read file");
                }
            }
        }

        // Full result goes out-of-band; history keeps the lazy reference.
        let result_ref = match ctx
            .results
            .store(&call.id, &call.name, &call.args, &result)
        {
            Ok(reference) => reference,
            Err(e) => {
                warn!(error = %e, call_id = %call.id, "Failed to store tool result");
                ToolResultRef {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    status: "error".into(),
                    size_bytes: 0,
                    summary: String::new(),
                    truncated_preview: String::new(),
                    result_ref: call.id.clone(),
                }
            }
        };

        if let Err(e) = ctx
            .store
            .save_tool_result_meta(
                &ctx.dialog_id,
                &crate::dialogs::ToolResultMeta {
                    tool_call_id: result_ref.tool_call_id.clone(),
                    tool_name: result_ref.tool_name.clone(),
                    status: result_ref.status.clone(),
                    size_bytes: result_ref.size_bytes,
                    summary: result_ref.summary.clone(),
                    created_at: chrono::Utc::now().to_rfc3339(),
                },
            )
            .await
        {
            warn!(error = %e, "Failed to record tool result metadata");
        }

        if let Err(e) = ctx.store.add_tool_message(&ctx.dialog_id, &result_ref).await {
            warn!(error = %e, "Failed to append tool message");
        }

        ToolOutcome {
            call,
            result,
            result_ref,
        }
    }
}
