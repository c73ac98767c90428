//! Tool trait, registry and invocation context.
//!
//! Tools are named polymorphic units behind a single capability: name,
//! argument schema, async execute. Failures are encoded into the structured
//! result (`tool_error`) and shown to the model, never raised to the agent
//! loop.

pub mod command;
pub mod dialog;
pub mod executor;
pub mod fs;
pub mod web;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dialogs::{DialogStore, ToolResultStore};
use crate::events::AgentEvent;
use crate::llm::{ChatProvider, ToolDefinition};
use crate::project::Project;
use crate::rag::RagStore;
use crate::versioning::VersioningTracker;

pub use executor::ToolExecutor;

/// Typed tool failure; the `code` is part of the wire contract.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Permission(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Cancelled(String),
    #[error("{0}")]
    Exception(String),
    #[error("{0}")]
    ExecFailed(String),
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Permission(_) => "permission",
            Self::Timeout(_) => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::Exception(_) => "exception",
            Self::ExecFailed(_) => "exec_failed",
        }
    }

    /// Structured result presented to the model.
    pub fn to_value(&self, tool_name: &str) -> Value {
        serde_json::json!({
            "type": "tool_error",
            "name": tool_name,
            "code": self.code(),
            "error": self.to_string(),
            "error_type": self.code(),
        })
    }
}

impl From<anyhow::Error> for ToolError {
    fn from(e: anyhow::Error) -> Self {
        Self::Exception(e.to_string())
    }
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::Permission(e.to_string()),
            _ => Self::Exception(e.to_string()),
        }
    }
}

/// Everything an invocation may touch.
pub struct ToolContext {
    pub project: Arc<Project>,
    pub dialog_id: String,
    pub versioning: Arc<VersioningTracker>,
    pub rag: Arc<RagStore>,
    pub results: Arc<ToolResultStore>,
    pub store: DialogStore,
    pub provider: Arc<dyn ChatProvider>,
    pub cancel: CancellationToken,
    pub events: mpsc::Sender<AgentEvent>,
    pub command_timeout_secs: u64,
    /// Tool-call ids issued in the current turn; `get_tool_result` refuses
    /// these.
    pub current_turn_calls: std::sync::Mutex<HashSet<String>>,
}

impl ToolContext {
    pub async fn emit(&self, event: AgentEvent) {
        if let Err(e) = self.events.send(event).await {
            tracing::debug!(error = %e, "Event channel closed; dropping tool event");
        }
    }

    pub fn project_root(&self) -> PathBuf {
        self.project.root().to_path_buf()
    }

    pub fn mark_current_turn_call(&self, tool_call_id: &str) {
        if let Ok(mut calls) = self.current_turn_calls.lock() {
            calls.insert(tool_call_id.to_string());
        }
    }

    pub fn is_current_turn_call(&self, tool_call_id: &str) -> bool {
        self.current_turn_calls
            .lock()
            .map(|calls| calls.contains(tool_call_id))
            .unwrap_or(false)
    }
}

/// A single tool behind the registry.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON Schema of the arguments object.
    fn parameters(&self) -> Value;

    /// Path this call mutates, if any. Mutating calls on the same path are
    /// serialized by a per-path lock.
    fn mutated_path(&self, _args: &Value) -> Option<String> {
        None
    }

    /// Whether the call needs the exclusive workdir lock (`run_command`).
    fn needs_workdir_lock(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// Stable name-to-implementation dispatch map.
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Registry with the standard tool set.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(fs::ReadFileTool));
        registry.register(Arc::new(fs::WriteFileTool));
        registry.register(Arc::new(fs::ReplaceInFileTool));
        registry.register(Arc::new(fs::DeleteFileTool));
        registry.register(Arc::new(fs::ListFilesTool));
        registry.register(Arc::new(fs::SearchFilesTool));
        registry.register(Arc::new(command::RunCommandTool));
        registry.register(Arc::new(web::WebSearchTool));
        registry.register(Arc::new(web::WebFetchTool));
        registry.register(Arc::new(dialog::GetToolResultTool));
        registry.register(Arc::new(dialog::GenerateDialogTitleTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Schemas bound into the LLM request, excluding `excluded` names
    /// (e.g. `generate_dialog_title` once a title exists).
    pub fn definitions(&self, excluded: &[&str]) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .filter(|tool| !excluded.contains(&tool.name()))
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }
}
