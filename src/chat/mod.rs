//! Chat service: ingest a user turn, checkpoint, sync RAG, drive the agent
//! loop and forward its events.
//!
//! Stream invariants enforced here: exactly one `done` terminates every
//! stream; an `error` is always immediately followed by it; a busy dialog
//! fails fast with `dialog_busy`; a shutdown mid-turn surfaces as
//! `error{code: "shutdown"}`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentError, AgentLoop, CodeContext, ContextBuilder};
use crate::config::Settings;
use crate::dialogs::summarization::{self, KEEP_LAST_MESSAGES};
use crate::dialogs::{DialogStore, ToolResultStore};
use crate::events::AgentEvent;
use crate::llm::ChatProvider;
use crate::project::Project;
use crate::rag::RagStore;
use crate::tools::{ToolContext, ToolExecutor, ToolRegistry};
use crate::versioning::VersioningTracker;

/// Incoming chat request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<IncomingMessage>,
    #[serde(default)]
    pub context: Option<CodeContext>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub dialog_id: Option<String>,
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    pub content: String,
}

impl ChatRequest {
    /// The query is the trailing user message.
    pub fn query(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }
}

/// Per-dialog turn locks: one turn per dialog, second callers fail fast.
#[derive(Default)]
struct DialogLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DialogLocks {
    async fn try_acquire(&self, dialog_id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(dialog_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.try_lock_owned().ok()
    }
}

pub struct ChatService {
    project: Arc<Project>,
    store: DialogStore,
    provider: Arc<dyn ChatProvider>,
    rag: Arc<RagStore>,
    registry: Arc<ToolRegistry>,
    executor: Arc<ToolExecutor>,
    settings: Settings,
    shutdown: CancellationToken,
    dialog_locks: DialogLocks,
    trackers: Mutex<HashMap<String, Arc<VersioningTracker>>>,
}

impl ChatService {
    pub fn new(
        project: Arc<Project>,
        store: DialogStore,
        provider: Arc<dyn ChatProvider>,
        rag: Arc<RagStore>,
        settings: Settings,
        shutdown: CancellationToken,
    ) -> Self {
        let registry = Arc::new(ToolRegistry::standard());
        let executor = Arc::new(ToolExecutor::new(registry.clone()));
        Self {
            project,
            store,
            provider,
            rag,
            registry,
            executor,
            settings,
            shutdown,
            dialog_locks: DialogLocks::default(),
            trackers: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &DialogStore {
        &self.store
    }

    pub fn rag(&self) -> &Arc<RagStore> {
        &self.rag
    }

    /// Versioning tracker for a dialog, cached so staging and checkpoints
    /// share one serialized instance.
    pub async fn tracker_for(&self, dialog_id: &str) -> Result<Arc<VersioningTracker>> {
        let mut trackers = self.trackers.lock().await;
        if let Some(tracker) = trackers.get(dialog_id) {
            return Ok(tracker.clone());
        }
        let tracker = Arc::new(VersioningTracker::new(
            self.project.root(),
            dialog_id,
            self.store.pool(),
            self.settings.extra_excludes.clone(),
        )?);
        trackers.insert(dialog_id.to_string(), tracker.clone());
        Ok(tracker)
    }

    /// Create a dialog and take its initial checkpoint.
    pub async fn create_dialog(&self, title: Option<String>, set_current: bool) -> Result<String> {
        let dialog_id = self.project.create_dialog(title, set_current)?;
        let tracker = self.tracker_for(&dialog_id).await?;
        let checkpoint = tracker.create_checkpoint("Initial checkpoint").await?;
        self.project
            .upsert_dialog_meta(&dialog_id, None, Some(checkpoint.commit_id), None)?;
        Ok(dialog_id)
    }

    /// Resolve the target dialog, creating a default one if none exists.
    async fn resolve_dialog(&self, requested: Option<&str>) -> Result<String> {
        if let Some(dialog_id) = requested {
            if self.project.get_dialog_meta(dialog_id).is_none() {
                anyhow::bail!("Dialog not found: {dialog_id}");
            }
            return Ok(dialog_id.to_string());
        }
        if let Some(current) = self.project.get_current_dialog_id() {
            return Ok(current);
        }
        self.create_dialog(None, true).await
    }

    /// Run one chat turn; events arrive on the returned receiver. The stream
    /// always ends with `done`.
    pub fn chat_stream(self: &Arc<Self>, request: ChatRequest) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel::<AgentEvent>(64);
        let service = self.clone();

        tokio::spawn(async move {
            let dialog_id = match service.resolve_dialog(request.dialog_id.as_deref()).await {
                Ok(dialog_id) => dialog_id,
                Err(e) => {
                    let _ = tx.send(AgentEvent::error(e.to_string(), "")).await;
                    let _ = tx.send(AgentEvent::done("")).await;
                    return;
                }
            };

            // One turn per dialog at a time; a held lock is an immediate
            // dialog_busy, not a queue.
            let Some(_turn_guard) = service.dialog_locks.try_acquire(&dialog_id).await else {
                let _ = tx
                    .send(AgentEvent::error_with_code(
                        "Another turn is already running for this dialog",
                        "dialog_busy",
                        dialog_id.clone(),
                    ))
                    .await;
                let _ = tx.send(AgentEvent::done(dialog_id)).await;
                return;
            };

            // Cancellation: client disconnect (receiver dropped) or process
            // shutdown.
            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                let shutdown = service.shutdown.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => cancel.cancel(),
                        _ = tx.closed() => cancel.cancel(),
                    }
                });
            }

            let result = service
                .run_turn(&request, &dialog_id, tx.clone(), cancel)
                .await;

            match result {
                Ok(()) => {}
                Err(TurnFailure::Reported) => {}
                Err(TurnFailure::Error { message, code }) => {
                    let event = match code {
                        Some(code) => {
                            AgentEvent::error_with_code(message, code, dialog_id.clone())
                        }
                        None => AgentEvent::error(message, dialog_id.clone()),
                    };
                    let _ = tx.send(event).await;
                }
            }
            let _ = tx.send(AgentEvent::done(dialog_id)).await;
        });

        rx
    }

    /// Non-streaming chat: run the turn, assemble the final text.
    pub async fn chat_collect(self: &Arc<Self>, request: ChatRequest) -> serde_json::Value {
        let mut rx = self.chat_stream(request);
        let mut content = String::new();
        let mut dialog_id = String::new();
        let mut checkpoint = None;
        let mut session = None;
        let mut error = None;
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Chat { content: chunk, .. } => content.push_str(&chunk),
                AgentEvent::User {
                    checkpoint: cp,
                    session: s,
                    dialog_id: d,
                    ..
                } => {
                    checkpoint = cp;
                    session = s;
                    dialog_id = d;
                }
                AgentEvent::Error { message, .. } => error = Some(message),
                AgentEvent::Done { dialog_id: d } => {
                    if dialog_id.is_empty() {
                        dialog_id = d;
                    }
                }
                _ => {}
            }
        }
        serde_json::json!({
            "content": content,
            "dialog_id": dialog_id,
            "checkpoint": checkpoint,
            "session": session,
            "error": error,
        })
    }

    async fn run_turn(
        self: &Arc<Self>,
        request: &ChatRequest,
        dialog_id: &str,
        tx: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> std::result::Result<(), TurnFailure> {
        let query = request
            .query()
            .ok_or_else(|| TurnFailure::validation("request has no user message"))?
            .to_string();
        info!(dialog_id, query = %query.chars().take(100).collect::<String>(), "Chat turn started");

        let tracker = self
            .tracker_for(dialog_id)
            .await
            .map_err(TurnFailure::internal)?;

        // Snapshot before any agent work; undoing the whole turn means
        // restoring this commit.
        let truncated: String = query.chars().take(50).collect();
        let checkpoint = tracker
            .create_checkpoint(&format!("Before user message: {truncated}"))
            .await
            .map_err(TurnFailure::internal)?;
        let session = tracker
            .active_session_name()
            .await
            .map_err(TurnFailure::internal)?;

        let _ = tx
            .send(AgentEvent::user(
                query.clone(),
                Some(checkpoint.commit_id.clone()),
                Some(session.clone()),
                dialog_id.to_string(),
            ))
            .await;

        self.store
            .add_user_message(dialog_id, &query, &checkpoint.commit_id, &session)
            .await
            .map_err(TurnFailure::internal)?;
        self.project.touch_dialog(dialog_id);

        // Catch command-made and external edits before the model reads
        // anything.
        match self.rag.full_sync().await {
            Ok(stats) if stats.reindexed > 0 || stats.removed > 0 => {
                info!(
                    dialog_id,
                    reindexed = stats.reindexed,
                    removed = stats.removed,
                    "Synced RAG before turn"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(dialog_id, error = %e, "RAG sync failed; continuing"),
        }

        // Summarize older history when the prompt would grow too large.
        let all_messages = self
            .store
            .get_messages(dialog_id, None)
            .await
            .map_err(TurnFailure::internal)?;
        let existing_summary = self
            .store
            .load_summary(dialog_id)
            .await
            .map_err(TurnFailure::internal)?;
        let already = existing_summary
            .as_ref()
            .map(|s| s.summarized_count)
            .unwrap_or(0);

        let summary = if summarization::should_summarize(&all_messages, already) {
            let _ = tx
                .send(AgentEvent::SummaryStart {
                    dialog_id: dialog_id.to_string(),
                })
                .await;
            let summary = summarization::summarize_history(
                self.provider.as_ref(),
                &self.store,
                dialog_id,
                &all_messages,
            )
            .await;
            let _ = tx
                .send(AgentEvent::SummaryEnd {
                    dialog_id: dialog_id.to_string(),
                })
                .await;
            match summary {
                Ok((text, _count)) if !text.is_empty() => Some(text),
                Ok(_) => existing_summary.map(|s| s.summary_text),
                Err(e) => {
                    warn!(dialog_id, error = %e, "Summarization failed; using full history");
                    existing_summary.map(|s| s.summary_text)
                }
            }
        } else {
            existing_summary.map(|s| s.summary_text)
        };

        let history = if summary.is_some() {
            let keep = all_messages.len().saturating_sub(KEEP_LAST_MESSAGES);
            all_messages[keep..].to_vec()
        } else {
            all_messages
        };

        let builder = ContextBuilder::new(
            &self.project.root().to_string_lossy(),
            self.settings.ide.clone(),
        );
        let conversation =
            builder.build_messages(summary.as_deref(), &history, request.context.as_ref());

        // The title tool is only offered while the dialog is untitled.
        let has_title = self
            .project
            .get_dialog_meta(dialog_id)
            .and_then(|meta| meta.title)
            .is_some();
        let excluded: &[&str] = if has_title {
            &["generate_dialog_title"]
        } else {
            &[]
        };
        let tools = self.registry.definitions(excluded);

        let ctx = Arc::new(ToolContext {
            project: self.project.clone(),
            dialog_id: dialog_id.to_string(),
            versioning: tracker,
            rag: self.rag.clone(),
            results: Arc::new(ToolResultStore::new(&self.project.dialog_dir(dialog_id))),
            store: self.store.clone(),
            provider: self.provider.clone(),
            cancel: cancel.clone(),
            events: tx.clone(),
            command_timeout_secs: self.settings.command_timeout_secs,
            current_turn_calls: std::sync::Mutex::new(HashSet::new()),
        });

        let agent = AgentLoop::new(self.provider.clone(), self.executor.clone());
        let outcome = agent.run_turn(&ctx, conversation, tools).await;

        match outcome {
            Ok(()) => {
                self.project.touch_dialog(dialog_id);
                Ok(())
            }
            Err(AgentError::Cancelled) => {
                if self.shutdown.is_cancelled() {
                    Err(TurnFailure::Error {
                        message: "Server is shutting down".into(),
                        code: Some("shutdown".into()),
                    })
                } else {
                    Err(TurnFailure::Error {
                        message: "Request cancelled".into(),
                        code: Some("cancelled".into()),
                    })
                }
            }
            Err(AgentError::ToolLoopExceeded) => Err(TurnFailure::Error {
                message: "Tool loop exceeded maximum iterations".into(),
                code: Some("tool_loop_exceeded".into()),
            }),
            Err(AgentError::Provider(message)) => Err(TurnFailure::Error {
                message: format!("LLM error: {message}"),
                code: None,
            }),
            Err(AgentError::Internal(e)) => Err(TurnFailure::internal(e)),
        }
    }
}

/// Why a turn did not complete normally.
enum TurnFailure {
    /// The error event was already emitted downstream.
    #[allow(dead_code)]
    Reported,
    Error {
        message: String,
        code: Option<String>,
    },
}

impl TurnFailure {
    fn validation(message: &str) -> Self {
        Self::Error {
            message: message.into(),
            code: Some("validation".into()),
        }
    }

    fn internal(e: impl std::fmt::Display) -> Self {
        Self::Error {
            message: format!("Error processing request: {e}"),
            code: None,
        }
    }
}

/// Truncate helper used for checkpoint messages.
pub fn truncate_query(query: &str, max: usize) -> String {
    query.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_takes_last_user_message() {
        let request = ChatRequest {
            messages: vec![
                IncomingMessage {
                    role: "user".into(),
                    content: "first".into(),
                },
                IncomingMessage {
                    role: "assistant".into(),
                    content: "reply".into(),
                },
                IncomingMessage {
                    role: "user".into(),
                    content: "second".into(),
                },
            ],
            context: None,
            stream: true,
            dialog_id: None,
        };
        assert_eq!(request.query(), Some("second"));
    }

    #[tokio::test]
    async fn dialog_locks_fail_fast_when_held() {
        let locks = DialogLocks::default();
        let guard = locks.try_acquire("d1").await;
        assert!(guard.is_some());
        assert!(locks.try_acquire("d1").await.is_none());
        drop(guard);
        assert!(locks.try_acquire("d1").await.is_some());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_query("héllo wörld", 5), "héllo");
    }
}
