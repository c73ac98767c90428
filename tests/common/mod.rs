//! Shared helpers for integration tests: a scripted provider and service
//! construction over a throwaway workdir.

// Each test binary compiles this module separately and uses a subset of it.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use agentsmithy::chat::ChatService;
use agentsmithy::config::Settings;
use agentsmithy::dialogs::DialogStore;
use agentsmithy::events::AgentEvent;
use agentsmithy::llm::{ChatMessage, ChatProvider, StreamEvent, ToolDefinition, Workload};
use agentsmithy::project::Project;
use agentsmithy::rag::RagStore;

/// Provider that replays pre-scripted stream events, one script per call.
pub struct MockProvider {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    delay: Duration,
    generate_reply: String,
}

impl MockProvider {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            delay: Duration::from_millis(5),
            generate_reply: "Scripted reply".into(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn model_for(&self, _workload: Workload) -> String {
        "mock-model".into()
    }

    async fn generate_stream(
        &self,
        _workload: Workload,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let script = self
            .scripts
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| vec![StreamEvent::Done]);
        let delay = self.delay;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for event in script {
                tokio::time::sleep(delay).await;
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn generate(&self, _workload: Workload, _messages: &[ChatMessage]) -> Result<String> {
        Ok(self.generate_reply.clone())
    }
}

/// A chat service over a fresh temp workdir with the given provider script.
pub async fn make_service(
    provider: Arc<dyn ChatProvider>,
) -> (TempDir, Arc<ChatService>, CancellationToken) {
    let dir = TempDir::new().unwrap();
    let project = Arc::new(Project::open(dir.path()).unwrap());
    let store = DialogStore::open(&project.dialog_db_path()).await.unwrap();
    let rag = Arc::new(RagStore::new(&project.rag_dir(), project.root(), None));
    let shutdown = CancellationToken::new();
    let settings = Settings {
        command_timeout_secs: 10,
        ..Settings::default()
    };
    let service = Arc::new(ChatService::new(
        project,
        store,
        provider,
        rag,
        settings,
        shutdown.clone(),
    ));
    (dir, service, shutdown)
}

/// Drain a chat stream into a vector.
pub async fn collect_events(
    mut rx: mpsc::Receiver<AgentEvent>,
) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// Check the SSE ordering contract over a finished stream:
/// brackets properly nested and non-interleaving, `tool_call` never inside a
/// chat bracket, `error` followed by `done`, `done` terminal and unique.
pub fn assert_event_contract(events: &[AgentEvent]) {
    let mut chat_open = false;
    let mut reasoning_open = false;
    let mut saw_done = false;
    let mut last_was_error = false;

    for event in events {
        assert!(!saw_done, "event after done: {}", event.kind());
        match event.kind() {
            "chat_start" => {
                assert!(!chat_open, "nested chat_start");
                chat_open = true;
            }
            "chat_end" => {
                assert!(chat_open, "chat_end without chat_start");
                chat_open = false;
            }
            "reasoning_start" => {
                assert!(!reasoning_open, "nested reasoning_start");
                reasoning_open = true;
            }
            "reasoning_end" => {
                assert!(reasoning_open, "reasoning_end without reasoning_start");
                reasoning_open = false;
            }
            "tool_call" => {
                assert!(!chat_open, "tool_call inside an open chat bracket");
            }
            "done" => saw_done = true,
            _ => {}
        }
        if last_was_error {
            assert_eq!(event.kind(), "done", "error not followed by done");
        }
        last_was_error = event.kind() == "error";
    }

    assert!(saw_done, "stream did not terminate with done");
    assert!(!chat_open, "unclosed chat bracket");
    assert!(!reasoning_open, "unclosed reasoning bracket");
}

/// Events of a given kind.
pub fn events_of<'a>(events: &'a [AgentEvent], kind: &str) -> Vec<&'a AgentEvent> {
    events.iter().filter(|e| e.kind() == kind).collect()
}
