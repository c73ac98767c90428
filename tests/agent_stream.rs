//! End-to-end agent turns against a scripted provider: event ordering,
//! file tools, checkpoint/session workflow, cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use agentsmithy::chat::{ChatRequest, IncomingMessage};
use agentsmithy::events::AgentEvent;
use agentsmithy::llm::{StreamEvent, ToolCallDelta};

use common::{assert_event_contract, collect_events, events_of, make_service, MockProvider};

fn user_request(text: &str) -> ChatRequest {
    ChatRequest {
        messages: vec![IncomingMessage {
            role: "user".into(),
            content: text.into(),
        }],
        context: None,
        stream: true,
        dialog_id: None,
    }
}

fn tool_call_script(text: &str, id: &str, name: &str, args: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::TextDelta(text.into()),
        StreamEvent::ToolCallDelta(ToolCallDelta {
            index: 0,
            id: Some(id.into()),
            name_fragment: Some(name.into()),
            args_fragment: Some(args.into()),
        }),
        StreamEvent::Done,
    ]
}

#[tokio::test]
async fn create_write_approve_flow() {
    let provider = Arc::new(MockProvider::new(vec![
        tool_call_script(
            "Creating main.py",
            "call_1",
            "write_to_file",
            r#"{"path":"main.py","content":"print('hi')\n"}"#,
        ),
        vec![StreamEvent::TextDelta("Created it.".into()), StreamEvent::Done],
    ]));
    let (dir, service, _shutdown) = make_service(provider).await;

    let rx = service.chat_stream(user_request("Create main.py that prints hi"));
    let events = collect_events(rx).await;
    assert_event_contract(&events);

    // The user event carries the pre-message checkpoint and the session.
    let user = events_of(&events, "user");
    let AgentEvent::User {
        checkpoint, session, ..
    } = user[0]
    else {
        panic!("first event not user");
    };
    assert!(checkpoint.is_some());
    assert_eq!(session.as_deref(), Some("session_1"));

    // Tool activity: one tool_call, one file_edit, in that order.
    assert_eq!(events_of(&events, "tool_call").len(), 1);
    let edits = events_of(&events, "file_edit");
    assert_eq!(edits.len(), 1);
    let AgentEvent::FileEdit { file, diff, .. } = edits[0] else {
        panic!("not a file_edit");
    };
    assert!(file.ends_with("main.py"));
    assert!(diff.as_deref().unwrap().contains("+print('hi')"));

    // The file landed on disk with exact content.
    let content = std::fs::read_to_string(dir.path().join("main.py")).unwrap();
    assert_eq!(content, "print('hi')\n");

    // Session view shows the unapproved add; approving rotates the session.
    let AgentEvent::Done { dialog_id } = events.last().unwrap() else {
        panic!("last event not done");
    };
    let tracker = service.tracker_for(dialog_id).await.unwrap();
    let changed = tracker.get_staged_files().await.unwrap();
    assert!(changed.iter().any(|c| c.path == "main.py"));

    let outcome = tracker.approve_all(None).await.unwrap();
    assert!(outcome.commits_approved >= 1);
    assert_eq!(outcome.new_session, "session_2");
    assert!(tracker.get_staged_files().await.unwrap().is_empty());
}

#[tokio::test]
async fn restore_undoes_a_delete_turn() {
    let provider = Arc::new(MockProvider::new(vec![
        tool_call_script(
            "Writing",
            "call_1",
            "write_to_file",
            r#"{"path":"main.py","content":"original\n"}"#,
        ),
        vec![StreamEvent::Done],
        tool_call_script("Deleting", "call_2", "delete_file", r#"{"path":"main.py"}"#),
        vec![StreamEvent::Done],
    ]));
    let (dir, service, _shutdown) = make_service(provider).await;

    let events = collect_events(service.chat_stream(user_request("Create main.py"))).await;
    assert_event_contract(&events);
    assert!(dir.path().join("main.py").exists());

    let events = collect_events(service.chat_stream(user_request("Delete main.py"))).await;
    assert_event_contract(&events);
    assert!(!dir.path().join("main.py").exists());

    // The delete turn's user message points at the pre-delete checkpoint.
    let AgentEvent::User {
        checkpoint: Some(checkpoint),
        dialog_id,
        ..
    } = events_of(&events, "user")[0]
    else {
        panic!("user event without checkpoint");
    };

    let tracker = service.tracker_for(dialog_id).await.unwrap();
    let outcome = tracker.restore_checkpoint(checkpoint).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(dir.path().join("main.py")).unwrap(),
        "original\n"
    );
    // The restore itself is a checkpoint, so it can be undone too.
    assert!(tracker.has_commit(&outcome.new_checkpoint));
}

#[tokio::test]
async fn multi_file_batch_keeps_model_order() {
    let provider = Arc::new(MockProvider::new(vec![
        vec![
            StreamEvent::ToolCallDelta(ToolCallDelta {
                index: 0,
                id: Some("call_a".into()),
                name_fragment: Some("write_to_file".into()),
                args_fragment: Some(r#"{"path":"a.txt","content":"A"}"#.into()),
            }),
            StreamEvent::ToolCallDelta(ToolCallDelta {
                index: 1,
                id: Some("call_b".into()),
                name_fragment: Some("write_to_file".into()),
                args_fragment: Some(r#"{"path":"b.txt","content":"B"}"#.into()),
            }),
            StreamEvent::Done,
        ],
        vec![StreamEvent::TextDelta("Both written.".into()), StreamEvent::Done],
    ]));
    let (dir, service, _shutdown) = make_service(provider).await;

    let events =
        collect_events(service.chat_stream(user_request("Create a.txt and b.txt"))).await;
    assert_event_contract(&events);

    assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "A");
    assert_eq!(std::fs::read_to_string(dir.path().join("b.txt")).unwrap(), "B");

    // tool_call and file_edit events keep the order the model emitted.
    let names: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::FileEdit { file, .. } => Some(file.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names[0].ends_with("a.txt"));
    assert!(names[1].ends_with("b.txt"));

    let AgentEvent::Done { dialog_id } = events.last().unwrap() else {
        panic!();
    };
    let tracker = service.tracker_for(dialog_id).await.unwrap();
    let changed = tracker.get_staged_files().await.unwrap();
    let added: Vec<&str> = changed.iter().map(|c| c.path.as_str()).collect();
    assert!(added.contains(&"a.txt"));
    assert!(added.contains(&"b.txt"));
}

#[tokio::test]
async fn malformed_tool_args_become_tool_error_without_invocation() {
    let provider = Arc::new(MockProvider::new(vec![
        vec![
            StreamEvent::ToolCallDelta(ToolCallDelta {
                index: 0,
                id: Some("call_bad".into()),
                name_fragment: Some("write_to_file".into()),
                args_fragment: Some(r#"{"path": "x.txt", "content": "#.into()),
            }),
            StreamEvent::Done,
        ],
        vec![
            StreamEvent::TextDelta("Sorry, retrying.".into()),
            StreamEvent::Done,
        ],
    ]));
    let (dir, service, _shutdown) = make_service(provider).await;

    let events = collect_events(service.chat_stream(user_request("write broken"))).await;
    assert_event_contract(&events);

    // The call was never executed.
    assert!(!dir.path().join("x.txt").exists());

    // But its (error) result exists and is marked as a validation failure.
    let AgentEvent::Done { dialog_id } = events.last().unwrap() else {
        panic!();
    };
    let meta = service
        .store()
        .list_tool_result_meta(dialog_id)
        .await
        .unwrap();
    assert_eq!(meta.len(), 1);
    assert_eq!(meta[0].status, "error");
}

#[tokio::test]
async fn reasoning_is_bracketed_and_persisted() {
    let provider = Arc::new(MockProvider::new(vec![vec![
        StreamEvent::ReasoningDelta("thinking ".into()),
        StreamEvent::ReasoningDelta("hard".into()),
        StreamEvent::TextDelta("The answer.".into()),
        StreamEvent::Done,
    ]]));
    let (_dir, service, _shutdown) = make_service(provider).await;

    let events = collect_events(service.chat_stream(user_request("think"))).await;
    assert_event_contract(&events);
    assert_eq!(events_of(&events, "reasoning_start").len(), 1);
    assert_eq!(events_of(&events, "reasoning").len(), 2);
    assert_eq!(events_of(&events, "reasoning_end").len(), 1);

    let AgentEvent::Done { dialog_id } = events.last().unwrap() else {
        panic!();
    };
    let blocks = service.store().load_reasoning(dialog_id).await.unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].content, "thinking hard");
}

#[tokio::test]
async fn second_turn_on_busy_dialog_fails_fast() {
    // Slow provider so the first turn is still running when the second lands.
    let provider = Arc::new(
        MockProvider::new(vec![
            vec![
                StreamEvent::TextDelta("slow...".into()),
                StreamEvent::TextDelta("still going".into()),
                StreamEvent::Done,
            ],
            vec![StreamEvent::Done],
        ])
        .with_delay(Duration::from_millis(150)),
    );
    let (_dir, service, _shutdown) = make_service(provider.clone()).await;

    // Dialogs must exist up front so both turns target the same one.
    let dialog_id = service.create_dialog(None, true).await.unwrap();

    let mut request = user_request("first");
    request.dialog_id = Some(dialog_id.clone());
    let first = service.chat_stream(request);

    // Give the first turn time to take the lock.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut request = user_request("second");
    request.dialog_id = Some(dialog_id);
    let second_events = collect_events(service.chat_stream(request)).await;
    assert_event_contract(&second_events);
    let errors = events_of(&second_events, "error");
    assert_eq!(errors.len(), 1);
    let AgentEvent::Error { code, .. } = errors[0] else {
        panic!();
    };
    assert_eq!(code.as_deref(), Some("dialog_busy"));

    let first_events = collect_events(first).await;
    assert_event_contract(&first_events);
}

#[tokio::test]
async fn shutdown_mid_stream_emits_shutdown_error_then_done() {
    let provider = Arc::new(
        MockProvider::new(vec![vec![
            StreamEvent::TextDelta("part 1".into()),
            StreamEvent::TextDelta("part 2".into()),
            StreamEvent::TextDelta("part 3".into()),
            StreamEvent::Done,
        ]])
        .with_delay(Duration::from_millis(120)),
    );
    let (_dir, service, shutdown) = make_service(provider).await;

    let mut rx = service.chat_stream(user_request("long task"));
    let mut events = Vec::new();

    // Read until the first chat chunk, then pull the plug.
    while let Some(event) = rx.recv().await {
        let is_chat = event.kind() == "chat";
        events.push(event);
        if is_chat {
            shutdown.cancel();
            break;
        }
    }
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert_event_contract(&events);
    let errors = events_of(&events, "error");
    assert_eq!(errors.len(), 1);
    let AgentEvent::Error { code, .. } = errors[0] else {
        panic!();
    };
    assert_eq!(code.as_deref(), Some("shutdown"));
    assert_eq!(events.last().unwrap().kind(), "done");
}

#[tokio::test]
async fn run_command_changes_are_visible_to_session_view() {
    let provider = Arc::new(MockProvider::new(vec![
        tool_call_script(
            "Removing via shell",
            "call_rm",
            "run_command",
            r#"{"command":"rm x.txt"}"#,
        ),
        vec![StreamEvent::TextDelta("Removed.".into()), StreamEvent::Done],
    ]));
    let (dir, service, _shutdown) = make_service(provider).await;

    // Seed a file and approve it so it is part of main.
    std::fs::write(dir.path().join("x.txt"), "seed\n").unwrap();
    let dialog_id = service.create_dialog(None, true).await.unwrap();
    let tracker = service.tracker_for(&dialog_id).await.unwrap();
    tracker.approve_all(None).await.unwrap();

    let mut request = user_request("delete x.txt with the shell");
    request.dialog_id = Some(dialog_id.clone());
    let events = collect_events(service.chat_stream(request)).await;
    assert_event_contract(&events);
    assert!(!dir.path().join("x.txt").exists());

    // Command-made deletion: no staging, still detected against main.
    let changed = tracker.get_staged_files().await.unwrap();
    let gone = changed.iter().find(|c| c.path == "x.txt").unwrap();
    assert_eq!(format!("{:?}", gone.status).to_lowercase(), "deleted");
    assert_eq!(gone.base_content.as_deref(), Some("seed\n"));

    // And the next checkpoint's tree omits it.
    let cp = tracker.create_checkpoint("after shell delete").await.unwrap();
    assert!(tracker.has_commit(&cp.commit_id));
    let changed_after = tracker.get_staged_files().await.unwrap();
    assert!(changed_after.iter().any(|c| c.path == "x.txt"));
}

#[tokio::test]
async fn ignored_path_write_is_force_included() {
    let provider = Arc::new(MockProvider::new(vec![
        tool_call_script(
            "Writing venv config",
            "call_v",
            "write_to_file",
            r#"{"path":".venv/config.py","content":"SETTING = 1\n"}"#,
        ),
        vec![StreamEvent::Done],
    ]));
    let (dir, service, _shutdown) = make_service(provider).await;
    std::fs::write(dir.path().join(".gitignore"), ".venv/\n").unwrap();

    let events = collect_events(service.chat_stream(user_request("write venv config"))).await;
    assert_event_contract(&events);
    let AgentEvent::Done { dialog_id } = events.last().unwrap() else {
        panic!();
    };

    // A sibling ignored file that was never staged stays invisible.
    std::fs::write(dir.path().join(".venv/other.py"), "x = 2\n").unwrap();

    let tracker = service.tracker_for(dialog_id).await.unwrap();
    let changed = tracker.get_staged_files().await.unwrap();
    assert!(changed.iter().any(|c| c.path == ".venv/config.py"));
    assert!(!changed.iter().any(|c| c.path == ".venv/other.py"));
}

#[tokio::test]
async fn get_tool_result_refuses_current_turn_then_serves_next_turn() {
    let read_args = json!({"path": "data.txt"}).to_string();
    let provider = Arc::new(MockProvider::new(vec![
        // Turn 1: read a file, then immediately try to reload its result.
        vec![
            StreamEvent::ToolCallDelta(ToolCallDelta {
                index: 0,
                id: Some("call_read".into()),
                name_fragment: Some("read_file".into()),
                args_fragment: Some(read_args.clone()),
            }),
            StreamEvent::Done,
        ],
        vec![
            StreamEvent::ToolCallDelta(ToolCallDelta {
                index: 0,
                id: Some("call_fetch".into()),
                name_fragment: Some("get_tool_result".into()),
                args_fragment: Some(json!({"tool_call_id": "call_read"}).to_string()),
            }),
            StreamEvent::Done,
        ],
        vec![StreamEvent::TextDelta("done".into()), StreamEvent::Done],
        // Turn 2: the same lookup is now legitimate.
        vec![
            StreamEvent::ToolCallDelta(ToolCallDelta {
                index: 0,
                id: Some("call_fetch2".into()),
                name_fragment: Some("get_tool_result".into()),
                args_fragment: Some(json!({"tool_call_id": "call_read"}).to_string()),
            }),
            StreamEvent::Done,
        ],
        vec![StreamEvent::TextDelta("served".into()), StreamEvent::Done],
    ]));
    let (dir, service, _shutdown) = make_service(provider).await;
    std::fs::write(dir.path().join("data.txt"), "payload\n").unwrap();

    let events = collect_events(service.chat_stream(user_request("read data"))).await;
    assert_event_contract(&events);
    let AgentEvent::Done { dialog_id } = events.last().unwrap() else {
        panic!();
    };
    let dialog_id = dialog_id.clone();

    let meta = service.store().list_tool_result_meta(&dialog_id).await.unwrap();
    let fetch_meta = meta.iter().find(|m| m.tool_call_id == "call_fetch").unwrap();
    assert_eq!(fetch_meta.status, "error", "current-turn fetch must fail");

    let mut request = user_request("fetch it again");
    request.dialog_id = Some(dialog_id.clone());
    let events = collect_events(service.chat_stream(request)).await;
    assert_event_contract(&events);

    let meta = service.store().list_tool_result_meta(&dialog_id).await.unwrap();
    let fetch2 = meta.iter().find(|m| m.tool_call_id == "call_fetch2").unwrap();
    assert_eq!(fetch2.status, "success", "prior-turn fetch must succeed");
}
