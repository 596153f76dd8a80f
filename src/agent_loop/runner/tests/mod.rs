use super::*;

use std::sync::Mutex;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::{timeout, Duration};

use crate::agent_loop::approvals::{ApprovalKind, ApprovalMode, ABORTED_OUTPUT, DENIED_OUTPUT};
use crate::agent_loop::events::AgentEventPayload;
use crate::error::KestrelError;
use crate::message::{Role, UniversalMessage};
use crate::models::ModelCapabilities;

mod support;

use support::{
    assert_calls_answered, collect, kinds, next_approval, test_model, test_runner, tool_results,
    turn_count, ProviderScenario,
};

#[tokio::test]
async fn text_only_run_emits_ordered_events() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, turns) = test_runner(ProviderScenario::TextOnly, dir.path());
    let mut sub = runner.subscribe("req-text");

    let response = runner
        .run(RunRequest::new("req-text", "hi", test_model(), 5).with_system_prompt("Be brief."))
        .await
        .unwrap();
    let events = collect(&mut sub).await;

    assert_eq!(response.status, RunStatus::Completed);
    assert_eq!(response.response, "Hello there");
    assert_eq!(response.iterations, 1);
    assert_eq!(response.usage.as_ref().map(|u| u.total_tokens), Some(15));
    assert_eq!(
        kinds(&events),
        vec![
            "iteration_start",
            "thinking",
            "text_delta",
            "text_delta",
            "iteration_complete",
            "agent_complete",
        ]
    );
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=events.len() as u64).collect::<Vec<_>>());
    assert!(events.iter().all(|e| e.request_id == "req-text"));

    let turns = turns.lock().unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].stream_id, "req-text:1");
    assert_eq!(turns[0].messages[0].role, Role::System);
    assert_eq!(turns[0].messages[1].content, "hi");
    assert!(!runner.active_runs().contains(&"req-text".to_string()));
}

#[tokio::test]
async fn safe_tool_runs_without_approval_and_feeds_next_turn() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
    let (runner, turns) = test_runner(ProviderScenario::ListThenAnswer, dir.path());
    let mut sub = runner.subscribe("req-list");

    let response = runner
        .run(RunRequest::new("req-list", "what is here?", test_model(), 5))
        .await
        .unwrap();
    let events = collect(&mut sub).await;

    assert!(response.is_completed());
    assert_eq!(response.iterations, 2);
    assert_eq!(response.response, "Let me look.\n\nAll done.");
    assert!(!kinds(&events).contains(&"tool_approval_required"));
    assert_calls_answered(&events);

    let results = tool_results(&events);
    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    assert!(results[0].output.contains("a.txt"));

    let turns = turns.lock().unwrap();
    assert_eq!(turns.len(), 2);
    let tool_message = turns[1]
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool message in second turn");
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_list"));
    assert!(tool_message.content.contains("a.txt"));
}

#[tokio::test]
async fn denied_sensitive_tool_is_recorded_and_not_executed() {
    let dir = tempfile::tempdir().unwrap();
    let notes = dir.path().join("notes.txt");
    std::fs::write(&notes, "keep me").unwrap();
    let (runner, _) = test_runner(ProviderScenario::DeleteThenAnswer, dir.path());
    let mut sub = runner.subscribe("req-deny");

    let handle = runner
        .start(RunRequest::new("req-deny", "clean up", test_model(), 5))
        .unwrap();
    let mut events = Vec::new();
    let request = next_approval(&mut sub, &mut events).await;
    assert_eq!(request.kind, ApprovalKind::Tool);
    assert_eq!(request.related_tool_call_id, "call_delete");

    assert!(matches!(
        runner.respond_path_approval(&request.id, true),
        Err(KestrelError::ApprovalNotFound(_))
    ));
    runner.respond_tool_approval(&request.id, false).unwrap();

    let response = handle.wait().await;
    events.extend(collect(&mut sub).await);

    assert!(response.is_completed());
    assert!(notes.exists());
    let results = tool_results(&events);
    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert_eq!(results[0].output, DENIED_OUTPUT);
    assert_calls_answered(&events);
}

#[tokio::test]
async fn approved_sensitive_tool_executes() {
    let dir = tempfile::tempdir().unwrap();
    let notes = dir.path().join("notes.txt");
    std::fs::write(&notes, "remove me").unwrap();
    let (runner, _) = test_runner(ProviderScenario::DeleteThenAnswer, dir.path());
    let mut sub = runner.subscribe("req-approve");

    let handle = runner
        .start(RunRequest::new("req-approve", "clean up", test_model(), 5))
        .unwrap();
    let mut events = Vec::new();
    let request = next_approval(&mut sub, &mut events).await;
    runner.respond_tool_approval(&request.id, true).unwrap();

    let response = handle.wait().await;
    events.extend(collect(&mut sub).await);

    assert!(response.is_completed());
    assert!(!notes.exists());
    assert!(tool_results(&events)[0].success);
}

#[tokio::test]
async fn allow_all_mode_skips_the_gate() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "a").unwrap();
    std::fs::write(dir.path().join("b.txt"), "b").unwrap();
    let (runner, _) = test_runner(ProviderScenario::TwoDeletesThenAnswer, dir.path());
    let mut sub = runner.subscribe("req-all");

    let response = runner
        .run(
            RunRequest::new("req-all", "clean up", test_model(), 5)
                .with_approval_mode(ApprovalMode::AllowAll),
        )
        .await
        .unwrap();
    let events = collect(&mut sub).await;

    assert!(response.is_completed());
    assert!(!kinds(&events).contains(&"tool_approval_required"));
    assert!(!dir.path().join("a.txt").exists());
    assert!(!dir.path().join("b.txt").exists());
    assert_calls_answered(&events);
}

#[tokio::test]
async fn session_only_mode_asks_once_per_session() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "a").unwrap();
    std::fs::write(dir.path().join("b.txt"), "b").unwrap();
    let (runner, _) = test_runner(ProviderScenario::TwoDeletesThenAnswer, dir.path());
    let mut sub = runner.subscribe("req-session");

    let handle = runner
        .start(
            RunRequest::new("req-session", "clean up", test_model(), 5)
                .with_approval_mode(ApprovalMode::SessionOnly)
                .with_session_id("chat-1"),
        )
        .unwrap();
    let mut events = Vec::new();
    let request = next_approval(&mut sub, &mut events).await;
    assert_eq!(request.related_tool_call_id, "call_a");
    runner.respond_tool_approval(&request.id, true).unwrap();

    let response = handle.wait().await;
    events.extend(collect(&mut sub).await);

    assert!(response.is_completed());
    let asked = kinds(&events)
        .into_iter()
        .filter(|k| *k == "tool_approval_required")
        .count();
    assert_eq!(asked, 1);
    assert!(!dir.path().join("b.txt").exists());
    assert!(runner.end_session("chat-1"));
    assert!(!runner.end_session("chat-1"));
}

#[tokio::test]
async fn path_outside_workspace_needs_path_approval() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, _) = test_runner(ProviderScenario::ReadOutsideThenAnswer, dir.path());
    let mut sub = runner.subscribe("req-path");

    let handle = runner
        .start(RunRequest::new("req-path", "read it", test_model(), 5))
        .unwrap();
    let mut events = Vec::new();
    let request = next_approval(&mut sub, &mut events).await;
    assert_eq!(request.kind, ApprovalKind::Path);
    assert_eq!(request.paths, vec![support::OUTSIDE_PATH.to_string()]);
    assert_eq!(events.last().map(AgentEvent::kind), Some("path_approval_required"));
    runner.respond_path_approval(&request.id, false).unwrap();

    let response = handle.wait().await;
    events.extend(collect(&mut sub).await);

    assert!(response.is_completed());
    assert_eq!(tool_results(&events)[0].output, DENIED_OUTPUT);
}

#[tokio::test]
async fn iteration_limit_fails_after_one_request() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, turns) = test_runner(ProviderScenario::EndlessTools, dir.path());
    let mut sub = runner.subscribe("req-limit");

    let response = runner
        .run(RunRequest::new("req-limit", "loop", test_model(), 1))
        .await
        .unwrap();
    let events = collect(&mut sub).await;

    assert_eq!(response.status, RunStatus::Failed);
    assert_eq!(response.iterations, 1);
    assert_eq!(turn_count(&turns), 1);
    let error = response.error.expect("error");
    assert_eq!(error.kind, FailureKind::IterationLimit);
    assert_eq!(
        events.last().map(|e| e.payload.clone()),
        Some(AgentEventPayload::AgentError {
            kind: FailureKind::IterationLimit,
            message: "iteration limit reached".into(),
        })
    );
    assert_eq!(tool_results(&events).len(), 1);
    assert_calls_answered(&events);
}

#[tokio::test]
async fn abort_while_awaiting_approval_denies_and_ends_run() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "a").unwrap();
    std::fs::write(dir.path().join("b.txt"), "b").unwrap();
    let (runner, turns) = test_runner(ProviderScenario::TwoDeletesThenAnswer, dir.path());
    let mut sub = runner.subscribe("req-abort");

    let handle = runner
        .start(RunRequest::new("req-abort", "clean up", test_model(), 5))
        .unwrap();
    let mut events = Vec::new();
    let request = next_approval(&mut sub, &mut events).await;
    runner.abort("req-abort").unwrap();

    let response = handle.wait().await;
    events.extend(collect(&mut sub).await);

    assert_eq!(response.status, RunStatus::Aborted);
    assert_eq!(turn_count(&turns), 1);
    assert!(dir.path().join("a.txt").exists());
    assert!(dir.path().join("b.txt").exists());
    let outputs: Vec<String> = tool_results(&events).into_iter().map(|r| r.output).collect();
    assert_eq!(
        outputs,
        vec![ABORTED_OUTPUT.to_string(), "aborted before execution".to_string()]
    );
    assert_calls_answered(&events);
    assert_eq!(events.last().map(AgentEvent::kind), Some("agent_aborted"));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    assert!(matches!(runner.abort("req-abort"), Err(KestrelError::RunNotFound(_))));
    assert!(matches!(
        runner.respond_tool_approval(&request.id, true),
        Err(KestrelError::ApprovalNotFound(_))
    ));
}

#[tokio::test]
async fn abort_during_streaming_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, turns) = test_runner(ProviderScenario::TextThenHang, dir.path());
    let mut sub = runner.subscribe("req-stream");

    let handle = runner
        .start(RunRequest::new("req-stream", "talk", test_model(), 5))
        .unwrap();
    let mut events = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        let is_text = event.kind() == "text_delta";
        events.push(event);
        if is_text {
            break;
        }
    }
    handle.abort();

    let response = handle.wait().await;
    events.extend(collect(&mut sub).await);

    assert_eq!(response.status, RunStatus::Aborted);
    assert_eq!(turn_count(&turns), 1);
    assert_eq!(events.last().map(AgentEvent::kind), Some("agent_aborted"));
    assert!(!kinds(&events).contains(&"iteration_complete"));
}

#[tokio::test(start_paused = true)]
async fn silent_stream_fails_with_transport_kind() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, _) = test_runner(ProviderScenario::TextThenHang, dir.path());

    let response = runner
        .run(
            RunRequest::new("req-idle", "talk", test_model(), 5)
                .with_stream_idle_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();

    assert_eq!(response.status, RunStatus::Failed);
    let error = response.error.expect("error");
    assert_eq!(error.kind, FailureKind::Transport);
    assert_eq!(error.message, "Stream idle for 50ms");
}

#[tokio::test]
async fn stream_error_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, _) = test_runner(ProviderScenario::TextThenStreamError, dir.path());
    let mut sub = runner.subscribe("req-err");

    let response = runner
        .run(RunRequest::new("req-err", "talk", test_model(), 5))
        .await
        .unwrap();
    let events = collect(&mut sub).await;

    assert_eq!(response.status, RunStatus::Failed);
    assert_eq!(response.error.map(|e| e.kind), Some(FailureKind::Protocol));
    assert_eq!(events.last().map(AgentEvent::kind), Some("agent_error"));
}

#[tokio::test]
async fn malformed_arguments_become_a_failed_result() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, _) = test_runner(ProviderScenario::MalformedArgumentsThenAnswer, dir.path());
    let mut sub = runner.subscribe("req-bad-args");

    let response = runner
        .run(RunRequest::new("req-bad-args", "read", test_model(), 5))
        .await
        .unwrap();
    let events = collect(&mut sub).await;

    assert!(response.is_completed());
    let results = tool_results(&events);
    assert_eq!(
        results[0].output,
        "invalid arguments: expected a JSON object, got: [1,2]"
    );
    assert_eq!(response.iterations, 2);
}

#[tokio::test]
async fn toolless_model_gets_no_tools_and_ignores_tool_deltas() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, turns) = test_runner(ProviderScenario::ToolCallsPlusText, dir.path());
    let mut sub = runner.subscribe("req-plain");
    let model = test_model().with_capabilities(ModelCapabilities::text_only());

    let response = runner
        .run(RunRequest::new("req-plain", "hi", model, 5))
        .await
        .unwrap();
    let events = collect(&mut sub).await;

    assert!(response.is_completed());
    assert_eq!(response.iterations, 1);
    assert_eq!(response.response, "No tools here.");
    assert!(turns.lock().unwrap()[0].tools.is_empty());
    assert!(!kinds(&events).iter().any(|k| k.starts_with("tool_")));
}

#[tokio::test]
async fn enabled_tools_limit_what_the_model_sees() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, turns) = test_runner(ProviderScenario::TextOnly, dir.path());

    runner
        .run(RunRequest::new("req-scope", "hi", test_model(), 5).with_enabled_tools(["read_file", "stat"]))
        .await
        .unwrap();

    let names: Vec<String> = turns.lock().unwrap()[0]
        .tools
        .iter()
        .map(|t| t.name.clone())
        .collect();
    assert_eq!(names, vec!["read_file".to_string(), "stat".to_string()]);
}

#[tokio::test]
async fn dangling_history_calls_are_closed_before_the_first_request() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, turns) = test_runner(ProviderScenario::TextOnly, dir.path());
    let history = vec![
        UniversalMessage::user("earlier"),
        UniversalMessage::assistant_with_tool_calls(
            "",
            vec![crate::message::ToolCall::new("old_call", "stat", serde_json::Map::new())],
        ),
    ];

    let response = runner
        .run(RunRequest::new("req-hist", "again", test_model(), 5).with_history(history))
        .await
        .unwrap();

    assert!(response.is_completed());
    let turns = turns.lock().unwrap();
    let closed = turns[0]
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("synthesized tool result");
    assert_eq!(closed.tool_call_id.as_deref(), Some("old_call"));
    assert!(closed.is_error);
}

#[tokio::test]
async fn orphan_tool_message_in_history_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, turns) = test_runner(ProviderScenario::TextOnly, dir.path());
    let ghost = crate::message::ToolCall::new("ghost", "stat", serde_json::Map::new());
    let history = vec![
        UniversalMessage::user("earlier"),
        UniversalMessage::tool(&crate::message::ToolResult::success(&ghost, "boo", 0)),
    ];
    let mut sub = runner.subscribe("req-orphan");

    let response = runner
        .run(RunRequest::new("req-orphan", "again", test_model(), 5).with_history(history))
        .await
        .unwrap();
    let events = collect(&mut sub).await;

    assert_eq!(response.status, RunStatus::Failed);
    let error = response.error.expect("error");
    assert_eq!(error.kind, crate::error::FailureKind::Protocol);
    assert!(error.message.contains("ghost"), "{}", error.message);
    assert_eq!(turn_count(&turns), 0);
    assert_eq!(kinds(&events), ["agent_error"]);
}

#[tokio::test]
async fn duplicate_and_invalid_requests_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, _) = test_runner(ProviderScenario::TextThenHang, dir.path());

    let handle = runner
        .start(RunRequest::new("req-dup", "talk", test_model(), 5))
        .unwrap();
    assert!(matches!(
        runner.start(RunRequest::new("req-dup", "again", test_model(), 5)),
        Err(KestrelError::DuplicateRun(_))
    ));
    assert!(matches!(
        runner.start(RunRequest::new("req-zero", "talk", test_model(), 0)),
        Err(KestrelError::InvalidArgument(_))
    ));
    assert_eq!(runner.active_runs(), vec!["req-dup".to_string()]);

    runner.abort("req-dup").unwrap();
    assert_eq!(handle.wait().await.status, RunStatus::Aborted);
    assert!(runner.active_runs().is_empty());
}

#[tokio::test]
async fn concurrent_runs_keep_their_events_apart() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, _) = test_runner(ProviderScenario::TextOnly, dir.path());
    let mut sub_a = runner.subscribe("run-a");
    let mut sub_b = runner.subscribe("run-b");

    let a = runner
        .start(RunRequest::new("run-a", "one", test_model(), 5))
        .unwrap();
    let b = runner
        .start(RunRequest::new("run-b", "two", test_model(), 5))
        .unwrap();
    let (ra, rb) = tokio::join!(a.wait(), b.wait());

    assert!(ra.is_completed() && rb.is_completed());
    let events_a = collect(&mut sub_a).await;
    let events_b = collect(&mut sub_b).await;
    assert!(events_a.iter().all(|e| e.request_id == "run-a"));
    assert!(events_b.iter().all(|e| e.request_id == "run-b"));
    assert_eq!(events_a.len(), events_b.len());
}

#[tokio::test]
async fn request_id_can_be_reused_right_after_completion() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, turns) = test_runner(ProviderScenario::TextOnly, dir.path());
    let mut first = runner.subscribe("req-reuse");
    let first_run = runner
        .start(RunRequest::new("req-reuse", "one", test_model(), 5))
        .unwrap();
    let first_events = collect(&mut first).await;
    assert!(first_events.last().is_some_and(AgentEvent::is_terminal));

    let mut second = runner.subscribe("req-reuse");
    let second_run = runner
        .start(RunRequest::new("req-reuse", "two", test_model(), 5))
        .unwrap();
    let second_events = collect(&mut second).await;

    assert!(first_run.wait().await.is_completed());
    assert!(second_run.wait().await.is_completed());
    assert_eq!(turn_count(&turns), 2);
    assert_eq!(second_events[0].seq, 1);
    assert_eq!(kinds(&second_events)[0], "iteration_start");
    assert_eq!(kinds(&second_events).last(), Some(&"agent_complete"));
    assert_eq!(
        second_events.iter().filter(|e| e.is_terminal()).count(),
        1
    );
    assert!(matches!(runner.abort("req-reuse"), Err(KestrelError::RunNotFound(_))));
    assert!(matches!(
        runner.subscribe_active("req-reuse"),
        Err(KestrelError::RunNotFound(_))
    ));
}

#[tokio::test]
async fn on_event_callback_sees_every_event() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, _) = test_runner(ProviderScenario::TextOnly, dir.path());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener = runner.on_event("req-cb", move |event| {
        sink.lock().unwrap().push(event.kind());
    });

    runner
        .run(RunRequest::new("req-cb", "hi", test_model(), 5))
        .await
        .unwrap();
    timeout(Duration::from_secs(5), listener.join()).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.first(), Some(&"iteration_start"));
    assert_eq!(seen.last(), Some(&"agent_complete"));
}

#[tokio::test]
async fn execute_tool_runs_outside_a_run() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "direct").unwrap();
    let (runner, _) = test_runner(ProviderScenario::TextOnly, dir.path());

    let result = runner
        .execute_tool("read_file", json!({"path": "notes.txt"}), None)
        .await;
    assert!(result.success);
    assert_eq!(result.output, "direct");
    assert!(result.tool_call_id.starts_with("exec-"));

    let missing = runner.execute_tool("nope", json!({}), None).await;
    assert!(!missing.success);
    assert_eq!(missing.output, "tool not found: nope");

    let names: Vec<String> = runner
        .get_tools(crate::tools::ToolMode::ReadOnly)
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert!(names.contains(&"read_file".to_string()));
    assert!(!names.contains(&"delete_path".to_string()));
}
