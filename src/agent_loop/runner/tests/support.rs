use super::*;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use futures::stream::{self, StreamExt};
use tokio::time::{timeout, Duration};

use crate::agent_loop::approvals::ApprovalRequest;
use crate::agent_loop::events::AgentEventPayload;
use crate::error::KestrelError;
use crate::models::WireFormat;
use crate::provider::{DeltaStream, ProviderTurn};
use crate::tools::builtin_registry;
use crate::types::{FinishReason, StreamDelta, ToolCallDelta, Usage};

#[derive(Clone, Copy, Debug)]
pub(super) enum ProviderScenario {
    /// Two text chunks, then stop with usage.
    TextOnly,
    /// `list_directory` on call 0, text "All listed." after.
    ListThenAnswer,
    /// `delete_path` of `notes.txt` on call 0, text after.
    DeleteThenAnswer,
    /// `delete_path` of `a.txt` and `b.txt` in one turn, text after.
    TwoDeletesThenAnswer,
    /// `read_file` on an absolute path outside any workspace, text after.
    ReadOutsideThenAnswer,
    /// Every call asks for `list_directory` again.
    EndlessTools,
    /// Text, then the stream stays open without producing anything.
    TextThenHang,
    /// Text, then a malformed chunk error.
    TextThenStreamError,
    /// Tool call fragments plus text, for models without tool support.
    ToolCallsPlusText,
    /// A call whose arguments are not a JSON object, text after.
    MalformedArgumentsThenAnswer,
}

pub(super) const OUTSIDE_PATH: &str = "/kestrel-test-outside/secret.txt";

enum Step {
    Delta(StreamDelta),
    Fail,
    Hang,
}

fn text(chunk: &str) -> Step {
    Step::Delta(StreamDelta::text(chunk))
}

fn call(index: usize, id: &str, name: &str, arguments: &str) -> Step {
    Step::Delta(StreamDelta::tool_call(ToolCallDelta {
        index,
        id: Some(id.to_string()),
        name: Some(name.to_string()),
        arguments: arguments.to_string(),
    }))
}

fn more_arguments(index: usize, arguments: &str) -> Step {
    Step::Delta(StreamDelta::tool_call(ToolCallDelta {
        index,
        id: None,
        name: None,
        arguments: arguments.to_string(),
    }))
}

fn done(reason: FinishReason) -> Step {
    Step::Delta(StreamDelta::finish(Some(reason), Some(Usage::new(10, 5))))
}

impl ProviderScenario {
    fn script(self, call_index: usize) -> Vec<Step> {
        match (self, call_index) {
            (Self::TextOnly, _) => vec![text("Hello"), text(" there"), done(FinishReason::Stop)],
            (Self::ListThenAnswer, 0) => vec![
                text("Let me look."),
                call(0, "call_list", "list_directory", "{\"pa"),
                more_arguments(0, "th\":\".\"}"),
                done(FinishReason::ToolCalls),
            ],
            (Self::DeleteThenAnswer, 0) => vec![
                call(0, "call_delete", "delete_path", "{\"path\":\"notes.txt\"}"),
                done(FinishReason::ToolCalls),
            ],
            (Self::TwoDeletesThenAnswer, 0) => vec![
                call(0, "call_a", "delete_path", "{\"path\":\"a.txt\"}"),
                call(1, "call_b", "delete_path", "{\"path\":\"b.txt\"}"),
                done(FinishReason::ToolCalls),
            ],
            (Self::ReadOutsideThenAnswer, 0) => vec![
                call(
                    0,
                    "call_outside",
                    "read_file",
                    &format!("{{\"path\":\"{OUTSIDE_PATH}\"}}"),
                ),
                done(FinishReason::ToolCalls),
            ],
            (Self::EndlessTools, n) => vec![
                call(0, &format!("call_{n}"), "list_directory", "{}"),
                done(FinishReason::ToolCalls),
            ],
            (Self::TextThenHang, _) => vec![text("partial"), Step::Hang],
            (Self::TextThenStreamError, _) => vec![text("partial"), Step::Fail],
            (Self::ToolCallsPlusText, _) => vec![
                call(0, "call_ignored", "list_directory", "{}"),
                text("No tools here."),
                done(FinishReason::Stop),
            ],
            (Self::MalformedArgumentsThenAnswer, 0) => vec![
                call(0, "call_bad", "read_file", "[1,2]"),
                done(FinishReason::ToolCalls),
            ],
            (_, _) => vec![text("All done."), done(FinishReason::Stop)],
        }
    }
}

struct StubProvider {
    scenario: ProviderScenario,
    calls: AtomicUsize,
    turns: Arc<Mutex<Vec<ProviderTurn>>>,
}

#[async_trait]
impl ModelProvider for StubProvider {
    fn provider_name(&self) -> &str {
        "stub"
    }

    async fn stream_turn(&self, turn: &ProviderTurn) -> crate::error::Result<DeltaStream> {
        self.turns.lock().expect("turn lock").push(turn.clone());
        let call_index = self.calls.fetch_add(1, Ordering::SeqCst);

        let mut items = Vec::new();
        let mut hang = false;
        for step in self.scenario.script(call_index) {
            match step {
                Step::Delta(delta) => items.push(Ok(delta)),
                Step::Fail => items.push(Err(KestrelError::malformed("upstream stream failure"))),
                Step::Hang => {
                    hang = true;
                    break;
                }
            }
        }
        let scripted = stream::iter(items);
        Ok(if hang {
            scripted.chain(stream::pending()).boxed()
        } else {
            scripted.boxed()
        })
    }
}

pub(super) type Turns = Arc<Mutex<Vec<ProviderTurn>>>;

pub(super) fn test_runner(scenario: ProviderScenario, workspace: &Path) -> (LoopRunner, Turns) {
    let turns: Turns = Arc::new(Mutex::new(Vec::new()));
    let provider_turns = turns.clone();
    let factory: ProviderFactory = Arc::new(move |_model, _config| {
        Ok(Arc::new(StubProvider {
            scenario,
            calls: AtomicUsize::new(0),
            turns: provider_turns.clone(),
        }) as Arc<dyn ModelProvider>)
    });
    let runner = LoopRunner::new(KestrelConfig::new(), builtin_registry())
        .with_provider_factory(factory)
        .with_workspace_root(workspace);
    (runner, turns)
}

pub(super) fn test_model() -> ModelConfig {
    ModelConfig::new("stub", "stub-model", WireFormat::ChatCompletions)
}

pub(super) fn turn_count(turns: &Turns) -> usize {
    turns.lock().expect("turn lock").len()
}

/// Drain a subscription until the run's terminal event closes it.
pub(super) async fn collect(subscription: &mut EventSubscription) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Some(event) = timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("event stream stalled")
    {
        events.push(event);
    }
    events
}

/// Receive until the next approval request, keeping everything seen on the way.
pub(super) async fn next_approval(
    subscription: &mut EventSubscription,
    seen: &mut Vec<AgentEvent>,
) -> ApprovalRequest {
    loop {
        let event = timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("no approval request arrived")
            .expect("stream ended before an approval request");
        let request = match &event.payload {
            AgentEventPayload::ToolApprovalRequired { request }
            | AgentEventPayload::PathApprovalRequired { request } => Some(request.clone()),
            _ => None,
        };
        seen.push(event);
        if let Some(request) = request {
            return request;
        }
    }
}

pub(super) fn kinds(events: &[AgentEvent]) -> Vec<&'static str> {
    events.iter().map(AgentEvent::kind).collect()
}

pub(super) fn tool_results(events: &[AgentEvent]) -> Vec<crate::message::ToolResult> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            AgentEventPayload::ToolResult { result } => Some(result.clone()),
            _ => None,
        })
        .collect()
}

/// Every completed call has exactly one later result.
pub(super) fn assert_calls_answered(events: &[AgentEvent]) {
    for (pos, event) in events.iter().enumerate() {
        let AgentEventPayload::ToolCallComplete { call } = &event.payload else {
            continue;
        };
        let answers = events[pos + 1..]
            .iter()
            .filter(|e| {
                matches!(&e.payload, AgentEventPayload::ToolResult { result } if result.tool_call_id == call.id)
            })
            .count();
        assert_eq!(answers, 1, "call {} answered {answers} times", call.id);
    }
}
