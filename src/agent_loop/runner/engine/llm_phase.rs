use std::collections::{BTreeMap, HashSet};

use futures::StreamExt;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::error::KestrelError;
use crate::message::{validate_history, ToolCall};
use crate::provider::{ModelProvider, ProviderTurn, ToolDefinition};
use crate::types::{ToolCallDelta, Usage};

use super::super::super::events::AgentEventPayload;
use super::super::super::types::RunState;
use super::RunContext;

/// Assistant output of one fully streamed iteration.
pub(super) struct AssistantTurn {
    pub(super) text: String,
    pub(super) tool_calls: Vec<ToolCall>,
    pub(super) usage: Option<Usage>,
}

pub(super) enum LlmPhaseOutcome {
    Ready(AssistantTurn),
    Aborted,
    Failed(KestrelError),
}

pub(super) async fn run_llm_phase(
    ctx: &RunContext,
    state: &RunState,
    provider: &dyn ModelProvider,
    tool_defs: &[ToolDefinition],
    supports_tools: bool,
) -> LlmPhaseOutcome {
    if let Err(err) = validate_history(&state.history) {
        return LlmPhaseOutcome::Failed(err);
    }

    let turn = ProviderTurn {
        stream_id: format!("{}:{}", ctx.request_id(), state.iteration),
        messages: state.history.clone(),
        tools: tool_defs.to_vec(),
        model: ctx.request.model.clone(),
    };
    let idle = ctx.idle_timeout;
    let idle_ms = idle.as_millis() as u64;
    let cancel = &ctx.cancel;

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return LlmPhaseOutcome::Aborted,
        _ = time::sleep(idle) => return LlmPhaseOutcome::Failed(KestrelError::StreamTimeout(idle_ms)),
        opened = provider.stream_turn(&turn) => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(err) => return LlmPhaseOutcome::Failed(err),
    };

    let taken_ids = state
        .history
        .iter()
        .flat_map(|m| m.tool_calls.iter().map(|c| c.id.clone()))
        .collect();
    let mut calls = ToolCallAccumulator::new(&turn.stream_id, taken_ids);
    let mut text = String::new();
    let mut usage = None;
    let idle_sleep = time::sleep(idle);
    tokio::pin!(idle_sleep);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return LlmPhaseOutcome::Aborted,
            _ = &mut idle_sleep => {
                debug!(stream_id = %turn.stream_id, idle_ms, "stream idle timeout");
                return LlmPhaseOutcome::Failed(KestrelError::StreamTimeout(idle_ms));
            }
            next = stream.next() => next,
        };
        let Some(next) = next else {
            break;
        };
        let delta = match next {
            Ok(delta) => delta,
            Err(err) => return LlmPhaseOutcome::Failed(err),
        };
        idle_sleep.as_mut().reset(Instant::now() + idle);

        if let Some(chunk) = delta.text_delta.filter(|t| !t.is_empty()) {
            text.push_str(&chunk);
            ctx.emit(AgentEventPayload::TextDelta { text: chunk });
        }
        if let Some(chunk) = delta.reasoning_delta.filter(|t| !t.is_empty()) {
            ctx.emit(AgentEventPayload::ReasoningDelta { text: chunk });
        }
        if let Some(fragment) = delta.tool_call_delta {
            if supports_tools {
                for payload in calls.apply(fragment) {
                    ctx.emit(payload);
                }
            } else {
                trace!(stream_id = %turn.stream_id, "ignoring tool call delta from tool-less model");
            }
        }
        if delta.usage.is_some() {
            usage = delta.usage;
        }
        if let Some(reason) = delta.finish_reason {
            debug!(stream_id = %turn.stream_id, finish_reason = ?reason, "stream finished");
        }
        if cancel.is_cancelled() {
            return LlmPhaseOutcome::Aborted;
        }
    }

    let tool_calls = calls.finish();
    for call in &tool_calls {
        ctx.emit(AgentEventPayload::ToolCallComplete { call: call.clone() });
    }
    LlmPhaseOutcome::Ready(AssistantTurn {
        text,
        tool_calls,
        usage,
    })
}

struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds index-keyed tool call fragments into complete calls.
///
/// Ids are unique across the conversation: a missing id is synthesized and a
/// repeated one gets an index suffix.
pub(super) struct ToolCallAccumulator {
    id_prefix: String,
    taken_ids: HashSet<String>,
    calls: BTreeMap<usize, PartialCall>,
}

impl ToolCallAccumulator {
    pub(super) fn new(id_prefix: &str, taken_ids: HashSet<String>) -> Self {
        Self {
            id_prefix: id_prefix.to_string(),
            taken_ids,
            calls: BTreeMap::new(),
        }
    }

    fn unique_id(&mut self, proposed: Option<String>, index: usize) -> String {
        let base = proposed
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("call_{}_{index}", self.id_prefix.replace(':', "_")));
        let mut id = base.clone();
        let mut n = 1;
        while self.taken_ids.contains(&id) {
            id = format!("{base}_{n}");
            n += 1;
        }
        self.taken_ids.insert(id.clone());
        id
    }

    /// Apply one fragment, returning the events it produces.
    pub(super) fn apply(&mut self, fragment: ToolCallDelta) -> Vec<AgentEventPayload> {
        let mut events = Vec::new();
        let index = fragment.index;
        if !self.calls.contains_key(&index) {
            let id = self.unique_id(fragment.id.clone(), index);
            let name = fragment.name.clone().unwrap_or_default();
            events.push(AgentEventPayload::ToolCallStart {
                call_id: id.clone(),
                name: name.clone(),
                index,
            });
            self.calls.insert(
                index,
                PartialCall {
                    id,
                    name,
                    arguments: String::new(),
                },
            );
        }
        let Some(call) = self.calls.get_mut(&index) else {
            return events;
        };
        if call.name.is_empty() {
            if let Some(name) = fragment.name.filter(|n| !n.is_empty()) {
                call.name = name;
            }
        }
        if !fragment.arguments.is_empty() {
            call.arguments.push_str(&fragment.arguments);
            events.push(AgentEventPayload::ToolCallDelta {
                call_id: call.id.clone(),
                arguments_delta: fragment.arguments,
            });
        }
        events
    }

    /// Completed calls in index order.
    pub(super) fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_values()
            .map(|c| ToolCall::from_raw_arguments(c.id, c.name, &c.arguments))
            .collect()
    }
}
