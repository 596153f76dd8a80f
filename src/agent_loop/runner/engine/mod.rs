use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::KestrelConfig;
use crate::error::{FailureKind, KestrelError};
use crate::message::{close_dangling_tool_calls, Role, UniversalMessage};
use crate::provider::ToolDefinition;
use crate::tools::{ToolContext, ToolRegistry};
use crate::types::Usage;

use super::super::approvals::{ApprovalGate, ApprovalMode};
use super::super::events::AgentEventPayload;
use super::super::registry::{RunEventEmitter, RunRegistry};
use super::super::types::{RunError, RunRequest, RunResponse, RunState, RunStatus};
use super::ProviderFactory;

mod llm_phase;
mod tool_phase;

use llm_phase::{run_llm_phase, LlmPhaseOutcome};
use tool_phase::{run_tool_phase, ToolPhaseOutcome};

const ITERATION_LIMIT_MESSAGE: &str = "iteration limit reached";

/// Everything a run task needs, moved into it at start.
pub(super) struct RunContext {
    pub(super) request: RunRequest,
    pub(super) config: Arc<KestrelConfig>,
    pub(super) provider_factory: ProviderFactory,
    /// Registry already scoped to the run's enabled tools.
    pub(super) tools: ToolRegistry,
    pub(super) tool_ctx: ToolContext,
    pub(super) gate: Arc<ApprovalGate>,
    pub(super) registry: Arc<RunRegistry>,
    pub(super) emitter: RunEventEmitter,
    pub(super) cancel: CancellationToken,
    pub(super) approval_mode: ApprovalMode,
    pub(super) idle_timeout: Duration,
}

impl RunContext {
    fn request_id(&self) -> &str {
        &self.request.request_id
    }

    fn emit(&self, payload: AgentEventPayload) {
        self.emitter.emit(payload);
    }
}

/// Releases the registry slot if the run task unwinds. Normal exits release
/// it with the terminal event.
struct SlotGuard {
    registry: Arc<RunRegistry>,
    request_id: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.registry.finish(&self.request_id);
        }
    }
}

fn initial_history(request: &RunRequest) -> Result<Vec<UniversalMessage>, KestrelError> {
    let mut history = close_dangling_tool_calls(&request.history)?;
    if let Some(prompt) = &request.system_prompt {
        if !history.iter().any(|m| m.role == Role::System) {
            history.insert(0, UniversalMessage::system(prompt.clone()));
        }
    }
    history.push(UniversalMessage::user_with_attachments(
        request.message.clone(),
        request.attachments.clone(),
    ));
    Ok(history)
}

/// Drive one run to its terminal state.
pub(super) async fn drive(ctx: RunContext) -> RunResponse {
    let _slot = SlotGuard {
        registry: ctx.registry.clone(),
        request_id: ctx.request.request_id.clone(),
    };
    let history = match initial_history(&ctx.request) {
        Ok(history) => history,
        Err(err) => {
            let state = RunState::new(ctx.request.history.clone(), ctx.cancel.clone());
            return failed(&ctx, state, err.category(), err.to_string());
        }
    };
    let mut state = RunState::new(history, ctx.cancel.clone());

    let provider = match (ctx.provider_factory)(&ctx.request.model, &ctx.config) {
        Ok(provider) => provider,
        Err(err) => return failed(&ctx, state, err.category(), err.to_string()),
    };

    let supports_tools = ctx.request.model.capabilities.supports_tools;
    let tool_defs: Vec<ToolDefinition> = if supports_tools {
        ctx.tools.definitions()
    } else {
        if !ctx.tools.is_empty() {
            debug!(request_id = %ctx.request_id(), "model does not support tools; sending none");
        }
        Vec::new()
    };

    loop {
        if state.is_aborted() {
            return aborted(&ctx, state);
        }
        if state.iteration >= ctx.request.max_iterations {
            warn!(
                request_id = %ctx.request_id(),
                iterations = state.iteration,
                "iteration limit reached"
            );
            return failed(
                &ctx,
                state,
                FailureKind::IterationLimit,
                ITERATION_LIMIT_MESSAGE.to_string(),
            );
        }

        state.iteration += 1;
        let iteration = state.iteration;
        ctx.emit(AgentEventPayload::IterationStart {
            iteration,
            max_iterations: ctx.request.max_iterations,
        });
        ctx.emit(AgentEventPayload::Thinking { iteration });

        let turn = match run_llm_phase(&ctx, &state, provider.as_ref(), &tool_defs, supports_tools).await {
            LlmPhaseOutcome::Ready(turn) => turn,
            LlmPhaseOutcome::Aborted => return aborted(&ctx, state),
            LlmPhaseOutcome::Failed(err) => return failed(&ctx, state, err.category(), err.to_string()),
        };

        Usage::accumulate(&mut state.usage, turn.usage.as_ref());
        state.texts.push(turn.text.clone());
        let call_count = turn.tool_calls.len();
        state.history.push(if turn.tool_calls.is_empty() {
            UniversalMessage::assistant(turn.text)
        } else {
            UniversalMessage::assistant_with_tool_calls(turn.text, turn.tool_calls.clone())
        });

        if turn.tool_calls.is_empty() {
            ctx.emit(AgentEventPayload::IterationComplete {
                iteration,
                tool_calls: 0,
                usage: turn.usage,
            });
            return completed(&ctx, state);
        }

        match run_tool_phase(&ctx, &mut state, &turn.tool_calls).await {
            ToolPhaseOutcome::Continue => {}
            ToolPhaseOutcome::Aborted => return aborted(&ctx, state),
            ToolPhaseOutcome::Failed(err) => return failed(&ctx, state, err.category(), err.to_string()),
        }

        ctx.emit(AgentEventPayload::IterationComplete {
            iteration,
            tool_calls: call_count,
            usage: turn.usage,
        });
        debug!(request_id = %ctx.request_id(), iteration, tool_calls = call_count, "iteration complete");
    }
}

fn completed(ctx: &RunContext, state: RunState) -> RunResponse {
    let response = state.response_text();
    info!(request_id = %ctx.request_id(), iterations = state.iteration, "run completed");
    ctx.emit(AgentEventPayload::AgentComplete {
        response,
        usage: state.usage.clone(),
        iterations: state.iteration,
    });
    state.into_response(ctx.request_id(), RunStatus::Completed, None)
}

fn aborted(ctx: &RunContext, state: RunState) -> RunResponse {
    info!(request_id = %ctx.request_id(), iterations = state.iteration, "run aborted");
    ctx.emit(AgentEventPayload::AgentAborted {
        iterations: state.iteration,
    });
    state.into_response(ctx.request_id(), RunStatus::Aborted, None)
}

fn failed(ctx: &RunContext, state: RunState, kind: FailureKind, message: String) -> RunResponse {
    warn!(request_id = %ctx.request_id(), kind = %kind, error = %message, "run failed");
    ctx.emit(AgentEventPayload::AgentError {
        kind,
        message: message.clone(),
    });
    state.into_response(ctx.request_id(), RunStatus::Failed, Some(RunError { kind, message }))
}

