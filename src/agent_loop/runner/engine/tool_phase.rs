use tracing::{debug, info};

use crate::error::KestrelError;
use crate::message::{append_tool_result, ToolCall, ToolResult};
use crate::tools::Sensitivity;

use super::super::super::approvals::{ApprovalKind, ApprovalMode, ApprovalOutcome, ApprovalRequest};
use super::super::super::events::AgentEventPayload;
use super::super::super::types::RunState;
use super::RunContext;

/// Output recorded for calls an abort prevented from starting.
const ABORTED_BEFORE_EXECUTION: &str = "aborted before execution";

pub(super) enum ToolPhaseOutcome {
    Continue,
    Aborted,
    Failed(KestrelError),
}

/// Resolve each call through the gate and the executor, strictly in order.
pub(super) async fn run_tool_phase(
    ctx: &RunContext,
    state: &mut RunState,
    tool_calls: &[ToolCall],
) -> ToolPhaseOutcome {
    for (idx, call) in tool_calls.iter().enumerate() {
        if state.is_aborted() {
            return skip_remaining(ctx, state, &tool_calls[idx..]);
        }

        let result = match authorize(ctx, state, call).await {
            ApprovalOutcome::Approved => ctx.tools.execute(call, &ctx.tool_ctx).await,
            ApprovalOutcome::Denied(reason) => {
                info!(request_id = %ctx.request_id(), tool = %call.name, reason = %reason, "tool call denied");
                ToolResult::failure(call, reason, 0)
            }
        };
        if let Err(err) = record(ctx, state, result) {
            return ToolPhaseOutcome::Failed(err);
        }

        if state.is_aborted() {
            return skip_remaining(ctx, state, &tool_calls[idx + 1..]);
        }
    }
    ToolPhaseOutcome::Continue
}

fn record(ctx: &RunContext, state: &mut RunState, result: ToolResult) -> Result<(), KestrelError> {
    state.history = append_tool_result(&state.history, &result)?;
    debug!(
        request_id = %ctx.request_id(),
        tool = %result.tool_name,
        success = result.success,
        duration_ms = result.duration_ms,
        "tool result recorded"
    );
    ctx.emit(AgentEventPayload::ToolResult { result });
    Ok(())
}

fn skip_remaining(ctx: &RunContext, state: &mut RunState, remaining: &[ToolCall]) -> ToolPhaseOutcome {
    for call in remaining {
        if let Err(err) = record(ctx, state, ToolResult::failure(call, ABORTED_BEFORE_EXECUTION, 0)) {
            return ToolPhaseOutcome::Failed(err);
        }
    }
    ToolPhaseOutcome::Aborted
}

/// Decide whether `call` may run, asking the user when the mode requires it.
///
/// A sensitive tool needs a tool approval; a path argument outside the
/// workspace needs a path approval. When both apply the tool approval is
/// asked first and both must be granted.
async fn authorize(ctx: &RunContext, state: &mut RunState, call: &ToolCall) -> ApprovalOutcome {
    let session_id = ctx.request.session_id();
    if ctx.gate.bypasses(ctx.approval_mode, session_id) {
        return ApprovalOutcome::Approved;
    }

    let sensitive = ctx.tools.sensitivity(&call.name) == Some(Sensitivity::Sensitive);
    let outside = ctx
        .tools
        .outside_paths_async(call, ctx.tool_ctx.workspace.clone())
        .await;
    if !sensitive && outside.is_empty() {
        return ApprovalOutcome::Approved;
    }

    if sensitive {
        let outcome = ask(ctx, state, ApprovalRequest::for_tool(call)).await;
        if !outcome.is_approved() {
            return outcome;
        }
    }
    if !outside.is_empty() {
        let outcome = ask(ctx, state, ApprovalRequest::for_paths(call, outside)).await;
        if !outcome.is_approved() {
            return outcome;
        }
    }

    if ctx.approval_mode == ApprovalMode::SessionOnly {
        ctx.gate.approve_session(session_id);
    }
    ApprovalOutcome::Approved
}

async fn ask(ctx: &RunContext, state: &mut RunState, request: ApprovalRequest) -> ApprovalOutcome {
    let approval_id = request.id.clone();
    state.pending_approvals.insert(approval_id.clone());
    let outcome = ctx
        .gate
        .request(
            ctx.request_id(),
            request,
            |request| {
                ctx.emit(match request.kind {
                    ApprovalKind::Tool => {
                        AgentEventPayload::ToolApprovalRequired { request }
                    }
                    ApprovalKind::Path => {
                        AgentEventPayload::PathApprovalRequired { request }
                    }
                });
            },
            &ctx.cancel,
            ctx.request.approval_timeout,
        )
        .await;
    if state.is_aborted() {
        info!(
            request_id = %ctx.request_id(),
            denied = ?state.pending_approvals,
            "pending approvals denied by abort"
        );
    }
    state.pending_approvals.remove(&approval_id);
    outcome
}
