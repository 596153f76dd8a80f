//! Approval gate for sensitive tool calls and out-of-workspace paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{KestrelError, Result};
use crate::message::ToolCall;

/// Output recorded for a call the user declined.
pub const DENIED_OUTPUT: &str = "denied by user";
/// Output recorded when the approval wait expired.
pub const TIMED_OUT_OUTPUT: &str = "approval timed out";
/// Output recorded when the run was aborted while waiting.
pub const ABORTED_OUTPUT: &str = "approval cancelled: run aborted";

/// How a session treats calls that need approval.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ApprovalMode {
    /// Never ask.
    AllowAll,
    /// Ask once; the first approval covers the rest of the session.
    SessionOnly,
    /// Ask for every call.
    #[default]
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApprovalKind {
    Tool,
    Path,
}

/// An approval request emitted by the agent loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub kind: ApprovalKind,
    pub description: String,
    pub related_tool_call_id: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
}

impl ApprovalRequest {
    pub fn for_tool(call: &ToolCall) -> Self {
        Self {
            id: new_approval_id(),
            kind: ApprovalKind::Tool,
            description: format!(
                "Allow sensitive tool `{}` with arguments {}?",
                call.name,
                call.arguments_json()
            ),
            related_tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            paths: Vec::new(),
        }
    }

    pub fn for_paths(call: &ToolCall, paths: Vec<String>) -> Self {
        Self {
            id: new_approval_id(),
            kind: ApprovalKind::Path,
            description: format!(
                "Allow `{}` to access paths outside the workspace: {}?",
                call.name,
                paths.join(", ")
            ),
            related_tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            paths,
        }
    }
}

fn new_approval_id() -> String {
    format!("approval-{}", Uuid::new_v4())
}

/// How a single approval wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    /// Denied, with the text recorded as the tool output.
    Denied(String),
}

impl ApprovalOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

struct PendingApproval {
    request_id: String,
    kind: ApprovalKind,
    responder: oneshot::Sender<bool>,
}

/// Pending approvals across all runs plus per-session grants.
#[derive(Default)]
pub struct ApprovalGate {
    pending: Mutex<HashMap<String, PendingApproval>>,
    approved_sessions: Mutex<HashSet<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether calls in `session_id` should skip the gate under `mode`.
    pub fn bypasses(&self, mode: ApprovalMode, session_id: &str) -> bool {
        match mode {
            ApprovalMode::AllowAll => true,
            ApprovalMode::SessionOnly => lock(&self.approved_sessions).contains(session_id),
            ApprovalMode::Ask => false,
        }
    }

    pub fn approve_session(&self, session_id: &str) {
        lock(&self.approved_sessions).insert(session_id.to_string());
    }

    /// Drop a session's grant. Returns whether one existed.
    pub fn end_session(&self, session_id: &str) -> bool {
        lock(&self.approved_sessions).remove(session_id)
    }

    /// Register `request` for `request_id`, let `announce` publish it, then
    /// block until a response, the run's cancellation, or `timeout`.
    pub async fn request(
        &self,
        request_id: &str,
        request: ApprovalRequest,
        announce: impl FnOnce(ApprovalRequest),
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> ApprovalOutcome {
        let approval_id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(
            approval_id.clone(),
            PendingApproval {
                request_id: request_id.to_string(),
                kind: request.kind,
                responder: tx,
            },
        );
        debug!(request_id, approval_id = %approval_id, kind = %request.kind, "awaiting approval");
        announce(request);

        let expiry = async {
            match timeout {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => ApprovalOutcome::Denied(ABORTED_OUTPUT.to_string()),
            decision = rx => match decision {
                Ok(true) => ApprovalOutcome::Approved,
                Ok(false) => ApprovalOutcome::Denied(DENIED_OUTPUT.to_string()),
                Err(_) if cancel.is_cancelled() => ApprovalOutcome::Denied(ABORTED_OUTPUT.to_string()),
                Err(_) => ApprovalOutcome::Denied(DENIED_OUTPUT.to_string()),
            },
            _ = expiry => ApprovalOutcome::Denied(TIMED_OUT_OUTPUT.to_string()),
        };
        lock(&self.pending).remove(&approval_id);
        info!(request_id, approval_id = %approval_id, approved = outcome.is_approved(), "approval resolved");
        outcome
    }

    /// Resolve a pending approval. Fails for unknown ids and for ids of the other kind.
    pub fn respond(&self, approval_id: &str, kind: ApprovalKind, approved: bool) -> Result<()> {
        let mut pending = lock(&self.pending);
        match pending.get(approval_id) {
            Some(entry) if entry.kind == kind => {}
            _ => return Err(KestrelError::ApprovalNotFound(approval_id.to_string())),
        }
        if let Some(entry) = pending.remove(approval_id) {
            // The waiter may already be gone if the run was aborted concurrently.
            let _ = entry.responder.send(approved);
        }
        Ok(())
    }

    /// Deny every pending approval belonging to `request_id`.
    pub fn deny_all_for_run(&self, request_id: &str) -> usize {
        let mut pending = lock(&self.pending);
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| entry.request_id == request_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(entry) = pending.remove(id) {
                let _ = entry.responder.send(false);
            }
        }
        ids.len()
    }

    /// Ids of the approvals `request_id` is currently waiting on.
    pub fn pending_for_run(&self, request_id: &str) -> Vec<String> {
        lock(&self.pending)
            .iter()
            .filter(|(_, entry)| entry.request_id == request_id)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("pending", &lock(&self.pending).len())
            .field("approved_sessions", &lock(&self.approved_sessions).len())
            .finish()
    }
}
