//! Core run types for the agent loop.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{FailureKind, KestrelError, Result};
use crate::message::{Attachment, UniversalMessage};
use crate::models::ModelConfig;
use crate::types::Usage;

use super::approvals::ApprovalMode;

/// Request payload to start a run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub request_id: String,
    pub message: String,
    pub attachments: Vec<Attachment>,
    pub model: ModelConfig,
    /// Tools enabled for this run; `None` enables every registered tool.
    pub enabled_tools: Option<Vec<String>>,
    pub max_iterations: usize,
    pub history: Vec<UniversalMessage>,
    pub system_prompt: Option<String>,
    /// Falls back to the runner default.
    pub approval_mode: Option<ApprovalMode>,
    /// Scope for session-only approvals; defaults to the request id.
    pub session_id: Option<String>,
    /// Trusted root; falls back to the runner's workspace.
    pub workspace_root: Option<PathBuf>,
    pub stream_idle_timeout: Option<Duration>,
    /// Unset means approvals wait indefinitely.
    pub approval_timeout: Option<Duration>,
}

impl RunRequest {
    pub fn new(
        request_id: impl Into<String>,
        message: impl Into<String>,
        model: ModelConfig,
        max_iterations: usize,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            message: message.into(),
            attachments: Vec::new(),
            model,
            enabled_tools: None,
            max_iterations,
            history: Vec::new(),
            system_prompt: None,
            approval_mode: None,
            session_id: None,
            workspace_root: None,
            stream_idle_timeout: None,
            approval_timeout: None,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_enabled_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enabled_tools = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_history(mut self, history: Vec<UniversalMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = Some(mode);
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    pub fn with_stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = Some(timeout);
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = Some(timeout);
        self
    }

    pub fn session_id(&self) -> &str {
        self.session_id.as_deref().unwrap_or(&self.request_id)
    }

    /// Reject requests the loop cannot start.
    pub fn validate(&self) -> Result<()> {
        if self.request_id.trim().is_empty() {
            return Err(KestrelError::InvalidArgument("request id must not be empty".into()));
        }
        if self.max_iterations == 0 {
            return Err(KestrelError::InvalidArgument("max_iterations must be at least 1".into()));
        }
        Ok(())
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: FailureKind,
    pub message: String,
}

/// Result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResponse {
    pub request_id: String,
    pub status: RunStatus,
    /// Non-empty assistant text of every iteration, joined by a blank line.
    pub response: String,
    pub history: Vec<UniversalMessage>,
    pub iterations: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl RunResponse {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Mutable state owned by one run task.
#[derive(Debug)]
pub struct RunState {
    pub iteration: usize,
    pub history: Vec<UniversalMessage>,
    pub cancel: CancellationToken,
    pub pending_approvals: HashSet<String>,
    pub usage: Option<Usage>,
    /// Assistant text per iteration.
    pub texts: Vec<String>,
}

impl RunState {
    pub fn new(history: Vec<UniversalMessage>, cancel: CancellationToken) -> Self {
        Self {
            iteration: 0,
            history,
            cancel,
            pending_approvals: HashSet::new(),
            usage: None,
            texts: Vec::new(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn response_text(&self) -> String {
        self.texts
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn into_response(self, request_id: &str, status: RunStatus, error: Option<RunError>) -> RunResponse {
        RunResponse {
            request_id: request_id.to_string(),
            status,
            response: self.response_text(),
            iterations: self.iteration,
            usage: self.usage,
            history: self.history,
            error,
        }
    }
}
