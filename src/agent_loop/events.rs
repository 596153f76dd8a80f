//! Run event stream types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::message::{ToolCall, ToolResult};
use crate::types::Usage;

use super::approvals::ApprovalRequest;

/// Envelope for one run event. `seq` starts at 1 and increases by one per event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub request_id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: AgentEventPayload,
}

impl AgentEvent {
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }
}

/// Concrete event payloads emitted by the agent loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentEventPayload {
    /// A provider request is about to be sent.
    Thinking {
        iteration: usize,
    },
    TextDelta {
        text: String,
    },
    ReasoningDelta {
        text: String,
    },
    ToolCallStart {
        call_id: String,
        name: String,
        index: usize,
    },
    ToolCallDelta {
        call_id: String,
        arguments_delta: String,
    },
    ToolCallComplete {
        call: ToolCall,
    },
    ToolResult {
        result: ToolResult,
    },
    ToolApprovalRequired {
        request: ApprovalRequest,
    },
    PathApprovalRequired {
        request: ApprovalRequest,
    },
    IterationStart {
        iteration: usize,
        max_iterations: usize,
    },
    IterationComplete {
        iteration: usize,
        tool_calls: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    AgentComplete {
        response: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        iterations: usize,
    },
    AgentError {
        kind: FailureKind,
        message: String,
    },
    AgentAborted {
        iterations: usize,
    },
}

impl AgentEventPayload {
    /// Wire name of the variant, as in the serialized `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Thinking { .. } => "thinking",
            Self::TextDelta { .. } => "text_delta",
            Self::ReasoningDelta { .. } => "reasoning_delta",
            Self::ToolCallStart { .. } => "tool_call_start",
            Self::ToolCallDelta { .. } => "tool_call_delta",
            Self::ToolCallComplete { .. } => "tool_call_complete",
            Self::ToolResult { .. } => "tool_result",
            Self::ToolApprovalRequired { .. } => "tool_approval_required",
            Self::PathApprovalRequired { .. } => "path_approval_required",
            Self::IterationStart { .. } => "iteration_start",
            Self::IterationComplete { .. } => "iteration_complete",
            Self::AgentComplete { .. } => "agent_complete",
            Self::AgentError { .. } => "agent_error",
            Self::AgentAborted { .. } => "agent_aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AgentComplete { .. } | Self::AgentError { .. } | Self::AgentAborted { .. }
        )
    }
}
