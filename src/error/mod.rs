//! Error types for kestrel.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification used for `agent_error` payloads and caller-side retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// Malformed provider output or a broken conversation history.
    Protocol,
    /// Network failure or a stream that went silent.
    Transport,
    /// The provider answered with a non-2xx status.
    Provider,
    /// The run hit its iteration bound.
    IterationLimit,
    /// A tool handler failed. Never terminal for a run.
    ToolExecution,
    /// Invalid input at the API boundary.
    InvalidRequest,
    Configuration,
    Internal,
}

/// Primary error type for all kestrel operations.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Provider error{}: {message}", status_suffix(.status_code))]
    Provider {
        status_code: Option<u16>,
        message: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid history: {0}")]
    InvalidHistory(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Stream idle for {0}ms")]
    StreamTimeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Iteration limit reached")]
    IterationLimit,

    #[error("Run already active: {0}")]
    DuplicateRun(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Approval not found: {0}")]
    ApprovalNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl KestrelError {
    /// Non-2xx provider response.
    pub fn provider(status_code: u16, message: impl Into<String>) -> Self {
        Self::Provider {
            status_code: Some(status_code),
            message: message.into(),
        }
    }

    /// Provider stream body that could not be understood.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Provider {
            status_code: None,
            message: message.into(),
        }
    }

    /// Failure raised from inside a tool handler.
    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn category(&self) -> FailureKind {
        match self {
            Self::Provider {
                status_code: Some(_),
                ..
            } => FailureKind::Provider,
            Self::Provider {
                status_code: None, ..
            }
            | Self::Protocol(_)
            | Self::InvalidHistory(_)
            | Self::Serialization(_) => FailureKind::Protocol,
            Self::Network(_) | Self::StreamTimeout(_) => FailureKind::Transport,
            Self::IterationLimit => FailureKind::IterationLimit,
            Self::ToolExecution { .. } | Self::Io(_) => FailureKind::ToolExecution,
            Self::InvalidArgument(_)
            | Self::DuplicateRun(_)
            | Self::RunNotFound(_)
            | Self::ApprovalNotFound(_) => FailureKind::InvalidRequest,
            Self::Configuration(_) => FailureKind::Configuration,
            Self::InvalidState(_) => FailureKind::Internal,
        }
    }

    /// Whether a caller wrapping `run()` could reasonably retry. The loop itself never does.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::StreamTimeout(_) => true,
            Self::Provider {
                status_code: Some(status),
                ..
            } => *status == 429 || (500..=599).contains(status),
            _ => false,
        }
    }
}

fn status_suffix(status_code: &Option<u16>) -> String {
    status_code
        .map(|status| format!(" (status {status})"))
        .unwrap_or_default()
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, KestrelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_split_by_status_presence() {
        assert_eq!(
            KestrelError::provider(503, "overloaded").category(),
            FailureKind::Provider
        );
        assert_eq!(
            KestrelError::malformed("bad chunk").category(),
            FailureKind::Protocol
        );
    }

    #[test]
    fn display_includes_status_when_present() {
        let err = KestrelError::provider(401, "bad key");
        assert_eq!(err.to_string(), "Provider error (status 401): bad key");
        let err = KestrelError::malformed("truncated");
        assert_eq!(err.to_string(), "Provider error: truncated");
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(KestrelError::provider(429, "slow down").is_retryable());
        assert!(KestrelError::StreamTimeout(5_000).is_retryable());
        assert!(!KestrelError::provider(400, "bad request").is_retryable());
        assert!(!KestrelError::IterationLimit.is_retryable());
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&FailureKind::IterationLimit).unwrap(),
            "\"iteration_limit\""
        );
        assert_eq!(FailureKind::Transport.to_string(), "transport");
    }
}
