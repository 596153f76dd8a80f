//! Agent loop primitives (runs, events, approvals).

pub mod approvals;
pub mod events;
pub mod registry;
pub mod runner;
pub mod types;

pub use approvals::{
    ApprovalGate, ApprovalKind, ApprovalMode, ApprovalOutcome, ApprovalRequest, ABORTED_OUTPUT,
    DENIED_OUTPUT, TIMED_OUT_OUTPUT,
};
pub use events::{AgentEvent, AgentEventPayload};
pub use registry::{EventSubscription, RunEventEmitter, RunRegistry, RunSlot};
pub use runner::{LoopRunner, ProviderFactory, RunHandle, Unsubscribe};
pub use types::{RunError, RunRequest, RunResponse, RunState, RunStatus};
