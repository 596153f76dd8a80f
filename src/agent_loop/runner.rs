//! Runner facade for the agent loop.
//!
//! [`LoopRunner`] owns the tool registry, the approval gate and the run
//! registry. Each run executes as one spawned task that drives the
//! request, stream, tool and approval phases in order; callers observe it
//! through subscriptions and steer it through `abort` and the approval
//! endpoints.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{KestrelConfig, RunnerDefaults};
use crate::error::{FailureKind, Result};
use crate::message::{ToolCall, ToolResult};
use crate::models::ModelConfig;
use crate::provider::{self, ModelProvider, ToolDefinition};
use crate::tools::{CommandRunner, FileSystem, ToolContext, ToolMode, ToolRegistry, TrustedWorkspace};

use super::approvals::{ApprovalGate, ApprovalKind};
use super::events::AgentEvent;
use super::registry::{EventSubscription, RunRegistry};
use super::types::{RunError, RunRequest, RunResponse, RunStatus};

mod engine;

#[cfg(test)]
mod tests;

/// Resolves the provider for a run's model.
pub type ProviderFactory =
    Arc<dyn Fn(&ModelConfig, &KestrelConfig) -> Result<Arc<dyn ModelProvider>> + Send + Sync>;

/// Handle for an in-flight run.
#[derive(Debug)]
pub struct RunHandle {
    request_id: String,
    cancel: CancellationToken,
    result_rx: oneshot::Receiver<RunResponse>,
}

impl RunHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Cancel the run. Equivalent to [`LoopRunner::abort`] for this id.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> RunResponse {
        let request_id = self.request_id;
        self.result_rx.await.unwrap_or_else(|_| RunResponse {
            request_id,
            status: RunStatus::Failed,
            response: String::new(),
            history: Vec::new(),
            iterations: 0,
            usage: None,
            error: Some(RunError {
                kind: FailureKind::Internal,
                message: "run task ended without a result".into(),
            }),
        })
    }
}

/// Returned by [`LoopRunner::on_event`]; stops the callback's consumer task.
#[derive(Debug)]
pub struct Unsubscribe {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        self.stop.cancel();
    }

    /// Wait until the callback has seen the run's last event.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Default agent-loop runner (tool loop + approvals + event stream).
#[derive(Clone)]
pub struct LoopRunner {
    config: Arc<KestrelConfig>,
    defaults: RunnerDefaults,
    tools: Arc<ToolRegistry>,
    registry: Arc<RunRegistry>,
    gate: Arc<ApprovalGate>,
    provider_factory: ProviderFactory,
    tool_context: ToolContext,
}

impl LoopRunner {
    pub fn new(config: KestrelConfig, tools: ToolRegistry) -> Self {
        Self {
            config: Arc::new(config),
            defaults: RunnerDefaults::default(),
            tools: Arc::new(tools),
            registry: Arc::new(RunRegistry::new()),
            gate: Arc::new(ApprovalGate::new()),
            provider_factory: Arc::new(provider::create_provider),
            tool_context: ToolContext::local(TrustedWorkspace::untrusted()),
        }
    }

    pub fn with_defaults(mut self, defaults: RunnerDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Replace how providers are created, e.g. with a scripted provider in tests.
    pub fn with_provider_factory(mut self, factory: ProviderFactory) -> Self {
        self.provider_factory = factory;
        self
    }

    /// Trusted root used when a run does not name one.
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.tool_context.workspace = Arc::new(TrustedWorkspace::new(root.into()));
        self
    }

    pub fn with_file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.tool_context = self.tool_context.with_file_system(fs);
        self
    }

    pub fn with_command_runner(mut self, commands: Arc<dyn CommandRunner>) -> Self {
        self.tool_context = self.tool_context.with_command_runner(commands);
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run to completion.
    pub async fn run(&self, request: RunRequest) -> Result<RunResponse> {
        Ok(self.start(request)?.wait().await)
    }

    /// Spawn a run. Invalid requests and duplicate ids fail here, before any event.
    pub fn start(&self, request: RunRequest) -> Result<RunHandle> {
        request.validate()?;
        let slot = self.registry.register(&request.request_id)?;

        let mut tool_ctx = self.tool_context.clone();
        if let Some(root) = &request.workspace_root {
            tool_ctx.workspace = Arc::new(TrustedWorkspace::new(root));
        }
        tool_ctx.request_id = request.request_id.clone();
        let tools = match &request.enabled_tools {
            Some(names) => self.tools.scoped(names),
            None => self.tools.as_ref().clone(),
        };

        info!(
            request_id = %request.request_id,
            model = %request.model,
            max_iterations = request.max_iterations,
            "run start"
        );

        let ctx = engine::RunContext {
            approval_mode: request.approval_mode.unwrap_or(self.defaults.approval_mode),
            idle_timeout: request
                .stream_idle_timeout
                .unwrap_or(self.defaults.stream_idle_timeout),
            request,
            config: self.config.clone(),
            provider_factory: self.provider_factory.clone(),
            tools,
            tool_ctx,
            gate: self.gate.clone(),
            registry: self.registry.clone(),
            emitter: slot.emitter,
            cancel: slot.cancel.clone(),
        };

        let (result_tx, result_rx) = oneshot::channel();
        let request_id = slot.request_id.clone();
        tokio::spawn(async move {
            let response = engine::drive(ctx).await;
            let _ = result_tx.send(response);
        });

        Ok(RunHandle {
            request_id,
            cancel: slot.cancel,
            result_rx,
        })
    }

    /// Cancel an active run and deny its pending approvals.
    pub fn abort(&self, request_id: &str) -> Result<()> {
        self.registry.abort(request_id)?;
        let denied = self.gate.deny_all_for_run(request_id);
        if denied > 0 {
            info!(request_id, denied, "pending approvals denied by abort");
        }
        Ok(())
    }

    pub fn respond_tool_approval(&self, approval_id: &str, approved: bool) -> Result<()> {
        self.gate.respond(approval_id, ApprovalKind::Tool, approved)
    }

    pub fn respond_path_approval(&self, approval_id: &str, approved: bool) -> Result<()> {
        self.gate.respond(approval_id, ApprovalKind::Path, approved)
    }

    pub fn get_tools(&self, mode: ToolMode) -> Vec<ToolDefinition> {
        self.tools.definitions_for(mode)
    }

    /// Execute one tool directly, outside any run and without approval.
    ///
    /// `context` defaults to the runner's workspace and collaborators.
    pub async fn execute_tool(
        &self,
        name: &str,
        args: serde_json::Value,
        context: Option<ToolContext>,
    ) -> ToolResult {
        let id = format!("exec-{}", Uuid::new_v4());
        let call = match args {
            serde_json::Value::Object(map) => ToolCall::new(id, name, map),
            serde_json::Value::Null => ToolCall::new(id, name, serde_json::Map::new()),
            other => ToolCall::from_raw_arguments(id, name, &other.to_string()),
        };
        let ctx = context.unwrap_or_else(|| self.tool_context.clone());
        self.tools.execute(&call, &ctx).await
    }

    /// Invoke `callback` for each event of `request_id` from a consumer task.
    pub fn on_event<F>(&self, request_id: &str, mut callback: F) -> Unsubscribe
    where
        F: FnMut(AgentEvent) + Send + 'static,
    {
        let mut subscription = self.registry.subscribe(request_id);
        let stop = CancellationToken::new();
        let token = stop.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = subscription.recv() => match event {
                        Some(event) => callback(event),
                        None => break,
                    },
                }
            }
        });
        Unsubscribe { stop, task }
    }

    /// Queue for `request_id`'s events. If no run is active under the id, the
    /// queue belongs to the next run started with it.
    pub fn subscribe(&self, request_id: &str) -> EventSubscription {
        self.registry.subscribe(request_id)
    }

    /// Queue for a run that is active now; `RunNotFound` otherwise.
    pub fn subscribe_active(&self, request_id: &str) -> Result<EventSubscription> {
        self.registry.subscribe_active(request_id)
    }

    /// End a session's blanket approval. Returns whether one was granted.
    pub fn end_session(&self, session_id: &str) -> bool {
        let ended = self.gate.end_session(session_id);
        if !ended {
            debug!(session_id, "end_session for a session without approvals");
        }
        ended
    }

    pub fn active_runs(&self) -> Vec<String> {
        self.registry.active_runs()
    }
}

impl std::fmt::Debug for LoopRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopRunner")
            .field("defaults", &self.defaults)
            .field("tools", &self.tools)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
