//! Tool registry and the never-failing executor.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, warn};

use super::arguments::ToolArguments;
use super::tool::{Tool, ToolContext};
use super::types::{Sensitivity, ToolMode};
use super::validation::validate_arguments;
use super::workspace::TrustedWorkspace;
use crate::error::{KestrelError, Result};
use crate::message::{ToolCall, ToolResult};
use crate::provider::ToolDefinition;

/// Registered tools in registration order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. Names must be unique.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        if self.get(tool.name()).is_some() {
            return Err(KestrelError::InvalidArgument(format!(
                "tool '{}' is already registered",
                tool.name()
            )));
        }
        self.tools.push(tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// A registry restricted to `enabled`. Unknown names are ignored.
    pub fn scoped(&self, enabled: &[String]) -> Self {
        Self {
            tools: self
                .tools
                .iter()
                .filter(|t| enabled.iter().any(|n| n == t.name()))
                .cloned()
                .collect(),
        }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions_for(ToolMode::Agent)
    }

    pub fn definitions_for(&self, mode: ToolMode) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .filter(|t| mode.allows(t.sensitivity()))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters().schema.clone(),
            })
            .collect()
    }

    /// Sensitivity of the named tool, if registered.
    pub fn sensitivity(&self, name: &str) -> Option<Sensitivity> {
        self.get(name).map(|t| t.sensitivity())
    }

    /// Resolved path arguments of `call` that fall outside the workspace.
    ///
    /// Touches the filesystem to follow symlinks; async callers use
    /// [`outside_paths_async`](Self::outside_paths_async).
    pub fn outside_paths(&self, call: &ToolCall, workspace: &TrustedWorkspace) -> Vec<String> {
        outside_of(workspace, self.path_values(call))
    }

    /// [`outside_paths`](Self::outside_paths) on the blocking pool. If the
    /// check cannot complete, every path argument counts as outside.
    pub async fn outside_paths_async(
        &self,
        call: &ToolCall,
        workspace: Arc<TrustedWorkspace>,
    ) -> Vec<String> {
        let raws = self.path_values(call);
        if raws.is_empty() {
            return Vec::new();
        }
        let fallback: Vec<String> = raws
            .iter()
            .map(|raw| workspace.resolve(raw).display().to_string())
            .collect();
        match tokio::task::spawn_blocking(move || outside_of(&workspace, raws)).await {
            Ok(outside) => outside,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "path check did not complete");
                fallback
            }
        }
    }

    fn path_values(&self, call: &ToolCall) -> Vec<String> {
        let Some(tool) = self.get(&call.name) else {
            return Vec::new();
        };
        tool.path_arguments()
            .iter()
            .filter_map(|arg| call.arguments.get(arg).and_then(|v| v.as_str()))
            .map(str::to_string)
            .collect()
    }

    /// Run one call. Every failure, including a handler panic, becomes a failed result.
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let started = Instant::now();
        let elapsed = |started: Instant| started.elapsed().as_millis() as u64;

        let Some(tool) = self.get(&call.name) else {
            warn!(tool = %call.name, "tool not found");
            return ToolResult::failure(call, format!("tool not found: {}", call.name), 0);
        };

        if let Some(raw) = &call.invalid_arguments {
            return ToolResult::failure(
                call,
                format!("invalid arguments: expected a JSON object, got: {raw}"),
                elapsed(started),
            );
        }

        if let Err(message) = validate_arguments(&call.arguments, &tool.parameters().schema) {
            return ToolResult::failure(call, format!("invalid arguments: {message}"), elapsed(started));
        }

        let args = ToolArguments::new(call.arguments.clone());
        let ctx = ctx.for_call(&ctx.request_id, &call.id);
        debug!(tool = %call.name, call_id = %call.id, "executing tool");

        let outcome = AssertUnwindSafe(tool.execute(&args, &ctx)).catch_unwind().await;
        let duration_ms = elapsed(started);
        match outcome {
            Ok(Ok(output)) => ToolResult::success(call, output, duration_ms),
            Ok(Err(err)) => {
                debug!(tool = %call.name, error = %err, "tool failed");
                ToolResult::failure(call, tool_error_text(&err), duration_ms)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(tool = %call.name, panic = %message, "tool handler panicked");
                ToolResult::failure(call, format!("tool panicked: {message}"), duration_ms)
            }
        }
    }
}

fn tool_error_text(err: &KestrelError) -> String {
    match err {
        KestrelError::ToolExecution { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

fn outside_of(workspace: &TrustedWorkspace, raws: Vec<String>) -> Vec<String> {
    raws.iter()
        .filter(|raw| !workspace.contains(raw))
        .map(|raw| workspace.resolve(raw).display().to_string())
        .collect()
}
