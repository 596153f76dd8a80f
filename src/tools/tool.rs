//! Tool trait, execution context, and closure-based tool wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use super::arguments::ToolArguments;
use super::services::{CommandRunner, FileSystem, LocalCommandRunner, LocalFileSystem};
use super::types::{Sensitivity, ToolParameters};
use super::workspace::TrustedWorkspace;
use crate::error::KestrelError;

/// Context available during tool execution.
#[derive(Clone)]
pub struct ToolContext {
    pub request_id: String,
    pub tool_call_id: String,
    pub workspace: Arc<TrustedWorkspace>,
    pub fs: Arc<dyn FileSystem>,
    pub commands: Arc<dyn CommandRunner>,
}

impl ToolContext {
    /// Context backed by the local disk and shell.
    pub fn local(workspace: TrustedWorkspace) -> Self {
        Self {
            request_id: String::new(),
            tool_call_id: String::new(),
            workspace: Arc::new(workspace),
            fs: Arc::new(LocalFileSystem),
            commands: Arc::new(LocalCommandRunner),
        }
    }

    pub fn with_file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_command_runner(mut self, commands: Arc<dyn CommandRunner>) -> Self {
        self.commands = commands;
        self
    }

    /// Copy of this context tagged for one call.
    pub fn for_call(&self, request_id: &str, tool_call_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            tool_call_id: tool_call_id.to_string(),
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("request_id", &self.request_id)
            .field("tool_call_id", &self.tool_call_id)
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

/// Core tool trait. Implement it to create custom tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match what the model calls).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema parameters.
    fn parameters(&self) -> &ToolParameters;

    fn sensitivity(&self) -> Sensitivity;

    /// Names of arguments that hold file system paths.
    fn path_arguments(&self) -> &[String] {
        &[]
    }

    async fn execute(&self, args: &ToolArguments, ctx: &ToolContext) -> Result<String, KestrelError>;
}

type ToolHandler = dyn Fn(ToolArguments, ToolContext) -> Pin<Box<dyn Future<Output = Result<String, KestrelError>> + Send>>
    + Send
    + Sync;

/// Closure-based tool for quick tool creation.
pub struct AgentTool {
    name: String,
    description: String,
    parameters: ToolParameters,
    sensitivity: Sensitivity,
    path_arguments: Vec<String>,
    handler: Arc<ToolHandler>,
}

impl AgentTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ToolParameters,
        sensitivity: Sensitivity,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArguments, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, KestrelError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            sensitivity,
            path_arguments: Vec::new(),
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }

    /// Declare which arguments are paths checked against the workspace root.
    pub fn with_path_arguments(mut self, names: &[&str]) -> Self {
        self.path_arguments = names.iter().map(|n| n.to_string()).collect();
        self
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    fn sensitivity(&self) -> Sensitivity {
        self.sensitivity
    }

    fn path_arguments(&self) -> &[String] {
        &self.path_arguments
    }

    async fn execute(&self, args: &ToolArguments, ctx: &ToolContext) -> Result<String, KestrelError> {
        (self.handler)(args.clone(), ctx.clone()).await
    }
}

impl std::fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTool")
            .field("name", &self.name)
            .field("sensitivity", &self.sensitivity)
            .field("path_arguments", &self.path_arguments)
            .finish()
    }
}
