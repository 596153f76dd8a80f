//! CLI entry point for Kestrel.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::agent_loop::ApprovalMode;
use crate::tools::ToolMode;

/// Kestrel agent CLI
#[derive(Parser, Debug)]
#[command(name = "kestrel", version, about = "Kestrel agent run loop CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the agent loop on a prompt
    Run(RunArgs),
    /// List the tools a mode exposes
    Tools(ToolsArgs),
    /// Execute one tool directly
    Exec(ExecArgs),
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Model to use (format: provider:model, e.g., openai:gpt-4o)
    #[arg(short, long, default_value = "openai:gpt-4o")]
    pub model: String,

    /// System prompt
    #[arg(short, long)]
    pub system: Option<String>,

    /// Trusted workspace root
    #[arg(short, long, default_value = ".")]
    pub root: PathBuf,

    /// Prior conversation as a JSON array of messages
    #[arg(long)]
    pub history: Option<PathBuf>,

    /// Iteration bound (defaults to KESTREL_MAX_ITERATIONS or 25)
    #[arg(long)]
    pub max_iterations: Option<usize>,

    /// allow-all, session-only or ask
    #[arg(long = "approval")]
    pub approval_mode: Option<ApprovalMode>,

    /// Restrict the run to these tools (repeatable)
    #[arg(long = "tool")]
    pub tools: Vec<String>,

    /// User prompt (positional)
    pub prompt: String,
}

/// Arguments for the `tools` subcommand.
#[derive(Parser, Debug)]
pub struct ToolsArgs {
    /// agent, read-only or chat
    #[arg(long, default_value = "agent")]
    pub mode: ToolMode,
}

/// Arguments for the `exec` subcommand.
#[derive(Parser, Debug)]
pub struct ExecArgs {
    /// Tool name
    pub name: String,

    /// Arguments as a JSON object
    #[arg(default_value = "{}")]
    pub args: String,

    /// Trusted workspace root
    #[arg(short, long, default_value = ".")]
    pub root: PathBuf,
}
