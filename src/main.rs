//! Kestrel CLI binary entry point.

use std::io::{self, Write};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kestrel::agent_loop::{AgentEventPayload, ApprovalKind, LoopRunner, RunRequest, RunStatus};
use kestrel::cli::{Cli, Commands, ExecArgs, RunArgs, ToolsArgs};
use kestrel::config::{KestrelConfig, RunnerDefaults};
use kestrel::message::normalize;
use kestrel::models::ModelConfig;
use kestrel::tools::builtin_registry;

type CliResult = Result<(), Box<dyn std::error::Error>>;

const PREVIEW_CHARS: usize = 200;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kestrel=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => handle_run(args).await,
        Commands::Tools(args) => handle_tools(args),
        Commands::Exec(args) => handle_exec(args).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn runner(workspace: &std::path::Path, defaults: RunnerDefaults) -> LoopRunner {
    LoopRunner::new(KestrelConfig::from_env(), builtin_registry())
        .with_defaults(defaults)
        .with_workspace_root(workspace)
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(PREVIEW_CHARS).collect();
    if out.len() < text.len() {
        out.push_str("...");
    }
    out
}

async fn handle_run(args: RunArgs) -> CliResult {
    let model: ModelConfig = args.model.parse().map_err(|_| {
        format!(
            "Invalid model format: '{}'. Use provider:model (e.g. openai:gpt-4o)",
            args.model
        )
    })?;
    let defaults = RunnerDefaults::from_env();
    let runner = runner(&args.root, defaults);
    let history = match &args.history {
        Some(path) => {
            let raw: Vec<serde_json::Value> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
            normalize(&raw)?
        }
        None => Vec::new(),
    };

    let request_id = format!("cli-{}", uuid::Uuid::new_v4());
    let mut request = RunRequest::new(
        request_id.clone(),
        args.prompt,
        model,
        args.max_iterations.unwrap_or(defaults.max_iterations),
    );
    if !history.is_empty() {
        request = request.with_history(history);
    }
    if let Some(system) = args.system {
        request = request.with_system_prompt(system);
    }
    if let Some(mode) = args.approval_mode {
        request = request.with_approval_mode(mode);
    }
    if !args.tools.is_empty() {
        request = request.with_enabled_tools(args.tools);
    }

    let mut events = runner.subscribe(&request_id);
    let handle = runner.start(request)?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    while let Some(event) = events.recv().await {
        match event.payload {
            AgentEventPayload::TextDelta { text } => {
                print!("{text}");
                let _ = io::stdout().flush();
            }
            AgentEventPayload::ToolCallComplete { call } => {
                eprintln!("\n⚡ {}({})", call.name, call.arguments_json());
            }
            AgentEventPayload::ToolResult { result } => {
                let marker = if result.success { "✅" } else { "❌" };
                eprintln!("  {marker} {}", preview(&result.output));
            }
            AgentEventPayload::ToolApprovalRequired { request }
            | AgentEventPayload::PathApprovalRequired { request } => {
                eprint!("\n{} [y/N] ", request.description);
                let _ = io::stderr().flush();
                let answer = stdin.next_line().await?.unwrap_or_default();
                let approved = matches!(answer.trim(), "y" | "Y" | "yes");
                let responded = match request.kind {
                    ApprovalKind::Tool => {
                        runner.respond_tool_approval(&request.id, approved)
                    }
                    ApprovalKind::Path => {
                        runner.respond_path_approval(&request.id, approved)
                    }
                };
                if let Err(e) = responded {
                    eprintln!("approval no longer pending: {e}");
                }
            }
            AgentEventPayload::AgentError { kind, message } => {
                eprintln!("\n❌ {kind}: {message}");
            }
            _ => {}
        }
    }

    let response = handle.wait().await;
    println!();

    match response.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Aborted => Err("run aborted".into()),
        RunStatus::Failed => Err(response
            .error
            .map(|e| e.message)
            .unwrap_or_else(|| "run failed".to_string())
            .into()),
    }
}

fn handle_tools(args: ToolsArgs) -> CliResult {
    let definitions = builtin_registry().definitions_for(args.mode);
    println!("{}", serde_json::to_string_pretty(&definitions)?);
    Ok(())
}

async fn handle_exec(args: ExecArgs) -> CliResult {
    let value: serde_json::Value = serde_json::from_str(&args.args)?;
    let runner = runner(&args.root, RunnerDefaults::default());
    let result = runner.execute_tool(&args.name, value, None).await;
    println!("{}", result.output);
    if result.success {
        Ok(())
    } else {
        Err(format!("{} failed", args.name).into())
    }
}
