//! Kestrel: the agent run loop behind an IDE coding assistant.
//!
//! A run takes a user message plus prior history, streams model output from
//! one of three wire formats, executes the tools the model asks for (behind
//! an approval gate for sensitive tools and out-of-workspace paths), and
//! feeds the results back until the model answers without tool calls, the
//! iteration bound is hit, or the caller aborts. Every step is published as
//! an ordered event stream per request id.
//!
//! # Quick Start
//!
//! ```no_run
//! use kestrel::agent_loop::{LoopRunner, RunRequest};
//! use kestrel::config::KestrelConfig;
//! use kestrel::models::ModelConfig;
//! use kestrel::tools::builtin_registry;
//!
//! # async fn example() -> kestrel::error::Result<()> {
//! let model: ModelConfig = "openai:gpt-4o".parse()?;
//! let runner = LoopRunner::new(KestrelConfig::from_env(), builtin_registry())
//!     .with_workspace_root(".");
//! let response = runner
//!     .run(RunRequest::new("req-1", "List the files here", model, 10))
//!     .await?;
//! println!("{}", response.response);
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod config;
pub mod error;
pub mod message;
pub mod models;
pub mod provider;
pub mod tools;
pub mod types;

#[cfg(feature = "cli")]
pub mod cli;
