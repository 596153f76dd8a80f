//! Tool registry, builtin tools, and the collaborators they run against.

pub mod arguments;
pub mod builtin;
pub mod registry;
pub mod services;
pub mod tool;
pub mod types;
pub mod validation;
pub mod workspace;

pub use arguments::ToolArguments;
pub use builtin::{all_tools, builtin_registry};
pub use registry::ToolRegistry;
pub use services::{CommandOutput, CommandRunner, DirEntry, FileStat, FileSystem, LocalCommandRunner, LocalFileSystem};
pub use tool::{AgentTool, Tool, ToolContext};
pub use types::{Sensitivity, ToolMode, ToolParameters};
pub use workspace::TrustedWorkspace;
