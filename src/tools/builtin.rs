//! Built-in coding tools.
//!
//! Safe tools: `read_file`, `list_directory`, `search`, `stat`.
//! Sensitive tools: `write_file`, `delete_path`, `run_command`.
//!
//! File access goes through the context's [`FileSystem`](super::services::FileSystem)
//! and commands through its [`CommandRunner`](super::services::CommandRunner).
//! `search` walks the local disk directly so it can honour `.gitignore`.
//!
//! ```rust,no_run
//! use kestrel::tools::builtin::builtin_registry;
//!
//! let registry = builtin_registry();
//! assert_eq!(registry.len(), 7);
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ignore::WalkBuilder;
use regex::Regex;

use super::registry::ToolRegistry;
use super::tool::{AgentTool, Tool};
use super::types::{Sensitivity, ToolParameters};
use crate::error::KestrelError;

/// Upper bound on the text a single tool returns to the model.
pub const MAX_TOOL_OUTPUT_BYTES: usize = 32_768;
const DEFAULT_SEARCH_RESULTS: usize = 200;

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let mut cutoff = max_bytes;
    while cutoff > 0 && !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    format!("{}\n... (truncated)", &s[..cutoff])
}

fn to_json(tool: &str, value: serde_json::Value) -> Result<String, KestrelError> {
    serde_json::to_string_pretty(&value).map_err(|e| KestrelError::tool(tool, e.to_string()))
}

pub fn read_file_tool() -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "read_file",
            "Read a file's contents as UTF-8 text",
            ToolParameters::object()
                .string("path", "Path to the file, relative to the workspace root", true)
                .build(),
            Sensitivity::Safe,
            |args, ctx| async move {
                let path = ctx.workspace.resolve(args.get_str("path")?);
                let content = ctx
                    .fs
                    .read_file(&path)
                    .await
                    .map_err(|e| KestrelError::tool("read_file", e.to_string()))?;
                Ok(truncate_utf8(&content, MAX_TOOL_OUTPUT_BYTES))
            },
        )
        .with_path_arguments(&["path"]),
    )
}

/// Lists entries as JSON: `{path, entries: [{name, type, size}], count}`.
pub fn list_directory_tool() -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "list_directory",
            "List files and directories in a given path",
            ToolParameters::object()
                .string("path", "Directory to list (defaults to the workspace root)", false)
                .build(),
            Sensitivity::Safe,
            |args, ctx| async move {
                let raw = args.get_str_opt("path").unwrap_or(".");
                let path = ctx.workspace.resolve(raw);
                let entries = ctx
                    .fs
                    .read_dir(&path)
                    .await
                    .map_err(|e| KestrelError::tool("list_directory", e.to_string()))?;
                let listed: Vec<_> = entries
                    .iter()
                    .map(|e| {
                        serde_json::json!({
                            "name": e.name,
                            "type": if e.is_dir { "dir" } else { "file" },
                            "size": e.size,
                        })
                    })
                    .collect();
                let out = to_json(
                    "list_directory",
                    serde_json::json!({
                        "path": path.display().to_string(),
                        "entries": listed,
                        "count": entries.len(),
                    }),
                )?;
                Ok(truncate_utf8(&out, MAX_TOOL_OUTPUT_BYTES))
            },
        )
        .with_path_arguments(&["path"]),
    )
}

/// Regex search over files, skipping anything `.gitignore` excludes.
///
/// Output is one `path:line: text` row per match, paths relative to the
/// searched directory.
pub fn search_tool() -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "search",
            "Search file contents for a regular expression",
            ToolParameters::object()
                .string("pattern", "Regular expression to search for", true)
                .string("path", "Directory or file to search (defaults to the workspace root)", false)
                .integer("max_results", "Maximum number of matching lines", false)
                .build(),
            Sensitivity::Safe,
            |args, ctx| async move {
                let pattern = Regex::new(args.get_str("pattern")?)
                    .map_err(|e| KestrelError::tool("search", format!("invalid pattern: {e}")))?;
                let root = ctx.workspace.resolve(args.get_str_opt("path").unwrap_or("."));
                let limit = args
                    .get_u64_opt("max_results")
                    .map_or(DEFAULT_SEARCH_RESULTS, |n| n as usize);

                let matches = tokio::task::spawn_blocking(move || search_files(&root, &pattern, limit))
                    .await
                    .map_err(|e| KestrelError::tool("search", e.to_string()))?;
                if matches.is_empty() {
                    return Ok("no matches".to_string());
                }
                Ok(truncate_utf8(&matches.join("\n"), MAX_TOOL_OUTPUT_BYTES))
            },
        )
        .with_path_arguments(&["path"]),
    )
}

fn search_files(root: &Path, pattern: &Regex, limit: usize) -> Vec<String> {
    let mut matches = Vec::new();
    for entry in WalkBuilder::new(root).build().flatten() {
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let display = display_relative(root, entry.path());
        for (idx, line) in content.lines().enumerate() {
            if pattern.is_match(line) {
                matches.push(format!("{display}:{}: {}", idx + 1, line.trim_end()));
                if matches.len() >= limit {
                    return matches;
                }
            }
        }
    }
    matches
}

fn display_relative(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.display().to_string(),
        _ => path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| path.to_path_buf())
            .display()
            .to_string(),
    }
}

pub fn stat_tool() -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "stat",
            "Show metadata for a file or directory",
            ToolParameters::object()
                .string("path", "Path to inspect", true)
                .build(),
            Sensitivity::Safe,
            |args, ctx| async move {
                let path = ctx.workspace.resolve(args.get_str("path")?);
                let stat = ctx
                    .fs
                    .stat(&path)
                    .await
                    .map_err(|e| KestrelError::tool("stat", e.to_string()))?;
                let value = serde_json::to_value(&stat).map_err(|e| KestrelError::tool("stat", e.to_string()))?;
                to_json("stat", value)
            },
        )
        .with_path_arguments(&["path"]),
    )
}

pub fn write_file_tool() -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "write_file",
            "Write content to a file, creating parent directories if needed",
            ToolParameters::object()
                .string("path", "Path to the file to write", true)
                .string("content", "Full content of the file", true)
                .build(),
            Sensitivity::Sensitive,
            |args, ctx| async move {
                let path = ctx.workspace.resolve(args.get_str("path")?);
                let content = args.get_str("content")?;
                ctx.fs
                    .write_file(&path, content)
                    .await
                    .map_err(|e| KestrelError::tool("write_file", e.to_string()))?;
                Ok(format!("wrote {} bytes to {}", content.len(), path.display()))
            },
        )
        .with_path_arguments(&["path"]),
    )
}

pub fn delete_path_tool() -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "delete_path",
            "Delete a file, or a directory and its contents",
            ToolParameters::object()
                .string("path", "Path to delete", true)
                .build(),
            Sensitivity::Sensitive,
            |args, ctx| async move {
                let path = ctx.workspace.resolve(args.get_str("path")?);
                ctx.fs
                    .delete_path(&path)
                    .await
                    .map_err(|e| KestrelError::tool("delete_path", e.to_string()))?;
                Ok(format!("deleted {}", path.display()))
            },
        )
        .with_path_arguments(&["path"]),
    )
}

/// Runs a shell command in `cwd` (default: workspace root). A non-zero exit
/// is a tool failure whose output still carries stdout and stderr.
pub fn run_command_tool() -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "run_command",
            "Execute a shell command and return its output",
            ToolParameters::object()
                .string("command", "The shell command to execute", true)
                .string("cwd", "Working directory (defaults to the workspace root)", false)
                .build(),
            Sensitivity::Sensitive,
            |args, ctx| async move {
                let command = args.get_str("command")?;
                let cwd = match args.get_str_opt("cwd") {
                    Some(raw) => ctx.workspace.resolve(raw),
                    None => ctx.workspace.working_dir(),
                };
                let output = ctx
                    .commands
                    .run_command(command, &cwd)
                    .await
                    .map_err(|e| KestrelError::tool("run_command", e.to_string()))?;

                let mut combined = output.stdout.clone();
                if !output.stderr.is_empty() {
                    if !combined.is_empty() && !combined.ends_with('\n') {
                        combined.push('\n');
                    }
                    combined.push_str(&output.stderr);
                }
                let combined = truncate_utf8(&combined, MAX_TOOL_OUTPUT_BYTES);
                if output.succeeded() {
                    return Ok(combined);
                }
                let status = output
                    .exit_code
                    .map_or_else(|| "terminated by signal".to_string(), |c| format!("exit code {c}"));
                Err(KestrelError::tool("run_command", format!("command failed ({status})\n{combined}")))
            },
        )
        .with_path_arguments(&["cwd"]),
    )
}

pub fn all_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        read_file_tool(),
        list_directory_tool(),
        search_tool(),
        stat_tool(),
        write_file_tool(),
        delete_path_tool(),
        run_command_tool(),
    ]
}

/// A registry holding every builtin tool.
pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in all_tools() {
        // Builtin names are distinct.
        let _ = registry.register(tool);
    }
    registry
}
