//! File system and command collaborators used by tool handlers.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KestrelError, Result};

/// One entry returned by [`FileSystem::read_dir`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Metadata returned by [`FileSystem::stat`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub is_file: bool,
    pub is_dir: bool,
    pub size: u64,
    pub readonly: bool,
    pub modified: Option<DateTime<Utc>>,
}

/// Captured output of a shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn read_file(&self, path: &Path) -> Result<String>;

    /// Write `content`, creating missing parent directories.
    async fn write_file(&self, path: &Path, content: &str) -> Result<()>;

    /// List a directory, sorted by name.
    async fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>>;

    async fn stat(&self, path: &Path) -> Result<FileStat>;

    /// Remove a file, or a directory and everything beneath it.
    async fn delete_path(&self, path: &Path) -> Result<()>;
}

/// Runs shell commands. Implementations impose no timeout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run_command(&self, command: &str, cwd: &Path) -> Result<CommandOutput>;
}

fn io_context(path: &Path, err: std::io::Error) -> KestrelError {
    KestrelError::Io(std::io::Error::new(
        err.kind(),
        format!("{}: {err}", path.display()),
    ))
}

/// [`FileSystem`] backed by `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn read_file(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| io_context(path, e))
    }

    async fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_context(parent, e))?;
            }
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| io_context(path, e))
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let mut reader = tokio::fs::read_dir(path)
            .await
            .map_err(|e| io_context(path, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| io_context(path, e))? {
            let metadata = entry.metadata().await.map_err(|e| io_context(path, e))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn stat(&self, path: &Path) -> Result<FileStat> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| io_context(path, e))?;
        Ok(FileStat {
            is_file: metadata.is_file(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            readonly: metadata.permissions().readonly(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    async fn delete_path(&self, path: &Path) -> Result<()> {
        let metadata = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|e| io_context(path, e))?;
        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        removed.map_err(|e| io_context(path, e))
    }
}

/// [`CommandRunner`] that spawns `sh -c` (or `cmd /C` on Windows).
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCommandRunner;

#[async_trait]
impl CommandRunner for LocalCommandRunner {
    async fn run_command(&self, command: &str, cwd: &Path) -> Result<CommandOutput> {
        let mut cmd = if cfg!(windows) {
            let mut c = tokio::process::Command::new("cmd");
            c.arg("/C");
            c
        } else {
            let mut c = tokio::process::Command::new("sh");
            c.arg("-c");
            c
        };
        let output = cmd
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| io_context(cwd, e))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_creates_parents_and_read_returns_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/file.txt");
        LocalFileSystem.write_file(&path, "hello").await.unwrap();
        assert_eq!(LocalFileSystem.read_file(&path).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn read_dir_is_sorted_and_marks_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "bb").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        let entries = LocalFileSystem.read_dir(dir.path()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a");
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].size, 2);
    }

    #[tokio::test]
    async fn missing_file_error_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        let err = LocalFileSystem.read_file(&path).await.unwrap_err();
        assert!(err.to_string().contains("missing.txt"));
    }

    #[tokio::test]
    async fn delete_removes_directories_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("tree");
        std::fs::create_dir_all(target.join("inner")).unwrap();
        std::fs::write(target.join("inner/x"), "x").unwrap();
        LocalFileSystem.delete_path(&target).await.unwrap();
        assert!(!target.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_runner_captures_streams_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = LocalCommandRunner
            .run_command("echo out; echo err >&2; exit 3", dir.path())
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.succeeded());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_runs_in_requested_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();
        let out = LocalCommandRunner.run_command("ls", dir.path()).await.unwrap();
        assert!(out.stdout.contains("marker"));
    }
}
