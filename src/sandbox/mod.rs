//! Sandbox capability surface.
//!
//! The engine never talks to a compute host directly. Everything it needs
//! from a sandbox goes through the [`Sandbox`] trait:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Sandbox                               │
//! │                                                               │
//! │  run_command(cmd, timeout)      ──▶ stdout / stderr / exit    │
//! │  open_interactive_process(...)  ──▶ pid (+ on_data chunks)    │
//! │  send_input(pid, bytes)                                       │
//! │  kill_process(pid)                                            │
//! │  read_file / write_file                                       │
//! │  watch_directory(path, recursive, on_event) ──▶ WatchHandle   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation reports a vanished process or path as
//! [`SandboxError::NotFound`].

mod config;
mod error;
mod local;

pub use config::{INACTIVITY_TIMEOUT, SandboxConfig};
pub use error::{Result, SandboxError};
pub use local::LocalSandbox;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Output of a one-shot command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    /// Combined output in the form handed back to agents.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n\n--- stderr ---\n{}", self.stdout, self.stderr)
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Terminal geometry and working directory for an interactive process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOptions {
    pub cols: u16,
    pub rows: u16,
    pub cwd: String,
}

/// Kind of filesystem change reported by a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    Create,
    Modify,
    Delete,
}

/// A single filesystem change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    #[serde(rename = "type")]
    pub kind: FileChangeKind,
    pub path: String,
}

/// Callback receiving raw output chunks from an interactive process.
pub type OutputCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback receiving filesystem changes.
pub type WatchCallback = Arc<dyn Fn(FileChange) + Send + Sync>;

/// Handle to an active directory watcher.
pub trait WatchHandle: Send + Sync {
    /// Stop delivering events. Idempotent.
    fn stop(&self);
}

/// The capabilities the engine consumes from a remote execution sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run a command to completion. `None` means no timeout.
    async fn run_command(&self, cmd: &str, timeout: Option<Duration>) -> Result<CommandOutput>;

    /// Open a long-lived interactive process. Output is delivered to `on_data`.
    async fn open_interactive_process(
        &self,
        options: ProcessOptions,
        on_data: Option<OutputCallback>,
    ) -> Result<u32>;

    /// Write raw bytes to a process's input stream.
    async fn send_input(&self, pid: u32, data: &[u8]) -> Result<()>;

    /// Kill a process.
    async fn kill_process(&self, pid: u32) -> Result<()>;

    /// Read a file as text.
    async fn read_file(&self, path: &str) -> Result<String>;

    /// Write (create or replace) a file.
    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    /// Watch a directory for changes.
    async fn watch_directory(
        &self,
        path: &str,
        recursive: bool,
        on_event: WatchCallback,
    ) -> Result<Box<dyn WatchHandle>>;
}

/// Convert a millisecond timeout where `0` means unbounded.
pub fn timeout_from_millis(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output() {
        let out = CommandOutput {
            stdout: "ok".to_string(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert_eq!(out.combined(), "ok");
        assert!(out.success());

        let out = CommandOutput {
            stdout: "a".to_string(),
            stderr: "b".to_string(),
            exit_code: 2,
        };
        assert_eq!(out.combined(), "a\n\n--- stderr ---\nb");
        assert!(!out.success());
    }

    #[test]
    fn test_zero_timeout_is_unbounded() {
        assert_eq!(timeout_from_millis(0), None);
        assert_eq!(timeout_from_millis(1500), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_file_change_serializes_with_type_tag() {
        let change = FileChange {
            kind: FileChangeKind::Delete,
            path: "src/main.rs".to_string(),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json, serde_json::json!({"type": "delete", "path": "src/main.rs"}));
    }
}
