//! Error types for the sandbox capability surface.

use std::time::Duration;

/// Errors that can occur talking to a sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The target process or path no longer exists.
    ///
    /// Session management treats this on a process as a confirmed crash.
    #[error("Not found: {target}")]
    NotFound { target: String },

    /// Failed to spawn a process.
    #[error("Spawn failed: {reason}")]
    SpawnFailed { reason: String },

    /// Command execution failed inside the sandbox.
    #[error("Execution failed: {reason}")]
    ExecutionFailed { reason: String },

    /// Command timed out.
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// A path resolved outside the sandbox root.
    #[error("Path escapes sandbox: {path}")]
    PathEscape { path: String },

    /// Filesystem watcher error.
    #[error("Watch failed: {reason}")]
    WatchFailed { reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Build a not-found error for a process id.
    pub fn process_not_found(pid: u32) -> Self {
        SandboxError::NotFound {
            target: format!("process {}", pid),
        }
    }

    /// Whether the error means the target process or path is gone.
    pub fn is_not_found(&self) -> bool {
        match self {
            SandboxError::NotFound { .. } => true,
            SandboxError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<notify::Error> for SandboxError {
    fn from(err: notify::Error) -> Self {
        SandboxError::WatchFailed {
            reason: err.to_string(),
        }
    }
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
