//! Configuration for the host-backed sandbox.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for [`LocalSandbox`](super::LocalSandbox).
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Directory every path and command is confined to.
    pub root: PathBuf,
    /// Shell used for commands and interactive processes.
    pub shell: String,
    /// Maximum captured output per stream, in bytes.
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            shell: default_shell(),
            max_output_bytes: 64 * 1024, // 64 KB
        }
    }
}

impl SandboxConfig {
    /// Create a config rooted at a directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }
}

/// Sandbox inactivity timeout. Interactive sessions are reclaimed after this.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

fn default_shell() -> String {
    if cfg!(target_os = "windows") {
        "cmd".to_string()
    } else {
        "sh".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_root() {
        let config = SandboxConfig::with_root("/tmp/ws");
        assert_eq!(config.root, PathBuf::from("/tmp/ws"));
        assert_eq!(config.max_output_bytes, 64 * 1024);
    }

    #[test]
    fn test_inactivity_timeout_is_four_hours() {
        assert_eq!(INACTIVITY_TIMEOUT.as_secs(), 14_400);
    }
}
