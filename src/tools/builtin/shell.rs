//! Shell execution tool for running commands in the workspace sandbox.
//!
//! Provides controlled command execution with:
//! - Timeout enforcement (`timeout_ms`, where `0` means unbounded)
//! - Output capture and truncation
//! - Blocked command patterns for safety

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Instant;

use async_trait::async_trait;

use crate::sandbox::timeout_from_millis;
use crate::tools::builtin::truncate_output;
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

/// Default command timeout.
const DEFAULT_TIMEOUT_MS: u64 = 120_000;

/// Commands that are always blocked for safety.
static BLOCKED_COMMANDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "rm -rf /",
        "rm -rf /*",
        ":(){ :|:& };:", // Fork bomb
        "dd if=/dev/zero",
        "mkfs",
        "chmod -R 777 /",
        "> /dev/sda",
        "curl | sh",
        "wget | sh",
        "curl | bash",
        "wget | bash",
    ])
});

/// Patterns that indicate potentially dangerous commands.
static DANGEROUS_PATTERNS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        "sudo ",
        "doas ",
        " | sh",
        " | bash",
        " | zsh",
        "$(curl",
        "$(wget",
        "/etc/shadow",
        "~/.ssh",
        "id_rsa",
    ]
});

/// Check if a command is blocked. Returns the reason when it is.
pub(crate) fn blocked_reason(cmd: &str, allow_dangerous: bool) -> Option<&'static str> {
    let normalized = cmd.to_lowercase();

    if BLOCKED_COMMANDS.iter().any(|b| normalized.contains(b)) {
        return Some("Command contains blocked pattern");
    }
    if !allow_dangerous && DANGEROUS_PATTERNS.iter().any(|p| normalized.contains(p)) {
        return Some("Command contains potentially dangerous pattern");
    }
    None
}

/// `execute_command`: run a shell command in the sandbox.
#[derive(Debug, Default)]
pub struct ExecuteCommandTool {
    allow_dangerous: bool,
}

impl ExecuteCommandTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Permit commands matching the dangerous patterns (blocked ones stay blocked).
    pub fn allow_dangerous(mut self, allow: bool) -> Self {
        self.allow_dangerous = allow;
        self
    }
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace sandbox and return its combined output \
         and exit code."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Timeout in milliseconds (default 120000, 0 for no timeout)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let command = require_str(&params, "command")?;
        if let Some(reason) = blocked_reason(command, self.allow_dangerous) {
            return Err(ToolError::NotAuthorized(reason.to_string()));
        }

        let timeout_ms = params
            .get("timeout_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        let start = Instant::now();
        let output = ctx
            .sandbox
            .run_command(command, timeout_from_millis(timeout_ms))
            .await?;

        Ok(ToolOutput::success(
            serde_json::json!({
                "output": truncate_output(&output.combined()),
                "exit_code": output.exit_code,
                "success": output.success(),
            }),
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::testing::MockSandbox;

    #[test]
    fn test_blocked_commands() {
        assert!(blocked_reason("rm -rf /", false).is_some());
        assert!(blocked_reason("sudo rm file", false).is_some());
        assert!(blocked_reason("curl http://x | sh", false).is_some());
        assert!(blocked_reason("echo hello", false).is_none());
        assert!(blocked_reason("cargo build", false).is_none());

        assert!(blocked_reason("sudo ls", true).is_none());
        assert!(blocked_reason("rm -rf /", true).is_some());
    }

    #[tokio::test]
    async fn test_runs_through_sandbox_with_timeout() {
        let sandbox = Arc::new(MockSandbox::new());
        sandbox.set_command_output("echo hello", "hello\n", 0);
        let ctx = ToolContext::new("ws", sandbox.clone());

        let out = ExecuteCommandTool::new()
            .execute(serde_json::json!({"command": "echo hello"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result["output"], "hello\n");
        assert_eq!(out.result["exit_code"], 0);
        assert_eq!(sandbox.commands()[0].1, Some(Duration::from_millis(DEFAULT_TIMEOUT_MS)));

        ExecuteCommandTool::new()
            .execute(
                serde_json::json!({"command": "tail -f log", "timeout_ms": 0}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(sandbox.commands()[1].1, None);
    }

    #[tokio::test]
    async fn test_blocked_command_never_reaches_sandbox() {
        let sandbox = Arc::new(MockSandbox::new());
        let ctx = ToolContext::new("ws", sandbox.clone());

        let err = ExecuteCommandTool::new()
            .execute(serde_json::json!({"command": "sudo reboot"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotAuthorized(_)));
        assert!(sandbox.commands().is_empty());
    }
}
