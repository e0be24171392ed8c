//! Tool trait and types.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::ToolDefinition;
use crate::sandbox::{Sandbox, SandboxError};

/// Error type for tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),
}

impl From<SandboxError> for ToolError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Timeout(d) => ToolError::Timeout(d),
            SandboxError::PathEscape { path } => {
                ToolError::NotAuthorized(format!("path escapes the workspace: {}", path))
            }
            other => ToolError::Sandbox(other.to_string()),
        }
    }
}

/// Output from a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    /// The result data.
    pub result: serde_json::Value,
    /// Time taken.
    pub duration: Duration,
}

impl ToolOutput {
    /// Create a successful output with a JSON result.
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self { result, duration }
    }

    /// Create a text output.
    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: serde_json::Value::String(text.into()),
            duration,
        }
    }

    /// Result as the string handed back to the model.
    pub fn as_text(&self) -> String {
        match &self.result {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// What a tool may touch while it runs.
#[derive(Clone)]
pub struct ToolContext {
    /// Workspace the calling agent works in.
    pub workspace_id: String,
    /// Sandbox hosting the workspace.
    pub sandbox: Arc<dyn Sandbox>,
}

impl ToolContext {
    pub fn new(workspace_id: impl Into<String>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            sandbox,
        }
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("workspace_id", &self.workspace_id)
            .finish_non_exhaustive()
    }
}

/// Trait for tools that agents can use.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name.
    fn name(&self) -> &str;

    /// Get a description of what the tool does.
    fn description(&self) -> &str;

    /// Get the JSON Schema for the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given parameters.
    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;

    /// Get the definition offered to the model.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Extract a required string parameter.
pub(crate) fn require_str<'a>(
    params: &'a serde_json::Value,
    name: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{}' parameter", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_errors_map_to_tool_errors() {
        let err: ToolError = SandboxError::Timeout(Duration::from_secs(1)).into();
        assert!(matches!(err, ToolError::Timeout(_)));

        let err: ToolError = SandboxError::PathEscape {
            path: "../etc".to_string(),
        }
        .into();
        assert!(matches!(err, ToolError::NotAuthorized(_)));

        let err: ToolError = SandboxError::process_not_found(7).into();
        assert!(matches!(err, ToolError::Sandbox(_)));
    }

    #[test]
    fn test_output_text() {
        let out = ToolOutput::text("hi", Duration::ZERO);
        assert_eq!(out.as_text(), "hi");
        let out = ToolOutput::success(serde_json::json!({"exit_code": 0}), Duration::ZERO);
        assert_eq!(out.as_text(), r#"{"exit_code":0}"#);
    }

    #[test]
    fn test_require_str() {
        let params = serde_json::json!({"path": "a.txt", "n": 1});
        assert_eq!(require_str(&params, "path").unwrap(), "a.txt");
        assert!(matches!(
            require_str(&params, "n"),
            Err(ToolError::InvalidParameters(_))
        ));
    }
}
