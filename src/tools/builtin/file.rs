//! File operation tools for reading, writing, and listing workspace files.
//!
//! Paths are interpreted by the sandbox, which rejects anything outside the
//! workspace root.

use std::time::Instant;

use async_trait::async_trait;

use crate::tools::builtin::{shell_quote, truncate_output};
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

/// Maximum file size for writing (5MB).
const MAX_WRITE_SIZE: usize = 5 * 1024 * 1024;

/// Maximum directory listing entries.
const MAX_DIR_ENTRIES: usize = 500;

/// `read_file`: read a text file from the workspace.
#[derive(Debug, Default)]
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file in the workspace."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace root"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let path = require_str(&params, "path")?;
        let start = Instant::now();
        let content = ctx.sandbox.read_file(path).await?;
        Ok(ToolOutput::text(truncate_output(&content), start.elapsed()))
    }
}

/// `write_file`: create or overwrite a file in the workspace.
#[derive(Debug, Default)]
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the workspace, creating parent directories as needed. \
         Overwrites existing files."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace root"
                },
                "content": {
                    "type": "string",
                    "description": "Full file content"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let path = require_str(&params, "path")?;
        let content = require_str(&params, "content")?;
        if content.len() > MAX_WRITE_SIZE {
            return Err(ToolError::InvalidParameters(format!(
                "content is {} bytes, limit is {}",
                content.len(),
                MAX_WRITE_SIZE
            )));
        }

        let start = Instant::now();
        ctx.sandbox.write_file(path, content).await?;
        Ok(ToolOutput::success(
            serde_json::json!({"path": path, "bytes_written": content.len()}),
            start.elapsed(),
        ))
    }
}

/// `list_files`: list entries under a directory.
#[derive(Debug, Default)]
pub struct ListFilesTool;

impl ListFilesTool {
    fn command(path: &str, recursive: bool) -> String {
        let depth = if recursive { "" } else { " -maxdepth 1" };
        format!(
            "find {} -mindepth 1{} -not -path '*/.git/*' -not -name .git | sort | head -n {}",
            shell_quote(path),
            depth,
            MAX_DIR_ENTRIES
        )
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files and directories under a workspace path."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (default: workspace root)"
                },
                "recursive": {
                    "type": "boolean",
                    "description": "List nested entries too (default false)"
                }
            }
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let path = params.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let recursive = params
            .get("recursive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let start = Instant::now();
        let output = ctx
            .sandbox
            .run_command(&Self::command(path, recursive), None)
            .await?;
        if !output.success() {
            return Err(ToolError::ExecutionFailed(output.combined()));
        }

        let entries: Vec<&str> = output.stdout.lines().filter(|l| !l.is_empty()).collect();
        Ok(ToolOutput::success(
            serde_json::json!({
                "path": path,
                "entries": entries,
                "truncated": entries.len() >= MAX_DIR_ENTRIES,
            }),
            start.elapsed(),
        ))
    }
}
