//! Version-control passthrough.

use std::time::Instant;

use async_trait::async_trait;

use crate::tools::builtin::{shell_quote, truncate_output};
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput};

/// `git`: run a git subcommand in the workspace.
#[derive(Debug, Default)]
pub struct GitTool;

impl GitTool {
    /// Build the command line from an argument array or a plain string.
    fn command(params: &serde_json::Value) -> Result<String, ToolError> {
        let args: Vec<String> = match params.get("args") {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        ToolError::InvalidParameters("'args' must contain strings".to_string())
                    })
                })
                .collect::<Result<_, _>>()?,
            Some(serde_json::Value::String(s)) => {
                s.split_whitespace().map(str::to_string).collect()
            }
            _ => {
                return Err(ToolError::InvalidParameters(
                    "missing 'args' parameter".to_string(),
                ));
            }
        };

        // Leading "git" is tolerated so `git status` and `status` both work.
        let args: Vec<&str> = match args.split_first() {
            Some((first, rest)) if first == "git" => rest.iter().map(String::as_str).collect(),
            _ => args.iter().map(String::as_str).collect(),
        };
        if args.is_empty() {
            return Err(ToolError::InvalidParameters(
                "no git subcommand given".to_string(),
            ));
        }

        let quoted: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();
        Ok(format!("git {}", quoted.join(" ")))
    }
}

#[async_trait]
impl Tool for GitTool {
    fn name(&self) -> &str {
        "git"
    }

    fn description(&self) -> &str {
        "Run a git command in the workspace repository, e.g. [\"status\"] or \
         [\"commit\", \"-m\", \"message\"]."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "args": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Arguments after `git`"
                }
            },
            "required": ["args"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let command = Self::command(&params)?;
        let start = Instant::now();
        let output = ctx.sandbox.run_command(&command, None).await?;

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
