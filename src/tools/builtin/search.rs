//! Recursive content and name search over the workspace.

use std::time::Instant;

use async_trait::async_trait;

use crate::tools::builtin::{shell_quote, truncate_output};
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

const MAX_MATCHES: usize = 200;

/// What `search_files` matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchMode {
    Content,
    Name,
}

/// `search_files`: grep file contents or match file names recursively.
#[derive(Debug, Default)]
pub struct SearchFilesTool;

impl SearchFilesTool {
    fn command(mode: SearchMode, pattern: &str, path: &str) -> String {
        match mode {
            SearchMode::Content => format!(
                "grep -rnI --exclude-dir=.git -e {} -- {} | head -n {}",
                shell_quote(pattern),
                shell_quote(path),
                MAX_MATCHES
            ),
            SearchMode::Name => format!(
                "find {} -not -path '*/.git/*' -name {} | sort | head -n {}",
                shell_quote(path),
                shell_quote(pattern),
                MAX_MATCHES
            ),
        }
    }
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "search_files"
    }

    fn description(&self) -> &str {
        "Search the workspace recursively, either inside file contents (regex) or by file \
         name (glob)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regex for content search, glob for name search"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search (default: workspace root)"
                },
                "mode": {
                    "type": "string",
                    "enum": ["content", "name"],
                    "description": "What to match (default: content)"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let pattern = require_str(&params, "pattern")?;
        let path = params.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let mode = match params.get("mode").and_then(|v| v.as_str()) {
            None | Some("content") => SearchMode::Content,
            Some("name") => SearchMode::Name,
            Some(other) => {
                return Err(ToolError::InvalidParameters(format!(
                    "unknown mode '{}', expected content or name",
                    other
                )));
            }
        };

        let start = Instant::now();
        let output = ctx
            .sandbox
            .run_command(&Self::command(mode, pattern, path), None)
            .await?;

        // grep exits 1 when nothing matched; only 2+ is a real failure.
        if output.exit_code > 1 {
            return Err(ToolError::ExecutionFailed(output.combined()));
        }

        let matches: Vec<&str> = output.stdout.lines().filter(|l| !l.is_empty()).collect();
        if matches.is_empty() {
            return Ok(ToolOutput::text("No matches found.", start.elapsed()));
        }
        Ok(ToolOutput::text(
            truncate_output(&matches.join("\n")),
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::testing::MockSandbox;

    #[test]
    fn test_commands() {
        let content = SearchFilesTool::command(SearchMode::Content, "fn main", ".");
        assert_eq!(
            content,
            "grep -rnI --exclude-dir=.git -e 'fn main' -- . | head -n 200"
        );
        let name = SearchFilesTool::command(SearchMode::Name, "*.rs", "src");
        assert!(name.starts_with("find src "));
        assert!(name.contains("-name '*.rs'"));
    }

    #[tokio::test]
    async fn test_no_matches_is_not_an_error() {
        let sandbox = Arc::new(MockSandbox::new());
        sandbox.set_command_output(
            &SearchFilesTool::command(SearchMode::Content, "zzz", "."),
            "",
            1,
        );
        let ctx = ToolContext::new("ws", sandbox);
        let out = SearchFilesTool
            .execute(serde_json::json!({"pattern": "zzz"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.as_text(), "No matches found.");
    }

    #[tokio::test]
    async fn test_bad_mode_rejected() {
        let ctx = ToolContext::new("ws", Arc::new(MockSandbox::new()));
        let err = SearchFilesTool
            .execute(serde_json::json!({"pattern": "x", "mode": "fuzzy"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }
}
