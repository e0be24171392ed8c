//! Runs tool calls on behalf of agents and reports them on the bus.
//!
//! Every invocation publishes `tool.called` first and then exactly one of
//! `tool.completed` or `tool.failed`. Failures never escape: they come back
//! as an error-flagged string result the agent can react to.

use std::sync::Arc;
use std::time::Instant;

use crate::bus::{AgentEventType, ChannelPublisher};
use crate::llm::ToolUse;
use crate::tools::{ToolContext, ToolError, ToolRegistry};

/// Outcome of one tool call, as handed back to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    /// Render for inclusion in a follow-up prompt.
    pub fn render(&self) -> String {
        if self.is_error {
            format!("[{} failed] {}", self.name, self.content)
        } else {
            format!("[{} result]\n{}", self.name, self.content)
        }
    }
}

/// Executes allowlisted tools with event emission.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    registry: Arc<ToolRegistry>,
}

impl ToolRunner {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run one tool call. Never fails; errors become the result content.
    pub async fn run(
        &self,
        call: &ToolUse,
        allowed: &[String],
        ctx: &ToolContext,
        events: Option<&ChannelPublisher>,
    ) -> ToolResult {
        Self::observe(call, events, self.dispatch(call, allowed, ctx)).await
    }

    /// Report `work` as the execution of `call`.
    ///
    /// Publishes `tool.called`, awaits `work`, then publishes exactly one of
    /// `tool.completed` or `tool.failed`.
    pub async fn observe<F>(
        call: &ToolUse,
        events: Option<&ChannelPublisher>,
        work: F,
    ) -> ToolResult
    where
        F: Future<Output = Result<String, ToolError>>,
    {
        if let Some(events) = events {
            events
                .emit(
                    AgentEventType::ToolCalled,
                    serde_json::json!({
                        "id": call.id,
                        "name": call.name,
                        "input": call.input,
                    }),
                )
                .await;
        }

        let start = Instant::now();
        let outcome = work.await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(content) => {
                tracing::debug!("Tool {} completed in {}ms", call.name, elapsed_ms);
                if let Some(events) = events {
                    events
                        .emit(
                            AgentEventType::ToolCompleted,
                            serde_json::json!({
                                "id": call.id,
                                "name": call.name,
                                "output": content,
                                "duration_ms": elapsed_ms,
                            }),
                        )
                        .await;
                }
                ToolResult {
                    tool_use_id: call.id.clone(),
                    name: call.name.clone(),
                    content,
                    is_error: false,
                }
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!("Tool {} failed: {}", call.name, message);
                if let Some(events) = events {
                    events
                        .emit(
                            AgentEventType::ToolFailed,
                            serde_json::json!({
                                "id": call.id,
                                "name": call.name,
                                "error": message,
                                "duration_ms": elapsed_ms,
                            }),
                        )
                        .await;
                }
                ToolResult {
                    tool_use_id: call.id.clone(),
                    name: call.name.clone(),
                    content: message,
                    is_error: true,
                }
            }
        }
    }

    async fn dispatch(
        &self,
        call: &ToolUse,
        allowed: &[String],
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        if !allowed.iter().any(|name| name == &call.name) {
            return Err(ToolError::NotAuthorized(format!(
                "tool '{}' is not in this agent's allowlist",
                call.name
            )));
        }
        let tool = self.registry.get(&call.name).ok_or_else(|| {
            ToolError::InvalidParameters(format!("unknown tool '{}'", call.name))
        })?;
        let output = tool.execute(call.input.clone(), ctx).await?;
        Ok(output.as_text())
    }
}
