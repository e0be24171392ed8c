//! Provider-neutral request/response types and the adapter trait.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::LlmError;

/// Which adapter serves a model.
///
/// Resolved once when an agent is loaded or created, never re-parsed per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Tool-calling, streaming-capable messages adapter.
    ToolCalling,
    /// Request/response adapter returning one structured output list.
    Responses,
}

impl ProviderKind {
    /// Resolve the adapter for a model identifier.
    pub fn for_model(model: &str) -> Self {
        let model = model.trim().to_lowercase();
        let bare = model.strip_prefix("anthropic/").unwrap_or(&model);
        if bare.starts_with("claude") {
            ProviderKind::ToolCalling
        } else {
            ProviderKind::Responses
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::ToolCalling => "tool_calling",
            ProviderKind::Responses => "responses",
        }
    }

    /// Whether agents on this adapter can be offered tools.
    pub fn supports_tools(&self) -> bool {
        matches!(self, ProviderKind::ToolCalling)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definition of a tool offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// How the model may pick tools.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ToolChoice {
    #[default]
    Auto,
    /// Must call some tool.
    Any,
    None,
    /// Must call this tool.
    Tool(String),
}

/// One call to a provider adapter.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub system_prompt: String,
    pub prompt: String,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    pub max_tokens: Option<u32>,
}

impl ProviderRequest {
    /// Create a request without tools.
    pub fn new(
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            system_prompt: system_prompt.into(),
            prompt: prompt.into(),
            tools: Vec::new(),
            tool_choice: None,
            max_tokens: None,
        }
    }

    /// Offer tools to the model.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A structured message produced by the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderMessage {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

/// Everything one provider call produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResponse {
    pub messages: Vec<ProviderMessage>,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl ProviderResponse {
    /// Response consisting of a single text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            messages: vec![ProviderMessage::Text(text.into())],
            ..Self::default()
        }
    }

    /// All text joined, or `None` when the model produced no non-empty text.
    pub fn joined_text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter_map(|m| match m {
                ProviderMessage::Text(t) if !t.trim().is_empty() => Some(t.as_str()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }

    /// Tool-use payloads in emission order.
    pub fn tool_uses(&self) -> Vec<ToolUse> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                ProviderMessage::ToolUse { id, name, input } => Some(ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                ProviderMessage::Text(_) => None,
            })
            .collect()
    }
}

/// A tool the model asked to run.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Receives incremental text while a streaming adapter generates.
pub type DeltaSender = mpsc::UnboundedSender<String>;

/// A provider adapter.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Which adapter this is.
    fn kind(&self) -> ProviderKind;

    /// Short name for logs and errors.
    fn name(&self) -> &str;

    /// Run one request. Streaming adapters forward text deltas to `deltas`.
    async fn complete(
        &self,
        request: ProviderRequest,
        deltas: Option<DeltaSender>,
    ) -> Result<ProviderResponse, LlmError>;
}
