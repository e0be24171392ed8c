//! Event taxonomy and topics.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentEventType {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "text.delta")]
    TextDelta,
    #[serde(rename = "text.completed")]
    TextCompleted,
    #[serde(rename = "tool.called")]
    ToolCalled,
    #[serde(rename = "tool.completed")]
    ToolCompleted,
    #[serde(rename = "tool.failed")]
    ToolFailed,
    #[serde(rename = "part.created")]
    PartCreated,
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "step.failed")]
    StepFailed,
}

impl AgentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentEventType::RunStarted => "run.started",
            AgentEventType::RunCompleted => "run.completed",
            AgentEventType::RunFailed => "run.failed",
            AgentEventType::TextDelta => "text.delta",
            AgentEventType::TextCompleted => "text.completed",
            AgentEventType::ToolCalled => "tool.called",
            AgentEventType::ToolCompleted => "tool.completed",
            AgentEventType::ToolFailed => "tool.failed",
            AgentEventType::PartCreated => "part.created",
            AgentEventType::StepStarted => "step.started",
            AgentEventType::StepCompleted => "step.completed",
            AgentEventType::StepFailed => "step.failed",
        }
    }

    /// Topic this kind of event is published on.
    ///
    /// Run and step lifecycle goes to `status`; content and tool traffic to
    /// `messages`.
    pub fn topic(&self) -> Topic {
        match self {
            AgentEventType::RunStarted
            | AgentEventType::RunCompleted
            | AgentEventType::RunFailed
            | AgentEventType::StepStarted
            | AgentEventType::StepCompleted
            | AgentEventType::StepFailed => Topic::Status,
            AgentEventType::TextDelta
            | AgentEventType::TextCompleted
            | AgentEventType::ToolCalled
            | AgentEventType::ToolCompleted
            | AgentEventType::ToolFailed
            | AgentEventType::PartCreated => Topic::Messages,
        }
    }
}

impl fmt::Display for AgentEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, timestamped fact about execution progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub event_type: AgentEventType,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl AgentEvent {
    /// Create an event stamped with the current time.
    pub fn new(event_type: AgentEventType, data: serde_json::Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// A topic partitions concerns within a workspace channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Topic {
    Messages,
    Status,
    FileChange,
    TerminalOutput,
    Custom(String),
}

impl Topic {
    pub fn as_str(&self) -> &str {
        match self {
            Topic::Messages => "messages",
            Topic::Status => "status",
            Topic::FileChange => "file-change",
            Topic::TerminalOutput => "terminal-output",
            Topic::Custom(name) => name,
        }
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        match s.as_str() {
            "messages" => Topic::Messages,
            "status" => Topic::Status,
            "file-change" => Topic::FileChange,
            "terminal-output" => Topic::TerminalOutput,
            _ => Topic::Custom(s),
        }
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Topic::from(s.to_string())
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.as_str().to_string()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
