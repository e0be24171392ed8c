//! Error types for the engine.
//!
//! Errors fall into a small taxonomy:
//! - configuration errors (missing credential, tool, or agent) are fatal and never retried
//! - transient execution errors (provider or sandbox failures) are retried by the executor
//! - session-crash errors get a dedicated variant so callers can offer a restart
//! - tool errors never escape a tool call; they are reported as results instead

use std::time::Duration;

use uuid::Uuid;

use crate::agent::TaskStatus;
use crate::sandbox::SandboxError;

/// Errors from language-model provider adapters.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Missing credential for provider {provider}: set {env_var}")]
    MissingCredential {
        provider: String,
        env_var: &'static str,
    },

    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited the request")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} rejected the credential")]
    AuthFailed { provider: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

impl LlmError {
    /// Configuration problems surface immediately instead of being retried.
    pub fn is_configuration(&self) -> bool {
        matches!(self, LlmError::MissingCredential { .. })
    }
}

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} already exists")]
    Conflict { entity: &'static str, id: String },

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Errors from the task executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Provider(#[from] LlmError),

    #[error("Agent produced no output")]
    EmptyOutput,

    #[error("Tool loop exceeded {0} rounds without a final answer")]
    ToolRoundsExceeded(usize),

    #[error("Illegal task transition from {from} to {to}")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExecutorError {
    /// Whether the retry loop should give up without consuming an attempt.
    pub fn is_configuration(&self) -> bool {
        match self {
            ExecutorError::Config(_) => true,
            ExecutorError::Provider(e) => e.is_configuration(),
            ExecutorError::IllegalTransition { .. } | ExecutorError::Store(_) => true,
            ExecutorError::EmptyOutput | ExecutorError::ToolRoundsExceeded(_) => false,
        }
    }
}

/// Errors from the broker (key-value and pub/sub).
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid subscription pattern: {0}")]
    InvalidPattern(String),
}

/// Errors from the realtime bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Malformed subscription token: {0}")]
    MalformedToken(String),

    #[error("Subscription token expired")]
    TokenExpired,

    #[error("Subscription token grants no topics")]
    NoTopics,

    #[error("Too many subscribers (limit {0})")]
    TooManySubscribers(u64),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Errors from the interactive session manager.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No active session for workspace {0}")]
    NoActiveSession(String),

    #[error("Session for workspace {0} expired, restart it")]
    SessionExpired(String),

    #[error("Session for workspace {0} is busy with another send")]
    SessionBusy(String),

    #[error("Corrupt session descriptor for workspace {workspace}: {value}")]
    CorruptDescriptor { workspace: String, value: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Errors from the orchestration network.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error(transparent)]
    Provider(#[from] LlmError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Execution {0} cannot move from {1} to {2}")]
    IllegalExecutionTransition(Uuid, String, String),
}

/// Errors loading configuration or agent definitions.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to read agent definitions from {path}: {reason}")]
    AgentDefinitions { path: String, reason: String },
}
