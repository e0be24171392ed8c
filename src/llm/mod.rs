//! LLM integration for agents.
//!
//! Two adapters share one call contract:
//! - **Tool-calling** (Anthropic Messages API): tools, forced tool choice, streaming
//! - **Responses** (OpenAI Responses API): plain request/response, no tools
//!
//! The adapter for an agent is resolved once from its model identifier
//! ([`ProviderKind::for_model`]). Every call goes through the shared
//! [`RateLimiter`].

mod anthropic;
mod provider;
mod rate_limit;
mod responses;

pub use anthropic::AnthropicProvider;
pub use provider::{
    AgentProvider, DeltaSender, ProviderKind, ProviderMessage, ProviderRequest, ProviderResponse,
    ToolChoice, ToolDefinition, ToolUse,
};
pub use rate_limit::{RateLimiter, RatePermit};
pub use responses::ResponsesProvider;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{LlmConfig, RateLimitConfig};
use crate::error::LlmError;

/// The configured adapters plus the limiter every call passes through.
pub struct ProviderSet {
    providers: HashMap<ProviderKind, Arc<dyn AgentProvider>>,
    limiter: Arc<RateLimiter>,
}

impl ProviderSet {
    /// Build adapters for every provider that has a credential.
    ///
    /// Missing credentials are not an error here; they surface as
    /// [`LlmError::MissingCredential`] when an agent needs that adapter.
    pub fn from_config(llm: &LlmConfig, rate_limit: &RateLimitConfig) -> Self {
        let mut set = Self::empty(Arc::new(RateLimiter::new(rate_limit)));

        match AnthropicProvider::new(llm) {
            Ok(provider) => {
                tracing::info!("Tool-calling adapter enabled (Anthropic)");
                set = set.with_provider(Arc::new(provider));
            }
            Err(e) => tracing::debug!("Tool-calling adapter disabled: {}", e),
        }
        match ResponsesProvider::new(llm) {
            Ok(provider) => {
                tracing::info!("Responses adapter enabled (OpenAI)");
                set = set.with_provider(Arc::new(provider));
            }
            Err(e) => tracing::debug!("Responses adapter disabled: {}", e),
        }
        set
    }

    /// A set with no adapters.
    pub fn empty(limiter: Arc<RateLimiter>) -> Self {
        Self {
            providers: HashMap::new(),
            limiter,
        }
    }

    /// Register an adapter under the kind it reports.
    pub fn with_provider(mut self, provider: Arc<dyn AgentProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// The adapter for a kind, or the missing-credential error.
    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn AgentProvider>, LlmError> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| missing_credential(kind))
    }

    /// Run a request on the adapter for `kind` under the rate limiter.
    pub async fn complete(
        &self,
        kind: ProviderKind,
        request: ProviderRequest,
        deltas: Option<DeltaSender>,
    ) -> Result<ProviderResponse, LlmError> {
        let provider = self.get(kind)?;
        let _permit = self.limiter.acquire().await?;
        tracing::debug!("Calling {} for model {}", provider.name(), request.model);
        provider.complete(request, deltas).await
    }
}

fn missing_credential(kind: ProviderKind) -> LlmError {
    match kind {
        ProviderKind::ToolCalling => LlmError::MissingCredential {
            provider: "anthropic".to_string(),
            env_var: "ANTHROPIC_API_KEY",
        },
        ProviderKind::Responses => LlmError::MissingCredential {
            provider: "openai".to_string(),
            env_var: "OPENAI_API_KEY",
        },
    }
}

/// Map a non-success HTTP status to a provider error.
pub(crate) fn status_error(
    provider: &str,
    status: u16,
    retry_after: Option<Duration>,
    body: String,
) -> LlmError {
    match status {
        401 | 403 => LlmError::AuthFailed {
            provider: provider.to_string(),
        },
        429 => LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        _ => LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: format!("HTTP {}: {}", status, body),
        },
    }
}

pub(crate) fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;

    #[tokio::test]
    async fn test_missing_adapter_is_configuration_error() {
        let set = ProviderSet::from_config(&LlmConfig::default(), &RateLimitConfig::default());
        let err = set
            .complete(
                ProviderKind::ToolCalling,
                ProviderRequest::new("claude-x", "", "hi"),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(set.get(ProviderKind::Responses).is_err());
    }

    #[tokio::test]
    async fn test_registered_adapter_is_used() {
        let scripted = Arc::new(ScriptedProvider::new(vec![ProviderResponse::text("ok")]));
        let set = ProviderSet::empty(Arc::new(RateLimiter::unlimited()))
            .with_provider(scripted.clone());
        let response = set
            .complete(
                ProviderKind::ToolCalling,
                ProviderRequest::new("claude-x", "", "hi"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(response.joined_text().as_deref(), Some("ok"));
        assert_eq!(scripted.requests().len(), 1);
    }
}
