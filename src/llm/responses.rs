//! Request/response adapter (OpenAI Responses API).
//!
//! Sends `{model, instructions, input}` and reads back a single structured
//! output list. No streaming; agents on this adapter are not offered tools.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::{retry_after, status_error};
use crate::llm::provider::{
    AgentProvider, DeltaSender, ProviderKind, ProviderMessage, ProviderRequest, ProviderResponse,
};

const PROVIDER: &str = "openai";

/// Responses API adapter.
pub struct ResponsesProvider {
    client: Client,
    api_key: SecretString,
    base_url: String,
    max_tokens: u32,
}

impl ResponsesProvider {
    /// Create the adapter. Fails when no API key is configured.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config
            .openai_api_key
            .clone()
            .ok_or(LlmError::MissingCredential {
                provider: PROVIDER.to_string(),
                env_var: "OPENAI_API_KEY",
            })?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Ok(Self {
            client,
            api_key,
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl AgentProvider for ResponsesProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Responses
    }

    fn name(&self) -> &str {
        PROVIDER
    }

    async fn complete(
        &self,
        request: ProviderRequest,
        _deltas: Option<DeltaSender>,
    ) -> Result<ProviderResponse, LlmError> {
        if !request.tools.is_empty() {
            tracing::debug!(
                "Ignoring {} tool definitions for {}",
                request.tools.len(),
                request.model
            );
        }

        let body = ResponsesRequest {
            model: request.model,
            instructions: (!request.system_prompt.is_empty()).then_some(request.system_prompt),
            input: request.prompt,
            max_output_tokens: request.max_tokens.unwrap_or(self.max_tokens),
        };

        let url = format!("{}/v1/responses", self.base_url);
        tracing::debug!("Sending request to OpenAI Responses: {}", url);

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let retry = retry_after(&response);
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(status_error(PROVIDER, status.as_u16(), retry, text));
        }

        let parsed: ResponsesResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: format!("JSON parse error: {}. Raw: {}", e, text),
            })?;

        let mut messages = Vec::new();
        for item in parsed.output {
            match item {
                OutputItem::Message { content } => {
                    for part in content {
                        if let OutputContent::OutputText { text } = part {
                            messages.push(ProviderMessage::Text(text));
                        }
                    }
                }
                OutputItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                } => {
                    let input = serde_json::from_str(&arguments)
                        .unwrap_or(serde_json::Value::String(arguments));
                    messages.push(ProviderMessage::ToolUse {
                        id: call_id,
                        name,
                        input,
                    });
                }
                OutputItem::Other => {}
            }
        }

        Ok(ProviderResponse {
            messages,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        })
    }
}

#[derive(Debug, Serialize)]
struct ResponsesRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    input: String,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    usage: ResponsesUsage,
}

#[derive(Debug, Default, Deserialize)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<OutputContent>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputContent {
    OutputText {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> LlmConfig {
        LlmConfig {
            openai_api_key: Some(SecretString::from("sk-openai")),
            openai_base_url: base_url.to_string(),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_missing_key() {
        let err = ResponsesProvider::new(&LlmConfig::default()).err().unwrap();
        assert!(matches!(
            err,
            LlmError::MissingCredential {
                env_var: "OPENAI_API_KEY",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_complete_sends_instructions_and_reads_output_list() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .and(header("authorization", "Bearer sk-openai"))
            .and(body_json(serde_json::json!({
                "model": "gpt-4.1",
                "instructions": "be brief",
                "input": "summarize",
                "max_output_tokens": 4096
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "resp_1",
                "output": [
                    {"type": "reasoning", "summary": []},
                    {"type": "message", "role": "assistant", "content": [
                        {"type": "output_text", "text": "Done.", "annotations": []}
                    ]}
                ],
                "usage": {"input_tokens": 3, "output_tokens": 2, "total_tokens": 5}
            })))
            .mount(&server)
            .await;

        let provider = ResponsesProvider::new(&config(&server.uri())).unwrap();
        let response = provider
            .complete(ProviderRequest::new("gpt-4.1", "be brief", "summarize"), None)
            .await
            .unwrap();

        assert_eq!(response.joined_text().as_deref(), Some("Done."));
        assert!(response.tool_uses().is_empty());
        assert_eq!(response.output_tokens, 2);
    }

    #[tokio::test]
    async fn test_server_error_is_request_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let provider = ResponsesProvider::new(&config(&server.uri())).unwrap();
        let err = provider
            .complete(ProviderRequest::new("gpt-4.1", "", "x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed { .. }));
        assert!(!err.is_configuration());
    }

    #[tokio::test]
    async fn test_garbage_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let provider = ResponsesProvider::new(&config(&server.uri())).unwrap();
        let err = provider
            .complete(ProviderRequest::new("gpt-4.1", "", "x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }
}
