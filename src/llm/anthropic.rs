//! Tool-calling messages adapter (Anthropic Messages API).
//!
//! Supports tool definitions, forced tool choice, and streaming. When a delta
//! sink is supplied the request is sent with `stream: true` and the server-sent
//! event body is folded back into the same [`ProviderResponse`] a buffered call
//! would produce.

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::{retry_after, status_error};
use crate::llm::provider::{
    AgentProvider, DeltaSender, ProviderKind, ProviderMessage, ProviderRequest, ProviderResponse,
    ToolChoice,
};

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";

/// Messages API adapter.
pub struct AnthropicProvider {
    client: Client,
    api_key: secrecy::SecretString,
    base_url: String,
    max_tokens: u32,
}

impl AnthropicProvider {
    /// Create the adapter. Fails when no API key is configured.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config
            .anthropic_api_key
            .clone()
            .ok_or(LlmError::MissingCredential {
                provider: PROVIDER.to_string(),
                env_var: "ANTHROPIC_API_KEY",
            })?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Ok(Self {
            client,
            api_key,
            base_url: config.anthropic_base_url.trim_end_matches('/').to_string(),
            max_tokens: config.max_tokens,
        })
    }

    fn api_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    fn build_body(&self, req: &ProviderRequest, stream: bool) -> MessagesRequest {
        let tools: Vec<ToolSpec> = req
            .tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect();

        // A choice without tools is rejected by the API.
        let tool_choice = if tools.is_empty() {
            None
        } else {
            req.tool_choice.as_ref().map(ToolChoiceSpec::from)
        };

        MessagesRequest {
            model: req.model.clone(),
            max_tokens: req.max_tokens.unwrap_or(self.max_tokens),
            system: (!req.system_prompt.is_empty()).then(|| req.system_prompt.clone()),
            messages: vec![MessageParam {
                role: "user",
                content: req.prompt.clone(),
            }],
            tools: (!tools.is_empty()).then_some(tools),
            tool_choice,
            stream,
        }
    }

    async fn send(&self, body: &MessagesRequest) -> Result<reqwest::Response, LlmError> {
        let url = self.api_url();
        tracing::debug!("Sending request to Anthropic: {} (stream={})", url, body.stream);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Anthropic request failed: {}", e);
                LlmError::RequestFailed {
                    provider: PROVIDER.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = retry_after(&response);
        let text = response.text().await.unwrap_or_default();
        tracing::debug!("Anthropic error {}: {}", status, text);
        Err(status_error(PROVIDER, status.as_u16(), retry_after, text))
    }

    async fn read_stream(
        &self,
        response: reqwest::Response,
        deltas: &DeltaSender,
    ) -> Result<ProviderResponse, LlmError> {
        let mut decoder = SseDecoder::default();
        let mut acc = StreamAccumulator::default();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("stream interrupted: {}", e),
            })?;
            for data in decoder.push(&chunk) {
                if let Some(delta) = acc.apply(&data)? {
                    // Receiver gone just means nobody is watching.
                    let _ = deltas.send(delta);
                }
            }
        }
        for data in decoder.finish() {
            if let Some(delta) = acc.apply(&data)? {
                let _ = deltas.send(delta);
            }
        }

        acc.finish()
    }
}

#[async_trait]
impl AgentProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ToolCalling
    }

    fn name(&self) -> &str {
        PROVIDER
    }

    async fn complete(
        &self,
        request: ProviderRequest,
        deltas: Option<DeltaSender>,
    ) -> Result<ProviderResponse, LlmError> {
        let body = self.build_body(&request, deltas.is_some());
        let response = self.send(&body).await?;

        if let Some(deltas) = deltas {
            return self.read_stream(response, &deltas).await;
        }

        let text = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        })?;
        let parsed: MessagesResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: format!("JSON parse error: {}. Raw: {}", e, text),
            })?;

        Ok(ProviderResponse {
            messages: parsed
                .content
                .into_iter()
                .filter_map(ContentBlock::into_message)
                .collect(),
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        })
    }
}

// --- wire types ---

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<MessageParam>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoiceSpec>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct MessageParam {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ToolSpec {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ToolChoiceSpec {
    Auto,
    Any,
    None,
    Tool { name: String },
}

impl From<&ToolChoice> for ToolChoiceSpec {
    fn from(choice: &ToolChoice) -> Self {
        match choice {
            ToolChoice::Auto => ToolChoiceSpec::Auto,
            ToolChoice::Any => ToolChoiceSpec::Any,
            ToolChoice::None => ToolChoiceSpec::None,
            ToolChoice::Tool(name) => ToolChoiceSpec::Tool { name: name.clone() },
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

impl ContentBlock {
    fn into_message(self) -> Option<ProviderMessage> {
        match self {
            ContentBlock::Text { text } => Some(ProviderMessage::Text(text)),
            ContentBlock::ToolUse { id, name, input } => {
                Some(ProviderMessage::ToolUse { id, name, input })
            }
            ContentBlock::Other => None,
        }
    }
}

// --- streaming ---

/// Splits a server-sent event byte stream into `data:` payloads.
///
/// Bytes are buffered raw and only whole lines are decoded, so a multi-byte
/// character split across network chunks survives intact.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: BytesMut,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed bytes, returning the payloads of every event completed by them.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            let line = String::from_utf8_lossy(&line);
            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.trim_start().to_string());
            }
        }
        events
    }

    /// Flush an event left unterminated at end of stream.
    pub(crate) fn finish(&mut self) -> Vec<String> {
        let mut events = self.push(b"\n");
        if !self.data.is_empty() {
            events.push(self.data.join("\n"));
            self.data.clear();
        }
        events
    }
}

#[derive(Debug)]
enum PartialBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        json: String,
    },
    Skipped,
}

/// Folds streamed events into a complete response.
#[derive(Debug, Default)]
pub(crate) struct StreamAccumulator {
    blocks: Vec<PartialBlock>,
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: serde_json::Value,
    },
    ContentBlockDelta {
        index: usize,
        delta: serde_json::Value,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<Usage>,
    },
    Error {
        error: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: Usage,
}

impl StreamAccumulator {
    /// Apply one event payload; returns any text delta it carried.
    pub(crate) fn apply(&mut self, data: &str) -> Result<Option<String>, LlmError> {
        let event: StreamEvent =
            serde_json::from_str(data).map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: format!("bad stream event: {}. Raw: {}", e, data),
            })?;

        match event {
            StreamEvent::MessageStart { message } => {
                self.input_tokens = message.usage.input_tokens;
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let block = match content_block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => PartialBlock::Text(
                        content_block["text"].as_str().unwrap_or_default().to_string(),
                    ),
                    Some("tool_use") => PartialBlock::ToolUse {
                        id: content_block["id"].as_str().unwrap_or_default().to_string(),
                        name: content_block["name"].as_str().unwrap_or_default().to_string(),
                        json: String::new(),
                    },
                    _ => PartialBlock::Skipped,
                };
                while self.blocks.len() < index {
                    self.blocks.push(PartialBlock::Skipped);
                }
                if index < self.blocks.len() {
                    self.blocks[index] = block;
                } else {
                    self.blocks.push(block);
                }
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let kind = delta.get("type").and_then(|t| t.as_str());
                match (self.blocks.get_mut(index), kind) {
                    (Some(PartialBlock::Text(text)), Some("text_delta")) => {
                        let piece = delta["text"].as_str().unwrap_or_default();
                        text.push_str(piece);
                        if !piece.is_empty() {
                            return Ok(Some(piece.to_string()));
                        }
                    }
                    (Some(PartialBlock::ToolUse { json, .. }), Some("input_json_delta")) => {
                        json.push_str(delta["partial_json"].as_str().unwrap_or_default());
                    }
                    _ => {}
                }
            }
            StreamEvent::MessageDelta { usage } => {
                if let Some(usage) = usage {
                    self.output_tokens = usage.output_tokens;
                }
            }
            StreamEvent::Error { error } => {
                return Err(LlmError::RequestFailed {
                    provider: PROVIDER.to_string(),
                    reason: format!("stream error: {}", error),
                });
            }
            StreamEvent::Other => {}
        }
        Ok(None)
    }

    /// Produce the final response.
    pub(crate) fn finish(self) -> Result<ProviderResponse, LlmError> {
        let mut messages = Vec::with_capacity(self.blocks.len());
        for block in self.blocks {
            match block {
                PartialBlock::Text(text) => messages.push(ProviderMessage::Text(text)),
                PartialBlock::ToolUse { id, name, json } => {
                    let input = if json.trim().is_empty() {
                        serde_json::json!({})
                    } else {
                        serde_json::from_str(&json).map_err(|e| LlmError::InvalidResponse {
                            provider: PROVIDER.to_string(),
                            reason: format!("tool input for {} is not JSON: {}", name, e),
                        })?
                    };
                    messages.push(ProviderMessage::ToolUse { id, name, input });
                }
                PartialBlock::Skipped => {}
            }
        }
        Ok(ProviderResponse {
            messages,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::llm::provider::ToolDefinition;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> LlmConfig {
        LlmConfig {
            anthropic_api_key: Some(secrecy::SecretString::from("sk-test")),
            anthropic_base_url: base_url.to_string(),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_missing_key_is_configuration_error() {
        let err = AnthropicProvider::new(&LlmConfig::default()).err().unwrap();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn test_body_omits_tool_choice_without_tools() {
        let provider = AnthropicProvider::new(&config("http://localhost")).unwrap();
        let req = ProviderRequest::new("claude-x", "", "hi").with_tool_choice(ToolChoice::Any);
        let body = serde_json::to_value(provider.build_body(&req, false)).unwrap();
        assert!(body.get("tool_choice").is_none());
        assert!(body.get("system").is_none());
        assert!(body.get("stream").is_none());
        assert_eq!(body["max_tokens"], 4096);
    }

    #[test]
    fn test_forced_tool_choice_wire_form() {
        let provider = AnthropicProvider::new(&config("http://localhost")).unwrap();
        let req = ProviderRequest::new("claude-x", "sys", "hi")
            .with_tools(vec![ToolDefinition {
                name: "route".to_string(),
                description: "pick".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            }])
            .with_tool_choice(ToolChoice::Tool("route".to_string()));
        let body = serde_json::to_value(provider.build_body(&req, true)).unwrap();
        assert_eq!(body["tool_choice"], serde_json::json!({"type": "tool", "name": "route"}));
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["stream"], true);
    }

    #[tokio::test]
    async fn test_complete_parses_text_and_tool_use() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-test"))
            .and(header("anthropic-version", API_VERSION))
            .and(body_partial_json(serde_json::json!({"model": "claude-x"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [
                    {"type": "text", "text": "Looking."},
                    {"type": "tool_use", "id": "tu_1", "name": "read_file", "input": {"path": "a.txt"}}
                ],
                "usage": {"input_tokens": 12, "output_tokens": 7},
                "stop_reason": "tool_use"
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(&config(&server.uri())).unwrap();
        let response = provider
            .complete(ProviderRequest::new("claude-x", "sys", "hello"), None)
            .await
            .unwrap();

        assert_eq!(response.joined_text().as_deref(), Some("Looking."));
        let uses = response.tool_uses();
        assert_eq!(uses[0].id, "tu_1");
        assert_eq!(uses[0].input["path"], "a.txt");
        assert_eq!(response.input_tokens, 12);
        assert_eq!(response.output_tokens, 7);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(&config(&server.uri())).unwrap();
        let err = provider
            .complete(ProviderRequest::new("claude-x", "", "hi"), None)
            .await
            .unwrap_err();
        match err {
            LlmError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(3)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(
            status_error(PROVIDER, 401, None, String::new()),
            LlmError::AuthFailed { .. }
        ));
        assert!(matches!(
            status_error(PROVIDER, 500, None, "boom".to_string()),
            LlmError::RequestFailed { .. }
        ));
    }

    const STREAM_BODY: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5,\"output_tokens\":0}}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"tu_9\",\"name\":\"git\",\"input\":{}}}\n\n",
        "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"args\\\":\"}}\n\n",
        "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\" \\\"status\\\"}\"}}\n\n",
        "data: {\"type\":\"content_block_stop\",\"index\":1}\n\n",
        "event: ping\n",
        "data: {\"type\":\"ping\"}\n\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":9}}\n\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::default();
        let mut events = Vec::new();
        for chunk in STREAM_BODY.as_bytes().chunks(7) {
            events.extend(decoder.push(chunk));
        }
        events.extend(decoder.finish());
        assert_eq!(events.len(), 12);
        assert!(events[0].contains("message_start"));
    }

    #[test]
    fn test_decoder_keeps_characters_split_across_chunks() {
        let body = "data: {\"t\":\"é 日本\"}\r\n\n".as_bytes();
        let split = body.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let mut decoder = SseDecoder::default();

        assert!(decoder.push(&body[..split]).is_empty());
        let mut events = decoder.push(&body[split..split + 4]);
        events.extend(decoder.push(&body[split + 4..]));
        assert_eq!(events, vec!["{\"t\":\"é 日本\"}".to_string()]);
    }

    #[test]
    fn test_accumulator_rebuilds_blocks() {
        let mut decoder = SseDecoder::default();
        let mut acc = StreamAccumulator::default();
        let mut deltas = Vec::new();
        for data in decoder.push(STREAM_BODY.as_bytes()) {
            if let Some(d) = acc.apply(&data).unwrap() {
                deltas.push(d);
            }
        }
        let response = acc.finish().unwrap();

        assert_eq!(deltas, vec!["Hel", "lo"]);
        assert_eq!(response.joined_text().as_deref(), Some("Hello"));
        let uses = response.tool_uses();
        assert_eq!(uses[0].name, "git");
        assert_eq!(uses[0].input, serde_json::json!({"args": "status"}));
        assert_eq!(response.input_tokens, 5);
        assert_eq!(response.output_tokens, 9);
    }

    #[test]
    fn test_stream_error_event_fails() {
        let mut acc = StreamAccumulator::default();
        let err = acc
            .apply(r#"{"type":"error","error":{"type":"overloaded_error"}}"#)
            .unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed { .. }));
    }

    #[tokio::test]
    async fn test_streaming_forwards_deltas() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(serde_json::json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(STREAM_BODY),
            )
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new(&config(&server.uri())).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let response = provider
            .complete(ProviderRequest::new("claude-x", "", "hi"), Some(tx))
            .await
            .unwrap();

        assert_eq!(response.joined_text().as_deref(), Some("Hello"));
        let mut streamed = String::new();
        while let Ok(piece) = rx.try_recv() {
            streamed.push_str(&piece);
        }
        assert_eq!(streamed, "Hello");
    }
}
