//! Anthropic Messages API client
//!
//! Streams one session over SSE, forwarding text/thinking deltas and
//! complete tool-use blocks as chunks. Rate limits surface the server's
//! `retry-after` hint; other HTTP failures carry their status for the
//! runner's retry classification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::LlmConfig;

use super::{
    CompletionResponse, LlmError, PermissionDecision, SessionRequest, StreamChunk, TokenUsage, ToolGate,
};

/// Anthropic Claude API client
pub struct AnthropicClient {
    api_key: String,
    base_url: String,
    http: Client,
    max_tokens: u32,
    context_max: u64,
}

impl AnthropicClient {
    /// Create a client from configuration. The API key is read from the
    /// environment variable named in the config.
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| LlmError::InvalidResponse(format!("Environment variable {} not set", config.api_key_env)))?;

        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| LlmError::from_transport(&e))?;

        Ok(Self {
            api_key,
            base_url: config.base_url.clone(),
            http,
            max_tokens: config.max_tokens,
            context_max: config.context_max,
        })
    }

    fn build_request_body(&self, request: &SessionRequest) -> serde_json::Value {
        serde_json::json!({
            "model": request.model,
            "max_tokens": self.max_tokens,
            "system": request.system_prompt,
            "messages": [{ "role": "user", "content": request.prompt }],
            "stream": true,
        })
    }
}

#[async_trait]
impl super::LlmClient for AnthropicClient {
    async fn stream(
        &self,
        request: SessionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
        gate: Arc<dyn ToolGate>,
    ) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request_body(&request);
        debug!(model = %request.model, "AnthropicClient::stream: starting");

        let http_request = self
            .http
            .post(url)
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body);

        let mut es = EventSource::new(http_request).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let mut output = String::new();
        let mut session_id: Option<String> = None;
        let mut usage = TokenUsage::default();
        let mut stop_reason = String::new();
        // (id, name, accumulated json)
        let mut current_tool: Option<(String, String, String)> = None;

        while let Some(event) = es.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    let data: serde_json::Value = serde_json::from_str(&msg.data)?;
                    match data["type"].as_str() {
                        Some("message_start") => {
                            session_id = data["message"]["id"].as_str().map(|s| s.to_string());
                            if let Some(u) = data["message"].get("usage") {
                                usage.input_tokens = u["input_tokens"].as_u64().unwrap_or(0);
                                usage.cache_read_tokens = u["cache_read_input_tokens"].as_u64().unwrap_or(0);
                                usage.cache_creation_tokens =
                                    u["cache_creation_input_tokens"].as_u64().unwrap_or(0);
                                let _ = chunk_tx
                                    .send(StreamChunk::Usage {
                                        input_tokens: usage.input_tokens,
                                        cache_read_tokens: usage.cache_read_tokens,
                                        context_max: self.context_max,
                                    })
                                    .await;
                            }
                        }
                        Some("content_block_start") => {
                            if let Some(block) = data.get("content_block") {
                                if block["type"] == "tool_use" {
                                    let id = block["id"].as_str().unwrap_or("").to_string();
                                    let name = block["name"].as_str().unwrap_or("").to_string();
                                    current_tool = Some((id, name, String::new()));
                                }
                            }
                        }
                        Some("content_block_delta") => {
                            if let Some(delta) = data.get("delta") {
                                if let Some(text) = delta["text"].as_str() {
                                    output.push_str(text);
                                    let _ = chunk_tx.send(StreamChunk::Text(text.to_string())).await;
                                }
                                if let Some(thinking) = delta["thinking"].as_str() {
                                    let _ = chunk_tx.send(StreamChunk::Thinking(thinking.to_string())).await;
                                }
                                if let Some(json) = delta["partial_json"].as_str() {
                                    if let Some((_, _, acc)) = current_tool.as_mut() {
                                        acc.push_str(json);
                                    }
                                }
                            }
                        }
                        Some("content_block_stop") => {
                            if let Some((id, name, json)) = current_tool.take() {
                                let input: serde_json::Value =
                                    serde_json::from_str(&json).unwrap_or(serde_json::json!({}));
                                // The gate suspends here while a human decides
                                let decision = gate.decide(&id, &name, &input).await;
                                if let PermissionDecision::Deny { message } = &decision {
                                    warn!(tool = %name, %message, "tool use denied");
                                }
                                let _ = chunk_tx.send(StreamChunk::ToolUse { id, name, input }).await;
                            }
                        }
                        Some("message_delta") => {
                            if let Some(sr) = data["delta"]["stop_reason"].as_str() {
                                stop_reason = sr.to_string();
                            }
                            if let Some(u) = data.get("usage") {
                                usage.output_tokens = u["output_tokens"].as_u64().unwrap_or(0);
                            }
                        }
                        Some("message_stop") => break,
                        _ => {}
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                    let status = status.as_u16();
                    if status == 429 {
                        let retry_after = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .map(Duration::from_secs);
                        return Err(LlmError::RateLimited { retry_after });
                    }
                    let message = response.text().await.unwrap_or_default();
                    return Err(LlmError::Api { status, message });
                }
                Err(reqwest_eventsource::Error::Transport(e)) => {
                    return Err(LlmError::from_transport(&e));
                }
                Err(e) => {
                    return Err(LlmError::InvalidResponse(e.to_string()));
                }
            }
        }

        let result = if stop_reason == "end_turn" && !output.is_empty() {
            Some(output.clone())
        } else {
            None
        };

        Ok(CompletionResponse {
            output,
            result,
            cost: 0.0,
            turns: 1,
            session_id,
            usage,
        })
    }
}
