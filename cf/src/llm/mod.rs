//! LLM client abstraction
//!
//! The SDK runner consumes one streamed agent session through the
//! [`LlmClient`] trait; [`AnthropicClient`] implements it over the
//! Anthropic Messages API SSE stream. Tests substitute scripted clients.

mod anthropic;
mod error;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use anthropic::AnthropicClient;
pub use error::{LlmError, RETRYABLE_NETWORK_CODES};

/// One streamed session request
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub system_prompt: String,
    pub prompt: String,
    pub model: String,
    pub max_turns: u32,
    /// The task's worktree; tool use is confined here
    pub working_dir: PathBuf,
    /// Continue a prior session instead of starting fresh
    pub resume_session_id: Option<String>,
}

/// Incremental chunks forwarded while the session streams
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Assistant text delta
    Text(String),
    /// Assistant thinking delta
    Thinking(String),
    /// A complete tool-use block
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Per-turn context accounting (`input_tokens + cache_read_tokens`)
    Usage {
        input_tokens: u64,
        cache_read_tokens: u64,
        context_max: u64,
    },
}

/// Token usage accumulated over the session
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

/// Final outcome of a streamed session
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Accumulated assistant text
    pub output: String,
    /// The final `result` payload when the session ended in success;
    /// preferred over the accumulated text when present
    pub result: Option<String>,
    pub cost: f64,
    pub turns: u32,
    pub session_id: Option<String>,
    pub usage: TokenUsage,
}

/// Decision for one tool-use request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny { message: String },
}

/// Mediates tool-use permissions for an in-flight session. The SDK runner
/// implements this; the client consults it before every tool executes.
#[async_trait]
pub trait ToolGate: Send + Sync {
    async fn decide(&self, tool_use_id: &str, tool_name: &str, input: &serde_json::Value) -> PermissionDecision;
}

/// A gate that allows everything (autonomy mode bypass)
pub struct AllowAll;

#[async_trait]
impl ToolGate for AllowAll {
    async fn decide(&self, _id: &str, _name: &str, _input: &serde_json::Value) -> PermissionDecision {
        PermissionDecision::Allow
    }
}

/// Streaming LLM session source
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Stream one session to completion, forwarding chunks as they arrive
    /// and consulting `gate` for every tool use. Chunks must be sent in
    /// the order the provider emitted them.
    async fn stream(
        &self,
        request: SessionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
        gate: Arc<dyn ToolGate>,
    ) -> Result<CompletionResponse, LlmError>;
}
