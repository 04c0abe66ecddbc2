//! LLM error types and retry classification

use std::time::Duration;
use thiserror::Error;

/// Network error codes considered transient
pub const RETRYABLE_NETWORK_CODES: [&str; 5] = ["ECONNRESET", "ETIMEDOUT", "ENOTFOUND", "ECONNREFUSED", "EAI_AGAIN"];

/// Errors that can occur during LLM operations
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP 429. `retry_after` carries the server's hint when present.
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure with an OS-style error code
    #[error("Network error {code}: {message}")]
    Network { code: String, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Session aborted")]
    Aborted,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Transient errors worth retrying: known network codes, 429, and 5xx.
    /// 4xx other than 429 is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::Api { status, .. } => *status >= 500,
            LlmError::Network { code, .. } => RETRYABLE_NETWORK_CODES.contains(&code.as_str()),
            LlmError::InvalidResponse(_) | LlmError::Aborted | LlmError::Json(_) => false,
        }
    }

    /// The server's retry hint, when this is a rate limit
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classify a transport error from reqwest into a network code
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            "ETIMEDOUT"
        } else if err.is_connect() {
            "ECONNREFUSED"
        } else if let Some(io) = find_io_error(err) {
            match io.kind() {
                std::io::ErrorKind::ConnectionReset => "ECONNRESET",
                std::io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
                std::io::ErrorKind::TimedOut => "ETIMEDOUT",
                _ => "EUNKNOWN",
            }
        } else if err.to_string().to_lowercase().contains("dns") {
            "ENOTFOUND"
        } else {
            "EUNKNOWN"
        };
        LlmError::Network {
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

fn find_io_error<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a std::io::Error> {
    let mut source = err.source();
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        source = e.source();
    }
    None
}
