//! Error types for wren-ai

use thiserror::Error;

/// Result type alias using wren-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when interacting with providers
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response
    #[error("API error: {message} (type: {error_type})")]
    Api { error_type: String, message: String },

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Invalid API key
    #[error("Invalid or missing API key")]
    InvalidApiKey,

    /// Stream was aborted
    #[error("Request aborted")]
    Aborted,

    /// Server-sent events error
    #[error("SSE error: {0}")]
    Sse(String),

    /// Unexpected response format
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Context overflow / too many tokens
    #[error("Context overflow: {0}")]
    ContextOverflow(String),
}

impl Error {
    /// Create an API error from type and message
    pub fn api(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Check if this error indicates a context overflow / too many tokens
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::ContextOverflow(_) => true,
            Error::Api { message, .. } => {
                let msg = message.to_lowercase();
                msg.contains("too many tokens")
                    || msg.contains("context length")
                    || msg.contains("context window")
                    || msg.contains("token limit")
                    || msg.contains("prompt is too long")
                    || msg.contains("prompt too long")
                    || msg.contains("request too large")
                    || msg.contains("messages too long")
                    || msg.contains("reduce the length")
                    || msg.contains("context_length_exceeded")
                    || msg.contains("content too large")
                    || msg.contains("input too long")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_typed_variant() {
        assert!(Error::ContextOverflow("too big".into()).is_context_overflow());
    }

    #[test]
    fn test_overflow_api_too_many_tokens() {
        let e = Error::api("invalid_request_error", "Too many tokens in the request");
        assert!(e.is_context_overflow());
    }

    #[test]
    fn test_overflow_api_context_length_exceeded() {
        let e = Error::api(
            "invalid_request_error",
            "This model's maximum context length is 200000 tokens. context_length_exceeded",
        );
        assert!(e.is_context_overflow());
    }

    #[test]
    fn test_overflow_api_prompt_too_long() {
        let e = Error::api("invalid_request_error", "Prompt is too long for this model");
        assert!(e.is_context_overflow());
    }

    #[test]
    fn test_not_overflow_api_normal_error() {
        let e = Error::api("authentication_error", "Invalid API key");
        assert!(!e.is_context_overflow());
    }

    #[test]
    fn test_not_overflow_non_api() {
        assert!(!Error::InvalidApiKey.is_context_overflow());
        assert!(!Error::Aborted.is_context_overflow());
    }
}
