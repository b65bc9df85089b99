//! LLM-layer error types.

use parley_kernel::{LlmErrorReport, classify_llm_error};

/// Unified error type for the LLM layer.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The provider rejected or failed the request.
    #[error("llm request failed: {reason}")]
    RequestFailed { reason: String },

    /// The streaming connection was interrupted or produced invalid data.
    #[error("llm stream error: {reason}")]
    StreamError { reason: String },

    /// `tool_choice=required` produced a response with no tool calls.
    #[error("llm failed to return tool calls when tool_choice was 'required'")]
    RequiredToolCallsMissing,

    /// A RAG call was made but no retrieval service is configured.
    #[error("rag service not configured")]
    RagUnavailable,

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for unexpected internal errors.
    #[error("internal llm error: {0}")]
    Internal(String),
}

impl LlmError {
    /// Classify this error into the user-facing taxonomy, producing a safe
    /// user message and a verbose log message.
    pub fn report(&self) -> LlmErrorReport {
        classify_llm_error(&self.to_string())
    }
}

/// Convenience alias used throughout the LLM layer.
pub type Result<T> = std::result::Result<T, LlmError>;

#[cfg(test)]
mod tests {
    use super::*;
    use parley_kernel::ErrorKind;

    #[test]
    fn provider_rate_limit_classifies() {
        let err = LlmError::RequestFailed {
            reason: "RateLimitError: high traffic, slow down".into(),
        };
        assert_eq!(err.report().kind, ErrorKind::RateLimit);
    }

    #[test]
    fn stream_timeout_classifies() {
        let err = LlmError::StreamError {
            reason: "request timed out".into(),
        };
        assert_eq!(err.report().kind, ErrorKind::Timeout);
    }
}
