//! Agent error types.

use parley_llm::LlmError;

/// Unified error type for the agent engine.
///
/// Per-tool failures never surface here; they become unsuccessful
/// `ToolResult`s so the loop can continue.  What does surface is an LLM
/// layer failure (classified for the user by the caller) or an internal
/// invariant violation.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// An error propagated from the LLM layer.
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for unexpected internal errors.
    #[error("internal agent error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the agent engine.
pub type Result<T> = std::result::Result<T, AgentError>;
