//! Error taxonomy and LLM error classification.
//!
//! Every failure surfaced to the user carries an [`ErrorKind`] plus a safe
//! human message; the verbose detail goes to the log only.  Secrets (API
//! keys, signed URLs, tokens) must never appear in the user-facing text.

use serde::{Deserialize, Serialize};

/// User-facing error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The provider signaled throttling.
    RateLimit,
    /// An LLM or tool call exceeded its bounded deadline.
    Timeout,
    /// Provider or user credentials missing/invalid.
    Authentication,
    /// Malformed inputs.
    Validation,
    /// Other predictable failure in the core.
    Domain,
    /// The catch-all; the user sees a generic safe message.
    Unexpected,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Authentication => "authentication",
            Self::Validation => "validation",
            Self::Domain => "domain",
            Self::Unexpected => "unexpected",
        };
        f.write_str(s)
    }
}

/// Unified error type for the kernel crate.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Configuration records are inconsistent or incomplete.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// An `${VAR}` reference in configuration points at an unset variable.
    #[error("unresolved environment variable `{name}` in `{reference}`")]
    MissingEnvVar { name: String, reference: String },

    /// Validation failed for input data.
    #[error("validation error: {reason}")]
    Validation { reason: String },

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;

// ---------------------------------------------------------------------------
// LLM error classification
// ---------------------------------------------------------------------------

/// The outcome of classifying a provider error: the taxonomy kind, a safe
/// message for the user, and a verbose message for the log.
#[derive(Debug, Clone)]
pub struct LlmErrorReport {
    pub kind: ErrorKind,
    pub user_message: String,
    pub log_message: String,
}

/// Classify a provider error by matching its text.
///
/// The raw text is preserved only in `log_message`; `user_message` is a
/// fixed safe string per category so credentials embedded in provider
/// errors never reach the client.
pub fn classify_llm_error(error_text: &str) -> LlmErrorReport {
    let lower = error_text.to_lowercase();

    let (kind, user_message) = if lower.contains("rate limit")
        || lower.contains("ratelimit")
        || lower.contains("429")
        || lower.contains("high traffic")
        || lower.contains("overloaded")
    {
        (
            ErrorKind::RateLimit,
            "The model is receiving too many requests right now. Please wait a moment and try again.",
        )
    } else if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("deadline exceeded")
    {
        (
            ErrorKind::Timeout,
            "The request took too long and was cancelled. Please try again.",
        )
    } else if lower.contains("api key")
        || lower.contains("api_key")
        || lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("401")
        || lower.contains("403")
        || lower.contains("permission denied")
    {
        (
            ErrorKind::Authentication,
            "The model could not be reached due to a credential problem. Please contact your administrator.",
        )
    } else if lower.contains("validation")
        || lower.contains("invalid request")
        || lower.contains("400")
        || lower.contains("context length")
        || lower.contains("maximum context")
    {
        (
            ErrorKind::Validation,
            "The request was rejected by the model provider. Try shortening the conversation or changing models.",
        )
    } else {
        (
            ErrorKind::Unexpected,
            "Something went wrong while talking to the model. Please try again; if the problem persists, contact support.",
        )
    };

    LlmErrorReport {
        kind,
        user_message: user_message.to_owned(),
        log_message: format!("llm error ({kind}): {error_text}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
