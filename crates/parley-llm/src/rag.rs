//! Retrieval integration.
//!
//! Retrieval backends are external; the core consumes them through
//! [`RagService`].  Retrieval always runs to completion before any
//! streaming begins.  A single selected source may return a pre-formed
//! completion that bypasses the LLM entirely; with multiple sources the
//! retrieved contexts are always concatenated into one system message
//! placed immediately before the last user message.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;

use parley_kernel::{Message, Role};

/// The outcome of querying one retrieval source.
#[derive(Debug, Clone)]
pub struct RagResponse {
    /// Retrieved context, or a finished answer when `is_completion`.
    pub content: String,

    /// When true, `content` is a complete chat answer to surface directly
    /// (single-source mode only).
    pub is_completion: bool,

    /// Backend-specific retrieval metadata (sources, timings).
    pub metadata: Option<Value>,
}

/// The retrieval contract the LLM layer consumes.
#[async_trait]
pub trait RagService: Send + Sync {
    /// Query one data source with the conversation so far.
    async fn query(
        &self,
        user_email: &str,
        data_source: &str,
        messages: &[Message],
    ) -> std::result::Result<RagResponse, String>;
}

/// Strip the routing prefix from a qualified data-source id
/// (`server:source` -> `source`) for display purposes.
pub fn display_source(qualified: &str) -> &str {
    qualified.split_once(':').map_or(qualified, |(_, rest)| rest)
}

/// Query every source concurrently, dropping sources that fail.
///
/// Returns `(display_name, response)` pairs for the sources that answered.
/// When every source fails the caller falls back to the non-retrieval
/// path.
pub async fn query_all_sources(
    rag: &dyn RagService,
    data_sources: &[String],
    user_email: &str,
    messages: &[Message],
) -> Vec<(String, RagResponse)> {
    let queries = data_sources.iter().map(|qualified| async move {
        let display = display_source(qualified).to_owned();
        match rag.query(user_email, qualified, messages).await {
            Ok(response) => Some((display, response)),
            Err(reason) => {
                tracing::error!(source = %qualified, "rag query failed: {reason}");
                None
            }
        }
    });

    join_all(queries).await.into_iter().flatten().collect()
}

/// Combine multi-source responses into one context block.
pub fn combine_contexts(source_responses: &[(String, RagResponse)]) -> String {
    let parts: Vec<String> = source_responses
        .iter()
        .map(|(display, response)| format!("### Context from {display}:\n{}", response.content))
        .collect();
    parts.join("\n\n")
}

/// Format a pre-formed completion for direct display, with source
/// attribution.
pub fn completion_response(response: &RagResponse, display: &str) -> String {
    let mut parts = vec![
        format!("*Response from {display} (RAG completions endpoint):*\n"),
        response.content.clone(),
    ];
    if let Some(metadata) = &response.metadata
        && let Some(summary) = format_metadata(metadata)
    {
        parts.push(format!("\n\n---\n**RAG Sources & Processing Info:**\n{summary}"));
    }
    parts.join("\n")
}

/// Render retrieval metadata into a short human-readable summary.
fn format_metadata(metadata: &Value) -> Option<String> {
    let obj = metadata.as_object()?;
    let mut lines = Vec::new();

    if let Some(name) = obj.get("data_source_name").and_then(Value::as_str) {
        lines.push(format!("**Data Source:** {name}"));
    }
    if let Some(ms) = obj.get("query_processing_time_ms").and_then(Value::as_u64) {
        lines.push(format!("**Processing Time:** {ms}ms"));
    }
    if let Some(docs) = obj.get("documents_found").and_then(Value::as_array) {
        lines.push(format!("**Documents Found:** {}", docs.len()));
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Insert the retrieved context as a system message immediately before the
/// last user message.
pub fn insert_context(messages: &[Message], context_label: &str, content: &str) -> Vec<Message> {
    let system = Message::system(format!(
        "{context_label}:\n\n{content}\n\nUse this context to inform your response."
    ));

    let mut enriched = messages.to_vec();
    let insert_at = enriched
        .iter()
        .rposition(|m| m.role == Role::User)
        .unwrap_or(enriched.len());
    enriched.insert(insert_at, system);
    enriched
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_source_display_name() {
        assert_eq!(display_source("atlas_rag:technical-docs"), "technical-docs");
        assert_eq!(display_source("plain-source"), "plain-source");
    }

    #[test]
    fn context_inserted_before_last_user_message() {
        let messages = vec![
            Message::system("base prompt"),
            Message::user("first question"),
            Message::assistant("first answer"),
            Message::user("second question"),
        ];
        let enriched = insert_context(&messages, "Retrieved context from docs", "ctx");

        assert_eq!(enriched.len(), 5);
        assert_eq!(enriched[3].role, Role::System);
        assert!(enriched[3].content.contains("Retrieved context from docs"));
        assert_eq!(enriched[4].content, "second question");
    }

    #[test]
    fn combine_contexts_labels_each_source() {
        let responses = vec![
            (
                "docs".to_owned(),
                RagResponse {
                    content: "alpha".into(),
                    is_completion: false,
                    metadata: None,
                },
            ),
            (
                "wiki".to_owned(),
                RagResponse {
                    content: "beta".into(),
                    is_completion: false,
                    metadata: None,
                },
            ),
        ];
        let combined = combine_contexts(&responses);
        assert!(combined.contains("### Context from docs:\nalpha"));
        assert!(combined.contains("### Context from wiki:\nbeta"));
    }

    #[test]
    fn completion_response_appends_metadata_summary() {
        let response = RagResponse {
            content: "The answer.".into(),
            is_completion: true,
            metadata: Some(serde_json::json!({
                "data_source_name": "docs",
                "query_processing_time_ms": 42,
            })),
        };
        let formatted = completion_response(&response, "docs");
        assert!(formatted.contains("The answer."));
        assert!(formatted.contains("**Data Source:** docs"));
        assert!(formatted.contains("42ms"));
    }
}
