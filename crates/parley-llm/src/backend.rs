//! The narrow provider contract the streaming adapter builds on.
//!
//! The real provider SDK (HTTP client, wire format, API keys) lives
//! outside the core.  It only has to implement [`ChatBackend`]: one
//! non-streaming completion and one delta stream.  Fragment accumulation,
//! tool-choice fallback, and retrieval are layered on top by
//! [`crate::streaming::StreamingCaller`].

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

use parley_kernel::{LlmResponse, Message};

use crate::caller::ToolChoice;
use crate::error::Result;

/// One fully-assembled request to the provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// OpenAI-style function schemas; empty means no tools.
    pub tools: Vec<Value>,
    pub tool_choice: Option<ToolChoice>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Caller identity, for providers keyed per user.
    pub user_email: Option<String>,
}

impl ChatRequest {
    /// A plain request with no tools.
    pub fn plain(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            tool_choice: None,
            temperature: None,
            max_tokens: None,
            user_email: None,
        }
    }
}

/// One fragment of a streamed tool call.
///
/// Providers split tool calls across many chunks: the id and function name
/// usually arrive first, argument text trickles in afterwards.  `index`
/// correlates fragments belonging to the same call.
#[derive(Debug, Clone, Default)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// One chunk of a provider delta stream.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    /// Text delta, when the chunk carries visible content.
    pub text: Option<String>,
    /// Tool-call fragments, when the chunk extends pending calls.
    pub tool_calls: Vec<ToolCallDelta>,
}

/// The stream of deltas for one LLM call.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Minimal provider contract.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Run the request to completion and return the parsed response.
    async fn complete(&self, request: &ChatRequest) -> Result<LlmResponse>;

    /// Open a delta stream for the request.
    async fn open_stream(&self, request: &ChatRequest) -> Result<DeltaStream>;
}
