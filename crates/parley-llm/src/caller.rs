//! The LLM caller contract consumed by the agent loops.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

use parley_kernel::{LlmResponse, Message};

use crate::error::Result;

/// How strongly the model is pushed toward calling a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChoice {
    /// The model decides freely.
    Auto,
    /// The model must call a tool.  Providers that reject this are retried
    /// with [`ToolChoice::Auto`].
    Required,
}

impl ToolChoice {
    /// Wire form used in provider payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Required => "required",
        }
    }
}

/// One item of a streamed LLM call.
#[derive(Debug, Clone)]
pub enum StreamItem {
    /// A text chunk, in source order.
    Token(String),
    /// The terminal response, strictly after every token.  Plain streams
    /// may finish without one; the caller concatenates tokens instead.
    Final(LlmResponse),
}

/// The stream handle returned by the `stream_*` methods.
pub type LlmStream = Pin<Box<dyn Stream<Item = Result<StreamItem>> + Send>>;

/// The four call methods and their streaming variants.
///
/// Implementations own provider routing and credential resolution; the
/// core treats this as a black box that may fail with classified errors.
#[async_trait]
pub trait LlmCaller: Send + Sync {
    /// Plain call: no tools, no retrieval.
    async fn call_plain(
        &self,
        model: &str,
        messages: &[Message],
        temperature: Option<f32>,
        user_email: Option<&str>,
    ) -> Result<String>;

    /// Call with tool schemas attached.
    async fn call_with_tools(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[Value],
        tool_choice: ToolChoice,
        temperature: Option<f32>,
        user_email: Option<&str>,
    ) -> Result<LlmResponse>;

    /// Call with retrieval context from the selected data sources.
    async fn call_with_rag(
        &self,
        model: &str,
        messages: &[Message],
        data_sources: &[String],
        user_email: &str,
        temperature: Option<f32>,
    ) -> Result<String>;

    /// Call with both retrieval context and tools.
    async fn call_with_rag_and_tools(
        &self,
        model: &str,
        messages: &[Message],
        data_sources: &[String],
        tools: &[Value],
        user_email: &str,
        tool_choice: ToolChoice,
        temperature: Option<f32>,
    ) -> Result<LlmResponse>;

    /// Stream a plain call: yields only [`StreamItem::Token`]s.
    async fn stream_plain(
        &self,
        model: &str,
        messages: &[Message],
        temperature: Option<f32>,
        user_email: Option<&str>,
    ) -> Result<LlmStream>;

    /// Stream a call with tools: tokens, then one [`StreamItem::Final`]
    /// carrying accumulated tool calls.
    async fn stream_with_tools(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[Value],
        tool_choice: ToolChoice,
        temperature: Option<f32>,
        user_email: Option<&str>,
    ) -> Result<LlmStream>;

    /// Stream with retrieval: retrieval runs before streaming begins.
    async fn stream_with_rag(
        &self,
        model: &str,
        messages: &[Message],
        data_sources: &[String],
        user_email: &str,
        temperature: Option<f32>,
    ) -> Result<LlmStream>;

    /// Stream with retrieval and tools.
    async fn stream_with_rag_and_tools(
        &self,
        model: &str,
        messages: &[Message],
        data_sources: &[String],
        tools: &[Value],
        user_email: &str,
        tool_choice: ToolChoice,
        temperature: Option<f32>,
    ) -> Result<LlmStream>;
}
