//! Shared helper for streaming the final answer.
//!
//! Used by every loop when it exhausts its steps without a definitive
//! final answer: one plain LLM call streamed token-by-token to the client,
//! closed with an empty `is_last` token.

use futures::StreamExt;

use parley_kernel::{EventSink, Message, UiEvent};
use parley_llm::{LlmCaller, StreamItem};

use crate::error::Result;

/// Stream the final answer, publishing `token_stream` events, and return
/// the accumulated text.
///
/// Degrades gracefully: an empty or broken stream falls back to a
/// non-streaming call, and if that also fails the classified safe message
/// becomes the answer.
pub async fn stream_final_answer(
    llm: &dyn LlmCaller,
    events: &dyn EventSink,
    model: &str,
    messages: &[Message],
    temperature: Option<f32>,
    user_email: Option<&str>,
) -> Result<String> {
    let mut accumulated = String::new();
    let mut is_first = true;
    let mut stream_error = None;

    match llm.stream_plain(model, messages, temperature, user_email).await {
        Ok(mut stream) => {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(StreamItem::Token(token)) => {
                        events
                            .emit(UiEvent::TokenStream {
                                token: token.clone(),
                                is_first,
                                is_last: false,
                            })
                            .await;
                        accumulated.push_str(&token);
                        is_first = false;
                    }
                    // Plain streams do not yield a terminal response, but a
                    // backend may; prefer its text when nothing streamed.
                    Ok(StreamItem::Final(response)) => {
                        if accumulated.is_empty() {
                            accumulated = response.content;
                        }
                    }
                    Err(e) => {
                        tracing::error!("error streaming final answer: {e}");
                        stream_error = Some(e);
                        break;
                    }
                }
            }
        }
        Err(e) => {
            tracing::error!("failed to open final answer stream: {e}");
            stream_error = Some(e);
        }
    }

    // Close the stream when anything was shown (or the stream broke);
    // a wholly-empty stream skips straight to the non-streaming fallback.
    if !accumulated.is_empty() || stream_error.is_some() {
        events
            .emit(UiEvent::TokenStream {
                token: String::new(),
                is_first: false,
                is_last: true,
            })
            .await;
    }

    if accumulated.is_empty() {
        match llm.call_plain(model, messages, temperature, user_email).await {
            Ok(text) => accumulated = text,
            Err(call_err) => {
                let source = stream_error.unwrap_or(call_err);
                accumulated = source.report().user_message;
            }
        }
    }

    Ok(accumulated)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_kernel::LlmResponse;
    use parley_llm::{LlmError, LlmStream, ToolChoice};
    use serde_json::Value;
    use std::sync::Mutex;

    struct CollectingSink {
        events: Mutex<Vec<UiEvent>>,
    }

    #[async_trait]
    impl EventSink for CollectingSink {
        async fn emit(&self, event: UiEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    /// Caller whose plain stream yields scripted tokens.
    struct TokenCaller {
        tokens: Vec<&'static str>,
    }

    #[async_trait]
    impl LlmCaller for TokenCaller {
        async fn call_plain(
            &self,
            _model: &str,
            _messages: &[Message],
            _temperature: Option<f32>,
            _user_email: Option<&str>,
        ) -> parley_llm::Result<String> {
            Ok("non-streamed".into())
        }

        async fn call_with_tools(
            &self,
            _model: &str,
            _messages: &[Message],
            _tools: &[Value],
            _tool_choice: ToolChoice,
            _temperature: Option<f32>,
            _user_email: Option<&str>,
        ) -> parley_llm::Result<LlmResponse> {
            Err(LlmError::Internal("not scripted".into()))
        }

        async fn call_with_rag(
            &self,
            _model: &str,
            _messages: &[Message],
            _data_sources: &[String],
            _user_email: &str,
            _temperature: Option<f32>,
        ) -> parley_llm::Result<String> {
            Err(LlmError::Internal("not scripted".into()))
        }

        async fn call_with_rag_and_tools(
            &self,
            _model: &str,
            _messages: &[Message],
            _data_sources: &[String],
            _tools: &[Value],
            _user_email: &str,
            _tool_choice: ToolChoice,
            _temperature: Option<f32>,
        ) -> parley_llm::Result<LlmResponse> {
            Err(LlmError::Internal("not scripted".into()))
        }

        async fn stream_plain(
            &self,
            _model: &str,
            _messages: &[Message],
            _temperature: Option<f32>,
            _user_email: Option<&str>,
        ) -> parley_llm::Result<LlmStream> {
            let items: Vec<parley_llm::Result<StreamItem>> = self
                .tokens
                .iter()
                .map(|t| Ok(StreamItem::Token((*t).to_owned())))
                .collect();
            Ok(Box::pin(futures::stream::iter(items)))
        }

        async fn stream_with_tools(
            &self,
            _model: &str,
            _messages: &[Message],
            _tools: &[Value],
            _tool_choice: ToolChoice,
            _temperature: Option<f32>,
            _user_email: Option<&str>,
        ) -> parley_llm::Result<LlmStream> {
            Err(LlmError::Internal("not scripted".into()))
        }

        async fn stream_with_rag(
            &self,
            _model: &str,
            _messages: &[Message],
            _data_sources: &[String],
            _user_email: &str,
            _temperature: Option<f32>,
        ) -> parley_llm::Result<LlmStream> {
            Err(LlmError::Internal("not scripted".into()))
        }

        async fn stream_with_rag_and_tools(
            &self,
            _model: &str,
            _messages: &[Message],
            _data_sources: &[String],
            _tools: &[Value],
            _user_email: &str,
            _tool_choice: ToolChoice,
            _temperature: Option<f32>,
        ) -> parley_llm::Result<LlmStream> {
            Err(LlmError::Internal("not scripted".into()))
        }
    }

    #[tokio::test]
    async fn tokens_are_published_and_accumulated() {
        let caller = TokenCaller {
            tokens: vec!["Hel", "lo"],
        };
        let sink = CollectingSink {
            events: Mutex::new(Vec::new()),
        };

        let answer = stream_final_answer(&caller, &sink, "m", &[Message::user("q")], None, None)
            .await
            .unwrap();
        assert_eq!(answer, "Hello");

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 3);
        match &events[0] {
            UiEvent::TokenStream { token, is_first, is_last } => {
                assert_eq!(token, "Hel");
                assert!(is_first);
                assert!(!is_last);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match &events[2] {
            UiEvent::TokenStream { token, is_last, .. } => {
                assert!(token.is_empty());
                assert!(is_last);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_stream_falls_back_to_plain_call() {
        let caller = TokenCaller { tokens: vec![] };
        let sink = CollectingSink {
            events: Mutex::new(Vec::new()),
        };

        let answer = stream_final_answer(&caller, &sink, "m", &[Message::user("q")], None, None)
            .await
            .unwrap();
        assert_eq!(answer, "non-streamed");
    }
}
