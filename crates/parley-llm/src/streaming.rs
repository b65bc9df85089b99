//! The streaming adapter: [`LlmCaller`] implemented over a [`ChatBackend`].
//!
//! Wraps the four call shapes and their streaming variants.  Tool-capable
//! streams accumulate fragmented tool-call deltas and finish with one
//! terminal [`StreamItem::Final`], strictly after every token.  When
//! retrieval is active it runs to completion before streaming begins.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;

use parley_kernel::{LlmResponse, Message};

use crate::accumulator::StreamAccumulator;
use crate::backend::{ChatBackend, ChatRequest, DeltaStream};
use crate::caller::{LlmCaller, LlmStream, StreamItem, ToolChoice};
use crate::error::{LlmError, Result};
use crate::rag::{
    RagService, combine_contexts, completion_response, insert_context, query_all_sources,
};

/// Chunks between cooperative yields, so a hot provider stream cannot
/// starve other tasks on the runtime.
const YIELD_EVERY_CHUNKS: usize = 50;

/// What retrieval produced for one call.
enum Retrieval {
    /// A single source answered with a finished completion; the LLM is
    /// bypassed.
    Completion(String),
    /// The history enriched with retrieved context (or unchanged when
    /// every source failed).
    Enriched(Vec<Message>),
}

/// [`LlmCaller`] implementation over a narrow provider backend.
pub struct StreamingCaller<B> {
    backend: B,
    rag: Option<Arc<dyn RagService>>,
}

impl<B: ChatBackend> StreamingCaller<B> {
    /// Create a caller with no retrieval service; RAG methods will fail
    /// with [`LlmError::RagUnavailable`].
    pub fn new(backend: B) -> Self {
        Self { backend, rag: None }
    }

    /// Attach a retrieval service.
    pub fn with_rag(backend: B, rag: Arc<dyn RagService>) -> Self {
        Self {
            backend,
            rag: Some(rag),
        }
    }

    fn request(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[Value],
        tool_choice: Option<ToolChoice>,
        temperature: Option<f32>,
        user_email: Option<&str>,
    ) -> ChatRequest {
        ChatRequest {
            model: model.to_owned(),
            messages: messages.to_vec(),
            tools: tools.to_vec(),
            tool_choice,
            temperature,
            max_tokens: None,
            user_email: user_email.map(str::to_owned),
        }
    }

    /// Query retrieval for the selected sources, resolving the
    /// single-source / multi-source split.
    async fn retrieve(
        &self,
        data_sources: &[String],
        user_email: &str,
        messages: &[Message],
    ) -> Result<Retrieval> {
        let rag = self.rag.as_deref().ok_or(LlmError::RagUnavailable)?;

        let responses = query_all_sources(rag, data_sources, user_email, messages).await;
        if responses.is_empty() {
            tracing::warn!("all retrieval sources failed, falling back to plain call");
            return Ok(Retrieval::Enriched(messages.to_vec()));
        }

        if data_sources.len() == 1 {
            let (source_name, response) = &responses[0];
            if response.is_completion {
                tracing::info!(source = %source_name, "retrieval returned a pre-formed completion");
                return Ok(Retrieval::Completion(completion_response(response, source_name)));
            }
            let label = format!("Retrieved context from {source_name}");
            return Ok(Retrieval::Enriched(insert_context(
                messages,
                &label,
                &response.content,
            )));
        }

        // Multi-source mode always concatenates raw context; pre-formed
        // completions are treated as context here.
        let label = format!("Retrieved context from {} RAG sources", responses.len());
        let combined = combine_contexts(&responses);
        Ok(Retrieval::Enriched(insert_context(messages, &label, &combined)))
    }

    /// Pump a delta stream into an [`LlmStream`], accumulating tool-call
    /// fragments and yielding control periodically.
    fn pump(deltas: DeltaStream, model: String, with_final: bool) -> LlmStream {
        let (mut tx, rx) = futures::channel::mpsc::channel::<Result<StreamItem>>(32);

        tokio::spawn(async move {
            let mut deltas = deltas;
            let mut acc = StreamAccumulator::new();
            let mut chunk_count = 0usize;

            while let Some(item) = deltas.next().await {
                match item {
                    Ok(chunk) => {
                        if let Some(text) = acc.feed(&chunk) {
                            if tx.send(Ok(StreamItem::Token(text))).await.is_err() {
                                // Receiver went away; nothing left to do.
                                return;
                            }
                            chunk_count += 1;
                            if chunk_count % YIELD_EVERY_CHUNKS == 0 {
                                tokio::task::yield_now().await;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("stream error from provider: {e}");
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }

            if with_final {
                let _ = tx
                    .send(Ok(StreamItem::Final(acc.into_response(&model))))
                    .await;
            }
        });

        Box::pin(rx)
    }

    /// A stream that yields exactly the given items (pre-formed
    /// completions).
    fn fixed_stream(items: Vec<StreamItem>) -> LlmStream {
        let items: Vec<Result<StreamItem>> = items.into_iter().map(Ok).collect();
        Box::pin(futures::stream::iter(items))
    }
}

#[async_trait]
impl<B: ChatBackend> LlmCaller for StreamingCaller<B> {
    async fn call_plain(
        &self,
        model: &str,
        messages: &[Message],
        temperature: Option<f32>,
        user_email: Option<&str>,
    ) -> Result<String> {
        tracing::info!(model, messages = messages.len(), "plain llm call");
        let request = self.request(model, messages, &[], None, temperature, user_email);
        let response = self.backend.complete(&request).await?;
        Ok(response.content)
    }

    async fn call_with_tools(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[Value],
        tool_choice: ToolChoice,
        temperature: Option<f32>,
        user_email: Option<&str>,
    ) -> Result<LlmResponse> {
        tracing::info!(
            model,
            messages = messages.len(),
            tools = tools.len(),
            tool_choice = tool_choice.as_str(),
            "llm call with tools"
        );

        let request = self.request(
            model,
            messages,
            tools,
            Some(tool_choice),
            temperature,
            user_email,
        );

        // `required` is not universally supported: a provider may error on
        // it, or accept it and still return no tool calls.  Both cases are
        // retried once with `auto`.
        match self.backend.complete(&request).await {
            Ok(response) => {
                if tool_choice == ToolChoice::Required && !response.has_tool_calls() {
                    tracing::warn!(
                        "provider returned no tool calls under tool_choice=required, retrying with auto"
                    );
                    let retry = ChatRequest {
                        tool_choice: Some(ToolChoice::Auto),
                        ..request
                    };
                    return self.backend.complete(&retry).await;
                }
                Ok(response)
            }
            Err(e) if tool_choice == ToolChoice::Required => {
                tracing::warn!("tool_choice=required failed ({e}), retrying with auto");
                let retry = ChatRequest {
                    tool_choice: Some(ToolChoice::Auto),
                    ..request
                };
                self.backend.complete(&retry).await
            }
            Err(e) => Err(e),
        }
    }

    async fn call_with_rag(
        &self,
        model: &str,
        messages: &[Message],
        data_sources: &[String],
        user_email: &str,
        temperature: Option<f32>,
    ) -> Result<String> {
        if data_sources.is_empty() {
            return self.call_plain(model, messages, temperature, Some(user_email)).await;
        }
        match self.retrieve(data_sources, user_email, messages).await? {
            Retrieval::Completion(completion) => Ok(completion),
            Retrieval::Enriched(enriched) => {
                self.call_plain(model, &enriched, temperature, Some(user_email))
                    .await
            }
        }
    }

    async fn call_with_rag_and_tools(
        &self,
        model: &str,
        messages: &[Message],
        data_sources: &[String],
        tools: &[Value],
        user_email: &str,
        tool_choice: ToolChoice,
        temperature: Option<f32>,
    ) -> Result<LlmResponse> {
        if data_sources.is_empty() {
            return self
                .call_with_tools(model, messages, tools, tool_choice, temperature, Some(user_email))
                .await;
        }
        match self.retrieve(data_sources, user_email, messages).await? {
            Retrieval::Completion(completion) => Ok(LlmResponse::text(completion)),
            Retrieval::Enriched(enriched) => {
                self.call_with_tools(
                    model,
                    &enriched,
                    tools,
                    tool_choice,
                    temperature,
                    Some(user_email),
                )
                .await
            }
        }
    }

    async fn stream_plain(
        &self,
        model: &str,
        messages: &[Message],
        temperature: Option<f32>,
        user_email: Option<&str>,
    ) -> Result<LlmStream> {
        let request = self.request(model, messages, &[], None, temperature, user_email);
        let deltas = self.backend.open_stream(&request).await?;
        Ok(Self::pump(deltas, model.to_owned(), false))
    }

    async fn stream_with_tools(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[Value],
        tool_choice: ToolChoice,
        temperature: Option<f32>,
        user_email: Option<&str>,
    ) -> Result<LlmStream> {
        if tools.is_empty() {
            return self.stream_plain(model, messages, temperature, user_email).await;
        }
        let request = self.request(
            model,
            messages,
            tools,
            Some(tool_choice),
            temperature,
            user_email,
        );
        let deltas = self.backend.open_stream(&request).await?;
        Ok(Self::pump(deltas, model.to_owned(), true))
    }

    async fn stream_with_rag(
        &self,
        model: &str,
        messages: &[Message],
        data_sources: &[String],
        user_email: &str,
        temperature: Option<f32>,
    ) -> Result<LlmStream> {
        if data_sources.is_empty() {
            return self.stream_plain(model, messages, temperature, Some(user_email)).await;
        }
        match self.retrieve(data_sources, user_email, messages).await? {
            Retrieval::Completion(completion) => {
                Ok(Self::fixed_stream(vec![StreamItem::Token(completion)]))
            }
            Retrieval::Enriched(enriched) => {
                self.stream_plain(model, &enriched, temperature, Some(user_email))
                    .await
            }
        }
    }

    async fn stream_with_rag_and_tools(
        &self,
        model: &str,
        messages: &[Message],
        data_sources: &[String],
        tools: &[Value],
        user_email: &str,
        tool_choice: ToolChoice,
        temperature: Option<f32>,
    ) -> Result<LlmStream> {
        if data_sources.is_empty() {
            return self
                .stream_with_tools(model, messages, tools, tool_choice, temperature, Some(user_email))
                .await;
        }
        match self.retrieve(data_sources, user_email, messages).await? {
            Retrieval::Completion(completion) => Ok(Self::fixed_stream(vec![StreamItem::Final(
                LlmResponse::text(completion),
            )])),
            Retrieval::Enriched(enriched) => {
                self.stream_with_tools(
                    model,
                    &enriched,
                    tools,
                    tool_choice,
                    temperature,
                    Some(user_email),
                )
                .await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{StreamChunk, ToolCallDelta};
    use crate::rag::RagResponse;
    use parley_kernel::ToolCall;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Backend returning scripted completions and streams, recording every
    /// request it sees.
    #[derive(Default)]
    struct ScriptedBackend {
        completions: Mutex<VecDeque<Result<LlmResponse>>>,
        streams: Mutex<VecDeque<Vec<Result<StreamChunk>>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedBackend {
        fn push_completion(&self, response: Result<LlmResponse>) {
            self.completions.lock().unwrap().push_back(response);
        }

        fn push_stream(&self, chunks: Vec<Result<StreamChunk>>) {
            self.streams.lock().unwrap().push_back(chunks);
        }

        fn recorded(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn complete(&self, request: &ChatRequest) -> Result<LlmResponse> {
            self.requests.lock().unwrap().push(request.clone());
            self.completions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(LlmResponse::text("default")))
        }

        async fn open_stream(&self, request: &ChatRequest) -> Result<DeltaStream> {
            self.requests.lock().unwrap().push(request.clone());
            let chunks = self
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    fn text_chunk(text: &str) -> Result<StreamChunk> {
        Ok(StreamChunk {
            text: Some(text.to_owned()),
            tool_calls: Vec::new(),
        })
    }

    #[tokio::test]
    async fn required_with_no_tool_calls_retries_as_auto() {
        let backend = ScriptedBackend::default();
        backend.push_completion(Ok(LlmResponse::text("I refuse to call tools")));
        backend.push_completion(Ok(LlmResponse {
            content: String::new(),
            tool_calls: vec![ToolCall::new("c1", "srv_tool", json!({}))],
            model_used: None,
        }));

        let caller = StreamingCaller::new(backend);
        let response = caller
            .call_with_tools(
                "m",
                &[Message::user("hi")],
                &[json!({"type": "function"})],
                ToolChoice::Required,
                None,
                None,
            )
            .await
            .unwrap();
        assert!(response.has_tool_calls());

        let requests = caller.backend.recorded();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tool_choice, Some(ToolChoice::Required));
        assert_eq!(requests[1].tool_choice, Some(ToolChoice::Auto));
    }

    #[tokio::test]
    async fn required_provider_error_retries_as_auto() {
        let backend = ScriptedBackend::default();
        backend.push_completion(Err(LlmError::RequestFailed {
            reason: "tool_choice required not supported".into(),
        }));
        backend.push_completion(Ok(LlmResponse::text("fine")));

        let caller = StreamingCaller::new(backend);
        let response = caller
            .call_with_tools(
                "m",
                &[Message::user("hi")],
                &[json!({})],
                ToolChoice::Required,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(response.content, "fine");
    }

    #[tokio::test]
    async fn auto_errors_are_not_retried() {
        let backend = ScriptedBackend::default();
        backend.push_completion(Err(LlmError::RequestFailed {
            reason: "boom".into(),
        }));

        let caller = StreamingCaller::new(backend);
        let err = caller
            .call_with_tools(
                "m",
                &[Message::user("hi")],
                &[json!({})],
                ToolChoice::Auto,
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed { .. }));
        assert_eq!(caller.backend.recorded().len(), 1);
    }

    #[tokio::test]
    async fn stream_with_tools_yields_tokens_then_final() {
        let backend = ScriptedBackend::default();
        backend.push_stream(vec![
            text_chunk("Hel"),
            text_chunk("lo"),
            Ok(StreamChunk {
                text: None,
                tool_calls: vec![ToolCallDelta {
                    index: 0,
                    id: Some("c1".into()),
                    name: Some("srv_search".into()),
                    arguments: Some(r#"{"q":"x"}"#.into()),
                }],
            }),
        ]);

        let caller = StreamingCaller::new(backend);
        let mut stream = caller
            .stream_with_tools(
                "m",
                &[Message::user("hi")],
                &[json!({})],
                ToolChoice::Auto,
                None,
                None,
            )
            .await
            .unwrap();

        let mut tokens = Vec::new();
        let mut finals = Vec::new();
        while let Some(item) = stream.next().await {
            match item.unwrap() {
                StreamItem::Token(t) => {
                    // Tokens must never arrive after the terminal response.
                    assert!(finals.is_empty());
                    tokens.push(t);
                }
                StreamItem::Final(resp) => finals.push(resp),
            }
        }

        assert_eq!(tokens.join(""), "Hello");
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].tool_calls[0].name, "srv_search");
        assert_eq!(finals[0].tool_calls[0].arguments["q"], "x");
    }

    #[tokio::test]
    async fn plain_stream_has_no_final() {
        let backend = ScriptedBackend::default();
        backend.push_stream(vec![text_chunk("a"), text_chunk("b")]);

        let caller = StreamingCaller::new(backend);
        let mut stream = caller
            .stream_plain("m", &[Message::user("hi")], None, None)
            .await
            .unwrap();

        let mut tokens = Vec::new();
        while let Some(item) = stream.next().await {
            match item.unwrap() {
                StreamItem::Token(t) => tokens.push(t),
                StreamItem::Final(_) => panic!("plain stream should not yield a final response"),
            }
        }
        assert_eq!(tokens, vec!["a", "b"]);
    }

    // -- RAG ----------------------------------------------------------------

    struct ScriptedRag {
        responses: Mutex<std::collections::HashMap<String, std::result::Result<RagResponse, String>>>,
    }

    #[async_trait]
    impl RagService for ScriptedRag {
        async fn query(
            &self,
            _user_email: &str,
            data_source: &str,
            _messages: &[Message],
        ) -> std::result::Result<RagResponse, String> {
            self.responses
                .lock()
                .unwrap()
                .get(data_source)
                .cloned()
                .unwrap_or_else(|| Err("unknown source".into()))
        }
    }

    fn rag_with(entries: Vec<(&str, std::result::Result<RagResponse, String>)>) -> Arc<ScriptedRag> {
        Arc::new(ScriptedRag {
            responses: Mutex::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.to_owned(), v))
                    .collect(),
            ),
        })
    }

    #[tokio::test]
    async fn single_source_completion_bypasses_llm() {
        let rag = rag_with(vec![(
            "docs",
            Ok(RagResponse {
                content: "Final answer from RAG.".into(),
                is_completion: true,
                metadata: None,
            }),
        )]);
        let backend = ScriptedBackend::default();
        let caller = StreamingCaller::with_rag(backend, rag);

        let answer = caller
            .call_with_rag("m", &[Message::user("q")], &["docs".to_owned()], "u@e", None)
            .await
            .unwrap();
        assert!(answer.contains("Final answer from RAG."));
        // No LLM request was issued.
        assert!(caller.backend.recorded().is_empty());
    }

    #[tokio::test]
    async fn multi_source_always_concatenates_context() {
        let rag = rag_with(vec![
            (
                "a:docs",
                Ok(RagResponse {
                    content: "alpha context".into(),
                    // Completion flags are ignored in multi-source mode.
                    is_completion: true,
                    metadata: None,
                }),
            ),
            (
                "b:wiki",
                Ok(RagResponse {
                    content: "beta context".into(),
                    is_completion: false,
                    metadata: None,
                }),
            ),
        ]);
        let backend = ScriptedBackend::default();
        backend.push_completion(Ok(LlmResponse::text("combined answer")));
        let caller = StreamingCaller::with_rag(backend, rag);

        let answer = caller
            .call_with_rag(
                "m",
                &[Message::user("q")],
                &["a:docs".to_owned(), "b:wiki".to_owned()],
                "u@e",
                None,
            )
            .await
            .unwrap();
        assert_eq!(answer, "combined answer");

        let requests = caller.backend.recorded();
        assert_eq!(requests.len(), 1);
        let system = &requests[0].messages[0];
        assert!(system.content.contains("alpha context"));
        assert!(system.content.contains("beta context"));
        assert!(system.content.contains("2 RAG sources"));
    }

    #[tokio::test]
    async fn all_sources_failing_falls_back_to_plain() {
        let rag = rag_with(vec![("docs", Err("backend down".into()))]);
        let backend = ScriptedBackend::default();
        backend.push_completion(Ok(LlmResponse::text("plain answer")));
        let caller = StreamingCaller::with_rag(backend, rag);

        let answer = caller
            .call_with_rag("m", &[Message::user("q")], &["docs".to_owned()], "u@e", None)
            .await
            .unwrap();
        assert_eq!(answer, "plain answer");

        // The request carried the original, unenriched history.
        let requests = caller.backend.recorded();
        assert_eq!(requests[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn rag_without_service_is_an_error() {
        let caller = StreamingCaller::new(ScriptedBackend::default());
        let err = caller
            .call_with_rag("m", &[Message::user("q")], &["docs".to_owned()], "u@e", None)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::RagUnavailable));
    }

    #[tokio::test]
    async fn rag_stream_completion_is_a_single_final() {
        let rag = rag_with(vec![(
            "docs",
            Ok(RagResponse {
                content: "done".into(),
                is_completion: true,
                metadata: None,
            }),
        )]);
        let caller = StreamingCaller::with_rag(ScriptedBackend::default(), rag);

        let mut stream = caller
            .stream_with_rag_and_tools(
                "m",
                &[Message::user("q")],
                &["docs".to_owned()],
                &[json!({})],
                "u@e",
                ToolChoice::Auto,
                None,
            )
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        match first {
            StreamItem::Final(resp) => assert!(resp.content.contains("done")),
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }
}
