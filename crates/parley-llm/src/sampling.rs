//! Answering sampling requests from tool servers.
//!
//! A tool server may ask the host to run an LLM call on its behalf
//! (`sampling/createMessage`).  [`LlmSamplingHandler`] is the host side of
//! that contract: it resolves the server's model preferences against the
//! configured model map and runs one plain call through the [`LlmCaller`].
//!
//! Preference matching order: configured model name first, then provider
//! model id, else the first configured model.  The server's requested
//! token cap is advisory; the selected model's configured cap governs.

use std::sync::Arc;

use async_trait::async_trait;

use parley_kernel::{LlmModelConfig, Message};
use parley_mcp::{SamplingHandler, SamplingReply, SamplingRequest};

use crate::caller::LlmCaller;

/// [`SamplingHandler`] backed by the host's LLM caller.
///
/// Install on the connection manager at startup
/// (`ServerManager::set_sampling_handler`); without it, sampling requests
/// are refused.
pub struct LlmSamplingHandler {
    llm: Arc<dyn LlmCaller>,
    /// Configured models in declaration order; the first entry is the
    /// fallback when no preference matches.
    models: Vec<(String, LlmModelConfig)>,
}

impl LlmSamplingHandler {
    pub fn new(llm: Arc<dyn LlmCaller>, models: Vec<(String, LlmModelConfig)>) -> Self {
        Self { llm, models }
    }

    /// Resolve the server's preferences to a configured model name.
    fn select_model(&self, preferences: &[String]) -> Option<String> {
        for preference in preferences {
            if let Some((name, _)) = self.models.iter().find(|(name, _)| name == preference) {
                return Some(name.clone());
            }
            if let Some((name, _)) = self
                .models
                .iter()
                .find(|(_, config)| &config.model_name == preference)
            {
                return Some(name.clone());
            }
        }
        self.models.first().map(|(name, _)| name.clone())
    }
}

#[async_trait]
impl SamplingHandler for LlmSamplingHandler {
    async fn sample(
        &self,
        request: SamplingRequest,
    ) -> std::result::Result<SamplingReply, String> {
        let Some(model) = self.select_model(&request.model_preferences) else {
            return Err("no models configured for sampling".to_owned());
        };

        let mut messages = request.messages;
        if let Some(system) = request.system_prompt {
            messages.insert(0, Message::system(system));
        }

        tracing::info!(
            model = %model,
            messages = messages.len(),
            max_tokens = request.max_tokens,
            preferences = ?request.model_preferences,
            "answering sampling request"
        );

        let content = self
            .llm
            .call_plain(&model, &messages, request.temperature, None)
            .await
            .map_err(|e| e.to_string())?;

        tracing::debug!(model = %model, response_len = content.len(), "sampling completed");
        Ok(SamplingReply { content, model })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caller::{LlmStream, ToolChoice};
    use crate::error::LlmError;
    use parley_kernel::{LlmResponse, Role};
    use serde_json::{Value, json};
    use std::sync::Mutex;

    /// Caller that records plain calls and echoes the model it served.
    #[derive(Default)]
    struct RecordingCaller {
        plain_calls: Mutex<Vec<(String, Vec<Message>)>>,
    }

    #[async_trait]
    impl LlmCaller for RecordingCaller {
        async fn call_plain(
            &self,
            model: &str,
            messages: &[Message],
            _temperature: Option<f32>,
            _user_email: Option<&str>,
        ) -> crate::Result<String> {
            self.plain_calls
                .lock()
                .unwrap()
                .push((model.to_owned(), messages.to_vec()));
            Ok(format!("sampled by {model}"))
        }

        async fn call_with_tools(
            &self,
            _: &str,
            _: &[Message],
            _: &[Value],
            _: ToolChoice,
            _: Option<f32>,
            _: Option<&str>,
        ) -> crate::Result<LlmResponse> {
            Err(LlmError::Internal("not used".into()))
        }

        async fn call_with_rag(
            &self,
            _: &str,
            _: &[Message],
            _: &[String],
            _: &str,
            _: Option<f32>,
        ) -> crate::Result<String> {
            Err(LlmError::Internal("not used".into()))
        }

        async fn call_with_rag_and_tools(
            &self,
            _: &str,
            _: &[Message],
            _: &[String],
            _: &[Value],
            _: &str,
            _: ToolChoice,
            _: Option<f32>,
        ) -> crate::Result<LlmResponse> {
            Err(LlmError::Internal("not used".into()))
        }

        async fn stream_plain(
            &self,
            _: &str,
            _: &[Message],
            _: Option<f32>,
            _: Option<&str>,
        ) -> crate::Result<LlmStream> {
            Err(LlmError::Internal("not used".into()))
        }

        async fn stream_with_tools(
            &self,
            _: &str,
            _: &[Message],
            _: &[Value],
            _: ToolChoice,
            _: Option<f32>,
            _: Option<&str>,
        ) -> crate::Result<LlmStream> {
            Err(LlmError::Internal("not used".into()))
        }

        async fn stream_with_rag(
            &self,
            _: &str,
            _: &[Message],
            _: &[String],
            _: &str,
            _: Option<f32>,
        ) -> crate::Result<LlmStream> {
            Err(LlmError::Internal("not used".into()))
        }

        async fn stream_with_rag_and_tools(
            &self,
            _: &str,
            _: &[Message],
            _: &[String],
            _: &[Value],
            _: &str,
            _: ToolChoice,
            _: Option<f32>,
        ) -> crate::Result<LlmStream> {
            Err(LlmError::Internal("not used".into()))
        }
    }

    fn model(name: &str, provider_id: &str) -> (String, LlmModelConfig) {
        (
            name.to_owned(),
            serde_json::from_value(json!({
                "model_name": provider_id,
                "model_url": "http://llm.internal",
            }))
            .unwrap(),
        )
    }

    fn request(preferences: Vec<&str>) -> SamplingRequest {
        SamplingRequest {
            messages: vec![Message::user("summarize this")],
            system_prompt: None,
            temperature: None,
            max_tokens: 256,
            model_preferences: preferences.into_iter().map(str::to_owned).collect(),
        }
    }

    fn handler(caller: Arc<RecordingCaller>) -> LlmSamplingHandler {
        LlmSamplingHandler::new(
            caller,
            vec![
                model("general", "provider/general-1"),
                model("small", "provider/small-1"),
            ],
        )
    }

    #[tokio::test]
    async fn preference_matches_configured_name() {
        let caller = Arc::new(RecordingCaller::default());
        let reply = handler(Arc::clone(&caller))
            .sample(request(vec!["small"]))
            .await
            .unwrap();
        assert_eq!(reply.model, "small");
        assert_eq!(reply.content, "sampled by small");
    }

    #[tokio::test]
    async fn preference_matches_provider_model_id() {
        let caller = Arc::new(RecordingCaller::default());
        let reply = handler(Arc::clone(&caller))
            .sample(request(vec!["provider/small-1"]))
            .await
            .unwrap();
        assert_eq!(reply.model, "small");
    }

    #[tokio::test]
    async fn unmatched_preferences_fall_back_to_first_model() {
        let caller = Arc::new(RecordingCaller::default());
        let reply = handler(Arc::clone(&caller))
            .sample(request(vec!["nonexistent-model"]))
            .await
            .unwrap();
        assert_eq!(reply.model, "general");
    }

    #[tokio::test]
    async fn system_prompt_is_prepended() {
        let caller = Arc::new(RecordingCaller::default());
        let mut req = request(vec![]);
        req.system_prompt = Some("Be brief".to_owned());

        handler(Arc::clone(&caller)).sample(req).await.unwrap();

        let calls = caller.plain_calls.lock().unwrap();
        let (_, messages) = &calls[0];
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "Be brief");
        assert_eq!(messages[1].content, "summarize this");
    }

    #[tokio::test]
    async fn no_configured_models_is_an_error() {
        let caller = Arc::new(RecordingCaller::default());
        let empty = LlmSamplingHandler::new(caller, Vec::new());
        let err = empty.sample(request(vec![])).await.unwrap_err();
        assert!(err.contains("no models configured"));
    }
}
