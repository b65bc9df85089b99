//! Claude-native agentic loop.
//!
//! No control tools, no forced tool choice, no separate reasoning phases.
//! Each step calls the LLM with the real user tools and
//! `tool_choice=auto`; the model either calls tools (all executed in
//! parallel, results fed back) or answers with text, which ends the loop.
//! The simplest and most token-efficient strategy because the model
//! manages its own control flow.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use parley_kernel::{AgentOutcome, EventSink, LlmResponse, Message, UiEvent};
use parley_llm::{StreamItem, ToolChoice};

use crate::dispatch::execute_parallel;
use crate::error::Result;
use crate::loops::{
    AgentLoop, AgentRun, LoopDeps, act_llm_call, fallback_final_answer, outcome_metadata,
    selected_tools_schema,
};

pub struct AgenticLoop {
    deps: LoopDeps,
}

impl AgenticLoop {
    pub fn new(deps: LoopDeps) -> Self {
        Self { deps }
    }

    /// One streamed LLM call: tokens are published as they arrive; once the
    /// stream ends, accumulated tool calls (if any) take over and text
    /// streaming stops without a closing token.
    async fn call_llm_streaming(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[serde_json::Value],
        data_sources: Option<&[String]>,
        user_email: &str,
        temperature: Option<f32>,
        events: &Arc<dyn EventSink>,
    ) -> Result<LlmResponse> {
        let mut stream = match data_sources {
            Some(sources) if !sources.is_empty() && !user_email.is_empty() => {
                self.deps
                    .llm
                    .stream_with_rag_and_tools(
                        model,
                        messages,
                        sources,
                        tools,
                        user_email,
                        ToolChoice::Auto,
                        temperature,
                    )
                    .await?
            }
            _ => {
                self.deps
                    .llm
                    .stream_with_tools(
                        model,
                        messages,
                        tools,
                        ToolChoice::Auto,
                        temperature,
                        (!user_email.is_empty()).then_some(user_email),
                    )
                    .await?
            }
        };

        let mut accumulated = String::new();
        let mut final_response: Option<LlmResponse> = None;
        let mut is_first = true;

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
                Ok(StreamItem::Final(response)) => {
                    final_response = Some(response);
                }
                Err(e) => {
                    tracing::error!("error during streaming LLM call in agentic loop: {e}");
                    break;
                }
            }
        }

        let response =
            final_response.unwrap_or_else(|| LlmResponse::text(accumulated.clone()));

        // Text-only responses close the token stream; tool-call responses
        // leave it open-ended since execution follows.
        if !response.has_tool_calls() && !accumulated.is_empty() {
            events
                .emit(UiEvent::TokenStream {
                    token: String::new(),
                    is_first: false,
                    is_last: true,
                })
                .await;
        }

        Ok(response)
    }
}

#[async_trait]
impl AgentLoop for AgenticLoop {
    fn strategy(&self) -> &'static str {
        "agentic"
    }

    async fn run(&self, run: AgentRun<'_>) -> Result<AgentOutcome> {
        let AgentRun {
            model,
            messages,
            context,
            selected_tools,
            data_sources,
            max_steps,
            temperature,
            events,
            streaming,
        } = run;

        events
            .emit(UiEvent::AgentStart {
                strategy: self.strategy().to_owned(),
                max_steps,
            })
            .await;

        let tools = selected_tools_schema(&self.deps, selected_tools);

        let mut steps = 0u32;
        let mut final_answer: Option<String> = None;

        while steps < max_steps {
            steps += 1;
            events.emit(UiEvent::AgentTurnStart { step: steps }).await;

            let response = if streaming {
                self.call_llm_streaming(
                    model,
                    messages,
                    &tools,
                    data_sources,
                    &context.user_email,
                    temperature,
                    &events,
                )
                .await?
            } else {
                act_llm_call(
                    &self.deps,
                    model,
                    messages,
                    &tools,
                    ToolChoice::Auto,
                    temperature,
                    data_sources,
                    &context.user_email,
                )
                .await?
            };

            if !response.has_tool_calls() {
                final_answer = Some(response.content);
                break;
            }

            // The model chose to call tools: execute all in parallel, feed
            // the results back, and loop.
            messages.push(Message::assistant_tool_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            let results = execute_parallel(
                &self.deps.executor,
                &response.tool_calls,
                context,
                Some(events.clone()),
            )
            .await;

            for result in &results {
                messages.push(Message::tool_result(&result.tool_call_id, &result.content));
            }
            events.emit(UiEvent::AgentToolResults { results }).await;
        }

        // Max steps exhausted without a text-only response.
        let final_answer = match final_answer {
            Some(answer) => answer,
            None => {
                fallback_final_answer(
                    &self.deps,
                    model,
                    messages,
                    temperature,
                    &context.user_email,
                    streaming,
                    &events,
                )
                .await?
            }
        };

        events.emit(UiEvent::AgentCompletion { steps }).await;
        Ok(AgentOutcome {
            final_answer,
            steps,
            metadata: outcome_metadata(self.strategy()),
        })
    }
}
