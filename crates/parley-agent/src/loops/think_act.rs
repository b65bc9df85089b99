//! Think-Act loop.
//!
//! Simpler than react: a single `agent_think` control tool serves both
//! planning and observation.  Shape: one initial think (always), then
//! {act one tool, think} until the think decides to finish or steps run
//! out.

use async_trait::async_trait;
use serde_json::Value;

use parley_kernel::{AgentOutcome, LlmResponse, Message, UiEvent};
use parley_llm::ToolChoice;

use crate::error::Result;
use crate::loops::{
    AgentLoop, AgentRun, LoopDeps, act_llm_call, extract_tool_args, fallback_final_answer,
    outcome_metadata, parse_control_json, selected_tools_schema, think_tool_schema,
};

pub struct ThinkActLoop {
    deps: LoopDeps,
}

impl ThinkActLoop {
    pub fn new(deps: LoopDeps) -> Self {
        Self { deps }
    }

    /// One think phase: forced `agent_think` call, JSON-from-text
    /// fallback.
    async fn think(
        &self,
        model: &str,
        messages: &[Message],
        temperature: Option<f32>,
        user_email: &str,
    ) -> Result<(Option<Value>, String)> {
        let response: LlmResponse = self
            .deps
            .llm
            .call_with_tools(
                model,
                messages,
                &[think_tool_schema()],
                ToolChoice::Required,
                temperature,
                (!user_email.is_empty()).then_some(user_email),
            )
            .await?;

        let control = extract_tool_args(&response, "agent_think")
            .or_else(|| parse_control_json(&response.content));
        Ok((control, response.content))
    }
}

/// The think decision, when the control payload carried one.
fn think_finish(control: &Option<Value>, visible: &str) -> Option<String> {
    let control = control.as_ref()?;
    if !control.get("finish").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let answer = control
        .get("final_answer")
        .and_then(Value::as_str)
        .filter(|a| !a.is_empty())
        .unwrap_or(visible);
    Some(answer.to_owned())
}

#[async_trait]
impl AgentLoop for ThinkActLoop {
    fn strategy(&self) -> &'static str {
        "think-act"
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

        let mut steps = 0u32;

        // First think always happens before entering the loop.
        steps += 1;
        events.emit(UiEvent::AgentTurnStart { step: steps }).await;
        let (control, visible) = self
            .think(model, messages, temperature, &context.user_email)
            .await?;
        events
            .emit(UiEvent::AgentReason {
                message: visible.clone(),
                step: steps,
            })
            .await;
        let mut final_answer = think_finish(&control, &visible);

        while steps < max_steps && final_answer.is_none() {
            // Act: select and execute at most one tool.
            let tools = selected_tools_schema(&self.deps, selected_tools);
            if !tools.is_empty() {
                let response = act_llm_call(
                    &self.deps,
                    model,
                    messages,
                    &tools,
                    ToolChoice::Required,
                    temperature,
                    data_sources,
                    &context.user_email,
                )
                .await?;

                if response.has_tool_calls() {
                    let first_call = response.tool_calls[0].clone();
                    messages.push(Message::assistant_tool_calls(
                        response.content.clone(),
                        vec![first_call.clone()],
                    ));

                    let result = self
                        .deps
                        .executor
                        .execute_single(&first_call, context, Some(events.clone()))
                        .await;
                    messages.push(Message::tool_result(&result.tool_call_id, &result.content));
                    events
                        .emit(UiEvent::AgentToolResults {
                            results: vec![result],
                        })
                        .await;
                } else if !response.content.is_empty() {
                    final_answer = Some(response.content);
                    break;
                }
            }

            // Think after the action.
            steps += 1;
            events.emit(UiEvent::AgentTurnStart { step: steps }).await;
            let (control, visible) = self
                .think(model, messages, temperature, &context.user_email)
                .await?;
            events
                .emit(UiEvent::AgentReason {
                    message: visible.clone(),
                    step: steps,
                })
                .await;
            if let Some(answer) = think_finish(&control, &visible) {
                final_answer = Some(answer);
                break;
            }
        }

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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
