//! Reason–Act–Observe loop.
//!
//! Three LLM calls per step.  **Reason** sees only the `agent_decide_next`
//! control tool and may finish, ask the user for input, or plan ahead.
//! **Act** sees the user's tools with `tool_choice=required` and executes
//! only the first returned call, leaving the continue/stop decision to
//! **Observe**, which sees only `agent_observe_decide`.  Control calls
//! that come back as plain text are recovered by parsing the last JSON
//! object in the response.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use parley_kernel::{AgentOutcome, ClientMessage, Message, UiEvent};
use parley_llm::ToolChoice;

use crate::error::Result;
use crate::loops::{
    AgentLoop, AgentRun, LoopDeps, act_llm_call, decide_next_tool_schema, extract_tool_args,
    fallback_final_answer, latest_user_question, observe_decide_tool_schema, outcome_metadata,
    parse_control_json, selected_tools_schema,
};

pub struct ReactLoop {
    deps: LoopDeps,
}

/// How a user-input wait ended.
enum UserInputOutcome {
    Reply(String),
    Stopped,
    TimedOut,
}

impl ReactLoop {
    pub fn new(deps: LoopDeps) -> Self {
        Self { deps }
    }

    /// One control-phase call: forced control tool, with a plain-text
    /// fallback pass when the provider ignores the tool.
    ///
    /// Returns `(control_args, visible_text)`.
    async fn control_call(
        &self,
        model: &str,
        messages: &[Message],
        control_schema: Value,
        control_name: &str,
        temperature: Option<f32>,
        user_email: &str,
    ) -> Result<(Option<Value>, String)> {
        let user = (!user_email.is_empty()).then_some(user_email);
        let response = self
            .deps
            .llm
            .call_with_tools(
                model,
                messages,
                &[control_schema],
                ToolChoice::Required,
                temperature,
                user,
            )
            .await?;

        let mut control = extract_tool_args(&response, control_name)
            .or_else(|| parse_control_json(&response.content));
        let mut visible = response.content.clone();

        if control.is_none() {
            let fallback_text = self
                .deps
                .llm
                .call_plain(model, messages, temperature, user)
                .await?;
            control = parse_control_json(&fallback_text);
            visible = fallback_text;
        }

        Ok((control, visible))
    }

    /// Wait for the user's reply to a requested input, within the
    /// cumulative budget.  Non-input control messages are skipped; a stop
    /// control aborts.
    async fn await_user_input(&self) -> UserInputOutcome {
        let Some(control) = &self.deps.control else {
            return UserInputOutcome::TimedOut;
        };

        let deadline = Instant::now() + Duration::from_secs(self.deps.timeouts.user_input_secs);
        loop {
            let now = Instant::now();
            if now >= deadline {
                return UserInputOutcome::TimedOut;
            }
            match tokio::time::timeout(deadline - now, control.recv()).await {
                Ok(Some(ClientMessage::AgentUserInput { content })) if !content.is_empty() => {
                    return UserInputOutcome::Reply(content);
                }
                Ok(Some(ClientMessage::AgentControl { action })) if action == "stop" => {
                    return UserInputOutcome::Stopped;
                }
                Ok(Some(_)) => continue,
                Ok(None) => return UserInputOutcome::TimedOut,
                Err(_) => return UserInputOutcome::TimedOut,
            }
        }
    }
}

/// System context appended for the reason phase.
fn reason_context(user_question: &str, last_observation: Option<&str>) -> String {
    let mut text = format!(
        "You are deciding the next step toward answering the user's question:\n{user_question}"
    );
    if let Some(observation) = last_observation {
        text.push_str("\n\nLatest observation:\n");
        text.push_str(observation);
    }
    text.push_str("\n\nRespond through the agent_decide_next tool.");
    text
}

/// System context appended for the observe phase: the latest tool output,
/// previewed.
fn observe_context(user_question: &str, messages: &[Message]) -> String {
    let mut summary = messages
        .iter()
        .rev()
        .find(|m| m.role == parley_kernel::Role::Tool)
        .map(|m| m.content.trim().to_owned())
        .unwrap_or_else(|| "No tools were executed.".to_owned());
    if summary.len() > 400 {
        summary.truncate(400);
        summary.push_str("...");
    }
    format!(
        "The user asked:\n{user_question}\n\nLatest tool output:\n{summary}\n\n\
         Decide through the agent_observe_decide tool whether another step is needed."
    )
}

/// Recover a `request_input` question from free-form control text.
fn question_from_text(text: &str) -> Option<String> {
    if !text.contains("\"request_input\"") {
        return None;
    }
    let re = Regex::new(r#""request_input"\s*:\s*\{[^}]*"question"\s*:\s*"([^"]+)""#).ok()?;
    re.captures(text)
        .map(|captures| captures[1].to_owned())
}

#[async_trait]
impl AgentLoop for ReactLoop {
    fn strategy(&self) -> &'static str {
        "react"
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
        let mut final_answer: Option<String> = None;
        let mut user_question = latest_user_question(messages);
        let mut last_observation: Option<String> = None;

        while steps < max_steps {
            steps += 1;
            events.emit(UiEvent::AgentTurnStart { step: steps }).await;

            // ----- Reason -----
            let mut reason_messages = messages.clone();
            reason_messages.push(Message::system(reason_context(
                &user_question,
                last_observation.as_deref(),
            )));
            let (reason_ctrl, reason_visible) = self
                .control_call(
                    model,
                    &reason_messages,
                    decide_next_tool_schema(),
                    "agent_decide_next",
                    temperature,
                    &context.user_email,
                )
                .await?;

            events
                .emit(UiEvent::AgentReason {
                    message: reason_visible.clone(),
                    step: steps,
                })
                .await;

            let finish = reason_ctrl
                .as_ref()
                .and_then(|c| c.get("finish"))
                .and_then(Value::as_bool)
                .unwrap_or(false);

            let question = reason_ctrl
                .as_ref()
                .and_then(|c| c.get("request_input"))
                .and_then(|ri| ri.get("question"))
                .and_then(Value::as_str)
                .map(str::to_owned)
                .or_else(|| question_from_text(&reason_visible));

            if let Some(question) = question.filter(|q| !q.is_empty()) {
                events
                    .emit(UiEvent::AgentRequestInput {
                        question,
                        step: steps,
                    })
                    .await;

                match self.await_user_input().await {
                    UserInputOutcome::Reply(reply) => {
                        messages.push(Message::user(reply.clone()));
                        user_question = reply;
                        last_observation = Some("User provided additional input.".to_owned());
                        continue;
                    }
                    UserInputOutcome::Stopped | UserInputOutcome::TimedOut => break,
                }
            }

            if finish {
                let answer = reason_ctrl
                    .as_ref()
                    .and_then(|c| c.get("final_answer"))
                    .and_then(Value::as_str)
                    .filter(|a| !a.is_empty())
                    .map(str::to_owned)
                    .unwrap_or(reason_visible);
                final_answer = Some(answer);
                break;
            }

            // ----- Act -----
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
                    // Only the first call runs; Observe decides whether to
                    // continue.
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

            // ----- Observe -----
            let mut observe_messages = messages.clone();
            observe_messages.push(Message::system(observe_context(&user_question, messages)));
            let (observe_ctrl, observe_visible) = self
                .control_call(
                    model,
                    &observe_messages,
                    observe_decide_tool_schema(),
                    "agent_observe_decide",
                    temperature,
                    &context.user_email,
                )
                .await?;

            events
                .emit(UiEvent::AgentObserve {
                    message: observe_visible.clone(),
                    step: steps,
                })
                .await;

            if let Some(ctrl) = &observe_ctrl {
                let candidate = ctrl
                    .get("final_answer")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|a| !a.is_empty());
                if let Some(answer) = candidate {
                    final_answer = Some(answer.to_owned());
                    break;
                }
                let should_continue = ctrl
                    .get("should_continue")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                if !should_continue {
                    final_answer = Some(observe_visible.clone());
                    break;
                }
            }

            last_observation = Some(observe_visible);
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
