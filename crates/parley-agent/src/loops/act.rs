//! Pure action loop: execute tools until done.
//!
//! No explicit reasoning or observation phases.  The model sees the user's
//! tools plus a reserved `finished` pseudo-tool and is forced to call
//! something each step; calling `finished` (or answering with plain text)
//! ends the loop.  The fastest strategy, with minimal overhead.

use async_trait::async_trait;

use parley_kernel::{AgentOutcome, Message, UiEvent};
use parley_llm::ToolChoice;

use crate::dispatch::execute_parallel;
use crate::error::Result;
use crate::loops::{
    AgentLoop, AgentRun, LoopDeps, act_llm_call, extract_tool_args, fallback_final_answer,
    finished_tool_schema, outcome_metadata, selected_tools_schema,
};

pub struct ActLoop {
    deps: LoopDeps,
}

impl ActLoop {
    pub fn new(deps: LoopDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl AgentLoop for ActLoop {
    fn strategy(&self) -> &'static str {
        "act"
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

        while steps < max_steps && final_answer.is_none() {
            steps += 1;
            events.emit(UiEvent::AgentTurnStart { step: steps }).await;

            // The reserved control tool always leads the schema list.
            let mut tools = vec![finished_tool_schema()];
            tools.extend(selected_tools_schema(&self.deps, selected_tools));

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

            if !response.has_tool_calls() {
                final_answer = Some(non_empty_or(response.content, "Task completed."));
                break;
            }

            if let Some(answer) = extract_tool_args(&response, "finished")
                .and_then(|args| args.get("final_answer").and_then(|v| v.as_str().map(str::to_owned)))
                .filter(|answer| !answer.is_empty())
            {
                final_answer = Some(answer);
                break;
            }

            let actionable: Vec<_> = response
                .tool_calls
                .iter()
                .filter(|call| call.name != "finished")
                .cloned()
                .collect();
            if actionable.is_empty() {
                final_answer = Some(non_empty_or(response.content, "Task completed."));
                break;
            }

            messages.push(Message::assistant_tool_calls(
                response.content.clone(),
                actionable.clone(),
            ));

            let results = execute_parallel(
                &self.deps.executor,
                &actionable,
                context,
                Some(events.clone()),
            )
            .await;

            for result in &results {
                messages.push(Message::tool_result(&result.tool_call_id, &result.content));
            }
            events
                .emit(UiEvent::AgentToolResults { results })
                .await;
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

fn non_empty_or(content: String, fallback: &str) -> String {
    if content.is_empty() {
        fallback.to_owned()
    } else {
        content
    }
}
