//! Agent loop strategies.
//!
//! Four interchangeable drivers share one contract: [`AgentLoop::run`]
//! takes the working message list and emits progress events while deciding
//! when to call the LLM, how to present tools, and when to stop.
//!
//! | strategy    | control tools                  | tool execution per step |
//! |-------------|--------------------------------|-------------------------|
//! | `act`       | `finished`                     | all calls, parallel     |
//! | `react`     | `agent_decide_next` / `agent_observe_decide` | first call only |
//! | `think-act` | `agent_think`                  | first call only         |
//! | `agentic`   | none (`tool_choice=auto`)      | all calls, parallel     |
//!
//! Every strategy emits `agent_start`, `agent_turn_start` per step,
//! `agent_tool_results` whenever tools ran, and `agent_completion` on
//! exit.  On step exhaustion without a final answer, one plain (optionally
//! streamed) LLM call produces the text.

pub mod act;
pub mod agentic;
pub mod factory;
pub mod react;
pub mod streaming;
pub mod think_act;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use parley_kernel::{
    AgentContext, AgentOutcome, ApprovalTimeouts, ControlChannel, EventSink, LlmModelConfig,
    LlmResponse, Message,
};
use parley_llm::{LlmCaller, LlmSamplingHandler, ToolChoice};
use parley_mcp::ServerManager;

use crate::error::Result;
use crate::executor::ToolExecutor;
use crate::runtime::ToolRuntime;

pub use factory::AgentLoopFactory;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Collaborators shared by every strategy.
#[derive(Clone)]
pub struct LoopDeps {
    pub llm: Arc<dyn LlmCaller>,
    /// Tool layer; absent when the deployment has no tool servers.
    pub runtime: Option<Arc<dyn ToolRuntime>>,
    pub executor: Arc<ToolExecutor>,
    /// Inbound control messages (user input, stop); absent for headless
    /// runs.
    pub control: Option<Arc<dyn ControlChannel>>,
    pub timeouts: ApprovalTimeouts,
}

impl LoopDeps {
    /// Standard wiring over a live [`ServerManager`].
    ///
    /// The manager becomes the loops' tool runtime, and the LLM-backed
    /// sampling handler is installed on it so tool servers can issue
    /// `sampling/createMessage` requests against the configured `models`
    /// map.  Hosts call this once at startup, after building the executor
    /// over the same manager.
    pub fn over_manager(
        llm: Arc<dyn LlmCaller>,
        manager: Arc<ServerManager>,
        executor: Arc<ToolExecutor>,
        control: Option<Arc<dyn ControlChannel>>,
        timeouts: ApprovalTimeouts,
        models: Vec<(String, LlmModelConfig)>,
    ) -> Self {
        manager.set_sampling_handler(Arc::new(LlmSamplingHandler::new(
            Arc::clone(&llm),
            models,
        )));
        let runtime: Arc<dyn ToolRuntime> = manager;
        Self {
            llm,
            runtime: Some(runtime),
            executor,
            control,
            timeouts,
        }
    }
}

/// One loop invocation.  `messages` is the working history; the loop
/// appends to it in causal order and the caller hands it to persistence
/// afterwards.
pub struct AgentRun<'a> {
    pub model: &'a str,
    pub messages: &'a mut Vec<Message>,
    pub context: &'a AgentContext,
    pub selected_tools: Option<&'a [String]>,
    pub data_sources: Option<&'a [String]>,
    pub max_steps: u32,
    pub temperature: Option<f32>,
    pub events: Arc<dyn EventSink>,
    pub streaming: bool,
}

/// A single agent loop strategy.
#[async_trait]
pub trait AgentLoop: Send + Sync {
    /// Canonical strategy name (`act`, `react`, `think-act`, `agentic`).
    fn strategy(&self) -> &'static str;

    /// Drive the loop to a final answer.
    async fn run(&self, run: AgentRun<'_>) -> Result<AgentOutcome>;
}

/// Build the standard outcome metadata.
pub(crate) fn outcome_metadata(strategy: &str) -> HashMap<String, Value> {
    let mut metadata = HashMap::new();
    metadata.insert("agent_mode".to_owned(), Value::Bool(true));
    metadata.insert("strategy".to_owned(), Value::String(strategy.to_owned()));
    metadata
}

// ---------------------------------------------------------------------------
// Control-call parsing
// ---------------------------------------------------------------------------

/// Arguments of the named control tool call, when present.
pub(crate) fn extract_tool_args(response: &LlmResponse, tool_name: &str) -> Option<Value> {
    for call in &response.tool_calls {
        if call.name != tool_name {
            continue;
        }
        match &call.arguments {
            Value::Object(_) => return Some(call.arguments.clone()),
            Value::String(raw) => {
                return serde_json::from_str::<Value>(raw)
                    .ok()
                    .filter(Value::is_object);
            }
            _ => return None,
        }
    }
    None
}

/// Fallback parsing for providers that answer control calls in text: the
/// whole text as JSON, else the last `{...}` span within it.
pub(crate) fn parse_control_json(text: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(text)
        && v.is_object()
    {
        return Some(v);
    }
    let start = text.rfind('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// The most recent non-empty user message.
pub(crate) fn latest_user_question(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == parley_kernel::Role::User && !m.content.is_empty())
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Shared LLM plumbing
// ---------------------------------------------------------------------------

/// Schemas for the selected tools; empty when none are selected or the
/// tool layer is absent.
pub(crate) fn selected_tools_schema(
    deps: &LoopDeps,
    selected_tools: Option<&[String]>,
) -> Vec<Value> {
    match (selected_tools, &deps.runtime) {
        (Some(names), Some(runtime)) if !names.is_empty() => runtime.tools_schema(names),
        _ => Vec::new(),
    }
}

/// One act-phase LLM call, routed through retrieval when data sources are
/// selected.
pub(crate) async fn act_llm_call(
    deps: &LoopDeps,
    model: &str,
    messages: &[Message],
    tools: &[Value],
    tool_choice: ToolChoice,
    temperature: Option<f32>,
    data_sources: Option<&[String]>,
    user_email: &str,
) -> Result<LlmResponse> {
    let response = match data_sources {
        Some(sources) if !sources.is_empty() && !user_email.is_empty() => {
            deps.llm
                .call_with_rag_and_tools(
                    model,
                    messages,
                    sources,
                    tools,
                    user_email,
                    tool_choice,
                    temperature,
                )
                .await?
        }
        _ => {
            deps.llm
                .call_with_tools(
                    model,
                    messages,
                    tools,
                    tool_choice,
                    temperature,
                    (!user_email.is_empty()).then_some(user_email),
                )
                .await?
        }
    };
    Ok(response)
}

/// The step-exhaustion fallback: one plain LLM call, streamed to the
/// client when streaming is on.
pub(crate) async fn fallback_final_answer(
    deps: &LoopDeps,
    model: &str,
    messages: &[Message],
    temperature: Option<f32>,
    user_email: &str,
    streaming: bool,
    events: &Arc<dyn EventSink>,
) -> Result<String> {
    let user = (!user_email.is_empty()).then_some(user_email);
    if streaming {
        streaming::stream_final_answer(
            deps.llm.as_ref(),
            events.as_ref(),
            model,
            messages,
            temperature,
            user,
        )
        .await
    } else {
        Ok(deps.llm.call_plain(model, messages, temperature, user).await?)
    }
}

// ---------------------------------------------------------------------------
// Control tool schemas
// ---------------------------------------------------------------------------

/// The `finished` pseudo-tool presented by the act strategy.
pub(crate) fn finished_tool_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": "finished",
            "description": "Call this when you have completed the task and are ready to provide a final answer to the user.",
            "parameters": {
                "type": "object",
                "properties": {
                    "final_answer": {
                        "type": "string",
                        "description": "The final response to provide to the user",
                    },
                },
                "required": ["final_answer"],
                "additionalProperties": false,
            },
        },
    })
}

/// The react reason-phase control tool.
pub(crate) fn decide_next_tool_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": "agent_decide_next",
            "description": "Plan the next action. If you can answer now, set finish=true and provide final_answer. If you need information from the user, set request_input={question: \"...\"}.",
            "parameters": {
                "type": "object",
                "properties": {
                    "finish": {"type": "boolean"},
                    "final_answer": {"type": "string"},
                    "request_input": {
                        "type": "object",
                        "properties": {
                            "question": {"type": "string"},
                        },
                        "required": ["question"],
                    },
                    "next_plan": {"type": "string"},
                    "tools_to_consider": {"type": "array", "items": {"type": "string"}},
                },
                "additionalProperties": false,
            },
        },
    })
}

/// The react observe-phase control tool.
pub(crate) fn observe_decide_tool_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": "agent_observe_decide",
            "description": "Given the observations, decide whether to continue another step or finish.",
            "parameters": {
                "type": "object",
                "properties": {
                    "should_continue": {"type": "boolean"},
                    "final_answer": {"type": "string"},
                    "observation": {"type": "string"},
                },
                "additionalProperties": false,
            },
        },
    })
}

/// The think-act control tool, used for planning and observation alike.
pub(crate) fn think_tool_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": "agent_think",
            "description": "Think step: analyze the user input and context, outline next action or finish. Be concise, at most two sentences. You are only thinking, not acting right now.",
            "parameters": {
                "type": "object",
                "properties": {
                    "finish": {"type": "boolean"},
                    "final_answer": {"type": "string"},
                    "next_action_hint": {"type": "string"},
                },
                "additionalProperties": false,
            },
        },
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parley_kernel::ToolCall;

    #[test]
    fn extract_tool_args_by_name() {
        let response = LlmResponse {
            content: String::new(),
            tool_calls: vec![
                ToolCall::new("a", "other_tool", json!({"x": 1})),
                ToolCall::new("b", "agent_think", json!({"finish": true})),
            ],
            model_used: None,
        };
        let args = extract_tool_args(&response, "agent_think").unwrap();
        assert_eq!(args["finish"], true);
        assert!(extract_tool_args(&response, "missing").is_none());
    }

    #[test]
    fn extract_tool_args_parses_string_payload() {
        let response = LlmResponse {
            content: String::new(),
            tool_calls: vec![ToolCall::new(
                "a",
                "agent_think",
                json!(r#"{"finish": false, "next_action_hint": "search"}"#),
            )],
            model_used: None,
        };
        let args = extract_tool_args(&response, "agent_think").unwrap();
        assert_eq!(args["next_action_hint"], "search");
    }

    #[test]
    fn parse_control_json_whole_and_embedded() {
        assert_eq!(
            parse_control_json(r#"{"finish": true}"#).unwrap()["finish"],
            true
        );

        let embedded = r#"I think we're done. {"finish": true, "final_answer": "42"}"#;
        let parsed = parse_control_json(embedded).unwrap();
        assert_eq!(parsed["final_answer"], "42");

        assert!(parse_control_json("no json here").is_none());
    }

    #[test]
    fn latest_user_question_walks_backwards() {
        let messages = vec![
            Message::user("first"),
            Message::assistant("answer"),
            Message::user("second"),
            Message::assistant("another"),
        ];
        assert_eq!(latest_user_question(&messages), "second");
        assert_eq!(latest_user_question(&[]), "");
    }
}
