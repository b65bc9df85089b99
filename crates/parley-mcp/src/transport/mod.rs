//! Tool-server transports.
//!
//! Both transports speak the same JSON-RPC framing; they differ only in the
//! channel: [`stdio::StdioTransport`] pipes frames through a spawned child
//! process, [`http::HttpTransport`] POSTs them to a streamable HTTP (or
//! SSE) endpoint.  Server-originated frames are funneled through the shared
//! dispatch helpers here so both transports deliver callbacks identically.

pub mod http;
pub mod stdio;

use async_trait::async_trait;
use serde_json::{Value, json};

use parley_kernel::{Message, UiEvent};

use crate::error::Result;
use crate::protocol::{LogParams, ProgressParams, RpcError};
use crate::routing::{CallbackRouter, ElicitationPrompt, SamplingRequest};

/// A live connection to one tool server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and await its response payload.
    ///
    /// The caller bounds the wait; transports do not time out on their own.
    async fn request(&self, method: &str, params: Value) -> Result<Value>;

    /// Tear the connection down (kill the child / drop the session).
    async fn shutdown(&self);
}

// ---------------------------------------------------------------------------
// Shared server-frame handling
// ---------------------------------------------------------------------------

/// Deliver a server notification to the sinks of the matching in-flight
/// call.  Unroutable notifications are dropped with a trace.
pub(crate) async fn dispatch_notification(
    server: &str,
    router: &CallbackRouter,
    method: &str,
    params: Value,
) {
    match method {
        "notifications/progress" => {
            let Ok(progress) = serde_json::from_value::<ProgressParams>(params) else {
                tracing::trace!(server, "malformed progress notification");
                return;
            };
            // The manager sets progressToken to the tool call id, so exact
            // routing usually works; fall back to any call on this server.
            let token = match &progress.progress_token {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let sinks = router
                .get(server, &token)
                .or_else(|| router.any_for_server(server));
            let Some(sinks) = sinks else {
                tracing::trace!(server, "progress notification with no in-flight call");
                return;
            };
            if let Some(events) = &sinks.events {
                events
                    .emit(UiEvent::ToolProgress {
                        tool_call_id: sinks.tool_call_id.clone(),
                        tool_name: sinks.tool_name.clone(),
                        progress: progress.progress,
                        total: progress.total,
                        message: progress.message,
                    })
                    .await;
            }
        }

        "notifications/message" => {
            let Ok(log) = serde_json::from_value::<LogParams>(params) else {
                tracing::trace!(server, "malformed log notification");
                return;
            };
            let message = log.message_text();
            tracing::debug!(server, level = %log.level, "{message}");

            if let Some(sinks) = router.any_for_server(server)
                && let Some(events) = &sinks.events
            {
                events
                    .emit(UiEvent::ToolLog {
                        tool_call_id: sinks.tool_call_id.clone(),
                        tool_name: sinks.tool_name.clone(),
                        server_name: server.to_owned(),
                        level: log.level,
                        message,
                    })
                    .await;
            }
        }

        other => {
            tracing::trace!(server, method = other, "ignoring server notification");
        }
    }
}

/// Answer a server-initiated request, returning the JSON-RPC result or
/// error payload to send back.
pub(crate) async fn answer_server_request(
    server: &str,
    router: &CallbackRouter,
    method: &str,
    params: Value,
) -> std::result::Result<Value, RpcError> {
    match method {
        "ping" => Ok(json!({})),

        "elicitation/create" => {
            let Some(sinks) = router.any_for_server(server) else {
                tracing::warn!(server, "elicitation request with no routing context, cancelling");
                return Ok(json!({"action": "cancel"}));
            };
            let Some(handler) = sinks.elicitation.clone() else {
                tracing::warn!(
                    server,
                    tool = %sinks.tool_name,
                    "elicitation request but no handler registered, cancelling"
                );
                return Ok(json!({"action": "cancel"}));
            };

            let prompt = ElicitationPrompt {
                tool_call_id: sinks.tool_call_id.clone(),
                tool_name: sinks.tool_name.clone(),
                message: params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                response_schema: params
                    .get("requestedSchema")
                    .cloned()
                    .unwrap_or(Value::Null),
            };

            let outcome = handler.elicit(prompt).await;
            let action = serde_json::to_value(outcome.action)
                .unwrap_or_else(|_| Value::String("cancel".into()));
            let mut reply = json!({"action": action});
            if let Some(content) = outcome.content {
                reply["content"] = content;
            }
            Ok(reply)
        }

        "sampling/createMessage" => {
            let Some(sinks) = router.any_for_server(server) else {
                tracing::warn!(server, "sampling request with no routing context");
                return Err(RpcError {
                    code: -32603,
                    message: "no routing context for sampling request".into(),
                    data: None,
                });
            };
            let Some(handler) = sinks.sampling.clone() else {
                return Err(RpcError {
                    code: -32603,
                    message: "sampling is not available".into(),
                    data: None,
                });
            };

            let request = parse_sampling_params(&params);
            tracing::info!(
                server,
                tool = %sinks.tool_name,
                messages = request.messages.len(),
                max_tokens = request.max_tokens,
                "sampling request from tool server"
            );

            match handler.sample(request).await {
                Ok(reply) => Ok(json!({
                    "role": "assistant",
                    "content": {"type": "text", "text": reply.content},
                    "model": reply.model,
                })),
                Err(reason) => Err(RpcError {
                    code: -32603,
                    message: reason,
                    data: None,
                }),
            }
        }

        other => Err(RpcError {
            code: -32601,
            message: format!("method not supported: {other}"),
            data: None,
        }),
    }
}

/// Convert the wire sampling params into a [`SamplingRequest`].
fn parse_sampling_params(params: &Value) -> SamplingRequest {
    let mut messages = Vec::new();
    if let Some(items) = params.get("messages").and_then(Value::as_array) {
        for item in items {
            let role = item.get("role").and_then(Value::as_str).unwrap_or("user");
            let text = match item.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(content) => content
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                None => String::new(),
            };
            messages.push(match role {
                "assistant" => Message::assistant(text),
                _ => Message::user(text),
            });
        }
    }

    // Model preferences arrive as hint objects, a list of names, or a bare
    // string depending on the server SDK.
    let mut model_preferences = Vec::new();
    match params.get("modelPreferences") {
        Some(Value::String(s)) => model_preferences.push(s.clone()),
        Some(Value::Array(items)) => {
            for item in items {
                if let Some(s) = item.as_str() {
                    model_preferences.push(s.to_owned());
                }
            }
        }
        Some(Value::Object(map)) => {
            if let Some(hints) = map.get("hints").and_then(Value::as_array) {
                for hint in hints {
                    if let Some(name) = hint.get("name").and_then(Value::as_str) {
                        model_preferences.push(name.to_owned());
                    }
                }
            }
        }
        _ => {}
    }

    SamplingRequest {
        messages,
        system_prompt: params
            .get("systemPrompt")
            .and_then(Value::as_str)
            .map(str::to_owned),
        temperature: params
            .get("temperature")
            .and_then(Value::as_f64)
            .map(|t| t as f32),
        max_tokens: params
            .get("maxTokens")
            .and_then(Value::as_u64)
            .unwrap_or(512) as u32,
        model_preferences,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
