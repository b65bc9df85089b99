//! Single tool call execution.
//!
//! One call runs through a fixed pipeline: parse (and best-effort repair)
//! the arguments, inject security-critical context, filter to the tool's
//! declared schema, sanitize a display copy for the UI, obtain approval,
//! invoke through the tool runtime, and package the result.  Edited
//! approval arguments are re-injected and re-filtered so the injections
//! cannot be removed by the user.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use parley_kernel::{
    AgentContext, ApprovalTimeouts, ElicitationAction, EventSink, ToolApprovalsConfig, ToolCall,
    ToolResult, UiEvent,
};
use parley_mcp::{
    ElicitationHandler, ElicitationOutcome, ElicitationPrompt, McpError,
};

use crate::broker::{ApprovalBroker, ElicitationBroker, ElicitationReply};
use crate::runtime::ToolRuntime;

/// Produces signed short-lived download URLs for session files.  The
/// capability layer itself is external to the core.
pub trait UrlSigner: Send + Sync {
    fn create_download_url(&self, key: &str, user_email: &str) -> String;
}

/// Executes one tool call end to end.
pub struct ToolExecutor {
    runtime: Arc<dyn ToolRuntime>,
    approvals: Arc<ApprovalBroker>,
    elicitations: Arc<ElicitationBroker>,
    approvals_config: Option<ToolApprovalsConfig>,
    timeouts: ApprovalTimeouts,
    url_signer: Option<Arc<dyn UrlSigner>>,
    skip_approval: bool,
}

impl ToolExecutor {
    pub fn new(
        runtime: Arc<dyn ToolRuntime>,
        approvals: Arc<ApprovalBroker>,
        elicitations: Arc<ElicitationBroker>,
    ) -> Self {
        Self {
            runtime,
            approvals,
            elicitations,
            approvals_config: None,
            timeouts: ApprovalTimeouts::default(),
            url_signer: None,
            skip_approval: false,
        }
    }

    /// Attach the deployment approval policy.
    pub fn with_approvals_config(mut self, config: ToolApprovalsConfig) -> Self {
        self.approvals_config = Some(config);
        self
    }

    pub fn with_timeouts(mut self, timeouts: ApprovalTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_url_signer(mut self, signer: Arc<dyn UrlSigner>) -> Self {
        self.url_signer = Some(signer);
        self
    }

    /// Bypass approval entirely (trusted internal callers).
    pub fn with_skip_approval(mut self, skip: bool) -> Self {
        self.skip_approval = skip;
        self
    }

    /// Execute a single tool call.  Never fails the caller: every failure
    /// mode becomes an unsuccessful [`ToolResult`].
    pub async fn execute_single(
        &self,
        tool_call: &ToolCall,
        context: &AgentContext,
        events: Option<Arc<dyn EventSink>>,
    ) -> ToolResult {
        let tool_name = &tool_call.name;

        // 1-2. Parse/repair arguments, then inject context.
        let parsed = parse_tool_arguments(tool_call);
        let injected = self.inject_context(parsed, context, tool_name).await;

        // 3. Only schema-declared parameters reach the server.
        let mut filtered = self.filter_args_to_schema(injected, tool_name);

        // 4. What the approval UI sees: basenames, no signed URLs.
        let display_args = sanitize_args_for_ui(&filtered);

        // 5. Approval.
        let (needs_approval, allow_edit, admin_required) = if self.skip_approval {
            (false, true, false)
        } else {
            self.approval_requirement(tool_name).await
        };

        let mut arguments_were_edited = false;

        if needs_approval {
            tracing::info!(tool = %tool_name, admin_required, "tool requires approval");

            if let Some(events) = &events {
                events
                    .emit(UiEvent::ToolApprovalRequest {
                        tool_call_id: tool_call.id.clone(),
                        tool_name: tool_name.clone(),
                        arguments: Value::Object(display_args.clone()),
                        allow_edit,
                        admin_required,
                    })
                    .await;
            }

            let waiter = self.approvals.create(&tool_call.id);
            let decision = waiter
                .wait(Duration::from_secs(self.timeouts.approval_secs))
                .await;
            self.approvals.cleanup(&tool_call.id);

            let Some(decision) = decision else {
                tracing::warn!(tool = %tool_name, "approval timed out");
                return ToolResult::failed(
                    &tool_call.id,
                    "Tool execution timed out waiting for user approval",
                    "Approval timeout",
                );
            };

            if !decision.approved {
                let reason = decision
                    .reason
                    .unwrap_or_else(|| "User rejected the tool call".to_owned());
                tracing::info!(tool = %tool_name, reason = %reason, "tool rejected by user");
                return ToolResult::failed(
                    &tool_call.id,
                    format!("Tool execution rejected by user: {reason}"),
                    reason,
                );
            }

            if allow_edit && let Some(Value::Object(edited)) = decision.arguments {
                // Canonical JSON comparison avoids false positives from
                // key ordering; the baseline is the display copy the user
                // was shown.
                let changed = serde_json::to_string(&edited).unwrap_or_default()
                    != serde_json::to_string(&display_args).unwrap_or_default();
                if changed {
                    arguments_were_edited = true;
                    tracing::info!(tool = %tool_name, "user edited tool arguments");

                    // Re-apply injections and re-filter so security-critical
                    // parameters cannot be tampered with.
                    let reinjected = self.inject_context(edited, context, tool_name).await;
                    filtered = self.filter_args_to_schema(reinjected, tool_name);
                }
            }
        }

        // 6. Announce the execution with the sanitized copy.
        if let Some(events) = &events {
            events
                .emit(UiEvent::ToolStart {
                    tool_call_id: tool_call.id.clone(),
                    tool_name: tool_name.clone(),
                    arguments: Value::Object(sanitize_args_for_ui(&filtered)),
                })
                .await;
        }

        // 7. Invoke with the filtered arguments; elicitation requests during
        // execution are answered through the broker.
        let prepared = ToolCall::new(
            tool_call.id.clone(),
            tool_name.clone(),
            Value::Object(filtered.clone()),
        );
        let elicitation_handler: Arc<dyn ElicitationHandler> = Arc::new(BrokerElicitation {
            broker: Arc::clone(&self.elicitations),
            events: events.clone(),
            timeout: Duration::from_secs(self.timeouts.elicitation_secs),
        });

        let outcome = self
            .runtime
            .execute_tool(
                &prepared,
                (!context.user_email.is_empty()).then_some(context.user_email.as_str()),
                events.clone(),
                Some(elicitation_handler),
            )
            .await;

        let mut result = match outcome {
            Ok(result) => result,
            Err(McpError::AuthenticationRequired {
                server_name,
                auth_type,
                oauth_start_url,
                message,
            }) => {
                tracing::info!(
                    tool = %tool_name,
                    server = %server_name,
                    "tool requires authentication"
                );
                if let Some(events) = &events {
                    events
                        .emit(UiEvent::AuthRequired {
                            tool_call_id: tool_call.id.clone(),
                            tool_name: tool_name.clone(),
                            server_name: server_name.clone(),
                            auth_type: auth_type.clone(),
                            oauth_start_url: oauth_start_url.clone(),
                            message: message.clone(),
                        })
                        .await;
                }
                let mut result = ToolResult::failed(
                    &tool_call.id,
                    format!("Authentication required: {message}"),
                    message,
                );
                result.meta_data = Some(json!({
                    "auth_required": true,
                    "server_name": server_name,
                    "auth_type": auth_type,
                    "oauth_start_url": oauth_start_url,
                }));
                return result;
            }
            Err(e) => {
                tracing::error!(tool = %tool_name, "error executing tool: {e}");
                if let Some(events) = &events {
                    events
                        .emit(UiEvent::ToolError {
                            tool_call_id: tool_call.id.clone(),
                            tool_name: tool_name.clone(),
                            error: e.to_string(),
                        })
                        .await;
                }
                return ToolResult::failed(
                    &tool_call.id,
                    format!("Tool execution failed: {e}"),
                    e.to_string(),
                );
            }
        };

        // The LLM must treat the re-injected arguments as the user's true
        // intent when the user edited them.
        if arguments_were_edited {
            let executed = serde_json::to_string(&filtered).unwrap_or_default();
            result.content = format!(
                "[IMPORTANT: The user manually edited the tool arguments before execution. \
                 Security-critical parameters (like username) were re-injected by the system \
                 and cannot be modified. The ACTUAL arguments executed were: {executed}. \
                 Your response must reflect these arguments as the user's true intent.]\n\n{}",
                result.content
            );
        }

        // 9. Completion event carries the artifact count, never the bodies.
        if let Some(events) = &events {
            events
                .emit(UiEvent::ToolComplete {
                    tool_call_id: tool_call.id.clone(),
                    tool_name: tool_name.clone(),
                    success: result.success,
                    content: result.content.clone(),
                    artifact_count: result.artifacts.len(),
                })
                .await;
        }

        result
    }

    // -----------------------------------------------------------------------
    // Approval policy
    // -----------------------------------------------------------------------

    /// `(requires_approval, allow_edit, admin_required)` for one tool.
    ///
    /// Admin-required approvals (global force flag, per-tool rule, server
    /// `require_approval` list) cannot be auto-approved by the user; the
    /// default is user-level approval which the UI may auto-accept.
    async fn approval_requirement(&self, tool_name: &str) -> (bool, bool, bool) {
        if let Some(config) = &self.approvals_config {
            if config.force_approval_globally {
                return (true, true, true);
            }
            if config
                .tools
                .get(tool_name)
                .is_some_and(|rule| rule.require_approval)
            {
                return (true, true, true);
            }
        }
        if self.runtime.requires_admin_approval(tool_name).await {
            return (true, true, true);
        }
        (true, true, false)
    }

    // -----------------------------------------------------------------------
    // Argument preparation
    // -----------------------------------------------------------------------

    /// Inject context the tool is entitled to: the caller's identity, the
    /// server digest, and signed URLs for referenced session files.
    async fn inject_context(
        &self,
        mut args: Map<String, Value>,
        context: &AgentContext,
        tool_name: &str,
    ) -> Map<String, Value> {
        let descriptor = self.runtime.tool_descriptor(tool_name);

        // Username: schema-aware when possible, injected by default when
        // the schema is unavailable.
        let declares_username = descriptor
            .as_ref()
            .map(|d| d.declares_property("username"));
        if !context.user_email.is_empty() && declares_username.unwrap_or(true) {
            args.insert("username".into(), Value::String(context.user_email.clone()));
        }

        if descriptor
            .as_ref()
            .is_some_and(|d| d.declares_property("_mcp_data"))
        {
            args.insert("_mcp_data".into(), self.runtime.servers_digest().await);
        }

        if let Some(signer) = &self.url_signer {
            self.rewrite_file_references(&mut args, context, signer.as_ref());
        }

        args
    }

    /// Rewrite `filename` / `file_names` entries to signed download URLs,
    /// preserving the originals for audit.
    fn rewrite_file_references(
        &self,
        args: &mut Map<String, Value>,
        context: &AgentContext,
        signer: &dyn UrlSigner,
    ) {
        if let Some(Value::String(fname)) = args.get("filename").cloned()
            && let Some(file_ref) = context.files.get(&fname)
        {
            let url = signer.create_download_url(&file_ref.key, &context.user_email);
            // Signed URLs carry capability tokens; never log them.
            tracing::debug!(
                filename = %sanitize_filename_value(&fname),
                "rewrote filename argument to signed URL"
            );
            args.entry("original_filename".to_owned())
                .or_insert(Value::String(fname));
            args.insert("filename".into(), Value::String(url.clone()));
            args.entry("file_url".to_owned()).or_insert(Value::String(url));
        }

        if let Some(Value::Array(names)) = args.get("file_names").cloned() {
            let mut originals = Vec::new();
            let mut urls = Vec::new();
            for name in names {
                let Value::String(name) = name else { continue };
                originals.push(Value::String(name.clone()));
                match context.files.get(&name) {
                    Some(file_ref) => urls.push(Value::String(
                        signer.create_download_url(&file_ref.key, &context.user_email),
                    )),
                    None => urls.push(Value::String(name)),
                }
            }
            if !urls.is_empty() {
                tracing::debug!(count = urls.len(), "rewrote file_names arguments to signed URLs");
                args.entry("original_file_names".to_owned())
                    .or_insert(Value::Array(originals));
                args.insert("file_names".into(), Value::Array(urls.clone()));
                args.entry("file_urls".to_owned()).or_insert(Value::Array(urls));
            }
        }
    }

    /// Keep only schema-declared parameters.  With no reachable schema,
    /// fall back to dropping the known injected extras.
    fn filter_args_to_schema(
        &self,
        args: Map<String, Value>,
        tool_name: &str,
    ) -> Map<String, Value> {
        let allowed = self
            .runtime
            .tool_descriptor(tool_name)
            .and_then(|d| d.property_names());

        match allowed {
            Some(allowed) => args
                .into_iter()
                .filter(|(key, _)| allowed.iter().any(|a| a == key))
                .collect(),
            None => args
                .into_iter()
                .filter(|(key, _)| {
                    !key.starts_with("original_") && key != "file_url" && key != "file_urls"
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Elicitation bridging
// ---------------------------------------------------------------------------

/// Routes a server's elicitation request to the UI and waits for the
/// user's reply through the broker.
struct BrokerElicitation {
    broker: Arc<ElicitationBroker>,
    events: Option<Arc<dyn EventSink>>,
    timeout: Duration,
}

#[async_trait]
impl ElicitationHandler for BrokerElicitation {
    async fn elicit(&self, prompt: ElicitationPrompt) -> ElicitationOutcome {
        let Some(events) = &self.events else {
            tracing::warn!(
                tool = %prompt.tool_name,
                "elicitation requested but no event sink, cancelling"
            );
            return ElicitationOutcome::cancelled();
        };

        let elicitation_id = Uuid::now_v7().to_string();
        let waiter = self.broker.create(&elicitation_id);

        events
            .emit(UiEvent::ElicitationRequest {
                elicitation_id: elicitation_id.clone(),
                tool_call_id: prompt.tool_call_id.clone(),
                tool_name: prompt.tool_name.clone(),
                message: prompt.message.clone(),
                response_schema: prompt.response_schema.clone(),
            })
            .await;

        let reply = waiter.wait(self.timeout).await;
        self.broker.cleanup(&elicitation_id);

        let Some(ElicitationReply { action, data }) = reply else {
            tracing::warn!(tool = %prompt.tool_name, "elicitation timed out");
            return ElicitationOutcome::cancelled();
        };

        if action != ElicitationAction::Accept {
            return ElicitationOutcome {
                action,
                content: None,
            };
        }

        // Servers require elicitation content to be a JSON object; bare
        // values are wrapped.
        let content = data.map(|data| match data {
            Value::Object(_) => data,
            other => json!({"value": other}),
        });
        ElicitationOutcome {
            action: ElicitationAction::Accept,
            content,
        }
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Parse raw tool-call arguments into an object.
///
/// Providers sometimes deliver arguments as JSON text, occasionally
/// truncated.  One bounded repair is attempted (wrap missing braces, close
/// an open string value); anything else degrades to `{}` with a warning.
pub fn parse_tool_arguments(tool_call: &ToolCall) -> Map<String, Value> {
    match &tool_call.arguments {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        Value::String(raw) if raw.is_empty() => Map::new(),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                let mut map = Map::new();
                map.insert("_value".into(), other);
                map
            }
            Err(_) => match try_repair_json(raw) {
                Some(map) => {
                    tracing::info!(tool = %tool_call.name, "repaired truncated tool arguments");
                    map
                }
                None => {
                    tracing::warn!(
                        tool = %tool_call.name,
                        "failed to parse tool arguments as JSON, using empty object"
                    );
                    Map::new()
                }
            },
        },
        other => {
            let mut map = Map::new();
            map.insert("_value".into(), other.clone());
            map
        }
    }
}

/// Attempt to repair truncated JSON from LLM tool arguments.
fn try_repair_json(raw: &str) -> Option<Map<String, Value>> {
    let mut s = raw.trim().to_owned();
    if !s.starts_with('{') {
        s = format!("{{{s}");
    }
    if !s.ends_with('}') {
        s.push('}');
    }
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&s) {
        return Some(map);
    }

    // An odd quote count suggests an unterminated string value, e.g.
    // {"expression": "355/113
    if s.matches('"').count() % 2 != 0 {
        let reclosed = format!("{}\"}}", s.trim_end_matches('}'));
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&reclosed) {
            return Some(map);
        }
    }
    None
}

/// Reduce a filename-like value to a clean basename: no directories, no
/// query string, no capability token.
fn sanitize_filename_value(value: &str) -> String {
    let without_query = value.split('?').next().unwrap_or(value);
    without_query
        .rsplit('/')
        .next()
        .unwrap_or(without_query)
        .to_owned()
}

/// Produce the display copy of the arguments shown to the user.
fn sanitize_args_for_ui(args: &Map<String, Value>) -> Map<String, Value> {
    let mut cleaned = args.clone();

    for key in ["filename", "file_url"] {
        if let Some(Value::String(v)) = cleaned.get(key) {
            let sanitized = sanitize_filename_value(v);
            cleaned.insert(key.to_owned(), Value::String(sanitized));
        }
    }
    for key in ["file_names", "file_urls"] {
        if let Some(Value::Array(items)) = cleaned.get(key) {
            let sanitized: Vec<Value> = items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Value::String(sanitize_filename_value(s)),
                    other => other.clone(),
                })
                .collect();
            cleaned.insert(key.to_owned(), Value::Array(sanitized));
        }
    }

    cleaned
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call_with_args(arguments: Value) -> ToolCall {
        ToolCall::new("call_1", "srv_tool", arguments)
    }

    #[test]
    fn object_arguments_pass_through() {
        let parsed = parse_tool_arguments(&call_with_args(json!({"q": "x"})));
        assert_eq!(parsed["q"], "x");
    }

    #[test]
    fn string_arguments_are_parsed() {
        let parsed = parse_tool_arguments(&call_with_args(json!(r#"{"q": "x"}"#)));
        assert_eq!(parsed["q"], "x");
    }

    #[test]
    fn missing_braces_are_repaired() {
        let parsed = parse_tool_arguments(&call_with_args(json!(r#""q": "x""#)));
        assert_eq!(parsed["q"], "x");
    }

    #[test]
    fn open_string_value_is_reclosed() {
        let parsed = parse_tool_arguments(&call_with_args(json!(r#"{"expression": "355/113"#)));
        assert_eq!(parsed["expression"], "355/113");
    }

    #[test]
    fn unrepairable_arguments_become_empty() {
        let parsed = parse_tool_arguments(&call_with_args(json!("[1, 2, {")));
        assert!(parsed.is_empty());
    }

    #[test]
    fn non_object_json_is_wrapped() {
        let parsed = parse_tool_arguments(&call_with_args(json!("[1, 2, 3]")));
        assert_eq!(parsed["_value"], json!([1, 2, 3]));
    }

    #[test]
    fn filename_sanitization() {
        assert_eq!(
            sanitize_filename_value("https://host/files/report.pdf?token=SECRET"),
            "report.pdf"
        );
        assert_eq!(sanitize_filename_value("plain.txt"), "plain.txt");
        assert_eq!(sanitize_filename_value("dir/sub/data.csv"), "data.csv");
    }

    #[test]
    fn display_args_hide_signed_urls() {
        let mut args = Map::new();
        args.insert(
            "filename".into(),
            json!("https://host/dl/abc123?capability=SECRET"),
        );
        args.insert(
            "file_names".into(),
            json!(["https://host/dl/a?t=S1", "https://host/dl/b?t=S2"]),
        );
        args.insert("query".into(), json!("unchanged"));

        let display = sanitize_args_for_ui(&args);
        assert_eq!(display["filename"], "abc123");
        assert_eq!(display["file_names"], json!(["a", "b"]));
        assert_eq!(display["query"], "unchanged");
        assert!(!serde_json::to_string(&display).unwrap().contains("SECRET"));
    }
}
