//! Core conversation and tool types.
//!
//! These types model the data flowing between the agent loops, the tool
//! execution pipeline, and the LLM layer.  They are provider-agnostic; the
//! LLM crate translates them into provider wire formats.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Input from the human user.
    User,
    /// Output from the LLM.
    Assistant,
    /// Result of a tool invocation, fed back to the model.
    Tool,
}

/// A single message in a conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,

    /// The textual content of the message.
    ///
    /// For [`Role::Tool`] messages this contains the serialized tool result.
    /// For [`Role::Assistant`] messages that contain tool calls only, this
    /// may be empty.
    #[serde(default)]
    pub content: String,

    /// Tool calls requested by the assistant (only present when
    /// `role == Role::Assistant`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Identifies which tool call this message is a response to
    /// (only present when `role == Role::Tool`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create an assistant text message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create an assistant message that carries tool calls alongside any
    /// text the model produced in the same turn.
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Create a tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

/// A tool invocation requested by the LLM.
///
/// `name` is the fully qualified `server_tool` form.  Produced once per
/// assistant turn and never mutated afterwards; the executor works on a
/// parsed copy of `arguments`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier assigned by the LLM for correlating results.
    pub id: String,

    /// The fully qualified tool name (`server_tool`).
    pub name: String,

    /// Arguments as produced by the provider.  Usually a JSON object, but
    /// some providers deliver the arguments as a JSON-encoded string; the
    /// executor owns parsing and repair.
    pub arguments: Value,
}

impl ToolCall {
    /// Create a tool call with object arguments.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// A binary payload produced by a tool, surfaced to the UI out-of-band from
/// the LLM-visible text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// File name the UI should display (content-addressed within a turn).
    pub name: String,

    /// Base64-encoded payload bytes.
    pub b64: String,

    /// MIME type of the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,

    /// Viewer hint for the UI (e.g. `"image"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer: Option<String>,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Instruction for the UI canvas panel attached to a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// The artifact the canvas should show first.
    pub primary_file: String,

    /// Whether the canvas panel should open automatically.
    #[serde(default)]
    pub open_canvas: bool,
}

/// The outcome of one tool invocation, ready to feed back to the LLM and to
/// surface to the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// The [`ToolCall::id`] this result corresponds to.
    pub tool_call_id: String,

    /// JSON-serialized normalized payload for LLM consumption.  Never
    /// contains inlined artifact base64.
    pub content: String,

    /// Whether the invocation succeeded.
    pub success: bool,

    /// Terse error description when `success == false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Binary artifacts extracted from the raw result.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,

    /// Optional canvas instruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_config: Option<DisplayConfig>,

    /// Optional side-channel metadata (e.g. auth-required details).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<Value>,
}

impl ToolResult {
    /// Create a successful result with plain content.
    pub fn ok(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            success: true,
            error: None,
            artifacts: Vec::new(),
            display_config: None,
            meta_data: None,
        }
    }

    /// Create a failed result.  `content` is what the LLM sees; `error` is
    /// the terse machine-readable reason.
    pub fn failed(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            success: false,
            error: Some(error.into()),
            artifacts: Vec::new(),
            display_config: None,
            meta_data: None,
        }
    }
}

// ---------------------------------------------------------------------------
// LLM response
// ---------------------------------------------------------------------------

/// The high-level response from an LLM after processing one turn.
///
/// A response either requests tools (`tool_calls` non-empty) or terminates
/// the turn (text only).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Text content, possibly empty when the model only called tools.
    #[serde(default)]
    pub content: String,

    /// Tool invocations requested by the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// The model that actually served the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
}

impl LlmResponse {
    /// Create a text-only response.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            model_used: None,
        }
    }

    /// Whether the model requested at least one tool invocation.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Per-request context
// ---------------------------------------------------------------------------

/// Reference to a file attached to the session.  The blob itself lives in
/// external storage; tools receive signed download URLs derived from `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Storage key of the uploaded blob.
    pub key: String,
}

/// Per-request immutables handed to the agent loops and the tool executor.
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Session this request belongs to.
    pub session_id: Uuid,

    /// Identity of the requesting user.
    pub user_email: String,

    /// Files attached to the session, keyed by display name.
    pub files: HashMap<String, FileRef>,
}

impl AgentContext {
    /// Create a context with no attached files.
    pub fn new(session_id: Uuid, user_email: impl Into<String>) -> Self {
        Self {
            session_id,
            user_email: user_email.into(),
            files: HashMap::new(),
        }
    }
}

/// The final result of one agent loop run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    /// The answer to surface to the user.
    pub final_answer: String,

    /// Number of steps the loop executed (`0 < steps <= max_steps`).
    pub steps: u32,

    /// Strategy-specific metadata (always includes the strategy name).
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);

        let tool = Message::tool_result("call_1", "{}");
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn assistant_tool_calls_keeps_content() {
        let call = ToolCall::new("call_1", "search_query", json!({"q": "x"}));
        let msg = Message::assistant_tool_calls("thinking...", vec![call]);
        assert_eq!(msg.content, "thinking...");
        assert_eq!(msg.tool_calls.len(), 1);
    }

    #[test]
    fn tool_message_serializes_tool_call_id() {
        let msg = Message::tool_result("call_9", "done");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["role"], "tool");
        assert_eq!(v["tool_call_id"], "call_9");
        // Empty tool_calls list is omitted from the wire form.
        assert!(v.get("tool_calls").is_none());
    }

    #[test]
    fn llm_response_tool_call_detection() {
        assert!(!LlmResponse::text("hi").has_tool_calls());

        let resp = LlmResponse {
            content: String::new(),
            tool_calls: vec![ToolCall::new("a", "srv_tool", json!({}))],
            model_used: None,
        };
        assert!(resp.has_tool_calls());
    }

    #[test]
    fn tool_result_error_constructor() {
        let r = ToolResult::failed("id", "Tool execution failed: boom", "boom");
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("boom"));
        assert!(r.artifacts.is_empty());
    }
}
