//! Typed event protocol spoken with the transport.
//!
//! The core never touches a WebSocket directly.  It emits [`UiEvent`]s
//! through an [`EventSink`] supplied by the caller and receives
//! [`ClientMessage`]s through a [`ControlChannel`].  Both enums are
//! internally tagged with a `type` field so they serialize to the JSON wire
//! shapes the frontend expects.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::types::{FileRef, ToolResult};

// ---------------------------------------------------------------------------
// Outbound events
// ---------------------------------------------------------------------------

/// An event emitted by the core toward the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    /// An agent loop started.
    AgentStart { strategy: String, max_steps: u32 },

    /// A new loop step began.
    AgentTurnStart { step: u32 },

    /// Visible reasoning text from a control phase.
    AgentReason { message: String, step: u32 },

    /// Visible observation text from the react observe phase.
    AgentObserve { message: String, step: u32 },

    /// Tool results ready for artifact ingestion by the outer system.
    AgentToolResults { results: Vec<ToolResult> },

    /// The agent needs input from the user before it can continue.
    AgentRequestInput { question: String, step: u32 },

    /// The agent loop finished.
    AgentCompletion { steps: u32 },

    /// A tool call awaits user approval.  `arguments` is the sanitized
    /// display copy, never the raw executed arguments.
    ToolApprovalRequest {
        tool_call_id: String,
        tool_name: String,
        arguments: Value,
        allow_edit: bool,
        admin_required: bool,
    },

    /// A per-user server rejected the call for lack of credentials.
    AuthRequired {
        tool_call_id: String,
        tool_name: String,
        server_name: String,
        auth_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        oauth_start_url: Option<String>,
        message: String,
    },

    /// A tool execution started.
    ToolStart {
        tool_call_id: String,
        tool_name: String,
        arguments: Value,
    },

    /// Progress reported by the tool server mid-execution.
    ToolProgress {
        tool_call_id: String,
        tool_name: String,
        progress: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// A tool execution finished.  Carries the artifact count, never the
    /// artifact bodies.
    ToolComplete {
        tool_call_id: String,
        tool_name: String,
        success: bool,
        content: String,
        artifact_count: usize,
    },

    /// A tool execution failed.
    ToolError {
        tool_call_id: String,
        tool_name: String,
        error: String,
    },

    /// A log line forwarded from the tool server.
    ToolLog {
        tool_call_id: String,
        tool_name: String,
        server_name: String,
        level: String,
        message: String,
    },

    /// One token of streamed assistant text.
    TokenStream {
        token: String,
        is_first: bool,
        is_last: bool,
    },

    /// A tool server asked the user for structured input mid-execution.
    ElicitationRequest {
        elicitation_id: String,
        tool_call_id: String,
        tool_name: String,
        message: String,
        response_schema: Value,
    },

    /// Free-form progress payload for the UI.
    IntermediateUpdate { payload: Value },

    /// Content to render in the canvas panel.
    CanvasContent { content: String },

    /// The final assistant answer for a non-streamed turn.
    ChatResponse { message: String },

    /// A structured error with a safe human message.
    Error {
        message: String,
        error_type: ErrorKind,
    },
}

/// Receives [`UiEvent`]s emitted by the core.
///
/// Implementations own delivery (WebSocket, test buffer, ...) and must not
/// fail the caller: transport errors are theirs to log and swallow.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: UiEvent);
}

// ---------------------------------------------------------------------------
// Inbound messages
// ---------------------------------------------------------------------------

/// Structured elicitation reply action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElicitationAction {
    Accept,
    Reject,
    Cancel,
}

/// Payload of an inbound `chat` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    pub content: String,
    pub model: String,
    #[serde(default)]
    pub selected_tools: Option<Vec<String>>,
    #[serde(default)]
    pub selected_prompts: Option<Vec<String>>,
    #[serde(default)]
    pub selected_data_sources: Option<Vec<String>>,
    #[serde(default)]
    pub only_rag: bool,
    pub user_email: String,
    #[serde(default)]
    pub agent_mode: bool,
    #[serde(default)]
    pub agent_max_steps: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub agent_loop_strategy: Option<String>,
    #[serde(default)]
    pub files: Option<HashMap<String, FileRef>>,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub incognito: bool,
}

/// A message arriving from the client connection.
///
/// Session operations (`attach_file`, `reset_session`, ...) are handled by
/// the transport layer before the core ever sees them, so they have no
/// variant here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A new chat request.
    Chat(ChatPayload),

    /// The user's verdict on a pending tool approval.
    ToolApprovalResponse {
        tool_call_id: String,
        approved: bool,
        #[serde(default)]
        arguments: Option<Value>,
        #[serde(default)]
        reason: Option<String>,
    },

    /// The user's reply to an elicitation request.
    ElicitationResponse {
        elicitation_id: String,
        action: ElicitationAction,
        #[serde(default)]
        data: Option<Value>,
    },

    /// Free-form user input requested by the react loop.
    AgentUserInput { content: String },

    /// Loop control (currently only `{"action": "stop"}`).
    AgentControl { action: String },
}

/// Receives inbound control messages for a single request.
///
/// `recv` resolves with the next message, or `None` when the connection is
/// gone.  Callers bound the wait with their own timeout.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn recv(&self) -> Option<ClientMessage>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
