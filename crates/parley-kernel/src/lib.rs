//! Shared kernel for the Parley chat orchestration service.
//!
//! Every other Parley crate builds on the types defined here:
//!
//! - [`types`] -- conversation messages, tool calls/results, artifacts, and
//!   the LLM response shape exchanged between the agent loops, the tool
//!   layer, and the LLM layer.
//! - [`events`] -- the typed event protocol spoken with the transport:
//!   outbound [`events::UiEvent`]s emitted by the core and inbound
//!   [`events::ClientMessage`]s delivered by the connection.
//! - [`error`] -- the user-facing error taxonomy and LLM error
//!   classification.
//! - [`config`] -- typed configuration records (parsing the files that
//!   produce them is the host application's job).
//!
//! The kernel deliberately has no I/O of its own; it is the vocabulary the
//! rest of the workspace speaks.

pub mod config;
pub mod error;
pub mod events;
pub mod types;

// Re-export the most commonly used types at the crate root.
pub use config::{
    ApiKeySource, ApprovalTimeouts, AuthType, ConfigDiff, LlmModelConfig, McpTimeouts,
    OauthSettings, ReconnectSettings, ToolApprovalRule, ToolApprovalsConfig, ToolServerConfig,
    TransportKind, diff_server_configs, resolve_env_refs,
};
pub use error::{ErrorKind, KernelError, LlmErrorReport, Result, classify_llm_error};
pub use events::{
    ChatPayload, ClientMessage, ControlChannel, ElicitationAction, EventSink, UiEvent,
};
pub use types::{
    AgentContext, AgentOutcome, Artifact, DisplayConfig, FileRef, LlmResponse, Message, Role,
    ToolCall, ToolResult,
};
