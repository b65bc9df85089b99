//! Tool-server connection layer for Parley.
//!
//! This crate owns everything between the agent core and external tool
//! servers:
//!
//! ```text
//! ┌────────────────┐     ┌────────────┐     ┌───────────────┐
//! │ ServerManager  │────>│ Transports │────>│  Tool servers │
//! │ (discovery,    │     │ (stdio /   │     │  (JSON-RPC)   │
//! │  reconnect,    │     │  http/sse) │     └───────────────┘
//! │  per-user auth)│     └─────┬──────┘
//! └───────┬────────┘           │ server-originated callbacks
//!         │              ┌─────┴──────────┐
//!         │              │ CallbackRouter │ (keyed by server + call id)
//!         │              └────────────────┘
//!         └── normalize ──> uniform tool results + artifacts
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] -- JSON-RPC frames and tool-server wire types.
//! - [`transport`] -- stdio child-process and streamable HTTP/SSE clients.
//! - [`routing`] -- the `(server, tool_call_id)` callback routing table.
//! - [`manager`] -- connection lifecycle, discovery, backoff/reconnect,
//!   per-user authentication, and tool invocation.
//! - [`normalize`] -- heterogeneous result payloads into one record, plus
//!   artifact and display-hint extraction.
//! - [`error`] -- tool-layer error types, including the distinct
//!   authentication-required kind.

pub mod error;
pub mod manager;
pub mod normalize;
pub mod protocol;
pub mod routing;
pub mod transport;

pub use error::{McpError, Result};
pub use manager::{
    FailureInfo, ReconnectReport, ServerManager, ServerManagerSettings, SkippedServer,
};
pub use normalize::{NormalizedResult, normalize_tool_result};
pub use protocol::{CallToolResult, ContentItem, PromptDescriptor, ToolDescriptor};
pub use routing::{
    CallSinks, CallbackRouter, ElicitationHandler, ElicitationOutcome, ElicitationPrompt,
    SamplingHandler, SamplingReply, SamplingRequest,
};
