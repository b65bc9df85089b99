//! Agent execution engine for Parley.
//!
//! ```text
//! chat request ──> AgentLoopFactory ──> one of four strategies
//!                                        (act / react / think-act / agentic)
//!                        │
//!                        ├── LlmCaller (parley-llm)
//!                        └── dispatch ──> ToolExecutor ──> ToolRuntime
//!                                             │              (parley-mcp)
//!                                             └── ApprovalBroker /
//!                                                 ElicitationBroker
//! ```
//!
//! ## Modules
//!
//! - [`loops`] -- the four interchangeable loop strategies and their
//!   factory.
//! - [`executor`] -- one tool call end to end: argument parsing/repair,
//!   context injection, schema filtering, approval, invocation, events.
//! - [`dispatch`] -- N tool calls concurrently with input-order results.
//! - [`broker`] -- rendezvous between suspended tool executions and the
//!   user's asynchronous approval/elicitation replies.
//! - [`runtime`] -- the tool-layer seam the executor and loops consume.
//! - [`error`] -- agent error types.

pub mod broker;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod loops;
pub mod runtime;

pub use broker::{ApprovalBroker, ApprovalDecision, ElicitationBroker, ElicitationReply};
pub use dispatch::execute_parallel;
pub use error::{AgentError, Result};
pub use executor::{ToolExecutor, UrlSigner};
pub use loops::{
    AgentLoop, AgentLoopFactory, AgentRun, LoopDeps, act::ActLoop, agentic::AgenticLoop,
    react::ReactLoop, think_act::ThinkActLoop,
};
pub use runtime::ToolRuntime;
