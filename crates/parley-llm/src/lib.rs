//! LLM layer for Parley.
//!
//! The agent loops consume a narrow [`caller::LlmCaller`] contract: four
//! call methods (plain, with tools, with RAG, with RAG and tools) plus
//! matching streaming variants that yield text chunks followed by one
//! terminal [`parley_kernel::LlmResponse`].
//!
//! [`streaming::StreamingCaller`] implements that contract over an even
//! narrower [`backend::ChatBackend`] (one completion method, one delta
//! stream), keeping the actual provider SDK outside the core.  The adapter
//! owns:
//!
//! - tool-call fragment accumulation across streaming deltas
//!   ([`accumulator`]),
//! - the `required` → `auto` tool-choice downgrade for providers that
//!   reject forced tool calling,
//! - retrieval-before-streaming and multi-source context combination
//!   ([`rag`]),
//! - cooperative yielding every ~50 chunks so a fast provider cannot
//!   starve the event loop.
//!
//! [`sampling::LlmSamplingHandler`] closes the loop in the other
//! direction: tool servers issuing `sampling/createMessage` requests get
//! them answered through the same [`caller::LlmCaller`].

pub mod accumulator;
pub mod backend;
pub mod caller;
pub mod error;
pub mod rag;
pub mod sampling;
pub mod streaming;

pub use accumulator::StreamAccumulator;
pub use backend::{ChatBackend, ChatRequest, DeltaStream, StreamChunk, ToolCallDelta};
pub use caller::{LlmCaller, LlmStream, StreamItem, ToolChoice};
pub use error::{LlmError, Result};
pub use rag::{RagResponse, RagService};
pub use sampling::LlmSamplingHandler;
pub use streaming::StreamingCaller;
