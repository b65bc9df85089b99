//! Tool-call fragment accumulation for streamed responses.
//!
//! Providers deliver tool calls fragmented across many chunks: each delta
//! carries an index, maybe an id, maybe a function-name fragment, maybe an
//! argument fragment.  One accumulator indexed by the delta index produces
//! the final tool-call list.  A call is never considered complete until
//! the stream ends.

use serde_json::Value;

use parley_kernel::{LlmResponse, ToolCall};

use crate::backend::StreamChunk;

/// In-progress tool call assembled from streaming deltas.
#[derive(Debug, Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates text and tool-call fragments into a complete response.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    builders: Vec<ToolCallBuilder>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk.  Returns the chunk's text delta, if any, for
    /// incremental rendering.
    pub fn feed(&mut self, chunk: &StreamChunk) -> Option<String> {
        if let Some(text) = &chunk.text {
            self.text.push_str(text);
        }

        for delta in &chunk.tool_calls {
            while self.builders.len() <= delta.index {
                self.builders.push(ToolCallBuilder::default());
            }
            let builder = &mut self.builders[delta.index];

            // The id arrives whole, typically in the first fragment.
            if let Some(id) = &delta.id
                && !id.is_empty()
            {
                builder.id = id.clone();
            }
            if let Some(name) = &delta.name {
                builder.name.push_str(name);
            }
            if let Some(arguments) = &delta.arguments {
                builder.arguments.push_str(arguments);
            }
        }

        chunk.text.clone()
    }

    /// The text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether any tool-call fragments have been seen.
    pub fn has_tool_calls(&self) -> bool {
        !self.builders.is_empty()
    }

    /// Consume the accumulator into the final response.
    ///
    /// Accumulated argument text is parsed as JSON when possible; malformed
    /// argument text is passed through as a string for the executor's
    /// bounded repair to deal with.
    pub fn into_response(self, model: &str) -> LlmResponse {
        let tool_calls: Vec<ToolCall> = self
            .builders
            .into_iter()
            .map(|builder| {
                let arguments = if builder.arguments.is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&builder.arguments)
                        .unwrap_or(Value::String(builder.arguments))
                };
                ToolCall {
                    id: builder.id,
                    name: builder.name,
                    arguments,
                }
            })
            .collect();

        LlmResponse {
            content: self.text,
            tool_calls,
            model_used: Some(model.to_owned()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
