//! Parallel tool dispatch.
//!
//! Every tool call in a turn runs as its own task so that IO-bound
//! executions overlap instead of serializing.  Results come back in input
//! order regardless of completion order, and a panicked task degrades to
//! an error result for its call rather than failing the batch.  There is
//! no concurrency cap; the effective bound is the model's per-turn
//! tool-call count.

use std::sync::Arc;

use parley_kernel::{AgentContext, EventSink, ToolCall, ToolResult};

use crate::executor::ToolExecutor;

/// Execute the given tool calls concurrently, preserving input order.
///
/// A single-call input skips the task machinery entirely.
pub async fn execute_parallel(
    executor: &Arc<ToolExecutor>,
    tool_calls: &[ToolCall],
    context: &AgentContext,
    events: Option<Arc<dyn EventSink>>,
) -> Vec<ToolResult> {
    if tool_calls.is_empty() {
        return Vec::new();
    }
    if tool_calls.len() == 1 {
        return vec![
            executor
                .execute_single(&tool_calls[0], context, events)
                .await,
        ];
    }

    tracing::info!(count = tool_calls.len(), "executing tool calls in parallel");

    let handles: Vec<_> = tool_calls
        .iter()
        .map(|call| {
            let executor = Arc::clone(executor);
            let call = call.clone();
            let context = context.clone();
            let events = events.clone();
            tokio::spawn(async move { executor.execute_single(&call, &context, events).await })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (call, handle) in tool_calls.iter().zip(handles) {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => {
                tracing::error!(tool = %call.name, "parallel tool execution panicked: {e}");
                results.push(ToolResult::failed(
                    &call.id,
                    format!("Tool execution failed: {e}"),
                    e.to_string(),
                ));
            }
        }
    }
    results
}
