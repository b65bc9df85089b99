//! The tool-layer seam consumed by the executor and the loops.
//!
//! [`ToolRuntime`] is what the agent engine needs from the tool layer:
//! schema introspection for argument filtering/injection, the server
//! digest for `_mcp_data`, approval flags from server configuration, and
//! invocation.  [`parley_mcp::ServerManager`] is the production
//! implementation; tests substitute scripted runtimes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use parley_kernel::{EventSink, ToolCall, ToolResult};
use parley_mcp::protocol::ToolDescriptor;
use parley_mcp::{ElicitationHandler, ServerManager};

/// Tool-layer operations the agent engine depends on.
#[async_trait]
pub trait ToolRuntime: Send + Sync {
    /// Descriptor for a fully-qualified tool name, when discovered.
    fn tool_descriptor(&self, full_name: &str) -> Option<ToolDescriptor>;

    /// Function-calling schemas for the selected tools.
    fn tools_schema(&self, tool_names: &[String]) -> Vec<Value>;

    /// The `_mcp_data` digest of every available server and its tools.
    async fn servers_digest(&self) -> Value;

    /// Whether server configuration pins this tool as admin-approved.
    async fn requires_admin_approval(&self, full_name: &str) -> bool;

    /// Invoke the tool.  `Err` is reserved for the authentication-required
    /// signal; other failures come back as unsuccessful results.
    async fn execute_tool(
        &self,
        tool_call: &ToolCall,
        user_email: Option<&str>,
        events: Option<Arc<dyn EventSink>>,
        elicitation: Option<Arc<dyn ElicitationHandler>>,
    ) -> parley_mcp::Result<ToolResult>;
}

#[async_trait]
impl ToolRuntime for ServerManager {
    fn tool_descriptor(&self, full_name: &str) -> Option<ToolDescriptor> {
        ServerManager::tool_descriptor(self, full_name)
    }

    fn tools_schema(&self, tool_names: &[String]) -> Vec<Value> {
        self.get_tools_schema(tool_names)
    }

    async fn servers_digest(&self) -> Value {
        ServerManager::servers_digest(self).await
    }

    async fn requires_admin_approval(&self, full_name: &str) -> bool {
        self.tool_requires_admin_approval(full_name).await
    }

    async fn execute_tool(
        &self,
        tool_call: &ToolCall,
        user_email: Option<&str>,
        events: Option<Arc<dyn EventSink>>,
        elicitation: Option<Arc<dyn ElicitationHandler>>,
    ) -> parley_mcp::Result<ToolResult> {
        ServerManager::execute_tool(self, tool_call, user_email, events, elicitation).await
    }
}
